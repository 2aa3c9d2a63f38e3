//! Rastreo - call-tree tracing for instrumented WebAssembly modules
//!
//! An instrumented module reports function enter/exit and memory growth while
//! it runs. This library correlates those raw events into one nested, timed
//! call tree per execution, resolves function names from the module's name
//! section, and batches completed traces out to exporters (OTLP or a
//! human-readable printer).

pub mod batcher;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod event;
pub mod otlp_exporter;
pub mod printer;
pub mod replay;
pub mod span_mapper;
pub mod span_record;
pub mod symbols;
pub mod trace_ctx;
