//! Human-readable trace printer
//!
//! Renders each call tree as indented lines:
//!
//! ```text
//! Call to main took 1.2ms
//!   Call to parse took 300µs
//!   Allocated 3 pages of memory in parse
//! ```

use crate::batcher::{BatchConfig, FlushError, Flusher, TraceBatcher};
use crate::config::ConfigError;
use crate::event::{CallEvent, Event, Trace};
use crate::span_record::unix_nanos;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

const INDENT: &str = "  ";

/// Writes flushed traces to stdout (or any injected writer)
pub struct StdoutPrinter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Default for StdoutPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl StdoutPrinter {
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    /// Render one trace; a trace without events renders nothing
    pub fn render(trace: &Trace) -> Vec<String> {
        let mut lines = Vec::new();
        for event in &trace.events {
            match event {
                Event::Call(call) => render_call(call, 0, &mut lines),
                Event::MemoryGrow(grow) => lines.push(format!(
                    "Allocated {} pages of memory in {}",
                    grow.memory_grow_amount(),
                    grow.function_name()
                )),
                Event::Custom(custom) => {
                    lines.push(format!("{} {}", custom.name, unix_nanos(custom.time)))
                }
            }
        }
        lines
    }
}

fn render_call(call: &CallEvent, depth: usize, lines: &mut Vec<String>) {
    let indent = INDENT.repeat(depth);
    let name = call.function_name();
    lines.push(format!("{}Call to {} took {:?}", indent, name, call.duration));

    for child in call.within() {
        match child {
            Event::Call(inner) => render_call(inner, depth + 1, lines),
            // growth is attributed to the enclosing call at its own level
            Event::MemoryGrow(grow) => lines.push(format!(
                "{}Allocated {} pages of memory in {}",
                indent,
                grow.memory_grow_amount(),
                name
            )),
            Event::Custom(custom) => lines.push(format!(
                "{}{} {}",
                indent,
                custom.name,
                unix_nanos(custom.time)
            )),
        }
    }
}

impl Flusher for StdoutPrinter {
    fn flush(&self, batch: Vec<Trace>) -> Result<(), FlushError> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        for trace in &batch {
            let lines = Self::render(trace);
            if lines.is_empty() {
                continue;
            }
            for line in lines {
                writeln!(out, "{}", line)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Batcher that prints to stdout
pub type StdoutAdapter = TraceBatcher<StdoutPrinter>;

/// Printer batcher that flushes every trace as soon as it arrives
pub fn stdout_adapter() -> Result<StdoutAdapter, ConfigError> {
    let config = BatchConfig {
        max_batch_size: 1,
        ..BatchConfig::default()
    };
    TraceBatcher::new(config, StdoutPrinter::new())
}
