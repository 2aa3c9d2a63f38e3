#![no_main]

use libfuzzer_sys::fuzz_target;
use rastreo::batcher::TraceSink;
use rastreo::correlator::CorrelatorConfig;
use rastreo::event::Trace;
use rastreo::printer::StdoutPrinter;
use rastreo::replay::replay;
use rastreo::span_mapper::map_trace;
use rastreo::trace_ctx::Observer;
use std::sync::Arc;

struct Render;

impl TraceSink for Render {
    fn handle_trace_event(&self, trace: Trace) {
        let _ = map_trace(&trace);
        let _ = StdoutPrinter::render(&trace);
    }
}

fuzz_target!(|data: &[u8]| {
    let observer = Observer::new(Arc::new(Render), CorrelatorConfig::default());
    let _ = replay(data, &observer);
});
