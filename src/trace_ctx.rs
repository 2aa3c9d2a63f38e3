//! Per-execution ingestion surface
//!
//! The host engine owns one [`Observer`] per loaded module and opens a
//! [`TraceCtx`] for every execution. The context feeds raw events into its
//! own correlator and, on [`TraceCtx::finish`], hands the completed trace to
//! the shared sink (usually a batching adapter).

use crate::batcher::TraceSink;
use crate::correlator::{CorrelationError, Correlator, CorrelatorConfig};
use crate::event::{CustomEvent, TelemetryId, TelemetryIdError};
use crate::symbols::{CompatibilityBaseline, FunctionNames, SymbolError, SymbolResolver};
use std::sync::Arc;
use std::time::SystemTime;

/// Factory for execution contexts that share one sink and symbol table
#[derive(Clone)]
pub struct Observer {
    sink: Arc<dyn TraceSink>,
    config: CorrelatorConfig,
    resolver: Option<Arc<SymbolResolver>>,
    names: Option<Arc<FunctionNames>>,
}

impl Observer {
    pub fn new(sink: Arc<dyn TraceSink>, config: CorrelatorConfig) -> Self {
        Self {
            sink,
            config,
            resolver: None,
            names: None,
        }
    }

    /// Resolve names from `module` and gate on its instrumentation version
    pub fn with_module(self, module: &[u8], baseline: CompatibilityBaseline) -> Result<Self, SymbolError> {
        Ok(self.with_resolver(SymbolResolver::new(module, baseline)?))
    }

    pub fn with_resolver(mut self, resolver: SymbolResolver) -> Self {
        self.names = Some(Arc::new(resolver.names().clone()));
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn resolver(&self) -> Option<&SymbolResolver> {
        self.resolver.as_deref()
    }

    /// Open a context for one execution with a fresh telemetry id
    pub fn new_trace_ctx(&self) -> TraceCtx {
        let mut correlator = Correlator::new(self.config);
        if let Some(names) = &self.names {
            correlator = correlator.with_names(Arc::clone(names));
        }

        TraceCtx {
            sink: Arc::clone(&self.sink),
            correlator,
            telemetry_id: TelemetryId::new(),
            metadata: None,
            finished: false,
        }
    }
}

/// Event intake for a single execution
///
/// Not shared between threads; an execution reports from one thread.
/// Call [`finish`](Self::finish) or [`finish_at`](Self::finish_at) to deliver
/// the trace. A context dropped without finishing discards its events and
/// logs a warning.
pub struct TraceCtx {
    sink: Arc<dyn TraceSink>,
    correlator: Correlator,
    telemetry_id: TelemetryId,
    metadata: Option<serde_json::Value>,
    finished: bool,
}

impl TraceCtx {
    pub fn telemetry_id(&self) -> TelemetryId {
        self.telemetry_id
    }

    /// Adopt a caller-chosen trace id (32 hex digits)
    pub fn set_trace_id(&mut self, hex: &str) -> Result<(), TelemetryIdError> {
        self.telemetry_id = hex.parse()?;
        Ok(())
    }

    /// Attach caller metadata; exporters decide which shapes they accept
    pub fn set_metadata(&mut self, metadata: serde_json::Value) {
        self.metadata = Some(metadata);
    }

    pub fn report_enter(&mut self, function_index: u32, function_name: &str, time: SystemTime) {
        self.correlator.enter(function_index, function_name, time);
    }

    pub fn report_exit(&mut self, time: SystemTime) -> Result<(), CorrelationError> {
        self.correlator.exit(time)
    }

    pub fn report_memory_grow(&mut self, function_index: u32, function_name: &str, amount: u32, time: SystemTime) {
        self.correlator
            .memory_grow(function_index, function_name, amount, time);
    }

    /// Record an annotation stamped with the current time
    pub fn report_custom(&mut self, name: &str, metadata: serde_json::Map<String, serde_json::Value>) {
        self.correlator
            .custom(CustomEvent::new(name).with_metadata(metadata));
    }

    pub fn report_custom_event(&mut self, event: CustomEvent) {
        self.correlator.custom(event);
    }

    /// Current call depth
    pub fn depth(&self) -> usize {
        self.correlator.depth()
    }

    /// Complete the execution now and hand its trace to the sink
    pub fn finish(self) -> Result<TelemetryId, CorrelationError> {
        self.finish_at(SystemTime::now())
    }

    /// Complete the execution at `end`
    ///
    /// A correlation failure discards the trace; nothing reaches the sink.
    pub fn finish_at(mut self, end: SystemTime) -> Result<TelemetryId, CorrelationError> {
        self.finished = true;
        let telemetry_id = self.telemetry_id;
        let correlator = std::mem::take(&mut self.correlator);
        let mut trace = correlator.finish(telemetry_id, end)?;
        if let Some(metadata) = self.metadata.take() {
            trace = trace.with_metadata(metadata);
        }

        tracing::debug!(
            trace_id = %telemetry_id,
            roots = trace.events.len(),
            "execution trace complete"
        );
        self.sink.handle_trace_event(trace);
        Ok(telemetry_id)
    }
}

impl Drop for TraceCtx {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                trace_id = %self.telemetry_id,
                open_frames = self.correlator.depth(),
                "execution context dropped without finish; discarding its events"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Trace};
    use std::sync::Mutex;
    use std::time::{Duration, UNIX_EPOCH};

    #[derive(Default)]
    struct Collect(Mutex<Vec<Trace>>);

    impl TraceSink for Collect {
        fn handle_trace_event(&self, trace: Trace) {
            self.0.lock().unwrap().push(trace);
        }
    }

    fn at(nanos: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(nanos)
    }

    fn observer() -> (Arc<Collect>, Observer) {
        let sink = Arc::new(Collect::default());
        let observer = Observer::new(sink.clone(), CorrelatorConfig::default());
        (sink, observer)
    }

    #[test]
    fn test_finish_delivers_one_trace() {
        let (sink, observer) = observer();
        let mut ctx = observer.new_trace_ctx();
        ctx.report_enter(0, "main", at(10));
        ctx.report_memory_grow(0, "main", 2, at(15));
        ctx.report_exit(at(30)).unwrap();
        let id = ctx.finish_at(at(30)).unwrap();

        let traces = sink.0.lock().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].telemetry_id, id);
        match &traces[0].events[0] {
            Event::Call(call) => {
                assert_eq!(call.duration, Duration::from_nanos(20));
                assert_eq!(call.within().len(), 1);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_set_trace_id_and_metadata() {
        let (sink, observer) = observer();
        let mut ctx = observer.new_trace_ctx();
        ctx.set_trace_id("4bf92f3c7b644bf92f3c7b644bf92f3c").unwrap();
        ctx.set_metadata(serde_json::json!({"user": "alice"}));
        ctx.finish_at(at(0)).unwrap();

        let traces = sink.0.lock().unwrap();
        assert_eq!(traces[0].telemetry_id.to_hex(), "4bf92f3c7b644bf92f3c7b644bf92f3c");
        assert_eq!(traces[0].metadata, Some(serde_json::json!({"user": "alice"})));
    }

    #[test]
    fn test_bad_trace_id_keeps_generated_one() {
        let (_sink, observer) = observer();
        let mut ctx = observer.new_trace_ctx();
        let before = ctx.telemetry_id();
        assert!(ctx.set_trace_id("not-hex").is_err());
        assert_eq!(ctx.telemetry_id(), before);
    }

    #[test]
    fn test_underflow_sends_nothing() {
        let (sink, observer) = observer();
        let mut ctx = observer.new_trace_ctx();
        assert!(ctx.report_exit(at(5)).is_err());
        assert!(matches!(
            ctx.finish_at(at(5)),
            Err(CorrelationError::StackUnderflow)
        ));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[derive(Clone, Default)]
    struct LogBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn captured_warnings(f: impl FnOnce()) -> String {
        let buf = LogBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_unfinished_context_warns_on_drop() {
        let (sink, observer) = observer();
        let logs = captured_warnings(|| {
            let mut ctx = observer.new_trace_ctx();
            ctx.report_enter(0, "main", at(1));
            drop(ctx);
        });

        assert!(logs.contains("dropped without finish"), "logs: {}", logs);
        assert!(logs.contains("open_frames=1"), "logs: {}", logs);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_finished_context_drops_quietly() {
        let (sink, observer) = observer();
        let logs = captured_warnings(|| {
            let mut ctx = observer.new_trace_ctx();
            ctx.report_enter(0, "main", at(1));
            ctx.report_exit(at(2)).unwrap();
            ctx.finish_at(at(2)).unwrap();
        });

        assert!(!logs.contains("dropped without finish"), "logs: {}", logs);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_contexts_are_independent() {
        let (sink, observer) = observer();
        let mut a = observer.new_trace_ctx();
        let mut b = observer.new_trace_ctx();
        a.report_enter(0, "a", at(0));
        b.report_enter(1, "b", at(1));
        assert_ne!(a.telemetry_id(), b.telemetry_id());

        a.report_exit(at(2)).unwrap();
        b.report_exit(at(3)).unwrap();
        a.finish_at(at(2)).unwrap();
        b.finish_at(at(3)).unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_report_custom_attaches_to_active_call() {
        let (sink, observer) = observer();
        let mut ctx = observer.new_trace_ctx();
        ctx.report_enter(0, "main", SystemTime::now());
        ctx.report_custom("checkpoint", serde_json::Map::new());
        assert_eq!(ctx.depth(), 1);
        ctx.report_exit(SystemTime::now()).unwrap();
        ctx.finish().unwrap();

        let traces = sink.0.lock().unwrap();
        let Event::Call(call) = &traces[0].events[0] else {
            panic!("expected call");
        };
        assert!(matches!(call.within()[0], Event::Custom(_)));
    }
}
