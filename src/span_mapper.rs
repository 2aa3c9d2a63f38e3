//! Call tree → span mapping
//!
//! Every [`CallEvent`] becomes one [`SpanRecord`]; nesting is expressed through
//! parent span ids. Memory growth and annotations inside a call become span
//! events on that call's span. Spans are emitted depth-first, parents before
//! children, siblings in arrival order.

use crate::event::{CallEvent, Event, Trace};
use crate::span_record::{unix_nanos, SpanEventRecord, SpanRecord};
use std::collections::HashMap;

/// Span event name for memory growth inside a call
pub const MEMORY_GROW_EVENT: &str = "memory-grow";

/// Flatten a trace into span records
pub fn map_trace(trace: &Trace) -> Vec<SpanRecord> {
    let trace_id = trace.telemetry_id.to_bytes();
    let mut spans = Vec::new();

    for event in &trace.events {
        match event {
            Event::Call(call) => map_call(call, None, trace_id, &mut spans),
            Event::MemoryGrow(grow) => {
                tracing::warn!(
                    trace_id = %trace.telemetry_id,
                    function = %grow.function_name(),
                    "memory growth outside any call has no span to attach to"
                );
            }
            Event::Custom(custom) => {
                tracing::debug!(
                    trace_id = %trace.telemetry_id,
                    name = %custom.name,
                    "root-level custom events are not exported as spans"
                );
            }
        }
    }

    spans
}

fn map_call(call: &CallEvent, parent: Option<[u8; 8]>, trace_id: [u8; 16], spans: &mut Vec<SpanRecord>) {
    let name = call.function_name();
    let mut span = SpanRecord::new(
        trace_id,
        new_span_id(),
        parent,
        name.clone(),
        unix_nanos(call.time),
        unix_nanos(call.end_time()),
    );
    span.attributes
        .insert("function-name".to_string(), format!("function-call-{}", name));
    span.attributes
        .insert("function-index".to_string(), call.function_index().to_string());

    let span_id = span.span_id;
    let slot = spans.len();
    spans.push(span);

    for child in call.within() {
        match child {
            Event::Call(inner) => map_call(inner, Some(span_id), trace_id, spans),
            Event::MemoryGrow(grow) => {
                let mut attributes = HashMap::new();
                attributes.insert("allocation".to_string(), grow.memory_grow_amount().to_string());
                attributes.insert("function-name".to_string(), grow.function_name());
                spans[slot].events.push(SpanEventRecord {
                    name: MEMORY_GROW_EVENT.to_string(),
                    time_nanos: unix_nanos(grow.time),
                    attributes,
                });
            }
            Event::Custom(custom) => {
                let attributes = custom
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_string(v)))
                    .collect();
                spans[slot].events.push(SpanEventRecord {
                    name: custom.name.clone(),
                    time_nanos: unix_nanos(custom.time),
                    attributes,
                });
            }
        }
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn new_span_id() -> [u8; 8] {
    loop {
        let id: [u8; 8] = rand::random();
        if id != [0; 8] {
            return id;
        }
    }
}

/// A span with its reconstructed children
#[derive(Debug, Clone, PartialEq)]
pub struct SpanNode {
    pub span: SpanRecord,
    pub children: Vec<SpanNode>,
}

/// Rebuild nesting from parent span ids
///
/// Spans whose parent is not in the set become roots. Sibling order follows
/// the input order.
pub fn rebuild_tree(spans: &[SpanRecord]) -> Vec<SpanNode> {
    let known: HashMap<[u8; 8], usize> = spans
        .iter()
        .enumerate()
        .map(|(i, s)| (s.span_id, i))
        .collect();

    let mut children: HashMap<[u8; 8], Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (i, span) in spans.iter().enumerate() {
        match span.parent_span_id.filter(|p| known.contains_key(p)) {
            Some(parent) => children.entry(parent).or_default().push(i),
            None => roots.push(i),
        }
    }

    fn build(i: usize, spans: &[SpanRecord], children: &HashMap<[u8; 8], Vec<usize>>) -> SpanNode {
        let span = spans[i].clone();
        let kids = children
            .get(&span.span_id)
            .map(|ids| ids.iter().map(|&c| build(c, spans, children)).collect())
            .unwrap_or_default();
        SpanNode {
            span,
            children: kids,
        }
    }

    roots.into_iter().map(|i| build(i, spans, &children)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::Correlator;
    use crate::event::{CustomEvent, TelemetryId};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn at(nanos: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(nanos)
    }

    fn sample_trace() -> Trace {
        let mut c = Correlator::default();
        c.enter(0, "main", at(100));
        c.enter(1, "parse", at(110));
        c.memory_grow(1, "parse", 3, at(115));
        c.exit(at(130)).unwrap();
        let mut meta = serde_json::Map::new();
        meta.insert("step".to_string(), serde_json::json!(2));
        c.custom(CustomEvent::at("checkpoint", at(140)).with_metadata(meta));
        c.exit(at(200)).unwrap();
        c.memory_grow(0, "after", 1, at(210));
        c.finish(TelemetryId::new(), at(210)).unwrap()
    }

    #[test]
    fn test_one_span_per_call() {
        let trace = sample_trace();
        let spans = map_trace(&trace);
        assert_eq!(spans.len(), 2);

        let main = &spans[0];
        assert_eq!(main.span_name, "main");
        assert!(main.is_root());
        assert_eq!(main.start_time_nanos, 100);
        assert_eq!(main.end_time_nanos, 200);
        assert_eq!(main.trace_id, trace.telemetry_id.to_bytes());
        assert_eq!(
            main.attributes.get("function-name").map(String::as_str),
            Some("function-call-main")
        );

        let parse = &spans[1];
        assert_eq!(parse.parent_span_id, Some(main.span_id));
        assert_eq!(parse.duration_nanos, 20);
    }

    #[test]
    fn test_memory_growth_becomes_span_event() {
        let spans = map_trace(&sample_trace());
        let parse = &spans[1];
        assert_eq!(parse.events.len(), 1);
        assert_eq!(parse.events[0].name, MEMORY_GROW_EVENT);
        assert_eq!(parse.events[0].time_nanos, 115);
        assert_eq!(
            parse.events[0].attributes.get("allocation").map(String::as_str),
            Some("3")
        );
    }

    #[test]
    fn test_custom_event_metadata_stringified() {
        let spans = map_trace(&sample_trace());
        let checkpoint = &spans[0].events[0];
        assert_eq!(checkpoint.name, "checkpoint");
        assert_eq!(checkpoint.attributes.get("step").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_empty_trace_maps_to_nothing() {
        let trace = Trace::new(TelemetryId::new(), Vec::new());
        assert!(map_trace(&trace).is_empty());
    }

    #[test]
    fn test_rebuild_tree_nesting() {
        let spans = map_trace(&sample_trace());
        let tree = rebuild_tree(&spans);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].span.span_name, "main");
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].span.span_name, "parse");
    }

    #[test]
    fn test_rebuild_tree_unknown_parent_is_root() {
        let orphan = SpanRecord::new([1; 16], [2; 8], Some([9; 8]), "lost".to_string(), 0, 1);
        let tree = rebuild_tree(&[orphan]);
        assert_eq!(tree.len(), 1);
        assert!(tree[0].children.is_empty());
    }
}
