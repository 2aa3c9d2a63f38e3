//! Protocol-neutral span records
//!
//! The OTLP uploader does not build protocol spans straight from the call
//! tree. [`crate::span_mapper`] first flattens a trace into `SpanRecord`s with
//! explicit ids, timestamps and parent links; the uploader then replays them.
//!
//! ```text
//! SpanRecord
//! ├─ trace_id: [u8; 16]          (telemetry id of the execution)
//! ├─ span_id: [u8; 8]
//! ├─ parent_span_id: Option<..>  (None for top-level calls)
//! ├─ span_name: String           (demangled function name)
//! ├─ start_time_nanos / end_time_nanos / duration_nanos
//! ├─ attributes: HashMap<String, String>
//! └─ events: Vec<SpanEventRecord> (memory growth, annotations)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the UNIX epoch (zero for earlier times)
pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Inverse of [`unix_nanos`]
pub fn from_unix_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// Timestamped event inside a span
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanEventRecord {
    pub name: String,
    pub time_nanos: u64,
    pub attributes: HashMap<String, String>,
}

/// One function call as a protocol span
///
/// # Example
///
/// ```
/// use rastreo::span_record::SpanRecord;
///
/// let span = SpanRecord::new(
///     [0x4b, 0xf9, 0x2f, 0x3c, 0x7b, 0x64, 0x4b, 0xf9,
///      0x2f, 0x3c, 0x7b, 0x64, 0x4b, 0xf9, 0x2f, 0x3c],
///     [0x00, 0xf0, 0x67, 0xaa, 0x0b, 0xa9, 0x02, 0xb7],
///     None,
///     "main".to_string(),
///     1_700_000_000_000_000_000,
///     1_700_000_000_000_050_000,
/// );
///
/// assert_eq!(span.duration_nanos, 50_000);
/// assert_eq!(span.trace_id_hex(), "4bf92f3c7b644bf92f3c7b644bf92f3c");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRecord {
    /// Trace id, rendered as 32 hex characters on the wire
    pub trace_id: [u8; 16],

    /// Span id, rendered as 16 hex characters on the wire
    pub span_id: [u8; 8],

    /// Enclosing call's span; `None` for top-level calls
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_span_id: Option<[u8; 8]>,

    pub span_name: String,

    pub start_time_nanos: u64,

    pub end_time_nanos: u64,

    /// Computed: end - start
    pub duration_nanos: u64,

    pub attributes: HashMap<String, String>,

    pub events: Vec<SpanEventRecord>,
}

impl SpanRecord {
    /// Create a span record with computed duration and no attributes
    pub fn new(
        trace_id: [u8; 16],
        span_id: [u8; 8],
        parent_span_id: Option<[u8; 8]>,
        span_name: String,
        start_time_nanos: u64,
        end_time_nanos: u64,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            span_name,
            start_time_nanos,
            end_time_nanos,
            duration_nanos: end_time_nanos.saturating_sub(start_time_nanos),
            attributes: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn start_time(&self) -> SystemTime {
        from_unix_nanos(self.start_time_nanos)
    }

    pub fn end_time(&self) -> SystemTime {
        from_unix_nanos(self.end_time_nanos)
    }

    /// Get trace ID as hex string
    pub fn trace_id_hex(&self) -> String {
        hex::encode(self.trace_id)
    }

    /// Get span ID as hex string
    pub fn span_id_hex(&self) -> String {
        hex::encode(self.span_id)
    }

    /// Get parent span ID as hex string
    pub fn parent_span_id_hex(&self) -> Option<String> {
        self.parent_span_id.map(hex::encode)
    }

    /// Check if this is a root span (no parent)
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}
