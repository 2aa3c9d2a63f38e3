//! Event model for correlated WASM executions
//!
//! Raw enter/exit/memory-grow notifications arrive from the execution engine
//! as [`RawEvent`]s. The correlator folds them into a tree of [`Event`]s:
//!
//! ```text
//! Trace (telemetry_id)
//! ├─ Event::Call (main)
//! │  ├─ Event::Call (parse_input)
//! │  ├─ Event::MemoryGrow (2 pages)
//! │  └─ Event::Call (render)
//! └─ Event::Custom ("checkpoint")
//! ```
//!
//! `Event` is a closed enum; exporters match it exhaustively.

use crate::symbols::resolve_name;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Kind of a raw engine notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Enter,
    Exit,
    MemoryGrow,
}

/// A single timestamped notification from the execution engine
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub function_index: u32,
    /// Possibly mangled function name as reported by the engine
    pub function_name: String,
    /// Pages requested by a `memory.grow` (zero for enter/exit)
    pub memory_grow_amount: u32,
    pub time: SystemTime,
    /// Filled on exit records only
    pub duration: Duration,
}

impl RawEvent {
    pub fn enter(function_index: u32, function_name: impl Into<String>, time: SystemTime) -> Self {
        Self {
            kind: RawEventKind::Enter,
            function_index,
            function_name: function_name.into(),
            memory_grow_amount: 0,
            time,
            duration: Duration::ZERO,
        }
    }

    pub fn exit(
        function_index: u32,
        function_name: impl Into<String>,
        time: SystemTime,
        duration: Duration,
    ) -> Self {
        Self {
            kind: RawEventKind::Exit,
            function_index,
            function_name: function_name.into(),
            memory_grow_amount: 0,
            time,
            duration,
        }
    }

    pub fn memory_grow(
        function_index: u32,
        function_name: impl Into<String>,
        amount: u32,
        time: SystemTime,
    ) -> Self {
        Self {
            kind: RawEventKind::MemoryGrow,
            function_index,
            function_name: function_name.into(),
            memory_grow_amount: amount,
            time,
            duration: Duration::ZERO,
        }
    }
}

/// A correlated function invocation and everything that happened inside it
#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    /// Matching enter and exit records, in that order
    pub raw: Vec<RawEvent>,
    pub time: SystemTime,
    pub duration: Duration,
    pub(crate) within: Vec<Event>,
}

impl CallEvent {
    pub(crate) fn open(enter: RawEvent) -> Self {
        Self {
            time: enter.time,
            raw: vec![enter],
            duration: Duration::ZERO,
            within: Vec::new(),
        }
    }

    /// Close the call at `at`; a timestamp before the start clamps to zero
    pub(crate) fn stop(&mut self, at: SystemTime) {
        self.duration = at.duration_since(self.time).unwrap_or_default();
    }

    pub fn end_time(&self) -> SystemTime {
        self.time + self.duration
    }

    /// Nested events in arrival order
    pub fn within(&self) -> &[Event] {
        &self.within
    }

    pub fn function_index(&self) -> u32 {
        self.raw.first().map(|r| r.function_index).unwrap_or_default()
    }

    /// Demangled function name of the enter record
    pub fn function_name(&self) -> String {
        self.raw
            .first()
            .map(|r| resolve_name(&r.function_name))
            .unwrap_or_default()
    }
}

/// A `memory.grow` observed during an execution
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryGrowEvent {
    pub raw: RawEvent,
    pub time: SystemTime,
}

impl MemoryGrowEvent {
    pub fn new(raw: RawEvent) -> Self {
        Self { time: raw.time, raw }
    }

    pub fn function_index(&self) -> u32 {
        self.raw.function_index
    }

    pub fn function_name(&self) -> String {
        resolve_name(&self.raw.function_name)
    }

    /// Number of pages requested
    pub fn memory_grow_amount(&self) -> u32 {
        self.raw.memory_grow_amount
    }
}

/// Caller-supplied annotation; has no raw record and never nests children
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub name: String,
    pub time: SystemTime,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CustomEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self::at(name, SystemTime::now())
    }

    pub fn at(name: impl Into<String>, time: SystemTime) -> Self {
        Self {
            name: name.into(),
            time,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Correlated event; consumers must handle every variant
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Call(CallEvent),
    MemoryGrow(MemoryGrowEvent),
    Custom(CustomEvent),
}

impl Event {
    /// Raw engine records backing this event (empty for custom events)
    pub fn raw_events(&self) -> &[RawEvent] {
        match self {
            Event::Call(call) => &call.raw,
            Event::MemoryGrow(grow) => std::slice::from_ref(&grow.raw),
            Event::Custom(_) => &[],
        }
    }

    pub fn time(&self) -> SystemTime {
        match self {
            Event::Call(call) => call.time,
            Event::MemoryGrow(grow) => grow.time,
            Event::Custom(custom) => custom.time,
        }
    }
}

/// Fixed-width (128-bit) identifier of one execution's trace
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TelemetryId([u8; 16]);

impl TelemetryId {
    /// Fresh random identifier (never all zeros)
    pub fn new() -> Self {
        loop {
            let bytes: [u8; 16] = rand::random();
            if bytes.iter().any(|&b| b != 0) {
                return Self(bytes);
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    /// 32 lowercase hex characters, as used on the OTLP wire
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl Default for TelemetryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TelemetryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TelemetryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TelemetryId({})", self.to_hex())
    }
}

/// Telemetry id parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryIdError {
    #[error("telemetry id must be 32 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("telemetry id contains non-hex characters")]
    InvalidHex,
    #[error("telemetry id must not be all zeros")]
    AllZero,
}

impl FromStr for TelemetryId {
    type Err = TelemetryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(TelemetryIdError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| TelemetryIdError::InvalidHex)?;
        if bytes.iter().all(|&b| b == 0) {
            return Err(TelemetryIdError::AllZero);
        }
        Ok(Self(bytes))
    }
}

/// The complete, immutable record of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub telemetry_id: TelemetryId,
    /// Root-level events in arrival order
    pub events: Vec<Event>,
    /// Exporter-specific metadata supplied by the caller
    pub metadata: Option<serde_json::Value>,
}

impl Trace {
    pub fn new(telemetry_id: TelemetryId, events: Vec<Event>) -> Self {
        Self {
            telemetry_id,
            events,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(nanos: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(nanos)
    }

    #[test]
    fn test_call_event_stop_computes_duration() {
        let mut call = CallEvent::open(RawEvent::enter(3, "main", at(100)));
        call.stop(at(350));
        assert_eq!(call.duration, Duration::from_nanos(250));
        assert_eq!(call.end_time(), at(350));
        assert_eq!(call.function_index(), 3);
    }

    #[test]
    fn test_call_event_stop_before_start_clamps() {
        let mut call = CallEvent::open(RawEvent::enter(0, "f", at(100)));
        call.stop(at(50));
        assert_eq!(call.duration, Duration::ZERO);
    }

    #[test]
    fn test_function_name_is_demangled() {
        let call = CallEvent::open(RawEvent::enter(
            1,
            "_ZN4core3fmt5write17h0123456789abcdefE",
            at(0),
        ));
        assert_eq!(call.function_name(), "core::fmt::write");
    }

    #[test]
    fn test_raw_events_per_variant() {
        let grow = Event::MemoryGrow(MemoryGrowEvent::new(RawEvent::memory_grow(
            2,
            "alloc",
            4,
            at(10),
        )));
        assert_eq!(grow.raw_events().len(), 1);
        assert_eq!(grow.time(), at(10));

        let custom = Event::Custom(CustomEvent::at("mark", at(20)));
        assert!(custom.raw_events().is_empty());
        assert_eq!(custom.time(), at(20));
    }

    #[test]
    fn test_telemetry_id_hex_round_trip() {
        let id: TelemetryId = "4bf92f3c7b644bf92f3c7b644bf92f3c".parse().unwrap();
        assert_eq!(id.to_hex(), "4bf92f3c7b644bf92f3c7b644bf92f3c");
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn test_telemetry_id_rejects_bad_input() {
        assert_eq!(
            "abc".parse::<TelemetryId>(),
            Err(TelemetryIdError::InvalidLength(3))
        );
        assert_eq!(
            "zzf92f3c7b644bf92f3c7b644bf92f3c".parse::<TelemetryId>(),
            Err(TelemetryIdError::InvalidHex)
        );
        assert_eq!(
            "00000000000000000000000000000000".parse::<TelemetryId>(),
            Err(TelemetryIdError::AllZero)
        );
    }

    #[test]
    fn test_random_telemetry_ids_differ() {
        assert_ne!(TelemetryId::new(), TelemetryId::new());
    }
}
