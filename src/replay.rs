//! JSON-lines raw event logs
//!
//! Each line is one record tagged by `kind`. `begin`/`end` delimit
//! executions; events before the first `begin` open an implicit one, and an
//! execution still open at end of input is finished at the last timestamp seen.
//!
//! ```text
//! {"kind":"begin","trace_id":"4bf92f3c7b644bf92f3c7b644bf92f3c"}
//! {"kind":"enter","function_index":0,"function_name":"main","time_nanos":100}
//! {"kind":"memory_grow","function_index":0,"amount":2,"time_nanos":120}
//! {"kind":"exit","time_nanos":300}
//! {"kind":"end","time_nanos":300}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use crate::correlator::CorrelationError;
use crate::event::{CustomEvent, TelemetryId, TelemetryIdError};
use crate::span_record::from_unix_nanos;
use crate::trace_ctx::{Observer, TraceCtx};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use thiserror::Error;

/// One line of a raw event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayRecord {
    Begin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    Enter {
        function_index: u32,
        #[serde(default)]
        function_name: String,
        time_nanos: u64,
    },
    Exit {
        time_nanos: u64,
    },
    MemoryGrow {
        function_index: u32,
        #[serde(default)]
        function_name: String,
        amount: u32,
        time_nanos: u64,
    },
    Custom {
        name: String,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
        time_nanos: u64,
    },
    End {
        time_nanos: u64,
    },
}

impl ReplayRecord {
    fn time_nanos(&self) -> Option<u64> {
        match self {
            Self::Begin { .. } => None,
            Self::Enter { time_nanos, .. }
            | Self::Exit { time_nanos }
            | Self::MemoryGrow { time_nanos, .. }
            | Self::Custom { time_nanos, .. }
            | Self::End { time_nanos } => Some(*time_nanos),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read event log: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: malformed record: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },

    #[error("line {line}: {source}")]
    TraceId {
        line: usize,
        source: TelemetryIdError,
    },

    #[error("line {line}: {source}")]
    Correlation {
        line: usize,
        source: CorrelationError,
    },
}

/// Result of replaying a log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: usize,
    /// Trace ids handed to the sink, in completion order
    pub traces: Vec<TelemetryId>,
}

/// Feed every execution in `reader` through contexts opened on `observer`
///
/// Stops at the first malformed line or correlation failure.
pub fn replay<R: BufRead>(reader: R, observer: &Observer) -> Result<ReplaySummary, ReplayError> {
    let mut summary = ReplaySummary::default();
    let mut ctx: Option<TraceCtx> = None;
    let mut last_seen = 0u64;
    let mut last_line = 0usize;

    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let record: ReplayRecord = serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse {
            line: line_no,
            source,
        })?;
        summary.records += 1;
        last_line = line_no;
        if let Some(t) = record.time_nanos() {
            last_seen = last_seen.max(t);
        }

        let correlation = |source| ReplayError::Correlation {
            line: line_no,
            source,
        };

        match record {
            ReplayRecord::Begin { trace_id, metadata } => {
                if let Some(open) = ctx.take() {
                    tracing::warn!(line = line_no, "begin while an execution is open; finishing it");
                    let id = open
                        .finish_at(from_unix_nanos(last_seen))
                        .map_err(correlation)?;
                    summary.traces.push(id);
                }

                let mut next = observer.new_trace_ctx();
                if let Some(hex) = trace_id {
                    next.set_trace_id(&hex).map_err(|source| ReplayError::TraceId {
                        line: line_no,
                        source,
                    })?;
                }
                if let Some(metadata) = metadata {
                    next.set_metadata(metadata);
                }
                ctx = Some(next);
            }
            ReplayRecord::Enter {
                function_index,
                function_name,
                time_nanos,
            } => ctx
                .get_or_insert_with(|| observer.new_trace_ctx())
                .report_enter(function_index, &function_name, from_unix_nanos(time_nanos)),
            ReplayRecord::Exit { time_nanos } => ctx
                .get_or_insert_with(|| observer.new_trace_ctx())
                .report_exit(from_unix_nanos(time_nanos))
                .map_err(correlation)?,
            ReplayRecord::MemoryGrow {
                function_index,
                function_name,
                amount,
                time_nanos,
            } => ctx
                .get_or_insert_with(|| observer.new_trace_ctx())
                .report_memory_grow(function_index, &function_name, amount, from_unix_nanos(time_nanos)),
            ReplayRecord::Custom {
                name,
                metadata,
                time_nanos,
            } => ctx
                .get_or_insert_with(|| observer.new_trace_ctx())
                .report_custom_event(CustomEvent::at(name, from_unix_nanos(time_nanos)).with_metadata(metadata)),
            ReplayRecord::End { time_nanos } => match ctx.take() {
                Some(open) => {
                    let id = open
                        .finish_at(from_unix_nanos(time_nanos))
                        .map_err(correlation)?;
                    summary.traces.push(id);
                }
                None => tracing::warn!(line = line_no, "end with no open execution"),
            },
        }
    }

    if let Some(open) = ctx {
        tracing::debug!("event log ended inside an execution; finishing it");
        let id = open
            .finish_at(from_unix_nanos(last_seen))
            .map_err(|source| ReplayError::Correlation {
                line: last_line,
                source,
            })?;
        summary.traces.push(id);
    }

    Ok(summary)
}
