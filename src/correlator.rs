//! Call-tree correlation for a single WASM execution
//!
//! Folds the raw enter/exit/memory-grow stream of one execution into a
//! [`Trace`]. Each execution owns its `Correlator` exclusively, so nothing
//! here is locked.
//!
//! ```text
//! enter(f1, t=0)  ┐ push f1
//! enter(f2, t=1)  │ push f2
//! exit(t=2)       │ pop f2 (1ns)  → child of f1
//! exit(t=3)       ┘ pop f1 (3ns)  → root event
//! ```
//!
//! Children keep arrival order; nothing is re-sorted by time.

use crate::event::{CallEvent, CustomEvent, Event, MemoryGrowEvent, RawEvent, Trace, TelemetryId};
use crate::symbols::FunctionNames;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Correlation failures that abort the execution's trace
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("exit event at depth 0: no call frame is open")]
    StackUnderflow,
}

/// What to do with call frames still open when the execution ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnclosedFramePolicy {
    /// Close them at the last observed timestamp and keep them
    #[default]
    ForceClose,
    /// Drop them, including everything nested inside
    Discard,
}

/// What to do with a memory growth observed while no call is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Keep it as a root-level event
    #[default]
    AttachAtRoot,
    Drop,
}

/// Correlator policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    pub unclosed_frames: UnclosedFramePolicy,
    pub orphan_memory_grow: OrphanPolicy,
}

/// Per-execution stack machine turning raw events into a call tree
#[derive(Debug)]
pub struct Correlator {
    config: CorrelatorConfig,
    names: Option<Arc<FunctionNames>>,
    stack: Vec<CallEvent>,
    roots: Vec<Event>,
    last_seen: Option<SystemTime>,
    poisoned: Option<CorrelationError>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            names: None,
            stack: Vec::new(),
            roots: Vec::new(),
            last_seen: None,
            poisoned: None,
        }
    }

    /// Fill missing function names from the module's name section
    pub fn with_names(mut self, names: Arc<FunctionNames>) -> Self {
        self.names = Some(names);
        self
    }

    /// Current nesting depth
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn enter(&mut self, function_index: u32, function_name: &str, time: SystemTime) {
        self.observe(time);
        let name = self.name_for(function_index, function_name);
        self.stack
            .push(CallEvent::open(RawEvent::enter(function_index, name, time)));
    }

    /// Close the innermost open call
    ///
    /// An exit with nothing open is a hard error; the correlator stays
    /// poisoned and [`finish`](Self::finish) reports it.
    pub fn exit(&mut self, time: SystemTime) -> Result<(), CorrelationError> {
        self.observe(time);
        let Some(mut call) = self.stack.pop() else {
            tracing::error!("exit event with no open call frame");
            self.poisoned = Some(CorrelationError::StackUnderflow);
            return Err(CorrelationError::StackUnderflow);
        };

        call.stop(time);
        let exit = RawEvent::exit(
            call.function_index(),
            call.raw[0].function_name.clone(),
            time,
            call.duration,
        );
        call.raw.push(exit);
        self.attach(Event::Call(call));
        Ok(())
    }

    pub fn memory_grow(
        &mut self,
        function_index: u32,
        function_name: &str,
        amount: u32,
        time: SystemTime,
    ) {
        self.observe(time);
        let name = self.name_for(function_index, function_name);
        let event = MemoryGrowEvent::new(RawEvent::memory_grow(function_index, name, amount, time));

        if self.stack.is_empty() {
            match self.config.orphan_memory_grow {
                OrphanPolicy::AttachAtRoot => {
                    tracing::warn!(
                        function = %event.function_name(),
                        pages = amount,
                        "memory growth outside any call; attaching at root"
                    );
                    self.roots.push(Event::MemoryGrow(event));
                }
                OrphanPolicy::Drop => {
                    tracing::warn!(pages = amount, "dropping memory growth outside any call");
                }
            }
            return;
        }
        self.attach(Event::MemoryGrow(event));
    }

    /// Record an annotation inside the active call (or at root when idle)
    pub fn custom(&mut self, event: CustomEvent) {
        self.observe(event.time);
        self.attach(Event::Custom(event));
    }

    /// End the execution and build its trace
    pub fn finish(mut self, telemetry_id: TelemetryId, end: SystemTime) -> Result<Trace, CorrelationError> {
        if let Some(err) = self.poisoned.take() {
            return Err(err);
        }

        if !self.stack.is_empty() {
            let close_at = self.last_seen.map_or(end, |seen| seen.max(end));
            match self.config.unclosed_frames {
                UnclosedFramePolicy::ForceClose => {
                    tracing::warn!(
                        open_frames = self.stack.len(),
                        "execution ended with open call frames; force-closing"
                    );
                    while !self.stack.is_empty() {
                        self.exit(close_at)?;
                    }
                }
                UnclosedFramePolicy::Discard => {
                    tracing::warn!(
                        open_frames = self.stack.len(),
                        "execution ended with open call frames; discarding"
                    );
                    self.stack.clear();
                }
            }
        }

        Ok(Trace::new(telemetry_id, self.roots))
    }

    fn attach(&mut self, event: Event) {
        match self.stack.last_mut() {
            Some(parent) => parent.within.push(event),
            None => self.roots.push(event),
        }
    }

    fn observe(&mut self, time: SystemTime) {
        self.last_seen = Some(self.last_seen.map_or(time, |seen| seen.max(time)));
    }

    fn name_for(&self, function_index: u32, reported: &str) -> String {
        if !reported.is_empty() {
            return reported.to_string();
        }
        self.names
            .as_ref()
            .and_then(|names| names.get(function_index))
            .map(str::to_string)
            .unwrap_or_else(|| format!("function[{}]", function_index))
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(CorrelatorConfig::default())
    }
}
