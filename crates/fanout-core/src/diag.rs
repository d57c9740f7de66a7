use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RequestId;

/// Phase of a mirrored stream transition.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagPhase {
    Open,
    Message,
    Error,
    Close,
}

/// A structured diagnostic record emitted while any attached port runs
/// in test mode. Consumed by an external harness, never by application
/// logic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagEvent {
    pub stream_id: RequestId,
    pub phase: DiagPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DiagEvent {
    pub fn new(stream_id: RequestId, phase: DiagPhase) -> Self {
        Self { stream_id, phase, event: None, data: None }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Sink for diagnostic events.
pub trait DiagSink: Send + Sync + 'static {
    fn record(&self, event: DiagEvent);
}

/// Default sink: forwards to tracing at debug level.
pub struct TracingDiagSink;

impl DiagSink for TracingDiagSink {
    fn record(&self, event: DiagEvent) {
        tracing::debug!(
            stream_id = %event.stream_id,
            phase = ?event.phase,
            event = event.event.as_deref().unwrap_or(""),
            "stream diagnostic"
        );
    }
}

/// Sink that collects events in memory, for harness assertions.
#[derive(Default)]
pub struct CollectingDiagSink {
    events: parking_lot::Mutex<Vec<DiagEvent>>,
}

impl CollectingDiagSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drain(&self) -> Vec<DiagEvent> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DiagSink for CollectingDiagSink {
    fn record(&self, event: DiagEvent) {
        self.events.lock().push(event);
    }
}
