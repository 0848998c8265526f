/// Structured audit events for gate lifecycle transitions.
///
/// Events are serialized as single-line JSON and emitted through the `log`
/// facade under the `scriptgate::audit` target, so operators can split the
/// audit stream from ordinary diagnostics with a logger filter.
use log::info;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateEventKind {
    BootstrapCompleted,
    SessionEntered,
    SessionSkipped,
    SessionFailed,
    SessionLeft,
    InterruptRequested,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateEvent {
    pub kind: GateEventKind,
    /// Correlation id for joining related log lines.
    pub event_id: String,
    /// Consumer name, when the event belongs to a session manager.
    pub consumer: Option<String>,
    pub detail: Option<String>,
    pub unix_ms: u64,
}

impl GateEvent {
    pub fn new(kind: GateEventKind, consumer: Option<&str>, detail: Option<&str>) -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind,
            event_id: Uuid::new_v4().to_string(),
            consumer: consumer.map(str::to_string),
            detail: detail.map(str::to_string),
            unix_ms,
        }
    }
}

/// Emit one audit event. Serialization failures degrade to a debug-format
/// line rather than being surfaced; audit must never fail the operation it
/// describes.
pub fn emit(kind: GateEventKind, consumer: Option<&str>, detail: Option<&str>) {
    let event = GateEvent::new(kind, consumer, detail);
    match serde_json::to_string(&event) {
        Ok(json) => info!(target: "scriptgate::audit", "{json}"),
        Err(_) => info!(target: "scriptgate::audit", "{event:?}"),
    }
}
