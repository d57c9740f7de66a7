use serde::Deserialize;
use serde_json::Value;

/// Event name reserved for backend-initiated graceful shutdown.
/// Handled inside the broker; never exposed through the subscribe API.
pub const SHUTDOWN_EVENT: &str = "shutdown";

/// A decoded inbound frame, after envelope unwrapping.
///
/// Frames on the unnamed channel carry a `{type, payload}` envelope and
/// dispatch under `type`; named frames keep their transport-assigned
/// name and a best-effort JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEvent {
    pub event: String,
    pub payload: Value,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
}

/// Unwrap a frame from the unnamed channel.
///
/// Returns `None` when the body is not a well-formed envelope. That is
/// a silent drop, not an error: a malformed frame must never crash the
/// broker or surface to application code.
pub fn unwrap_envelope(body: &str) -> Option<InboundEvent> {
    match serde_json::from_str::<Envelope>(body) {
        Ok(env) => Some(InboundEvent {
            event: env.event_type,
            payload: env.payload,
        }),
        Err(err) => {
            tracing::debug!(error = %err, "dropping malformed envelope frame");
            None
        }
    }
}

/// Decode the body of a named frame.
///
/// The payload is JSON when it parses, and the raw string otherwise —
/// the fallback is expected behavior, not an error condition.
pub fn decode_named(event: &str, body: &str) -> InboundEvent {
    let payload = serde_json::from_str::<Value>(body)
        .unwrap_or_else(|_| Value::String(body.to_string()));
    InboundEvent {
        event: event.to_string(),
        payload,
    }
}

/// Whether an event name is reserved for internal lifecycle handling.
pub fn is_reserved(event: &str) -> bool {
    event == SHUTDOWN_EVENT
}
