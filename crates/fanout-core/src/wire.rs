use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RequestId;

/// Messages the broker sends back to an attached port.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortEvent {
    Connected {
        request_id: RequestId,
    },
    Event {
        event: String,
        data: Value,
    },
    Disconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        error: String,
    },
}

impl PortEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Event { .. } => "event",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn port_event_serde_roundtrip() {
        let events = vec![
            PortEvent::Connected { request_id: RequestId::from_raw("req_1") },
            PortEvent::Event { event: "status".into(), data: json!({"state":"ok"}) },
            PortEvent::Disconnected { reason: Some("server shutdown".into()) },
            PortEvent::Error { error: "stream interrupted".into() },
        ];
        for evt in &events {
            let json = serde_json::to_string(evt).unwrap();
            let parsed: PortEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(&parsed, evt);
        }
    }

    #[test]
    fn disconnected_omits_missing_reason() {
        let json = serde_json::to_string(&PortEvent::Disconnected { reason: None }).unwrap();
        assert_eq!(json, r#"{"type":"disconnected"}"#);
    }

    #[test]
    fn event_type_strings() {
        let evt = PortEvent::Event { event: "status".into(), data: Value::Null };
        assert_eq!(evt.event_type(), "event");
        assert_eq!(PortEvent::Disconnected { reason: None }.event_type(), "disconnected");
    }
}
