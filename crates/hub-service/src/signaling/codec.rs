//! Envelope decoding and encoding.

use super::messages::{ClientRequest, InboundFrame, ServerMessage};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why an inbound frame could not be turned into a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not a valid message envelope: {0}")]
    Malformed(String),

    #[error("unknown message type '{message_type}'")]
    UnknownType {
        message_type: String,
        request_id: Option<String>,
    },

    #[error("invalid payload for '{message_type}': {reason}")]
    InvalidPayload {
        message_type: String,
        request_id: Option<String>,
        reason: String,
    },
}

impl FrameError {
    /// Request type, when the envelope got far enough to have one.
    #[must_use]
    pub fn request_type(&self) -> Option<&str> {
        match self {
            FrameError::Malformed(_) => None,
            FrameError::UnknownType { message_type, .. }
            | FrameError::InvalidPayload { message_type, .. } => Some(message_type),
        }
    }

    /// Client correlation id, when one was readable.
    #[must_use]
    pub fn request_id(&self) -> Option<String> {
        match self {
            FrameError::Malformed(_) => None,
            FrameError::UnknownType { request_id, .. }
            | FrameError::InvalidPayload { request_id, .. } => request_id.clone(),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "requestId")]
    request_id: Option<Value>,
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<InboundFrame, FrameError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let payload = match envelope.payload {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        other => {
            return Err(FrameError::InvalidPayload {
                message_type: envelope.message_type,
                request_id: envelope.request_id.as_ref().and_then(correlation_string),
                reason: format!("payload must be an object, got {}", json_type_name(&other)),
            })
        }
    };

    let request_id = payload
        .get("requestId")
        .and_then(correlation_string)
        .or_else(|| envelope.request_id.as_ref().and_then(correlation_string));

    let message_type = envelope.message_type;
    let parse = |payload: Value| -> Result<ClientRequest, FrameError> {
        let invalid = |reason: String| FrameError::InvalidPayload {
            message_type: message_type.clone(),
            request_id: request_id.clone(),
            reason,
        };
        let request = match message_type.as_str() {
            "register" => ClientRequest::Register(typed(payload).map_err(invalid)?),
            "create-transport" => ClientRequest::CreateTransport(typed(payload).map_err(invalid)?),
            "connect-transport" => {
                ClientRequest::ConnectTransport(typed(payload).map_err(invalid)?)
            }
            "produce" => ClientRequest::Produce(typed(payload).map_err(invalid)?),
            "consume" => ClientRequest::Consume(typed(payload).map_err(invalid)?),
            "resume-consumer" => ClientRequest::ResumeConsumer(typed(payload).map_err(invalid)?),
            "pan-zoom" => ClientRequest::PanZoom(typed(payload).map_err(invalid)?),
            "stop-streaming" => ClientRequest::StopStreaming,
            "get-streamers" => ClientRequest::GetStreamers,
            "get-producers" => ClientRequest::GetProducers(typed(payload).map_err(invalid)?),
            _ => {
                return Err(FrameError::UnknownType {
                    message_type: message_type.clone(),
                    request_id: request_id.clone(),
                })
            }
        };
        Ok(request)
    };

    let request = parse(payload)?;
    Ok(InboundFrame {
        request_id,
        request,
    })
}

/// Encode one outbound message as a text frame.
pub fn encode(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

fn typed<T: DeserializeOwned>(payload: Value) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| e.to_string())
}

fn correlation_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::signaling::messages::{Produced, StreamerLeft};
    use common::secret::ExposeSecret;
    use common::types::{ClientId, MediaKind, ProducerId, Role, TransportDirection};
    use serde_json::json;

    #[test]
    fn test_decode_register_with_token() {
        let frame = decode(
            r#"{"type":"register","payload":{"role":"master","name":"Desk","token":"t0k","requestId":"r1"}}"#,
        )
        .unwrap();

        assert_eq!(frame.request_id.as_deref(), Some("r1"));
        match frame.request {
            ClientRequest::Register(p) => {
                assert_eq!(p.role, Role::Viewer);
                assert_eq!(p.name.as_deref(), Some("Desk"));
                assert_eq!(p.token.unwrap().expose_secret(), "t0k");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_decode_unit_requests_accept_missing_or_empty_payload() {
        assert!(matches!(
            decode(r#"{"type":"stop-streaming"}"#).unwrap().request,
            ClientRequest::StopStreaming
        ));
        assert!(matches!(
            decode(r#"{"type":"get-streamers","payload":{}}"#).unwrap().request,
            ClientRequest::GetStreamers
        ));
        match decode(r#"{"type":"get-producers"}"#).unwrap().request {
            ClientRequest::GetProducers(p) => assert!(p.client_id.is_none()),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_decode_numeric_request_id() {
        let frame =
            decode(r#"{"type":"create-transport","payload":{"direction":"send","requestId":7}}"#)
                .unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("7"));
        match frame.request {
            ClientRequest::CreateTransport(p) => assert_eq!(p.direction, TransportDirection::Send),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_decode_envelope_level_request_id() {
        let frame = decode(r#"{"type":"get-streamers","requestId":"outer"}"#).unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("outer"));
    }

    #[test]
    fn test_decode_not_json_is_malformed() {
        let err = decode("hello").unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
        assert!(err.request_type().is_none());
    }

    #[test]
    fn test_decode_missing_type_is_malformed() {
        assert!(matches!(
            decode(r#"{"payload":{}}"#).unwrap_err(),
            FrameError::Malformed(_)
        ));
    }

    #[test]
    fn test_decode_unknown_type_keeps_correlation() {
        let err = decode(r#"{"type":"teleport","payload":{"requestId":"r9"}}"#).unwrap_err();
        assert_eq!(err.request_type(), Some("teleport"));
        assert_eq!(err.request_id().as_deref(), Some("r9"));
    }

    #[test]
    fn test_decode_bad_payload_names_the_type() {
        let err = decode(r#"{"type":"produce","payload":{"kind":"smell","requestId":"p1"}}"#)
            .unwrap_err();
        match err {
            FrameError::InvalidPayload {
                message_type,
                request_id,
                ..
            } => {
                assert_eq!(message_type, "produce");
                assert_eq!(request_id.as_deref(), Some("p1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_decode_non_object_payload() {
        let err = decode(r#"{"type":"pan-zoom","payload":[1,2]}"#).unwrap_err();
        assert!(matches!(err, FrameError::InvalidPayload { .. }));
    }

    #[test]
    fn test_encode_uses_envelope_and_camel_case() {
        let text = encode(&ServerMessage::Produced(Produced {
            request_id: Some("r2".into()),
            id: ProducerId::from("p-1"),
            kind: MediaKind::Video,
        }))
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(
            value,
            json!({"type": "produced", "payload": {"requestId": "r2", "id": "p-1", "kind": "video"}})
        );
    }

    #[test]
    fn test_encode_omits_absent_request_id() {
        let text = encode(&ServerMessage::StreamerLeft(StreamerLeft {
            client_id: ClientId::from("c-1"),
        }))
        .unwrap();
        assert_eq!(text, r#"{"type":"streamer-left","payload":{"clientId":"c-1"}}"#);
    }

    #[test]
    fn test_error_message_shape() {
        let text = encode(&ServerMessage::error(
            "producer not found",
            4,
            Some("consume"),
            Some("c7".into()),
        ))
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["message"], "producer not found");
        assert_eq!(value["payload"]["requestType"], "consume");
        assert_eq!(value["payload"]["requestId"], "c7");
    }
}
