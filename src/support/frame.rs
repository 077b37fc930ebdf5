//! Wire framing
//!
//! JSON frames extend the OCPP-J arrays with a trailing header object:
//!
//! - **Request**       `[2, "<id>", "<action>", {<payload>}, {<header>}]`
//! - **Response**      `[3, "<id>", {<payload>}, {<header>}]`
//! - **RequestError**  `[4, "<id>", "<code>", "<description>", {<details>}, {<header>}]`
//! - **ResponseError** `[5, "<id>", "<code>", "<description>", {<details>}, {<header>}]`
//! - **Send**          `[6, "<id>", "<action>", {<payload>}, {<header>}]`
//!
//! The header object (`src`, `dst`, `ts`, `eid`, `path`, `auth`, `ext`) is
//! optional, so a plain OCPP-J frame from an authenticated neighbour decodes
//! with sensible defaults.
//!
//! Binary frames carry raw payload bytes:
//!
//! ```text
//! +------+----------------+-------------------+-----------------+
//! | type | head len (u32) | JSON head (N)     | payload bytes   |
//! +------+----------------+-------------------+-----------------+
//! ```
//!
//! The head holds the id, action or error fields, and the header keys
//! flattened.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::ids::{EventTrackingId, NodeId, RequestId};
use crate::domain::message::{
    ErrorCode, ErrorInfo, ErrorMessage, MessageHeader, MessageKind, Payload, ProtocolMessage,
    RequestMessage, ResponseMessage,
};

/// Raw frame as carried by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Errors ─────────────────────────────────────────────────────

/// Errors that can occur when decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Frame is not a JSON array")]
    NotAnArray,
    #[error("Empty message array")]
    EmptyArray,
    #[error("Message type is not a number")]
    InvalidMessageType,
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },
    #[error("Field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Binary frame truncated")]
    Truncated,
    #[error("Frame has no source and the connection is anonymous")]
    AnonymousSource,
}

/// Who is decoding, and on which connection.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Node doing the decoding; the default destination.
    pub local: &'a NodeId,
    /// Authenticated identity of the connection; the default source.
    pub peer: Option<&'a NodeId>,
}

// ── Header on the wire ─────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dst: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    eid: Option<EventTrackingId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    path: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ext: Option<Value>,
}

impl WireHeader {
    fn from_header(header: &MessageHeader) -> Self {
        Self {
            src: Some(header.source.clone()),
            dst: Some(header.destination.clone()),
            ts: Some(header.created_at),
            eid: Some(header.event_tracking_id.clone()),
            path: header.network_path.clone(),
            auth: header.credential.clone(),
            ext: header.custom_data.clone(),
        }
    }

    fn resolve(self, request_id: RequestId, ctx: &DecodeContext<'_>) -> Result<MessageHeader, FrameError> {
        let source = self
            .src
            .or_else(|| ctx.peer.cloned())
            .ok_or(FrameError::AnonymousSource)?;

        Ok(MessageHeader {
            request_id,
            source,
            destination: self.dst.unwrap_or_else(|| ctx.local.clone()),
            created_at: self.ts.unwrap_or_else(Utc::now),
            event_tracking_id: self.eid.unwrap_or_else(EventTrackingId::generate),
            network_path: self.path,
            credential: self.auth,
            custom_data: self.ext,
        })
    }
}

fn parse_wire_header(value: Option<&Value>) -> Result<WireHeader, FrameError> {
    match value {
        None | Some(Value::Null) => Ok(WireHeader::default()),
        Some(value) => {
            WireHeader::deserialize(value).map_err(|e| FrameError::InvalidHeader(e.to_string()))
        }
    }
}

// ── Decoding ───────────────────────────────────────────────────

pub fn decode(frame: &Frame, ctx: &DecodeContext<'_>) -> Result<ProtocolMessage, FrameError> {
    match frame {
        Frame::Text(text) => decode_text(text, ctx),
        Frame::Binary(bytes) => decode_binary(bytes, ctx),
    }
}

/// Decode a JSON array frame.
pub fn decode_text(text: &str, ctx: &DecodeContext<'_>) -> Result<ProtocolMessage, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let arr = value.as_array().ok_or(FrameError::NotAnArray)?;

    let code = arr
        .first()
        .ok_or(FrameError::EmptyArray)?
        .as_u64()
        .ok_or(FrameError::InvalidMessageType)?;
    let kind = MessageKind::from_code(code).ok_or(FrameError::UnknownMessageType(code))?;

    match kind {
        MessageKind::Request | MessageKind::Send => {
            require(arr, 4)?;
            let request_id = request_id_at(arr)?;
            let action = string_at(arr, 2, "action must be a string")?;
            let header = parse_wire_header(arr.get(4))?.resolve(request_id, ctx)?;
            let message = RequestMessage {
                header,
                action,
                payload: Payload::Json(arr[3].clone()),
            };
            Ok(if kind == MessageKind::Request {
                ProtocolMessage::Request(message)
            } else {
                ProtocolMessage::Send(message)
            })
        }
        MessageKind::Response => {
            require(arr, 3)?;
            let request_id = request_id_at(arr)?;
            let header = parse_wire_header(arr.get(3))?.resolve(request_id, ctx)?;
            Ok(ProtocolMessage::Response(ResponseMessage {
                header,
                payload: Payload::Json(arr[2].clone()),
            }))
        }
        MessageKind::RequestError | MessageKind::ResponseError => {
            require(arr, 4)?;
            let request_id = request_id_at(arr)?;
            let code = arr[2]
                .as_str()
                .map(parse_error_code)
                .unwrap_or(ErrorCode::GenericError);
            let description = arr.get(3).and_then(Value::as_str).unwrap_or("");
            let details = arr
                .get(4)
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            let header = parse_wire_header(arr.get(5))?.resolve(request_id, ctx)?;
            Ok(error_message(kind, header, code, description, details))
        }
    }
}

/// Decode a binary frame.
pub fn decode_binary(bytes: &[u8], ctx: &DecodeContext<'_>) -> Result<ProtocolMessage, FrameError> {
    if bytes.len() < 5 {
        return Err(FrameError::Truncated);
    }
    let code = u64::from(bytes[0]);
    let kind = MessageKind::from_code(code).ok_or(FrameError::UnknownMessageType(code))?;
    let head_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let head_end = 5usize.checked_add(head_len).ok_or(FrameError::Truncated)?;
    let head = bytes.get(5..head_end).ok_or(FrameError::Truncated)?;
    let body = &bytes[head_end..];

    let head: BinaryHead =
        serde_json::from_slice(head).map_err(|e| FrameError::InvalidHeader(e.to_string()))?;
    let header = head.header.resolve(head.id, ctx)?;

    match kind {
        MessageKind::Request | MessageKind::Send => {
            let action = head
                .action
                .ok_or(FrameError::FieldTypeMismatch("action missing from binary head"))?;
            let message = RequestMessage {
                header,
                action,
                payload: Payload::Binary(body.to_vec()),
            };
            Ok(if kind == MessageKind::Request {
                ProtocolMessage::Request(message)
            } else {
                ProtocolMessage::Send(message)
            })
        }
        MessageKind::Response => Ok(ProtocolMessage::Response(ResponseMessage {
            header,
            payload: Payload::Binary(body.to_vec()),
        })),
        MessageKind::RequestError | MessageKind::ResponseError => {
            let code = head.code.unwrap_or(ErrorCode::GenericError);
            let details = head
                .details
                .unwrap_or_else(|| Value::Object(Default::default()));
            let description = head.desc.unwrap_or_default();
            Ok(error_message(kind, header, code, &description, details))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BinaryHead {
    id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
    #[serde(flatten)]
    header: WireHeader,
}

fn error_message(
    kind: MessageKind,
    header: MessageHeader,
    code: ErrorCode,
    description: &str,
    details: Value,
) -> ProtocolMessage {
    let message = ErrorMessage {
        header,
        error: ErrorInfo::new(code, description).with_details(details),
    };
    if kind == MessageKind::RequestError {
        ProtocolMessage::RequestError(message)
    } else {
        ProtocolMessage::ResponseError(message)
    }
}

fn parse_error_code(code: &str) -> ErrorCode {
    ErrorCode::from_str(code).unwrap_or_else(|never| match never {})
}

fn require(arr: &[Value], expected: usize) -> Result<(), FrameError> {
    if arr.len() < expected {
        return Err(FrameError::MissingFields {
            expected,
            got: arr.len(),
        });
    }
    Ok(())
}

fn request_id_at(arr: &[Value]) -> Result<RequestId, FrameError> {
    string_at(arr, 1, "message id must be a string").map(RequestId::from)
}

fn string_at(arr: &[Value], index: usize, what: &'static str) -> Result<String, FrameError> {
    arr[index]
        .as_str()
        .map(str::to_string)
        .ok_or(FrameError::FieldTypeMismatch(what))
}

// ── Encoding ───────────────────────────────────────────────────

/// Encode a message, choosing the binary form when its payload is binary.
pub fn encode(message: &ProtocolMessage) -> Frame {
    if message.is_binary() {
        Frame::Binary(encode_binary(message))
    } else {
        Frame::Text(encode_text(message))
    }
}

/// JSON array form. Binary payloads are embedded as a JSON byte array.
pub fn encode_text(message: &ProtocolMessage) -> String {
    let kind = Value::Number(message.kind().code().into());
    let header = wire_header_value(message.header());

    let arr = match message {
        ProtocolMessage::Request(m) | ProtocolMessage::Send(m) => vec![
            kind,
            Value::String(m.header.request_id.to_string()),
            Value::String(m.action.clone()),
            payload_value(&m.payload),
            header,
        ],
        ProtocolMessage::Response(m) => vec![
            kind,
            Value::String(m.header.request_id.to_string()),
            payload_value(&m.payload),
            header,
        ],
        ProtocolMessage::RequestError(m) | ProtocolMessage::ResponseError(m) => vec![
            kind,
            Value::String(m.header.request_id.to_string()),
            Value::String(m.error.code.to_string()),
            Value::String(m.error.description.clone()),
            m.error.details.clone(),
            header,
        ],
    };

    Value::Array(arr).to_string()
}

/// Binary form: type byte, head length, JSON head, payload bytes.
pub fn encode_binary(message: &ProtocolMessage) -> Vec<u8> {
    let mut head = BinaryHead {
        id: message.request_id().clone(),
        action: message.action().map(str::to_string),
        code: None,
        desc: None,
        details: None,
        header: WireHeader::from_header(message.header()),
    };
    let body = match message {
        ProtocolMessage::Request(m) | ProtocolMessage::Send(m) => payload_bytes(&m.payload),
        ProtocolMessage::Response(m) => payload_bytes(&m.payload),
        ProtocolMessage::RequestError(m) | ProtocolMessage::ResponseError(m) => {
            head.code = Some(m.error.code.clone());
            head.desc = Some(m.error.description.clone());
            head.details = Some(m.error.details.clone());
            Vec::new()
        }
    };

    let head = serde_json::to_vec(&head).unwrap_or_else(|_| b"{}".to_vec());

    let mut out = Vec::with_capacity(5 + head.len() + body.len());
    out.push(message.kind().code());
    out.extend_from_slice(&(head.len() as u32).to_be_bytes());
    out.extend_from_slice(&head);
    out.extend_from_slice(&body);
    out
}

fn wire_header_value(header: &MessageHeader) -> Value {
    serde_json::to_value(WireHeader::from_header(header))
        .unwrap_or_else(|_| Value::Object(Default::default()))
}

fn payload_value(payload: &Payload) -> Value {
    match payload {
        Payload::Json(value) => value.clone(),
        Payload::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

/// JSON payloads sent in binary form travel as their serialized text.
fn payload_bytes(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Json(value) => value.to_string().into_bytes(),
        Payload::Binary(bytes) => bytes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn plain_ocpp_call_gets_defaults_from_connection() {
        let local = node("CSMS");
        let peer = node("ST-1");
        let ctx = DecodeContext {
            local: &local,
            peer: Some(&peer),
        };

        let msg = decode_text(r#"[2,"abc123","Heartbeat",{}]"#, &ctx).unwrap();
        match msg {
            ProtocolMessage::Request(m) => {
                assert_eq!(m.header.request_id.as_str(), "abc123");
                assert_eq!(m.action, "Heartbeat");
                assert_eq!(m.header.source, peer);
                assert_eq!(m.header.destination, local);
                assert!(m.header.network_path.is_empty());
            }
            other => panic!("Expected Request, got {other:?}"),
        }
    }

    #[test]
    fn anonymous_connection_needs_explicit_source() {
        let local = node("CSMS");
        let ctx = DecodeContext {
            local: &local,
            peer: None,
        };

        let err = decode_text(r#"[6,"m1","StatusNotification",{}]"#, &ctx).unwrap_err();
        assert!(matches!(err, FrameError::AnonymousSource));

        let msg = decode_text(r#"[6,"m1","StatusNotification",{},{"src":"ST-9"}]"#, &ctx).unwrap();
        assert_eq!(msg.kind(), MessageKind::Send);
        assert_eq!(msg.header().source, node("ST-9"));
    }

    #[test]
    fn header_fields_are_parsed() {
        let local = node("HUB");
        let ctx = DecodeContext {
            local: &local,
            peer: None,
        };
        let text = r#"[5,"r9","Timeout","no answer",{"after":2},
            {"src":"ST-1","dst":"CSMS","ts":"2024-05-01T10:00:00Z","eid":"trace-1",
             "path":["HUB-A"],"ext":{"vendor":"acme"}}]"#;

        let msg = decode_text(text, &ctx).unwrap();
        match msg {
            ProtocolMessage::ResponseError(m) => {
                assert_eq!(m.error.code, ErrorCode::Timeout);
                assert_eq!(m.error.description, "no answer");
                assert_eq!(m.error.details, json!({"after": 2}));
                assert_eq!(m.header.destination, node("CSMS"));
                assert_eq!(m.header.event_tracking_id.as_str(), "trace-1");
                assert_eq!(m.header.network_path, vec![node("HUB-A")]);
                assert_eq!(m.header.custom("vendor"), Some(&json!("acme")));
            }
            other => panic!("Expected ResponseError, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let local = node("CSMS");
        let peer = node("ST-1");
        let ctx = DecodeContext {
            local: &local,
            peer: Some(&peer),
        };

        assert!(matches!(decode_text("not json", &ctx), Err(FrameError::InvalidJson(_))));
        assert!(matches!(decode_text("{}", &ctx), Err(FrameError::NotAnArray)));
        assert!(matches!(decode_text("[]", &ctx), Err(FrameError::EmptyArray)));
        assert!(matches!(
            decode_text(r#"[9,"x"]"#, &ctx),
            Err(FrameError::UnknownMessageType(9))
        ));
        assert!(matches!(
            decode_text(r#"[2,"x","Heartbeat"]"#, &ctx),
            Err(FrameError::MissingFields { expected: 4, got: 3 })
        ));
        assert!(matches!(
            decode_text(r#"[3,"x",{},{"src":"bad id"}]"#, &ctx),
            Err(FrameError::InvalidHeader(_))
        ));
        assert!(matches!(
            decode_binary(&[2, 0, 0, 0, 9, b'{'], &ctx),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn text_encoding_carries_full_header() {
        let mut header = MessageHeader::new(node("CSMS"), node("ST-1"));
        header.network_path.push(node("HUB"));
        let msg = ProtocolMessage::Request(RequestMessage::new(
            header.clone(),
            "Reset",
            Payload::Json(json!({"type": "Soft"})),
        ));

        let text = encode_text(&msg);
        let local = node("ST-1");
        let decoded = decode_text(
            &text,
            &DecodeContext {
                local: &local,
                peer: None,
            },
        )
        .unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn binary_payload_survives_binary_encoding() {
        let header = MessageHeader::new(node("ST-1"), node("CSMS"));
        let msg = ProtocolMessage::Send(RequestMessage::new(
            header,
            "LogUpload",
            Payload::Binary(vec![0, 159, 146, 150, 255]),
        ));

        let frame = encode(&msg);
        assert!(matches!(frame, Frame::Binary(_)));

        let local = node("CSMS");
        let decoded = decode(
            &frame,
            &DecodeContext {
                local: &local,
                peer: None,
            },
        )
        .unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn binary_error_frame_decodes() {
        let request = RequestMessage::new(
            MessageHeader::new(node("CSMS"), node("ST-1")),
            "Firmware",
            Payload::Binary(vec![1, 2, 3]),
        );
        let error = ProtocolMessage::RequestError(
            request.error(node("ST-1"), ErrorInfo::not_implemented("Firmware")),
        );

        let bytes = encode_binary(&error);
        let local = node("CSMS");
        let decoded = decode_binary(
            &bytes,
            &DecodeContext {
                local: &local,
                peer: None,
            },
        )
        .unwrap();
        assert_eq!(decoded.kind(), MessageKind::RequestError);
        assert_eq!(decoded.request_id(), &request.header.request_id);
    }
}
