//! Protocol messages
//!
//! Typed form of everything exchanged between networking nodes. Wire
//! encoding lives in `support::frame`; this module knows nothing about
//! bytes.
//!
//! Every message carries a [`MessageHeader`] with the correlation id, source,
//! destination, creation time and event-tracking id. Replies copy the request
//! id and the event-tracking id so a whole request/response chain can be
//! traced end to end.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::domain::ids::{EventTrackingId, NodeId, RequestId};

// ── Message kinds ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request = 2,
    Response = 3,
    RequestError = 4,
    ResponseError = 5,
    Send = 6,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            2 => Some(Self::Request),
            3 => Some(Self::Response),
            4 => Some(Self::RequestError),
            5 => Some(Self::ResponseError),
            6 => Some(Self::Send),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::Response => "Response",
            Self::RequestError => "RequestError",
            Self::ResponseError => "ResponseError",
            Self::Send => "Send",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Header ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub request_id: RequestId,
    pub source: NodeId,
    pub destination: NodeId,
    pub created_at: DateTime<Utc>,
    pub event_tracking_id: EventTrackingId,
    /// Nodes that forwarded this message so far, oldest first.
    pub network_path: Vec<NodeId>,
    /// Secret presented on behalf of `source`.
    pub credential: Option<String>,
    /// Vendor extension data; carried along, never interpreted.
    pub custom_data: Option<Value>,
}

impl MessageHeader {
    /// Header for a new exchange, with fresh request and tracking ids.
    pub fn new(source: NodeId, destination: NodeId) -> Self {
        Self {
            request_id: RequestId::generate(),
            source,
            destination,
            created_at: Utc::now(),
            event_tracking_id: EventTrackingId::generate(),
            network_path: Vec::new(),
            credential: None,
            custom_data: None,
        }
    }

    /// Header for a reply sent by `from` to this message's source.
    pub fn reply(&self, from: NodeId) -> Self {
        Self {
            request_id: self.request_id.clone(),
            source: from,
            destination: self.source.clone(),
            created_at: Utc::now(),
            event_tracking_id: self.event_tracking_id.clone(),
            network_path: Vec::new(),
            credential: None,
            custom_data: None,
        }
    }

    pub fn hop_count(&self) -> usize {
        self.network_path.len()
    }

    pub fn has_visited(&self, node: &NodeId) -> bool {
        self.network_path.contains(node)
    }

    // ── Extension data ─────────────────────────────────────

    pub fn has_custom(&self, key: &str) -> bool {
        self.custom(key).is_some()
    }

    pub fn custom(&self, key: &str) -> Option<&Value> {
        self.custom_data.as_ref()?.get(key)
    }

    /// Typed lookup; a value of the wrong shape reads as `None`.
    pub fn custom_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.custom(key)
            .and_then(|value| T::deserialize(value).ok())
    }

    /// Run `f` with the value stored under `key`, if there is one.
    pub fn with_custom<R>(&self, key: &str, f: impl FnOnce(&Value) -> R) -> Option<R> {
        self.custom(key).map(f)
    }

    pub fn set_custom(&mut self, key: impl Into<String>, value: Value) {
        let data = self
            .custom_data
            .get_or_insert_with(|| Value::Object(Default::default()));
        if !data.is_object() {
            *data = Value::Object(Default::default());
        }
        if let Value::Object(map) = data {
            map.insert(key.into(), value);
        }
    }
}

// ── Payload ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn empty() -> Self {
        Self::Json(Value::Object(Default::default()))
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }

    /// Deserialize a JSON payload; binary payloads are parsed as JSON bytes.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Binary(bytes) => serde_json::from_slice(bytes),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

// ── Errors carried on the wire ─────────────────────────────────

/// OCPP-J error codes, plus the locally synthesized `Timeout`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    MessageTypeNotSupported,
    RpcFrameworkError,
    Timeout,
    /// Code not known locally; preserved verbatim.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
            Self::MessageTypeNotSupported => "MessageTypeNotSupported",
            Self::RpcFrameworkError => "RpcFrameworkError",
            Self::Timeout => "Timeout",
            Self::Other(code) => code,
        }
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "InternalError" => Self::InternalError,
            "ProtocolError" => Self::ProtocolError,
            "SecurityError" => Self::SecurityError,
            "FormationViolation" | "FormatViolation" => Self::FormationViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" | "OccurenceConstraintViolation" => {
                Self::OccurrenceConstraintViolation
            }
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            "GenericError" => Self::GenericError,
            "MessageTypeNotSupported" => Self::MessageTypeNotSupported,
            "RpcFrameworkError" => Self::RpcFrameworkError,
            "Timeout" => Self::Timeout,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ErrorCode::from_str(&raw).unwrap_or_else(|never| match never {}))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("No handler for action {action}"),
        )
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

// ── Messages ───────────────────────────────────────────────────

/// Request (expects a reply) or Send (one-way).
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub header: MessageHeader,
    pub action: String,
    pub payload: Payload,
}

impl RequestMessage {
    pub fn new(header: MessageHeader, action: impl Into<String>, payload: Payload) -> Self {
        Self {
            header,
            action: action.into(),
            payload,
        }
    }

    pub fn response(&self, from: NodeId, payload: Payload) -> ResponseMessage {
        ResponseMessage {
            header: self.header.reply(from),
            payload,
        }
    }

    pub fn error(&self, from: NodeId, error: ErrorInfo) -> ErrorMessage {
        ErrorMessage {
            header: self.header.reply(from),
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub header: MessageHeader,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub header: MessageHeader,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Request(RequestMessage),
    Response(ResponseMessage),
    /// The request was rejected before it reached a handler.
    RequestError(ErrorMessage),
    /// The handler ran and failed.
    ResponseError(ErrorMessage),
    Send(RequestMessage),
}

impl ProtocolMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
            Self::RequestError(_) => MessageKind::RequestError,
            Self::ResponseError(_) => MessageKind::ResponseError,
            Self::Send(_) => MessageKind::Send,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            Self::Request(m) | Self::Send(m) => &m.header,
            Self::Response(m) => &m.header,
            Self::RequestError(m) | Self::ResponseError(m) => &m.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            Self::Request(m) | Self::Send(m) => &mut m.header,
            Self::Response(m) => &mut m.header,
            Self::RequestError(m) | Self::ResponseError(m) => &mut m.header,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.header().request_id
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            Self::Request(m) | Self::Send(m) => Some(&m.action),
            _ => None,
        }
    }

    /// Whether the message carries a binary payload.
    pub fn is_binary(&self) -> bool {
        match self {
            Self::Request(m) | Self::Send(m) => m.payload.is_binary(),
            Self::Response(m) => m.payload.is_binary(),
            Self::RequestError(_) | Self::ResponseError(_) => false,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::Response(_) | Self::RequestError(_) | Self::ResponseError(_)
        )
    }
}
