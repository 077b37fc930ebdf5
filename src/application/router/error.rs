//! Outcomes of outbound traffic that are not a successful reply.

use std::time::Duration;

use thiserror::Error;

use crate::application::routing::TransportError;
use crate::domain::ids::{NodeId, RequestId};
use crate::domain::message::ErrorMessage;

/// A one-way message could not be handed to the next hop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no route to {0}")]
    Unreachable(NodeId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Terminal failure of an outbound request.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("no route to {0}")]
    Unreachable(NodeId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request {} timed out after {after:?}", .message.header.request_id)]
    TimedOut { message: ErrorMessage, after: Duration },
    #[error("request {0} was cancelled")]
    Cancelled(RequestId),
    #[error("request {0} is already pending")]
    DuplicateRequest(RequestId),
    /// The remote side refused the request before any handler ran.
    #[error("request rejected by {}: {}", .0.header.source, .0.error)]
    RequestError(ErrorMessage),
    /// The remote handler ran and failed.
    #[error("request failed at {}: {}", .0.header.source, .0.error)]
    ResponseError(ErrorMessage),
}

impl RpcError {
    /// Error message carried by the outcome: remote errors and the locally
    /// synthesized timeout.
    pub fn error_message(&self) -> Option<&ErrorMessage> {
        match self {
            Self::TimedOut { message, .. } | Self::RequestError(message) | Self::ResponseError(message) => {
                Some(message)
            }
            _ => None,
        }
    }

    /// Short label used for metrics and logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Transport(_) => "transport_error",
            Self::TimedOut { .. } => "timed_out",
            Self::Cancelled(_) => "cancelled",
            Self::DuplicateRequest(_) => "duplicate",
            Self::RequestError(_) => "request_error",
            Self::ResponseError(_) => "response_error",
        }
    }
}

impl From<DeliveryError> for RpcError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Unreachable(node) => Self::Unreachable(node),
            DeliveryError::Transport(err) => Self::Transport(err),
        }
    }
}
