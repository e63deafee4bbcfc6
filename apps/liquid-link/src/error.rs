use thiserror::Error;

use crate::engine::{NegotiationState, SdpKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("timed out")]
    Timeout,
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("refusing remote {kind} while signaling state is {state}")]
    Glare {
        kind: SdpKind,
        state: NegotiationState,
    },
    #[error("operation not valid for the {0} role")]
    InvalidRole(crate::protocol::PeerRole),
    #[error("peer connection not initialized")]
    NotInitialized,
    #[error("malformed payload: {0}")]
    Payload(String),
}

impl From<serde_json::Error> for LinkError {
    fn from(value: serde_json::Error) -> Self {
        LinkError::Payload(value.to_string())
    }
}

impl From<url::ParseError> for LinkError {
    fn from(value: url::ParseError) -> Self {
        LinkError::Setup(format!("invalid url: {value}"))
    }
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> LinkError {
    LinkError::Negotiation(err.to_string())
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> LinkError {
    LinkError::Setup(err.to_string())
}
