//! Error taxonomy shared by every layer of the node.

use crate::identity::KeyError;
use crate::objects::PayloadError;
use crate::wire::{FrameDecodeError, FrameEncodeError};

/// Every failure an Abyss operation can report, synchronously or through the error queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbyssError {
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("join timed out")]
    JoinTimeout,
    #[error("join rejected ({code}): {message}")]
    JoinRejected { code: i32, message: String },
    #[error("unknown peer: {0}")]
    PeerUnknown(String),
    #[error("handle or resource not found")]
    NotFound,
    #[error("closed")]
    Closed,
    #[error("world closed")]
    WorldClosed,
    #[error("malformed payload: {0}")]
    PayloadMalformed(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, AbyssError>;

impl From<KeyError> for AbyssError {
    fn from(e: KeyError) -> Self {
        AbyssError::InvalidKeyMaterial(e.to_string())
    }
}

impl From<PayloadError> for AbyssError {
    fn from(e: PayloadError) -> Self {
        AbyssError::PayloadMalformed(e.to_string())
    }
}

impl From<FrameEncodeError> for AbyssError {
    fn from(e: FrameEncodeError) -> Self {
        AbyssError::Protocol(e.to_string())
    }
}

impl From<FrameDecodeError> for AbyssError {
    fn from(e: FrameDecodeError) -> Self {
        AbyssError::Protocol(e.to_string())
    }
}
