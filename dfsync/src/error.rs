//! Status codes and error types shared by the server and client.
//!
//! Every call ends with exactly one [`RpcStatus`] on the wire. On the client
//! side it is lifted into a [`DfsError`] so callers can use `?`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level status code carried by the final reply of every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    /// Target file absent where it is required
    NotFound = 1,
    /// Checksums equal, nothing to transfer
    AlreadyExists = 2,
    /// Stale source or ownership conflict
    Cancelled = 3,
    /// Lock held by another client
    ResourceExhausted = 4,
    /// Caller deadline expired or the caller went away
    DeadlineExceeded = 5,
    /// Lock-table invariant violation or server-side I/O failure
    Internal = 6,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::Cancelled => "CANCELLED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Non-OK status as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Wire encoding and connection errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the file-sync service.
#[derive(Debug, Error)]
pub enum DfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already synchronized: {0}")]
    AlreadyExists(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("lock unavailable: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type DfsResult<T> = Result<T, DfsError>;

impl DfsError {
    /// Status code reported to the remote caller for this error.
    ///
    /// Local I/O failures map to `Internal`, transport failures to `Cancelled`.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NotFound,
            Self::AlreadyExists(_) => StatusCode::AlreadyExists,
            Self::Cancelled(_) => StatusCode::Cancelled,
            Self::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            Self::DeadlineExceeded => StatusCode::DeadlineExceeded,
            Self::Internal(_) | Self::Io(_) => StatusCode::Internal,
            Self::Protocol(_) => StatusCode::Cancelled,
        }
    }

    /// Convert into the wire status sent back to the caller.
    pub fn to_status(&self) -> RpcStatus {
        RpcStatus::new(self.code(), self.to_string())
    }

    /// True when the error is part of normal flow (lock busy, already in sync,
    /// stale source) rather than a failure worth escalating.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists(_) | Self::ResourceExhausted(_) | Self::Cancelled(_)
        )
    }
}

impl From<RpcStatus> for DfsError {
    fn from(status: RpcStatus) -> Self {
        let RpcStatus { code, message } = status;
        match code {
            StatusCode::NotFound => Self::NotFound(message),
            StatusCode::AlreadyExists => Self::AlreadyExists(message),
            StatusCode::ResourceExhausted => Self::ResourceExhausted(message),
            StatusCode::DeadlineExceeded => Self::DeadlineExceeded,
            StatusCode::Internal => Self::Internal(message),
            // An OK code never travels as an error; treat it as a protocol bug.
            StatusCode::Cancelled | StatusCode::Ok => Self::Cancelled(message),
        }
    }
}
