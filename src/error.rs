use reqwest::StatusCode;
use std::fmt;
use thiserror::Error;

/// Coarse classification handed to `failed` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The transfer was cancelled through `stop`/`cleanup`.
    Aborted,
    /// Network failure, non-success status, body read failure or handle allocation failure.
    Error,
    /// The session already had a transfer in flight.
    Busy,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "ABORTED",
            Self::Error => "ERROR",
            Self::Busy => "BUSY",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Transfer was aborted")]
    Aborted,
    #[error("A transfer is already active on this session")]
    Busy,
    #[error("Server responded with status {0}")]
    Status(StatusCode),
    #[error("{0}")]
    RequestError(#[from] reqwest_middleware::Error),
    #[error("{0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Invalid header name or value")]
    InvalidHeader,
    #[error("Too many live payload handles (limit {0})")]
    HandleLimit(usize),
    #[error("No async runtime available to drive the transfer")]
    Runtime,
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Aborted => FailureKind::Aborted,
            Self::Busy => FailureKind::Busy,
            _ => FailureKind::Error,
        }
    }
}
