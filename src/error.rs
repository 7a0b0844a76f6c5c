use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure talking to a remote endpoint.
///
/// Every variant is retryable from the point of view of the queues: the
/// owning queue leaves the entry in place and tries again on its next pass.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("remote returned status {0}")]
    Status(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("channel closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    /// reqwest does not report which timeout fired, so the caller passes the
    /// one it configured.
    pub fn from_reqwest(err: reqwest::Error, timeout: std::time::Duration) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Protocol(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(io) => TransportError::Io(io),
            WsError::Http(response) => TransportError::Status(response.status().as_u16()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Success,
    NotFound,
    Failed,
}

/// Structured result of a CRUD-style operation. Callers inspect `status`
/// instead of matching on an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub status: OpStatus,
    pub id: String,
    pub message: String,
}

impl OpResult {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            status: OpStatus::Success,
            id: id.into(),
            message: String::new(),
        }
    }

    pub fn not_found(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: OpStatus::NotFound,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn failed(id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            status: OpStatus::Failed,
            id: id.into(),
            message: message.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OpStatus::Success
    }
}
