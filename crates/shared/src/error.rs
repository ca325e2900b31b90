use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    Transport,
}

impl ErrorCode {
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            None => Self::Transport,
            Some(401) => Self::Unauthorized,
            Some(403) => Self::Forbidden,
            Some(404) => Self::NotFound,
            Some(400) | Some(409) | Some(422) => Self::Validation,
            Some(429) => Self::RateLimited,
            Some(_) => Self::Internal,
        }
    }
}

/// Failure reported by the analysis service, or by the transport underneath it.
///
/// `status` is `None` when no HTTP response was received at all.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}", display_remote(.status, .message))]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
}

fn display_remote(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("[{status}] {message}"),
        None => message.to_string(),
    }
}

impl RemoteError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_status(self.status)
    }

    pub fn is_transport(&self) -> bool {
        self.status.is_none()
    }
}
