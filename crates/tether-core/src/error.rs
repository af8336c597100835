//! Error types for the tether broker

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory request errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("id {0} is already claimed by another key")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl DirectoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl ToString) -> Self {
        Self::Storage(msg.to_string())
    }
}

/// Wire error codes (sent in HTTP error bodies)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    IdTaken,
    NotFound,
    InternalError,
}

impl From<&DirectoryError> for ErrorCode {
    fn from(e: &DirectoryError) -> Self {
        match e {
            DirectoryError::Validation(_) => ErrorCode::InvalidRequest,
            DirectoryError::Conflict(_) => ErrorCode::IdTaken,
            DirectoryError::NotFound(_) => ErrorCode::NotFound,
            DirectoryError::Storage(_) => ErrorCode::InternalError,
        }
    }
}

/// Map error code to HTTP status
impl ErrorCode {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidRequest => 400,
            ErrorCode::IdTaken => 409,
            ErrorCode::NotFound => 404,
            ErrorCode::InternalError => 500,
        }
    }
}
