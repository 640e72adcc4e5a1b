use thiserror::Error;

use crate::model::Status;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{what} is {actual}, expected {expected}")]
    InvalidTransition {
        what: String,
        actual: Status,
        expected: Status,
    },
    #[error("{0}")]
    Conflict(String),
    #[error("Invalid username or password")]
    Unauthorized,
    #[error("Password hashing failed: {0}")]
    Password(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// True for failures a caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::Store(_) | EngineError::Password(_))
    }
}
