//! User directory port
//!
//! Registration and login are served by an external identity store; the
//! signaling core only relays the outcome.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredUser {
    pub username: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Username already taken: {0}")]
    AlreadyExists(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Identity lookup shared by the REST and WebSocket registration paths
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn register(&self, username: &str, password: &str) -> Result<RegisteredUser, RegistrationError>;

    async fn authenticate(&self, username: &str, password: &str) -> Result<RegisteredUser, RegistrationError>;
}
