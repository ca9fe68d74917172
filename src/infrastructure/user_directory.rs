//! In-memory user directory
//!
//! Backs both the REST and the WebSocket registration paths. Passwords are
//! stored as bcrypt hashes; hashing runs on the blocking pool.

use crate::domain::user::{RegisteredUser, RegistrationError, UserDirectory};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, String>>,
    hash_cost: u32,
}

impl InMemoryUserDirectory {
    pub fn new(hash_cost: u32) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            hash_cost,
        }
    }

    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }
}

fn validate(username: &str, password: &str) -> Result<(), RegistrationError> {
    if username.trim().is_empty() {
        return Err(RegistrationError::ValidationError("username is required".to_string()));
    }
    if password.is_empty() {
        return Err(RegistrationError::ValidationError("password is required".to_string()));
    }
    Ok(())
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn register(&self, username: &str, password: &str) -> Result<RegisteredUser, RegistrationError> {
        validate(username, password)?;

        if self.users.read().await.contains_key(username) {
            return Err(RegistrationError::AlreadyExists(username.to_string()));
        }

        let password = password.to_string();
        let cost = self.hash_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| RegistrationError::Internal(e.to_string()))?
            .map_err(|e| RegistrationError::Internal(e.to_string()))?;

        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(RegistrationError::AlreadyExists(username.to_string()));
        }
        users.insert(username.to_string(), hash);

        info!("New user registered: {}", username);
        Ok(RegisteredUser {
            username: username.to_string(),
        })
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<RegisteredUser, RegistrationError> {
        let hash = self
            .users
            .read()
            .await
            .get(username)
            .cloned()
            .ok_or(RegistrationError::InvalidCredentials)?;

        let password = password.to_string();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| RegistrationError::Internal(e.to_string()))?
            .map_err(|e| RegistrationError::Internal(e.to_string()))?;

        if !valid {
            warn!("Rejected login for {}", username);
            return Err(RegistrationError::InvalidCredentials);
        }

        info!("User authenticated: {}", username);
        Ok(RegisteredUser {
            username: username.to_string(),
        })
    }
}
