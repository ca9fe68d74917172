//! User API handlers

use super::user_dto::{ApiResponse, CredentialsRequest, HealthResponse, UserResponse};
use crate::application::RelayRouter;
use crate::domain::user::{RegistrationError, UserDirectory};
use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::{info, warn};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayRouter>,
    pub users: Arc<dyn UserDirectory>,
}

fn status_for(error: &RegistrationError) -> StatusCode {
    match error {
        RegistrationError::AlreadyExists(_) => StatusCode::CONFLICT,
        RegistrationError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        RegistrationError::ValidationError(_) => StatusCode::BAD_REQUEST,
        RegistrationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Register a new user
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> (StatusCode, Json<ApiResponse<UserResponse>>) {
    info!("API: Registering user {}", req.username);

    match state.users.register(&req.username, &req.password).await {
        Ok(user) => (StatusCode::CREATED, Json(ApiResponse::success(user.into()))),
        Err(e) => {
            warn!("API: Registration of {} failed: {}", req.username, e);
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// Check a user's credentials
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> (StatusCode, Json<ApiResponse<UserResponse>>) {
    match state.users.authenticate(&req.username, &req.password).await {
        Ok(user) => {
            info!("API: User {} logged in", user.username);
            (StatusCode::OK, Json(ApiResponse::success(user.into())))
        }
        Err(e) => {
            warn!("API: Login of {} failed: {}", req.username, e);
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// Health check
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "ok".to_string(),
        sessions: state.relay.registry().len().await,
    }))
}
