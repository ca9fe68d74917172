/// Asterisk REST Interface (ARI) client
///
/// Implements the telephony control port over HTTP. Every request carries
/// the cached API key; an auth rejection triggers one re-authentication and
/// one retry before the operation fails.

use crate::config::TelephonyConfig;
use crate::domain::shared::error::{Result, SignalingError};
use crate::domain::shared::value_objects::{BridgeId, ChannelId};
use crate::domain::telephony::TelephonyControl;
use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// ARI client errors
#[derive(Error, Debug)]
pub enum AriError {
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl From<AriError> for SignalingError {
    fn from(e: AriError) -> Self {
        SignalingError::TelephonyUnavailable(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiKeyResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
}

/// One ARI call, replayable after re-authentication
struct AriRequest {
    method: Method,
    path: String,
    body: Option<Value>,
}

impl AriRequest {
    fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    fn delete(path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            body,
        }
    }
}

/// ARI HTTP client
pub struct AriClient {
    http: reqwest::Client,
    config: TelephonyConfig,
    api_key: RwLock<Option<String>>,
}

impl AriClient {
    pub fn new(config: TelephonyConfig) -> std::result::Result<Self, AriError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            config,
            api_key: RwLock::new(None),
        })
    }

    /// Exchange the configured credentials for a short-lived API key
    pub async fn authenticate(&self) -> std::result::Result<String, AriError> {
        let response = self
            .http
            .post(self.url("apiKey"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(AriError::Unauthorized(format!("{}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AriError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let key: ApiKeyResponse = response
            .json()
            .await
            .map_err(|e| AriError::Decode(e.to_string()))?;

        *self.api_key.write().await = Some(key.api_key.clone());
        debug!("Authenticated with ARI at {}", self.config.base_url);
        Ok(key.api_key)
    }

    async fn credential(&self, refresh: bool) -> std::result::Result<String, AriError> {
        if !refresh {
            if let Some(key) = self.api_key.read().await.clone() {
                return Ok(key);
            }
        }
        self.authenticate().await
    }

    /// Run a request, re-authenticating at most once
    async fn call(&self, request: &AriRequest) -> std::result::Result<Option<Value>, AriError> {
        let mut refreshed = false;

        loop {
            let key = match self.credential(refreshed).await {
                Ok(key) => key,
                Err(AriError::Unauthorized(reason)) if !refreshed => {
                    warn!("ARI authentication rejected ({}), retrying once", reason);
                    refreshed = true;
                    continue;
                }
                Err(e) => {
                    error!("Failed to authenticate with ARI: {}", e);
                    return Err(e);
                }
            };

            match self.send(request, &key).await {
                Err(AriError::Unauthorized(reason)) if !refreshed => {
                    warn!(
                        "ARI rejected credential for {} {} ({}), re-authenticating",
                        request.method, request.path, reason
                    );
                    self.api_key.write().await.take();
                    refreshed = true;
                }
                result => return result,
            }
        }
    }

    async fn send(&self, request: &AriRequest, key: &str) -> std::result::Result<Option<Value>, AriError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url(&request.path))
            .header(header::AUTHORIZATION, format!("Basic {}", key));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AriError::Unauthorized(format!("{}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            return Err(AriError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| AriError::Decode(e.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub async fn remove_channel_from_bridge(
        &self,
        channel: &ChannelId,
        bridge: &BridgeId,
    ) -> std::result::Result<(), AriError> {
        self.call(&AriRequest::delete(
            format!("bridges/{}/removeChannel", bridge),
            Some(json!({ "channel": channel.as_str() })),
        ))
        .await?;
        info!("Channel {} removed from bridge {}", channel, bridge);
        Ok(())
    }

    pub async fn destroy_bridge(&self, bridge: &BridgeId) -> std::result::Result<(), AriError> {
        self.call(&AriRequest::post(format!("bridges/{}/destroy", bridge), json!({})))
            .await?;
        info!("Bridge {} destroyed", bridge);
        Ok(())
    }

    pub async fn hangup_channel(&self, channel: &ChannelId) -> std::result::Result<(), AriError> {
        self.call(&AriRequest::delete(format!("channels/{}", channel), None))
            .await?;
        info!("Channel {} hung up", channel);
        Ok(())
    }
}

fn resource_id(response: Option<Value>, what: &str) -> std::result::Result<String, AriError> {
    response
        .as_ref()
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AriError::Decode(format!("{} response has no id", what)))
}

fn record_release_failure(step: &'static str) {
    metrics::counter!("webphone_telephony_release_failures_total", "step" => step).increment(1);
}

#[async_trait]
impl TelephonyControl for AriClient {
    async fn allocate_channel(&self, endpoint: &str) -> Result<ChannelId> {
        let response = self
            .call(&AriRequest::post(
                "channels",
                json!({
                    "endpoint": endpoint,
                    "app": self.config.app,
                    "appArgs": self.config.app_args,
                }),
            ))
            .await
            .map_err(|e| {
                error!("Failed to create channel: {}", e);
                e
            })?;

        let id = ChannelId::new(resource_id(response, "channel")?);
        info!("Channel created: {}", id);
        Ok(id)
    }

    async fn allocate_bridge(&self) -> Result<BridgeId> {
        let response = self
            .call(&AriRequest::post("bridges", json!({})))
            .await
            .map_err(|e| {
                error!("Failed to create bridge: {}", e);
                e
            })?;

        let id = BridgeId::new(resource_id(response, "bridge")?);
        info!("Bridge created: {}", id);
        Ok(id)
    }

    async fn attach_channel_to_bridge(&self, channel: &ChannelId, bridge: &BridgeId) -> Result<()> {
        self.call(&AriRequest::post(
            format!("channels/{}/continueInDialplan", channel),
            json!({
                "app": self.config.dialplan_app,
                "appArgs": format!("both_bridges,{}", bridge),
            }),
        ))
        .await
        .map_err(|e| {
            error!("Failed to continue channel {} in dialplan: {}", channel, e);
            e
        })?;

        info!("Channel {} continued in dialplan to bridge {}", channel, bridge);
        Ok(())
    }

    async fn release(&self, channel: Option<ChannelId>, bridge: Option<BridgeId>) {
        if let (Some(channel), Some(bridge)) = (&channel, &bridge) {
            if let Err(e) = self.remove_channel_from_bridge(channel, bridge).await {
                error!("Error removing channel {} from bridge {}: {}", channel, bridge, e);
                record_release_failure("remove_channel");
            }
        }

        if let Some(bridge) = &bridge {
            if let Err(e) = self.destroy_bridge(bridge).await {
                error!("Error destroying bridge {}: {}", bridge, e);
                record_release_failure("destroy_bridge");
            }
        }

        if let Some(channel) = &channel {
            if let Err(e) = self.hangup_channel(channel).await {
                warn!("Error hanging up channel {}: {}", channel, e);
                record_release_failure("hangup_channel");
            }
        }
    }
}
