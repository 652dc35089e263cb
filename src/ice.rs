//! ICE server resolution
//!
//! STUN servers are always available. TURN credentials come from a
//! credential endpoint and are reused until the cache expires. A failed or
//! empty fetch degrades to STUN only and is retried on the next call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::IceConfig;
use crate::error::{AppError, Result};

/// ICE server descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// A single URL or a list of URLs on the wire
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

/// Credential endpoint response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialResponse {
    #[serde(default)]
    ice_servers: Vec<IceServer>,
}

/// Where TURN credentials come from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServer>>;
}

/// HTTP credential endpoint (`POST {}` -> `{"iceServers": [...]}`)
pub struct HttpCredentialSource {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpCredentialSource {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<Vec<IceServer>> {
        let mut request = self.client.post(&self.endpoint).json(&serde_json::json!({}));
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "Credential endpoint returned {}",
                response.status()
            )));
        }

        let body: CredentialResponse = response.json().await?;
        Ok(body.ice_servers)
    }
}

struct CachedServers {
    servers: Vec<IceServer>,
    expires_at: Instant,
}

/// Resolves the ICE server list for new peer connections
pub struct IceCredentialProvider {
    stun: Vec<IceServer>,
    source: Option<Arc<dyn CredentialSource>>,
    ttl: Duration,
    fetch_timeout: Duration,
    cache: Mutex<Option<CachedServers>>,
}

impl IceCredentialProvider {
    pub fn new(config: &IceConfig, source: Option<Arc<dyn CredentialSource>>) -> Self {
        Self {
            stun: config.stun_servers.iter().map(IceServer::stun).collect(),
            source,
            ttl: Duration::from_millis(config.cache_ttl_ms),
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            cache: Mutex::new(None),
        }
    }

    /// Build from config, using the HTTP endpoint when one is configured
    pub fn from_config(config: &IceConfig) -> Result<Self> {
        let source = match config.credential_endpoint {
            Some(ref endpoint) => Some(Arc::new(HttpCredentialSource::new(
                endpoint.clone(),
                config.credential_token.clone(),
                Duration::from_millis(config.fetch_timeout_ms),
            )?) as Arc<dyn CredentialSource>),
            None => None,
        };
        Ok(Self::new(config, source))
    }

    pub fn stun_servers(&self) -> &[IceServer] {
        &self.stun
    }

    /// STUN plus TURN when available. Never fails.
    pub async fn get_ice_servers(&self) -> Vec<IceServer> {
        let mut cache = self.cache.lock().await;
        if let Some(ref cached) = *cache {
            if Instant::now() < cached.expires_at {
                info!("Using cached TURN credentials");
                return cached.servers.clone();
            }
        }

        let Some(ref source) = self.source else {
            return self.stun.clone();
        };

        let turn = match tokio::time::timeout(self.fetch_timeout, source.fetch()).await {
            Ok(Ok(servers)) => servers,
            Ok(Err(e)) => {
                warn!("TURN credential fetch failed: {} - using STUN only", e);
                *cache = None;
                return self.stun.clone();
            }
            Err(_) => {
                warn!("TURN credential fetch timed out - using STUN only");
                *cache = None;
                return self.stun.clone();
            }
        };

        if turn.is_empty() {
            warn!("No TURN servers returned, STUN only");
            *cache = None;
            return self.stun.clone();
        }

        info!("TURN credentials fetched: {} servers", turn.len());
        let mut servers = self.stun.clone();
        servers.extend(turn);
        *cache = Some(CachedServers {
            servers: servers.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        servers
    }
}
