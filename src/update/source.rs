//! # Update source abstraction and the HTTP implementation.
//!
//! The lifecycle manager only sees [`UpdateSource`]; tests plug in an in-memory
//! implementation, the binary uses [`HttpUpdateSource`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::response::{UpdateConfig, UpdateResponse};
use crate::config::AgentConfig;
use crate::devinfo::DevInfo;
use crate::error::AgentError;

/// # Where script versions come from.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use scriptvisor::{AgentError, UpdateConfig, UpdateSource};
///
/// struct Fixed(Vec<u8>);
///
/// #[async_trait]
/// impl UpdateSource for Fixed {
///     async fn fetch_metadata(&self) -> Result<UpdateConfig, AgentError> {
///         Ok(UpdateConfig {
///             md5: scriptvisor::checksum::md5_hex(&self.0),
///             url: "mem://script".into(),
///             project_id: None,
///         })
///     }
///
///     async fn fetch_script(&self, _url: &str) -> Result<Vec<u8>, AgentError> {
///         Ok(self.0.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait UpdateSource: Send + Sync + 'static {
    /// Returns the checksum and location of the current script.
    async fn fetch_metadata(&self) -> Result<UpdateConfig, AgentError>;

    /// Fetches the script content at `url`.
    async fn fetch_script(&self, url: &str) -> Result<Vec<u8>, AgentError>;
}

/// Control server client.
///
/// Every metadata request carries the agent version and device info as query
/// parameters.
pub struct HttpUpdateSource {
    client: reqwest::Client,
    server_url: String,
    project: Option<String>,
    query: Vec<(&'static str, String)>,
    timeout: Duration,
}

impl HttpUpdateSource {
    /// Creates a client for `cfg.server_url`.
    pub fn new(cfg: &AgentConfig, device: &DevInfo) -> Self {
        let mut query = device.query_pairs();
        query.push(("version", crate::VERSION.to_string()));
        Self {
            client: reqwest::Client::new(),
            server_url: cfg.server_url.clone(),
            project: cfg.project.clone(),
            query,
            timeout: cfg.http_timeout,
        }
    }

    async fn get(&self, url: &str, query: &[(&'static str, String)]) -> Result<Vec<u8>, AgentError> {
        let fetch_err = |e: reqwest::Error| AgentError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let resp = self
            .client
            .get(url)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(fetch_err)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await.map_err(fetch_err)?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn fetch_metadata(&self) -> Result<UpdateConfig, AgentError> {
        let body = self.get(&self.server_url, &self.query).await?;
        let resp: UpdateResponse = serde_json::from_slice(&body).map_err(|e| AgentError::Decode {
            reason: e.to_string(),
        })?;
        let cfg = resp
            .select(self.project.as_deref())
            .ok_or_else(|| AgentError::Decode {
                reason: format!("no entry for project {:?}", self.project),
            })?;
        debug!(md5 = %cfg.md5, url = %cfg.url, "update metadata");
        Ok(cfg)
    }

    async fn fetch_script(&self, url: &str) -> Result<Vec<u8>, AgentError> {
        self.get(url, &[]).await
    }
}
