//! HTTP client for the metadata service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::descriptor::Descriptor;

/// Where descriptors come from.
///
/// `fetch` returns the current descriptor immediately; `watch` blocks
/// server-side until the descriptor changes or the server's wait elapses,
/// whichever comes first.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn fetch(&self) -> Result<Descriptor>;
    async fn watch(&self) -> Result<Descriptor>;
}

/// Long-poll wait requested from the server, in seconds.
const WATCH_TIMEOUT_SECS: u64 = 60;

/// Slack on top of the server-side wait before the client gives up.
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Descriptor client over the metadata service's HTTP/JSON endpoint.
///
/// Watch requests carry the etag of the last seen snapshot so the server
/// only answers early when something actually changed.
pub struct MetadataClient {
    http: reqwest::Client,
    base: String,
    etag: Mutex<Option<String>>,
}

impl MetadataClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(WATCH_TIMEOUT_SECS) + CLIENT_TIMEOUT_SLACK)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base: endpoint.trim_end_matches('/').to_string(),
            etag: Mutex::new(None),
        })
    }

    async fn get(&self, watch: bool) -> Result<Descriptor> {
        let mut url = format!("{}/v1/descriptor?recursive=true", self.base);
        if watch {
            url.push_str(&format!("&watch=true&timeout_secs={WATCH_TIMEOUT_SECS}"));
            if let Some(etag) = self.etag.lock().await.as_deref() {
                url.push_str(&format!("&etag={etag}"));
            }
        }

        debug!(url = %url, "requesting descriptor");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("metadata request failed")?
            .error_for_status()
            .context("metadata server returned an error")?;

        if let Some(etag) = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
        {
            *self.etag.lock().await = Some(etag.to_string());
        }

        response
            .json::<Descriptor>()
            .await
            .context("malformed descriptor payload")
    }
}

#[async_trait]
impl DescriptorSource for MetadataClient {
    async fn fetch(&self) -> Result<Descriptor> {
        self.get(false).await
    }

    async fn watch(&self) -> Result<Descriptor> {
        self.get(true).await
    }
}
