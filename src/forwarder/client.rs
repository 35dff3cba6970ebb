//! HTTP delivery to the partner gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tracing::trace;

use crate::error::ForwardError;

/// Gateway reply to a delivered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

/// Sends one command URL to the gateway.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Issue the GET. A non-2xx status is an error.
    async fn send(&self, url: &Url, timeout: Duration) -> Result<GatewayResponse, ForwardError>;
}

/// `reqwest`-backed client.
#[derive(Debug, Clone, Default)]
pub struct HttpGatewayClient {
    client: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn send(&self, url: &Url, timeout: Duration) -> Result<GatewayResponse, ForwardError> {
        trace!(%url, "Sending gateway request");
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ForwardError::Http(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ForwardError::Status(status.as_u16()));
        }
        Ok(GatewayResponse {
            status: status.as_u16(),
            body,
        })
    }
}
