use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Client;
use tracing::debug;

use tokn_core::error::{Result, ToknError};

use crate::adapter::PreparedRequest;
use crate::streaming::{FragmentStream, RawFragment};

/// A live response body, already split into fragments.
pub type FragmentBoxStream = BoxStream<'static, Result<RawFragment>>;

/// Sends a prepared request and streams back its framed body.
///
/// A non-success status is an error here, before any fragment is produced.
pub trait LlmTransport: Send + Sync {
    fn open(&self, request: PreparedRequest) -> BoxFuture<'_, Result<FragmentBoxStream>>;
}

/// `reqwest`-backed transport used outside tests.
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmTransport for HttpTransport {
    fn open(&self, request: PreparedRequest) -> BoxFuture<'_, Result<FragmentBoxStream>> {
        Box::pin(async move {
            let mut req = self.http.post(&request.url).json(&request.body);
            for (k, v) in &request.headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(url = %request.url, framing = ?request.framing, "Opening provider stream");
            let response = req
                .send()
                .await
                .map_err(|e| ToknError::ProviderRequest(e.without_url().to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ToknError::ProviderRequest(format!("HTTP {}: {}", status, body)));
            }

            let byte_stream = Box::pin(response.bytes_stream());
            Ok(Box::pin(FragmentStream::new(byte_stream, request.framing)) as FragmentBoxStream)
        })
    }
}
