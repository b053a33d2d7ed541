//! Download transport collaborator

use anyhow::{Context, Result};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::AcquisitionConfig;

/// Per-request transport options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Accept any server certificate
    pub skip_cert_verify: bool,
}

/// An open response whose body is consumed in caller-sized chunks
#[async_trait::async_trait]
pub trait ResponseStream: Send {
    /// HTTP status code
    fn status(&self) -> u16;

    /// Advertised body length, if the server sent one
    fn content_length(&self) -> Option<u64>;

    /// Read up to `buf.len()` body bytes; `Ok(0)` means end of body
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Opens download streams
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect and send the request; body bytes are pulled via the returned stream
    async fn open(&self, url: &Url, options: &RequestOptions) -> Result<Box<dyn ResponseStream>>;
}

/// HTTP(S) transport backed by reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl HttpTransport {
    /// Build clients with the configured timeouts and user agent
    pub fn new(config: &AcquisitionConfig) -> Result<Self> {
        let build = |insecure: bool| {
            reqwest::Client::builder()
                .connect_timeout(config.connect_timeout())
                .read_timeout(config.read_timeout())
                .user_agent(config.user_agent.clone())
                .danger_accept_invalid_certs(insecure)
                .build()
                .context("Failed to create HTTP client")
        };

        Ok(Self {
            client: build(false)?,
            insecure_client: build(true)?,
        })
    }

    /// Transport with default settings and the given timeout for both phases
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let config = AcquisitionConfig {
            connect_timeout_secs: timeout.as_secs().max(1),
            read_timeout_secs: timeout.as_secs().max(1),
            ..AcquisitionConfig::default()
        };
        Self::new(&config)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &Url, options: &RequestOptions) -> Result<Box<dyn ResponseStream>> {
        let client = if options.skip_cert_verify {
            &self.insecure_client
        } else {
            &self.client
        };

        let response = client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;

        debug!(
            "HTTP {} from {}, content-length {:?}",
            response.status(),
            url,
            response.content_length()
        );

        Ok(Box::new(HttpResponseStream {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            response,
            pending: Bytes::new(),
        }))
    }
}

struct HttpResponseStream {
    status: u16,
    content_length: Option<u64>,
    response: reqwest::Response,
    pending: Bytes,
}

#[async_trait::async_trait]
impl ResponseStream for HttpResponseStream {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.pending.is_empty() {
            match self
                .response
                .chunk()
                .await
                .context("Connection lost while reading body")?
            {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        let head = self.pending.split_to(n);
        if let Some(dst) = buf.get_mut(..n) {
            dst.copy_from_slice(&head);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_clients_from_config() -> Result<()> {
        HttpTransport::new(&AcquisitionConfig::default())?;
        HttpTransport::with_timeout(Duration::from_millis(10))?;
        Ok(())
    }

    #[test]
    fn test_request_options_default_verifies_certs() {
        assert!(!RequestOptions::default().skip_cert_verify);
    }
}
