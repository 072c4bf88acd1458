use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use wbx_vfs::{FetchError, Fetcher};

use crate::config::FetchConfig;
use crate::error::HostError;

/// Full-body GET of remote assets. 2xx and 304 count as success.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, HostError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| HostError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let transport = |err: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !(status.is_success() || status == StatusCode::NOT_MODIFIED) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        tracing::debug!(%url, bytes = body.len(), "fetched asset");
        Ok(body)
    }
}
