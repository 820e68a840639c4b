//! Network seam for the resource cache.
//!
//! The cache never talks to the network directly; it goes through the
//! `Fetcher` trait so tests can script responses and failures.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A fully buffered response from the network.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchedResponse {
    /// Whether the response is cacheable (2xx).
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A failed fetch attempt (unreachable host, timeout, ...).
#[derive(Debug, Error)]
#[error("fetch failed for {url}: {message}")]
pub struct FetchError {
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn new(url: impl Into<String>, message: impl ToString) -> Self {
        Self {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

/// Performs raw HTTP requests on behalf of the cache.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, method: &str, url: &str) -> Result<FetchedResponse, FetchError>;
}

/// `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, method: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| FetchError::new(url, e))?;

        let response = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(|e| FetchError::new(url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::new(url, e))?;

        Ok(FetchedResponse {
            status,
            headers,
            body,
        })
    }
}
