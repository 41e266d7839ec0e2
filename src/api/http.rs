//! HTTP implementation of the backend boundary.
//!
//! REST-style endpoints under the configured base URL. Transient failures
//! (timeouts, network errors, 5xx) retry with exponential backoff;
//! everything else surfaces immediately. Response bodies are read with a
//! hard size cap so a misbehaving server cannot exhaust memory.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::{
    ApiError, Backend, ListPage, ListPageWire, ListQuery, MarkAllReadRequest, MarkReadRequest,
    MutationResponse, MutationResponseWire, SetScoreRequest, SetStarredRequest,
};
use crate::config::ClientConfig;
use crate::model::{Entry, EntryId, EntryWire};

/// Maximum response body size (5 MB). List pages are bounded by the page
/// limit; anything larger is a server bug, not data we want in memory.
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// HTTP transport for the typed command interface.
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    auth_token: Option<SecretString>,
    timeout: Duration,
    max_retries: u32,
}

impl HttpBackend {
    /// Build a transport from the client configuration.
    ///
    /// Enforces HTTPS for the base URL to prevent token exposure; HTTP is
    /// allowed only for localhost/127.0.0.1 (local servers and tests).
    /// The RIPTIDE_API_TOKEN env var takes precedence over the config
    /// file's `auth_token`.
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let base = &config.api_base_url;
        if !base.starts_with("https://") {
            let is_localhost =
                base.starts_with("http://127.0.0.1") || base.starts_with("http://localhost");
            if !is_localhost {
                tracing::error!(base_url = %base, "Rejecting non-HTTPS base URL (HTTPS required except for localhost)");
                return Err(ApiError::InsecureBaseUrl);
            }
            tracing::warn!(base_url = %base, "Using non-HTTPS API base URL (localhost only)");
        }
        let base = Url::parse(base).map_err(|e| ApiError::InvalidBaseUrl(e.to_string()))?;

        let auth_token = std::env::var("RIPTIDE_API_TOKEN")
            .ok()
            .or_else(|| config.auth_token.clone())
            .map(SecretString::from);

        // Connection pooling and keepalive tuned for a chatty client:
        // many small requests against one host.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base,
            auth_token,
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::InvalidBaseUrl(e.to_string()))
    }

    /// Attach the bearer token. Requests only ever target the configured
    /// base URL, so the token cannot leak to third-party origins.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(
                "Authorization",
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    /// GET with retry for transient failures. Backoff: 1s, 2s, 4s.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Option<&ListQuery>,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        let mut retry_count: u32 = 0;
        loop {
            let mut request = self.client.get(url.clone());
            if let Some(query) = query {
                request = request.query(query);
            }
            match self.execute(self.authorize(request)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry_count < self.max_retries => {
                    retry_count = self.backoff(&e, retry_count).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// POST with the same retry policy as `get_json`. Mutation endpoints
    /// are idempotent server-side (keyed on `changed_at`), so retrying a
    /// write that may have landed is safe.
    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        let mut retry_count: u32 = 0;
        loop {
            let request = self.client.post(url.clone()).json(body);
            match self.execute(self.authorize(request)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry_count < self.max_retries => {
                    retry_count = self.backoff(&e, retry_count).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backoff(&self, error: &ApiError, retry_count: u32) -> u32 {
        let delay = 1u64 << retry_count;
        tracing::debug!(
            error = %error,
            retry = retry_count + 1,
            delay_secs = delay,
            "Retrying request after transient error"
        );
        tokio::time::sleep(Duration::from_secs(delay)).await;
        retry_count + 1
    }

    /// Run one attempt: timeout, status check, bounded body read, decode.
    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ApiError::Timeout)?
            .map_err(ApiError::Network)?;

        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited(response, MAX_RESPONSE_SIZE).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_entries(&self, query: ListQuery) -> Result<ListPage, ApiError> {
        let wire: ListPageWire = self.get_json("api/entries", Some(&query)).await?;
        Ok(wire.into_page())
    }

    async fn entry(&self, id: EntryId) -> Result<Entry, ApiError> {
        let wire: EntryWire = self.get_json(&format!("api/entries/{}", id), None).await?;
        Ok(wire.into_entry())
    }

    async fn mark_read(&self, request: MarkReadRequest) -> Result<MutationResponse, ApiError> {
        let wire: MutationResponseWire =
            self.post_json("api/entries/mark-read", &request).await?;
        Ok(wire.into_response())
    }

    async fn set_starred(&self, request: SetStarredRequest) -> Result<MutationResponse, ApiError> {
        let wire: MutationResponseWire = self.post_json("api/entries/star", &request).await?;
        Ok(wire.into_response())
    }

    async fn set_score(&self, request: SetScoreRequest) -> Result<MutationResponse, ApiError> {
        let wire: MutationResponseWire = self.post_json("api/entries/score", &request).await?;
        Ok(wire.into_response())
    }

    async fn mark_all_read(
        &self,
        request: MarkAllReadRequest,
    ) -> Result<MutationResponse, ApiError> {
        let wire: MutationResponseWire =
            self.post_json("api/entries/mark-all-read", &request).await?;
        Ok(wire.into_response())
    }
}

async fn read_limited(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, ApiError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(ApiError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ApiError::Network)?;
        // saturating_add: no integer overflow in the size check
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ApiError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
