//! Support to fetch resources from the backend service.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use url::Url;

use crate::config::BackendConfig;
use crate::identity::UserId;
use crate::keys::ResourceKind;

const USER_AGENT: &str = concat!("memocache/", env!("CARGO_PKG_VERSION"));

/// A resource as returned by the backend.
///
/// Payloads are shared between all callers that got them from the cache.
pub type Payload = Arc<serde_json::Value>;

/// An error that happens when fetching a resource from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend does not know the resource.
    #[error("not found")]
    NotFound,
    /// The backend responded with an unexpected status code.
    ///
    /// The details contain the response body, if it could be read.
    #[error("backend responded with {status}: {details}")]
    Status { status: u16, details: String },
    /// The backend did not respond in time.
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),
    /// The backend could not be reached, for example because of connection loss or DNS
    /// resolution failure.
    #[error("backend request failed: {0}")]
    Request(String),
    /// The backend responded successfully, but with something that is not JSON.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The user cannot be addressed as a single path segment.
    #[error("invalid user id `{0}`")]
    InvalidUser(String),
}

/// The backend service that computes the cached resources.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Fetches the resource of the given `kind` for `user`.
    async fn fetch(&self, kind: ResourceKind, user: &UserId) -> Result<Payload, BackendError>;
}

/// A [`Backend`] that is reached over HTTP.
///
/// Resources are fetched with `GET {url}/{kind}/{user}`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| BackendError::Request(err.to_string()))?;

        Ok(Self::with_client(client, config.url.clone(), config.timeout))
    }

    pub fn with_client(client: Client, base_url: Url, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    /// Appends `{kind}/{user}` to the base URL, escaping the user as a single path segment.
    fn resource_url(&self, kind: ResourceKind, user: &UserId) -> Result<Url, BackendError> {
        // `push` drops these segments instead of escaping them.
        if matches!(user.as_str(), "" | "." | "..") {
            return Err(BackendError::InvalidUser(user.to_string()));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Request(format!("cannot-be-a-base URL: {}", self.base_url)))?
            .pop_if_empty()
            .push(kind.as_str())
            .push(user.as_str());
        Ok(url)
    }

    fn convert_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else if err.is_decode() {
            BackendError::Malformed(err.to_string())
        } else {
            BackendError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch(&self, kind: ResourceKind, user: &UserId) -> Result<Payload, BackendError> {
        let url = self.resource_url(kind, user)?;
        tracing::debug!("Fetching {} from `{}`", kind, url);

        let response = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|err| self.convert_error(err))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!("Backend does not know `{}`", url);
            return Err(BackendError::NotFound);
        }
        if !status.is_success() {
            tracing::debug!("Unexpected status code from `{}`: {}", url, status);
            let details = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                details,
            });
        }

        let payload = response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| self.convert_error(err))?;
        Ok(Arc::new(payload))
    }
}
