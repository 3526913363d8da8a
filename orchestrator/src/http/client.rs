//! HTTP client implementation

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error};
use url::Url;

use crate::errors::ConveyorError;

/// Basic auth credentials
#[derive(Debug)]
pub struct BasicAuth {
    pub user: String,
    pub password: SecretString,
}

impl BasicAuth {
    /// Credentials, or `None` when no user is configured
    pub fn from_parts(user: &str, password: &str) -> Option<Self> {
        if user.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            password: SecretString::from(password.to_string()),
        })
    }
}

/// HTTP client bound to one external service
pub struct HttpClient {
    client: Client,
    base_url: String,
    auth: Option<BasicAuth>,
    error_kind: fn(String) -> ConveyorError,
}

impl HttpClient {
    /// Create a new HTTP client
    ///
    /// `error_kind` wraps non-success responses into the caller's error
    /// variant.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        auth: Option<BasicAuth>,
        error_kind: fn(String) -> ConveyorError,
    ) -> Result<Self, ConveyorError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            error_kind,
        })
    }

    /// Start a request for base URL + percent-encoded path segments
    pub fn request_segments(
        &self,
        method: Method,
        segments: &[&str],
    ) -> Result<RequestBuilder, ConveyorError> {
        let url = self.segments_url(segments)?;
        debug!("{} {}", method, url);

        let request = self.client.request(method, url);
        Ok(match &self.auth {
            Some(auth) => request.basic_auth(&auth.user, Some(auth.password.expose_secret())),
            None => request,
        })
    }

    /// Base URL extended by path segments, each percent-encoded
    pub fn segments_url(&self, segments: &[&str]) -> Result<Url, ConveyorError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| self.error(format!("invalid base url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| self.error(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request and fail on non-2xx status
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, ConveyorError> {
        let response = request.send().await?;
        self.check(response).await
    }

    /// Map a non-2xx response into the configured error variant
    pub async fn check(&self, response: Response) -> Result<Response, ConveyorError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        error!("HTTP request to {} failed: {} - {}", url, status, body);
        Err((self.error_kind)(format!("{}: {}", status, body)))
    }

    /// Wrap an arbitrary message into the configured error variant
    pub fn error(&self, message: impl Into<String>) -> ConveyorError {
        (self.error_kind)(message.into())
    }
}
