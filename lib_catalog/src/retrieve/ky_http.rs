//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous API client wrapper around `reqwest`.
//! Each client is bound to one outbound identity (direct or a single proxy),
//! carries its own request deadline and optionally layers exponential-backoff
//! retries on top via `reqwest-retry`.
//!
//! Non-2xx statuses are not errors here: they come back inside an
//! [`ApiResponse`] so that callers can classify 401/404/429 themselves.

use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_TYPE, COOKIE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Failures that prevented a response from being obtained or decoded.
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("invalid proxy `{proxy}`: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to join `{path}` onto base url: {source}")]
    Url {
        path: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("failed to read response body: {0}")]
    Body(#[from] reqwest::Error),

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RetrieveError {
    /// True when the request never produced a usable answer because of the
    /// network (connect failure, deadline, reset) rather than a bad payload.
    pub fn is_transport(&self) -> bool {
        matches!(self, RetrieveError::Transport(_))
    }
}

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Construction options for an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Deadline applied to every request made through the client.
    pub timeout: Duration,
    /// Transient-failure retries handled by middleware. Zero disables the
    /// middleware entirely; callers then own their retry policy.
    pub max_retries: u32,
    /// Route every request through this proxy URL.
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            max_retries: 0,
            proxy: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36".to_string(),
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs, the session
/// cookie header and optional automatic retries.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient` bound to `base_url`.
    ///
    /// # Errors
    /// Fails if the proxy URL is malformed or the TLS backend cannot start.
    pub fn new(base_url: Url, options: &ClientOptions) -> Result<Self, RetrieveError> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent.clone());

        if let Some(proxy) = &options.proxy {
            let proxy_cfg = reqwest::Proxy::all(proxy).map_err(|source| RetrieveError::Proxy {
                proxy: proxy.clone(),
                source,
            })?;
            builder = builder.proxy(proxy_cfg);
        }

        let client = builder.build().map_err(RetrieveError::Build)?;

        let mut middleware = ClientBuilder::new(client);
        if options.max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
            middleware = middleware.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: middleware.build(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a generic HTTP request and decodes a JSON body on success.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The path to join onto the base URL; absolute URLs replace it.
    /// * `headers` - Optional additional headers for this specific request.
    /// * `cookie` - Optional `Cookie` header value for the current session.
    /// * `body` - Optional serializable object to send as the JSON body.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        cookie: Option<&str>,
        body: Option<B>,
    ) -> Result<ApiResponse<T>, RetrieveError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let response = self.send(method, path, headers, cookie, body).await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Like [`ApiClient::request`] but keeps the response body as text, for
    /// HTML pages, webhooks answering `204` and other non-JSON endpoints.
    pub async fn request_text<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> Result<ApiResponse<String>, RetrieveError> {
        let response = self.send(method, path, headers, None, body).await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let text = response.text().await?;
        let success = status.is_success();

        Ok(ApiResponse {
            data: success.then(|| text.clone()),
            error_body: (!success).then_some(text),
            status: status.as_u16(),
            success,
            headers: resp_headers,
        })
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        cookie: Option<&str>,
        body: Option<B>,
    ) -> Result<reqwest::Response, RetrieveError> {
        let full_url = self.base_url.join(path).map_err(|source| RetrieveError::Url {
            path: path.to_string(),
            source,
        })?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            req = req.header(COOKIE, cookie);
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        Ok(req.send().await?)
    }
}
