//! HTTP client with connection pooling and async operations

use crate::config::{Credentials, HttpClientConfig};
use crate::error::{HttpError, HttpResult};
use crate::request::{Request, RequestBody};
use crate::response::{from_reqwest, HttpResponse};
use cubist_common::HttpMethod;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Async HTTP client bound to one cube server
///
/// # Example
///
/// ```ignore
/// use cubist_http::{HttpClient, HttpClientConfig, Request};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = HttpClientConfig::new()
///         .base_url("https://tm1.example.com:8010/api/v1")
///         .basic_auth("admin", "apple");
///
///     let client = HttpClient::new(config)?;
///
///     let response = client.send(Request::get("Configuration/ProductVersion/$value")).await?;
///     println!("Status: {}, Latency: {}ms", response.status_code, response.latency_ms);
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<HttpClientInner>,
}

struct HttpClientInner {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpClient {
    /// Create a new HTTP client with the given configuration
    pub fn new(config: HttpClientConfig) -> HttpResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HttpError::InvalidRequest(format!("header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::InvalidRequest(format!("header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            // Server keeps the session in a cookie after the first call
            .cookie_store(true);

        // Configure compression
        builder = builder.gzip(config.gzip).brotli(config.brotli);

        // Danger: Accept invalid certificates (testing only)
        if config.danger_accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build()?;

        Ok(Self {
            inner: Arc::new(HttpClientInner { client, config }),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> Option<&str> {
        self.inner.config.base_url.as_deref()
    }

    /// Send a request and return the response whatever its status
    pub async fn send(&self, request: Request) -> HttpResult<HttpResponse> {
        let start = Instant::now();
        let url = request.url(self.base_url())?;

        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.inner.client.request(method, url);
        if let Credentials::Basic { user, password } = &self.inner.config.credentials {
            builder = builder.basic_auth(user, Some(password));
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::None => builder,
            RequestBody::Json(ref value) => builder.json(value),
            RequestBody::Bytes {
                ref data,
                ref content_type,
            } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
        };

        let response = builder.send().await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        let response = from_reqwest(response, latency_ms).await?;

        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status_code,
            latency_ms,
            "request completed"
        );

        Ok(response)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.inner.config.base_url)
            .field("timeout", &self.inner.config.timeout)
            .finish()
    }
}
