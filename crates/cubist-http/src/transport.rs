//! The transport seam between the engine and the wire

use async_trait::async_trait;
use std::sync::Arc;

use crate::client::HttpClient;
use crate::error::{HttpError, HttpResult};
use crate::request::Request;
use crate::response::HttpResponse;

/// Executes requests against a cube server.
///
/// Implementations return `Err(HttpError::Status { .. })` for any non-2xx
/// answer so callers only ever see successful responses in `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: Request) -> HttpResult<HttpResponse>;
}

#[async_trait]
impl Transport for HttpClient {
    async fn execute(&self, request: Request) -> HttpResult<HttpResponse> {
        let method = request.method;
        let path = request.path.clone();
        let response = self.send(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(HttpError::Status {
            status,
            method,
            path,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        })
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: Request) -> HttpResult<HttpResponse> {
        (**self).execute(request).await
    }
}
