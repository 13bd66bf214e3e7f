//! Request description relative to the service root

use bytes::Bytes;
use cubist_common::HttpMethod;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use std::fmt;

use crate::error::{HttpError, HttpResult};

/// Request body variants
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    None,
    /// JSON body
    Json(serde_json::Value),
    /// Raw bytes with their content type
    Bytes { data: Bytes, content_type: String },
}

/// A single call to the server.
///
/// `path` is relative to the service root, e.g. `Cellsets('abc')/Cells`.
/// Query values are kept unencoded; the client encodes them on the way out.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl Request {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    /// Append a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a JSON body from an existing value
    pub fn json_value(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    /// Serialize a JSON body
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> HttpResult<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| HttpError::Json(format!("Failed to serialize body: {}", e)))?;
        Ok(self.json_value(value))
    }

    /// Set a raw body
    pub fn bytes(mut self, data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Bytes {
            data: data.into(),
            content_type: content_type.into(),
        };
        self
    }

    /// Value of a query parameter, if set
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Content type implied by the body
    pub fn content_type(&self) -> Option<&str> {
        if let Some((_, v)) = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
        {
            return Some(v.as_str());
        }
        match &self.body {
            RequestBody::None => None,
            RequestBody::Json(_) => Some("application/json"),
            RequestBody::Bytes { content_type, .. } => Some(content_type.as_str()),
        }
    }

    /// Resolve against the service root into an absolute URL
    pub fn url(&self, base_url: Option<&str>) -> HttpResult<url::Url> {
        let joined = match base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.path.trim_start_matches('/')
            ),
            None => self.path.clone(),
        };
        let mut url = url::Url::parse(&joined)?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Quote a name for use inside an OData key, doubling single quotes.
pub fn odata_quote(name: &str) -> String {
    name.replace('\'', "''")
}
