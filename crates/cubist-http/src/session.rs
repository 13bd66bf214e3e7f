//! Per-session context threaded through every call

use std::cmp::Ordering;
use tracing::debug;

use crate::error::{HttpError, HttpResult};
use crate::request::Request;
use crate::transport::Transport;

/// Server version and sandbox selection for a session.
///
/// When a sandbox is set, requests that create, read, patch or release a
/// cellset carry it as the `!sandbox` query parameter. Everything else
/// goes out unchanged; generated procedures select the sandbox in their
/// own code instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub server_version: Option<String>,
    pub sandbox: Option<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = Some(version.into());
        self
    }

    pub fn with_sandbox(mut self, sandbox: impl Into<String>) -> Self {
        self.sandbox = Some(sandbox.into());
        self
    }

    /// Ask the server for its product version.
    pub async fn discover(transport: &dyn Transport) -> HttpResult<Self> {
        let response = transport
            .execute(Request::get("Configuration/ProductVersion/$value"))
            .await?;
        let version = response.text()?.trim().trim_matches('"').to_string();
        if version.is_empty() {
            return Err(HttpError::ResponseError(
                "server returned an empty product version".to_string(),
            ));
        }
        debug!(version = %version, "discovered server version");
        Ok(Self::new().with_version(version))
    }

    /// True when the server version is known and at least `minimum`.
    ///
    /// Versions compare component-wise on their numeric parts, so
    /// `11.8.01500.4` is at least `11.8.015`.
    pub fn version_at_least(&self, minimum: &str) -> bool {
        match &self.server_version {
            Some(version) => compare_versions(version, minimum) != Ordering::Less,
            None => false,
        }
    }

    /// Major version number, if known
    pub fn major_version(&self) -> Option<u32> {
        self.server_version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Attach the session parameters to a request.
    pub fn apply(&self, request: Request) -> Request {
        match &self.sandbox {
            Some(sandbox)
                if addresses_cellset(&request.path) && request.query_value("!sandbox").is_none() =>
            {
                request.query("!sandbox", sandbox.clone())
            }
            _ => request,
        }
    }
}

/// Cellset routes: MDX and view execution plus `Cellsets(...)` itself.
fn addresses_cellset(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    path == "ExecuteMDX"
        || path.starts_with("Cellsets(")
        || (path.starts_with("Cubes(") && path.ends_with("/tm1.Execute"))
}

fn compare_versions(version: &str, minimum: &str) -> Ordering {
    let left: Vec<&str> = version.split('.').map(str::trim).collect();
    let right: Vec<&str> = minimum.split('.').map(str::trim).collect();
    for i in 0..left.len().max(right.len()) {
        let a = left.get(i).copied().unwrap_or("0");
        let b = right.get(i).copied().unwrap_or("0");
        let ord = if i < 2 {
            a.parse::<u64>().unwrap_or(0).cmp(&b.parse::<u64>().unwrap_or(0))
        } else {
            // Build fields are zero-padded prefixes: "015" equals "01500"
            let width = a.len().max(b.len());
            format!("{:0<width$}", a).cmp(&format!("{:0<width$}", b))
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
