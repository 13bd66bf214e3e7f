//! cubist.toml handling
//!
//! ```toml
//! [server]
//! url = "https://tm1.example.com:8010/api/v1"
//! user = "admin"
//! password = "apple"
//!
//! [engine]
//! max_workers = 4
//! ```

use anyhow::{Context, Result};
use cubist_cellset::EngineConfig;
use cubist_http::{HttpClientConfig, SessionContext};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// File read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "cubist.toml";

/// Environment variable overriding `server.url`
pub const URL_ENV: &str = "CUBIST_URL";

/// Connection settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: Option<String>,
    /// Skips version discovery when set
    pub version: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub sandbox: Option<String>,
    pub timeout_secs: Option<f64>,
    pub headers: BTreeMap<String, String>,
    pub accept_invalid_certs: bool,
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

impl CliConfig {
    /// Load `path`, or `cubist.toml` when present. A missing default file
    /// gives the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::read(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply environment overrides looked up through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.server.url = Some(url);
        }
        self
    }

    pub fn http_config(&self) -> Result<HttpClientConfig> {
        let server = &self.server;
        let url = server
            .url
            .as_deref()
            .with_context(|| format!("No server url; set server.url or {}", URL_ENV))?;

        let mut config = HttpClientConfig::new()
            .base_url(url)
            .danger_accept_invalid_certs(server.accept_invalid_certs);
        if let Some(secs) = server.timeout_secs {
            config = config.timeout_secs(secs);
        }
        if let Some(user) = &server.user {
            config = config.basic_auth(user.clone(), server.password.clone().unwrap_or_default());
        }
        for (name, value) in &server.headers {
            config = config.default_header(name.clone(), value.clone());
        }
        Ok(config)
    }

    /// Session for a configured version; `None` means ask the server.
    pub fn session(&self) -> Option<SessionContext> {
        let version = self.server.version.as_ref()?;
        let mut session = SessionContext::new().with_version(version.clone());
        if let Some(sandbox) = &self.server.sandbox {
            session = session.with_sandbox(sandbox.clone());
        }
        Some(session)
    }
}
