//! Engine configuration

use cubist_http::SessionContext;
use serde::{Deserialize, Serialize};

use crate::retry::LogRetryPolicy;

/// Statements per procedure section on older servers
pub const MAX_STATEMENTS: usize = 16_380;
/// Statements per procedure section from 11.8.015 on
pub const MAX_STATEMENTS_POST_11_8_015: usize = 100_000;

/// Knobs for reads, writes and uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent partition reads and part uploads; 1 means sequential
    pub max_workers: usize,
    /// Keep successful partitions when others fail
    pub best_effort: bool,
    /// Values per direct cellset update request
    pub chunk_size: usize,
    /// Statements per procedure section; derived from the server version when unset
    pub max_statements: Option<usize>,
    /// Bytes per multipart upload part
    pub part_size_bytes: usize,
    /// Concurrent part uploads
    pub upload_workers: usize,
    /// Polling policy for error logs
    pub log_retry: LogRetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            best_effort: false,
            chunk_size: 50_000,
            max_statements: None,
            part_size_bytes: 200 * 1024 * 1024,
            upload_workers: 1,
            log_retry: LogRetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn best_effort(mut self, enabled: bool) -> Self {
        self.best_effort = enabled;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn max_statements(mut self, max: usize) -> Self {
        self.max_statements = Some(max.max(1));
        self
    }

    pub fn part_size_bytes(mut self, size: usize) -> Self {
        self.part_size_bytes = size.max(1);
        self
    }

    pub fn upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers.max(1);
        self
    }

    pub fn log_retry(mut self, policy: LogRetryPolicy) -> Self {
        self.log_retry = policy;
        self
    }

    /// Statements per procedure section for this session's server.
    pub fn statements_per_section(&self, session: &SessionContext) -> usize {
        match self.max_statements {
            Some(max) => max.max(1),
            None if session.version_at_least("11.8.015") => MAX_STATEMENTS_POST_11_8_015,
            None => MAX_STATEMENTS,
        }
    }
}
