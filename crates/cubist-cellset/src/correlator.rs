//! Execution status and error log correlation
//!
//! Procedure runs report a structured status and, when anything went
//! wrong, the name of an error log file. The log is written
//! asynchronously, so it is polled under a [`LogRetryPolicy`] before being
//! parsed into [`FailureRecord`]s.

use cubist_http::{odata_quote, Request};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::csv::parse_record;
use crate::error::{CellsetError, FailedCell, Result};
use crate::executor::CellsetExecutor;
use crate::retry::LogRetryPolicy;

/// Structured outcome of one procedure run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    CompletedSuccessfully,
    CompletedWithMessages,
    HasMinorErrors,
    Aborted,
    QuitCalled,
    Other(String),
}

impl ExecutionStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "CompletedSuccessfully" => Self::CompletedSuccessfully,
            "CompletedWithMessages" => Self::CompletedWithMessages,
            "HasMinorErrors" => Self::HasMinorErrors,
            "Aborted" => Self::Aborted,
            "QuitCalled" => Self::QuitCalled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CompletedSuccessfully => "CompletedSuccessfully",
            Self::CompletedWithMessages => "CompletedWithMessages",
            Self::HasMinorErrors => "HasMinorErrors",
            Self::Aborted => "Aborted",
            Self::QuitCalled => "QuitCalled",
            Self::Other(s) => s,
        }
    }

    /// Every statement ran without error.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::CompletedSuccessfully | Self::CompletedWithMessages)
    }

    /// Some statements failed, the rest were applied.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::HasMinorErrors)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus log reference returned by a procedure run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub log_file: Option<String>,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            status: ExecutionStatus::CompletedSuccessfully,
            log_file: None,
        }
    }
}

#[derive(Deserialize)]
struct RawLogFile {
    #[serde(rename = "Filename")]
    filename: String,
}

#[derive(Deserialize)]
struct RawExecutionResult {
    #[serde(rename = "ProcessExecuteStatusCode")]
    status: String,
    #[serde(rename = "ErrorLogFile", default)]
    error_log_file: Option<RawLogFile>,
}

impl ExecutionResult {
    /// Parse the body of an execute-with-return call.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let raw: RawExecutionResult = serde_json::from_slice(body)?;
        Ok(Self {
            status: ExecutionStatus::parse(&raw.status),
            log_file: raw.error_log_file.map(|f| f.filename),
        })
    }
}

/// Section of a procedure a log line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureSection {
    Prolog,
    Metadata,
    Data,
    Epilog,
}

impl ProcedureSection {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "prolog" => Some(Self::Prolog),
            "metadata" => Some(Self::Metadata),
            "data" => Some(Self::Data),
            "epilog" => Some(Self::Epilog),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prolog => "Prolog",
            Self::Metadata => "Metadata",
            Self::Data => "Data",
            Self::Epilog => "Epilog",
        }
    }
}

/// One parsed error log line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FailureRecord {
    pub section: Option<ProcedureSection>,
    /// 1-based line within the section
    pub line: Option<u32>,
    /// Data record the line was processing, for file-sourced procedures
    pub record: Option<Vec<String>>,
    pub element: Option<String>,
    pub dimension: Option<String>,
    pub reason: String,
}

impl FailureRecord {
    /// Attach this record to a written cell.
    pub fn into_failed_cell(
        self,
        coordinates: Vec<String>,
        value: Option<crate::model::CellValue>,
    ) -> FailedCell {
        FailedCell::new(coordinates, value, self.reason)
    }
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(prolog|metadata|data|epilog)\s+procedure\s+line\s*\((\d+)\)\s*:\s*(.*)$")
            .expect("valid regex")
    })
}

fn element_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)element name \(key\)\s*:\s*"([^"]*)"|element\s+"([^"]*)"\s+not found"#)
            .expect("valid regex")
    })
}

fn dimension_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)dimension name\s*:\s*"([^"]*)"|in dimension\s+"([^"]*)""#)
            .expect("valid regex")
    })
}

fn first_group(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).and_then(|c| {
        c.iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().to_string())
    })
}

/// Parse one log line; `None` for blank lines.
pub fn parse_line(line: &str) -> Option<FailureRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Some(caps) = line_regex().captures(line) else {
        return Some(FailureRecord {
            element: first_group(element_regex(), line),
            dimension: first_group(dimension_regex(), line),
            reason: line.to_string(),
            ..Default::default()
        });
    };

    let whole = caps.get(0).map_or(0, |m| m.start());
    let prefix = line[..whole].trim().trim_end_matches(',').trim();
    let record = if prefix.starts_with('"') {
        parse_record(prefix)
    } else {
        None
    };
    let reason = caps.get(3).map_or("", |m| m.as_str()).trim().to_string();

    Some(FailureRecord {
        section: caps.get(1).and_then(|m| ProcedureSection::parse(m.as_str())),
        line: caps.get(2).and_then(|m| m.as_str().parse().ok()),
        record,
        element: first_group(element_regex(), &reason),
        dimension: first_group(dimension_regex(), &reason),
        reason,
    })
}

/// Parse a whole error log.
pub fn parse_log(text: &str) -> Vec<FailureRecord> {
    text.trim_start_matches('\u{feff}')
        .lines()
        .filter_map(parse_line)
        .collect()
}

/// Fetches error logs and turns them into failure records.
#[derive(Debug, Clone)]
pub struct LogCorrelator {
    executor: CellsetExecutor,
    policy: LogRetryPolicy,
}

impl LogCorrelator {
    pub fn new(executor: CellsetExecutor, policy: LogRetryPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> &LogRetryPolicy {
        &self.policy
    }

    /// Fetch a log, retrying while it is missing or still empty.
    ///
    /// Gives up with `LogPropagationTimeout` once the policy is exhausted;
    /// other transport errors are returned at once.
    pub async fn fetch_log(&self, log_file: &str) -> Result<String> {
        let mut attempts = 0u32;
        loop {
            let delay = self.policy.delay_for_attempt(attempts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            let request = Request::get(format!("ErrorLogFiles('{}')/Content", odata_quote(log_file)));
            match self.executor.send(request, "fetching error log").await {
                Ok(response) => {
                    let text = response
                        .text()
                        .map_err(|e| CellsetError::transport("reading error log", e))?;
                    if !text.trim().is_empty() {
                        debug!(log_file, attempts, "error log fetched");
                        return Ok(text);
                    }
                    debug!(log_file, attempts, "error log still empty");
                }
                Err(CellsetError::TransportFailure { source, .. }) if source.is_not_found() => {
                    debug!(log_file, attempts, "error log not yet visible");
                }
                Err(e) => return Err(e),
            }

            if !self.policy.allows_another(attempts) {
                warn!(log_file, attempts, "error log never became visible");
                return Err(CellsetError::LogPropagationTimeout {
                    log_file: log_file.to_string(),
                    attempts,
                    statuses: Vec::new(),
                });
            }
            warn!(
                log_file,
                attempt = attempts,
                delay_ms = self.policy.delay_for_attempt(attempts).as_millis() as u64,
                "retrying error log fetch"
            );
        }
    }

    /// Failure records for one run; empty when the run succeeded.
    pub async fn correlate(&self, result: &ExecutionResult) -> Result<Vec<FailureRecord>> {
        if result.status.is_success() {
            return Ok(Vec::new());
        }
        let Some(log_file) = &result.log_file else {
            return Ok(Vec::new());
        };
        match self.fetch_log(log_file).await {
            Ok(text) => Ok(parse_log(&text)),
            Err(CellsetError::LogPropagationTimeout {
                log_file, attempts, ..
            }) => Err(CellsetError::LogPropagationTimeout {
                log_file,
                attempts,
                statuses: vec![result.status.clone()],
            }),
            Err(e) => Err(e),
        }
    }
}

/// Running tally of a write, classified into the error taxonomy at the end.
#[derive(Debug, Clone, Default)]
pub struct WriteTally {
    pub attempted: usize,
    pub applied: usize,
    /// Cells left out on purpose, such as read-only targets
    pub skipped: usize,
    pub statuses: Vec<ExecutionStatus>,
    pub log_files: Vec<String>,
    pub failures: Vec<FailedCell>,
}

impl WriteTally {
    pub fn new(attempted: usize) -> Self {
        Self {
            attempted,
            ..Default::default()
        }
    }

    pub fn record_status(&mut self, result: &ExecutionResult) {
        self.statuses.push(result.status.clone());
        if let Some(log_file) = &result.log_file {
            self.log_files.push(log_file.clone());
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.applied + self.skipped == self.attempted
    }

    /// `Ok` when every cell was applied or skipped. Otherwise
    /// `WriteFailure` when nothing was applied, and `WritePartialFailure`
    /// when some was. A run reporting minor errors applied part of its
    /// batch by definition, so it is never a `WriteFailure`.
    pub fn classify(self) -> Result<Self> {
        if self.is_clean() {
            return Ok(self);
        }
        let minor_errors = self.statuses.iter().any(ExecutionStatus::is_partial);
        if self.applied == 0 && !minor_errors {
            return Err(CellsetError::WriteFailure {
                statuses: self.statuses,
                log_files: self.log_files,
                failures: self.failures,
            });
        }
        Err(CellsetError::WritePartialFailure {
            applied: self.applied,
            attempts: self.attempted,
            statuses: self.statuses,
            log_files: self.log_files,
            failures: self.failures,
        })
    }
}
