//! Engine error taxonomy

use cubist_http::HttpError;
use std::fmt;
use thiserror::Error;

use crate::correlator::ExecutionStatus;
use crate::model::CellValue;

/// A cell the server did not accept, with enough context to retry it alone.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedCell {
    /// Element names in the cube's dimension order
    pub coordinates: Vec<String>,
    /// The value that was attempted, when known
    pub value: Option<CellValue>,
    pub reason: String,
    /// The run reported minor errors that could not be tied to this cell,
    /// so it may or may not have been applied
    pub unresolved: bool,
}

impl FailedCell {
    pub fn new(coordinates: Vec<String>, value: Option<CellValue>, reason: impl Into<String>) -> Self {
        Self {
            coordinates,
            value,
            reason: reason.into(),
            unresolved: false,
        }
    }

    pub fn into_unresolved(mut self) -> Self {
        self.unresolved = true;
        self
    }
}

impl fmt::Display for FailedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}): {}", self.coordinates.join(", "), self.reason)?;
        if self.unresolved {
            f.write_str(" [unresolved]")?;
        }
        Ok(())
    }
}

/// Errors raised by the cellset engine
#[derive(Error, Debug)]
pub enum CellsetError {
    #[error("ordinal {ordinal} out of range for cellset of {cardinality} cells")]
    OrdinalOutOfRange { ordinal: u64, cardinality: u64 },

    #[error("malformed cellset metadata: {0}")]
    MalformedCellsetMetadata(String),

    #[error("unknown dimension '{dimension}', expected one of [{}]", expected.join(", "))]
    UnknownDimension {
        dimension: String,
        expected: Vec<String>,
    },

    #[error("transport failure while {context}: {source}")]
    TransportFailure {
        context: String,
        #[source]
        source: HttpError,
    },

    #[error("write failed, nothing applied ({} cells rejected, statuses {statuses:?}, logs {log_files:?})", failures.len())]
    WriteFailure {
        statuses: Vec<ExecutionStatus>,
        log_files: Vec<String>,
        failures: Vec<FailedCell>,
    },

    #[error("write partially failed: {applied} applied, {} rejected after {attempts} attempts (statuses {statuses:?}, logs {log_files:?})", failures.len())]
    WritePartialFailure {
        applied: usize,
        attempts: usize,
        statuses: Vec<ExecutionStatus>,
        log_files: Vec<String>,
        failures: Vec<FailedCell>,
    },

    #[error("error log '{log_file}' not visible after {attempts} attempts")]
    LogPropagationTimeout {
        log_file: String,
        attempts: u32,
        statuses: Vec<ExecutionStatus>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, CellsetError>;

impl CellsetError {
    /// Wrap a transport error with what the engine was doing at the time.
    pub fn transport(context: impl Into<String>, source: HttpError) -> Self {
        CellsetError::TransportFailure {
            context: context.into(),
            source,
        }
    }

    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CellsetError::TransportFailure { .. } | CellsetError::LogPropagationTimeout { .. }
        )
    }

    /// Cells the server rejected, if this is a write outcome.
    pub fn failed_cells(&self) -> &[FailedCell] {
        match self {
            CellsetError::WriteFailure { failures, .. }
            | CellsetError::WritePartialFailure { failures, .. } => failures,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for CellsetError {
    fn from(e: serde_json::Error) -> Self {
        CellsetError::Serialization(e.to_string())
    }
}
