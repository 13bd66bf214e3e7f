//! Unbound-procedure writes
//!
//! Cells become generated statements, split over the prolog and epilog of
//! ad-hoc procedures. The execution status decides the outcome; for
//! minor errors the error log is correlated back to the failing cells.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::process::{execute_with_return, sandbox_statement, ProcessDefinition, HEADER_LINES, LINE_BREAK};
use super::statement::{StatementBuilder, StatementOptions};
use super::{WriteBatch, WriteStrategy, WriteStrategyKind};
use crate::correlator::{ExecutionResult, FailureRecord, LogCorrelator, ProcedureSection, WriteTally};
use crate::error::{CellsetError, FailedCell, Result};
use crate::executor::CellsetExecutor;
use crate::tokenize::check_statement;

/// First prolog line holding a statement: after the header and the
/// sandbox statement.
pub const PROLOG_FIRST_LINE: u32 = HEADER_LINES + 2;
/// First epilog line holding a statement.
pub const EPILOG_FIRST_LINE: u32 = HEADER_LINES + 1;

/// Where each statement of one procedure ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementLayout {
    pub prolog: usize,
    pub epilog: usize,
}

impl StatementLayout {
    pub fn new(statements: usize, max_statements: usize) -> Self {
        let prolog = statements.min(max_statements);
        Self {
            prolog,
            epilog: statements - prolog,
        }
    }

    /// Index of the statement on `line` of `section`, if it is one.
    pub fn statement_at(&self, section: ProcedureSection, line: u32) -> Option<usize> {
        let (first, offset, count) = match section {
            ProcedureSection::Prolog => (PROLOG_FIRST_LINE, 0, self.prolog),
            ProcedureSection::Epilog => (EPILOG_FIRST_LINE, self.prolog, self.epilog),
            _ => return None,
        };
        let index = line.checked_sub(first)? as usize;
        (index < count).then_some(offset + index)
    }
}

/// Build the procedure for `statements`, one statement per line.
///
/// Fails with `InvalidArgument` when a statement would not fit on a single
/// line, since the layout could no longer map log lines to cells.
pub fn build_procedure(
    name: String,
    statements: &[String],
    max_statements: usize,
    sandbox: Option<&str>,
) -> Result<(ProcessDefinition, StatementLayout)> {
    for (i, statement) in statements.iter().enumerate() {
        check_statement(statement).map_err(|e| {
            CellsetError::InvalidArgument(format!("statement {} is not a single line: {}", i, e))
        })?;
    }
    let layout = StatementLayout::new(statements.len(), max_statements);
    let mut process = ProcessDefinition::unbound(name);
    let mut prolog = vec![sandbox_statement(sandbox)];
    prolog.extend_from_slice(&statements[..layout.prolog]);
    process.prolog = prolog.join(LINE_BREAK);
    process.epilog = statements[layout.prolog..].join(LINE_BREAK);
    Ok((process, layout))
}

/// Writes through generated statements.
#[derive(Debug, Clone)]
pub struct ProcedureWrite {
    executor: CellsetExecutor,
    correlator: LogCorrelator,
    max_statements: usize,
}

impl ProcedureWrite {
    pub fn new(executor: CellsetExecutor, correlator: LogCorrelator, max_statements: usize) -> Self {
        Self {
            executor,
            correlator,
            max_statements: max_statements.max(1),
        }
    }

    /// Statements per procedure: a full prolog plus a full epilog.
    pub fn batch_size(&self) -> usize {
        self.max_statements * 2
    }

    fn failed_range(batch: &WriteBatch<'_>, range: Range<usize>, reason: &str) -> Vec<FailedCell> {
        batch.entries[range]
            .iter()
            .map(|(coordinate, value)| {
                FailedCell::new(coordinate.elements().to_vec(), Some((*value).clone()), reason)
            })
            .collect()
    }

    /// Fold one procedure's outcome for `range` into `tally`.
    async fn settle(
        &self,
        batch: &WriteBatch<'_>,
        range: Range<usize>,
        layout: StatementLayout,
        result: &ExecutionResult,
        tally: &mut WriteTally,
    ) -> Result<()> {
        tally.record_status(result);
        if result.status.is_success() {
            tally.applied += range.len();
            return Ok(());
        }

        let records = self.correlator.correlate(result).await?;
        let fallback_reason = records
            .first()
            .map(|r| r.reason.clone())
            .unwrap_or_else(|| format!("procedure finished with status {}", result.status));

        if !result.status.is_partial() {
            warn!(status = %result.status, cells = range.len(), "procedure failed as a whole");
            tally.failures.extend(Self::failed_range(batch, range, &fallback_reason));
            return Ok(());
        }

        let mut failed: BTreeMap<usize, FailureRecord> = BTreeMap::new();
        for record in records {
            let index = match (record.section, record.line) {
                (Some(section), Some(line)) => layout.statement_at(section, line),
                _ => None,
            };
            match index {
                Some(i) => {
                    failed.entry(range.start + i).or_insert(record);
                }
                None => debug!(reason = %record.reason, "log line not tied to a statement"),
            }
        }

        if failed.is_empty() {
            // Part of the range was applied; which part is unknown
            warn!(status = %result.status, cells = range.len(), "minor errors could not be tied to cells");
            tally.failures.extend(
                Self::failed_range(batch, range, &fallback_reason)
                    .into_iter()
                    .map(FailedCell::into_unresolved),
            );
            return Ok(());
        }

        tally.applied += range.len() - failed.len();
        for (index, record) in failed {
            let (coordinate, value) = batch.entries[index];
            tally.failures.push(
                record.into_failed_cell(coordinate.elements().to_vec(), Some(value.clone())),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl WriteStrategy for ProcedureWrite {
    fn kind(&self) -> WriteStrategyKind {
        WriteStrategyKind::UnboundProcedure
    }

    #[instrument(skip_all, fields(cube = batch.cube, cells = batch.entries.len()))]
    async fn apply(&self, batch: &WriteBatch<'_>) -> Result<WriteTally> {
        let options = StatementOptions {
            increment: batch.options.increment,
            allow_spread: batch.options.allow_spread,
            skip_non_updateable: batch.options.skip_non_updateable,
            precision: batch.options.precision,
        };
        let builder = StatementBuilder::new(batch.cube, batch.dimensions, batch.measure_types, options);
        let statements: Vec<String> = batch
            .entries
            .iter()
            .map(|(coordinate, value)| builder.statement(coordinate, value))
            .collect();

        let sandbox = self.executor.session().sandbox.as_deref();
        let batch_size = self.batch_size();
        // Everything is built before the first run so a bad statement sends nothing
        let procedures = (0..statements.len())
            .step_by(batch_size)
            .map(|start| {
                let range = start..(start + batch_size).min(statements.len());
                let name = format!("}}cubist_{}", Uuid::new_v4().simple());
                build_procedure(name, &statements[range.clone()], self.max_statements, sandbox)
                    .map(|(process, layout)| (range, process, layout))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tally = WriteTally::new(statements.len());
        for (range, process, layout) in procedures {
            debug!(
                process = %process.name,
                prolog = layout.prolog,
                epilog = layout.epilog,
                "running write procedure"
            );

            match execute_with_return(&self.executor, &process).await {
                Ok(result) => self.settle(batch, range, layout, &result, &mut tally).await?,
                Err(e @ CellsetError::TransportFailure { .. }) if tally.applied == 0 && tally.failures.is_empty() => {
                    return Err(e);
                }
                Err(e) => {
                    // Earlier procedures already ran; report the rest as not applied
                    warn!(error = %e, "procedure call failed after partial progress");
                    tally.failures.extend(Self::failed_range(
                        batch,
                        range.start..statements.len(),
                        &e.to_string(),
                    ));
                    break;
                }
            }
        }

        info!(
            applied = tally.applied,
            failed = tally.failures.len(),
            procedures = tally.statuses.len(),
            "procedure write finished"
        );
        Ok(tally)
    }
}
