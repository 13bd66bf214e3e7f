//! Bulk-transfer writes
//!
//! Cells are serialized to a CSV artifact, uploaded, and ingested by a
//! generated load procedure reading the artifact as its datasource.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::process::{execute_with_return, sandbox_statement, DataSource, ProcessDefinition, LINE_BREAK};
use super::upload::FileUploader;
use super::{WriteBatch, WriteStrategy, WriteStrategyKind};
use crate::correlator::{LogCorrelator, WriteTally};
use crate::csv;
use crate::error::{FailedCell, Result};
use crate::executor::CellsetExecutor;
use crate::model::Coordinate;
use crate::tokenize::quote_literal;

/// Load procedure options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub increment: bool,
    pub allow_spread: bool,
    pub skip_non_updateable: bool,
    /// View to zero out before loading
    pub clear_view: Option<String>,
}

/// The procedure ingesting `file_name` into `cube`.
pub fn load_procedure(
    name: String,
    cube: &str,
    dimensions: &[String],
    file_name: String,
    sandbox: Option<&str>,
    options: &LoadOptions,
) -> ProcessDefinition {
    let mut process = ProcessDefinition::unbound(name);
    process.datasource = DataSource::Ascii { file_name };

    let variables: Vec<String> = (1..=dimensions.len()).map(|n| format!("v{}", n)).collect();
    process.variables = variables.clone();
    process.variables.push("vValue".to_string());

    let mut prolog = vec![
        "SetInputCharacterSet('TM1CS_UTF8');".to_string(),
        sandbox_statement(sandbox),
    ];
    if let Some(view) = &options.clear_view {
        prolog.push(format!("ViewZeroOut({},{});", quote_literal(cube), quote_literal(view)));
    }
    process.prolog = prolog.join(LINE_BREAK);

    let cube_literal = quote_literal(cube);
    let address = format!("{},{}", cube_literal, variables.join(","));
    let numeric_function = if options.increment && !cube.to_lowercase().starts_with("}elementattributes_") {
        "CellIncrementN"
    } else {
        "CellPutN"
    };
    let numeric_write = format!("{}(nValue,{});", numeric_function, address);
    let numeric_write = if options.allow_spread {
        let any_consolidated = dimensions
            .iter()
            .zip(&variables)
            .map(|(d, v)| format!("ElementType({},'',{})@='C'", quote_literal(d), v))
            .collect::<Vec<_>>()
            .join("%");
        format!(
            "IF({});CellPutProportionalSpread(nValue,{});ELSE;{}ENDIF;",
            any_consolidated, address, numeric_write
        )
    } else {
        numeric_write
    };

    let mut data = Vec::new();
    if options.skip_non_updateable {
        data.push(format!("IF(CellIsUpdateable({})=1);", address));
    }
    match (dimensions.last(), variables.last()) {
        (Some(measure), Some(measure_variable)) => {
            data.push(format!(
                "vType = ElementType({},'',{});",
                quote_literal(measure),
                measure_variable
            ));
            data.push("IF(vType @= 'S' % vType @= 'AS' % vType @= 'AA');".to_string());
            data.push(format!("CellPutS(vValue,{});", address));
            data.push("ELSE;".to_string());
            data.push("nValue = StringToNumber(vValue);".to_string());
            data.push(numeric_write);
            data.push("ENDIF;".to_string());
        }
        _ => data.push("ItemSkip;".to_string()),
    }
    if options.skip_non_updateable {
        data.push("ELSE;".to_string());
        data.push("ItemSkip;".to_string());
        data.push("ENDIF;".to_string());
    }
    process.data = data.join(LINE_BREAK);
    process
}

/// Writes through an uploaded artifact and a load procedure.
#[derive(Debug, Clone)]
pub struct BulkWrite {
    executor: CellsetExecutor,
    correlator: LogCorrelator,
    uploader: FileUploader,
}

impl BulkWrite {
    pub fn new(executor: CellsetExecutor, correlator: LogCorrelator, uploader: FileUploader) -> Self {
        Self {
            executor,
            correlator,
            uploader,
        }
    }

    /// Datasource name of an uploaded file; older servers add `.blb`.
    fn datasource_name(&self, file_name: &str) -> String {
        if self.uploader.multipart_supported() {
            file_name.to_string()
        } else {
            format!("{}.blb", file_name)
        }
    }

    async fn load(&self, batch: &WriteBatch<'_>, process: &ProcessDefinition) -> Result<WriteTally> {
        let attempted = batch.entries.len();
        let mut tally = WriteTally::new(attempted);
        let result = execute_with_return(&self.executor, process).await?;
        tally.record_status(&result);
        if result.status.is_success() {
            tally.applied = attempted;
            return Ok(tally);
        }

        let records = self.correlator.correlate(&result).await?;
        let fallback_reason = records
            .first()
            .map(|r| r.reason.clone())
            .unwrap_or_else(|| format!("load finished with status {}", result.status));

        let positions: HashMap<&Coordinate, usize> = batch
            .entries
            .iter()
            .enumerate()
            .map(|(i, (c, _))| (*c, i))
            .collect();
        let dimension_count = batch.dimensions.len();
        let mut failed = HashSet::new();
        if result.status.is_partial() {
            for record in records {
                let Some(fields) = &record.record else {
                    debug!(reason = %record.reason, "log line without a data record");
                    continue;
                };
                if fields.len() < dimension_count {
                    continue;
                }
                let coordinate: Coordinate = fields[..dimension_count].iter().cloned().collect();
                if let Some(&i) = positions.get(&coordinate) {
                    if failed.insert(i) {
                        let (coordinate, value) = batch.entries[i];
                        tally.failures.push(
                            record.into_failed_cell(coordinate.elements().to_vec(), Some(value.clone())),
                        );
                    }
                }
            }
        }

        if failed.is_empty() {
            let minor = result.status.is_partial();
            warn!(status = %result.status, minor, "load failures not tied to cells");
            tally.failures = batch
                .entries
                .iter()
                .map(|(c, v)| {
                    let cell = FailedCell::new(c.elements().to_vec(), Some((*v).clone()), fallback_reason.clone());
                    // Minor errors mean most records loaded; which ones failed is unknown
                    if minor {
                        cell.into_unresolved()
                    } else {
                        cell
                    }
                })
                .collect();
            return Ok(tally);
        }
        tally.applied = attempted - failed.len();
        Ok(tally)
    }
}

#[async_trait]
impl WriteStrategy for BulkWrite {
    fn kind(&self) -> WriteStrategyKind {
        WriteStrategyKind::BulkTransfer
    }

    #[instrument(skip_all, fields(cube = batch.cube, cells = batch.entries.len()))]
    async fn apply(&self, batch: &WriteBatch<'_>) -> Result<WriteTally> {
        let unique = format!("}}cubist_{}", Uuid::new_v4().simple());
        let file_name = format!("{}.csv", unique);
        let payload = csv::encode(batch.entries.iter().copied());
        debug!(file = %file_name, bytes = payload.len(), "bulk payload encoded");

        if let Err(e) = self.uploader.upload(&file_name, Bytes::from(payload)).await {
            // The entry may exist even though its content never arrived
            if let Err(cleanup) = self.uploader.delete(&file_name).await {
                debug!(file = %file_name, error = %cleanup, "no partial artifact to remove");
            }
            return Err(e);
        }

        let options = LoadOptions {
            increment: batch.options.increment,
            allow_spread: batch.options.allow_spread,
            skip_non_updateable: batch.options.skip_non_updateable,
            clear_view: batch.options.clear_view.clone(),
        };
        let process = load_procedure(
            unique,
            batch.cube,
            batch.dimensions,
            self.datasource_name(&file_name),
            self.executor.session().sandbox.as_deref(),
            &options,
        );
        let outcome = self.load(batch, &process).await;

        if batch.options.remove_artifact {
            if let Err(e) = self.uploader.delete(&file_name).await {
                warn!(file = %file_name, error = %e, "failed to remove bulk artifact");
            }
        }
        if let Ok(tally) = &outcome {
            info!(applied = tally.applied, failed = tally.failures.len(), "bulk write finished");
        }
        outcome
    }
}
