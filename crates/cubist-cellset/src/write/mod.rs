//! Write engine
//!
//! One input contract, three strategies:
//!
//! - [`cellset::CellsetWrite`]: patch cells of a purpose-built cellset by
//!   ordinal. Atomic per chunk.
//! - [`procedure::ProcedureWrite`]: generated statements in ad-hoc
//!   procedures, with per-cell failure correlation from the error log.
//! - [`bulk::BulkWrite`]: CSV artifact plus a load procedure. Scales
//!   furthest.
//!
//! [`CellWriter`] aligns the caller's coordinates to the cube's dimension
//! order, runs the chosen strategy and classifies the outcome.

pub mod bulk;
pub mod cellset;
pub mod procedure;
pub mod process;
pub mod statement;
pub mod upload;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::correlator::{ExecutionStatus, LogCorrelator, WriteTally};
use crate::dimensions::{DimensionOrderResolver, MeasureTypes};
use crate::error::{CellsetError, Result};
use crate::executor::CellsetExecutor;
use crate::model::{CellMap, CellValue, Coordinate, DimensionRef};

use bulk::BulkWrite;
use cellset::CellsetWrite;
use procedure::ProcedureWrite;
use upload::FileUploader;

/// Which write strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategyKind {
    DirectCellset,
    #[default]
    UnboundProcedure,
    BulkTransfer,
}

impl WriteStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectCellset => "cellset",
            Self::UnboundProcedure => "procedure",
            Self::BulkTransfer => "bulk",
        }
    }
}

impl fmt::Display for WriteStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteStrategyKind {
    type Err = CellsetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cellset" | "direct_cellset" => Ok(Self::DirectCellset),
            "procedure" | "unbound_procedure" => Ok(Self::UnboundProcedure),
            "bulk" | "bulk_transfer" => Ok(Self::BulkTransfer),
            other => Err(CellsetError::InvalidArgument(format!(
                "unknown write strategy '{}'",
                other
            ))),
        }
    }
}

/// Options shared by all strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Add to the current values instead of replacing them
    pub increment: bool,
    /// Spread numbers written to consolidated targets
    pub allow_spread: bool,
    /// Silently drop writes to read-only cells
    pub skip_non_updateable: bool,
    /// Decimals for numbers; 15 significant digits when unset
    pub precision: Option<usize>,
    /// Authoritative dimension order; resolved from the server when unset
    pub dimensions: Option<Vec<String>>,
    /// Delete the bulk artifact after loading
    pub remove_artifact: bool,
    /// View to zero out before a bulk load
    pub clear_view: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            increment: false,
            allow_spread: false,
            skip_non_updateable: false,
            precision: None,
            dimensions: None,
            remove_artifact: true,
            clear_view: None,
        }
    }
}

impl WriteOptions {
    pub fn increment(mut self, enabled: bool) -> Self {
        self.increment = enabled;
        self
    }

    pub fn allow_spread(mut self, enabled: bool) -> Self {
        self.allow_spread = enabled;
        self
    }

    pub fn skip_non_updateable(mut self, enabled: bool) -> Self {
        self.skip_non_updateable = enabled;
        self
    }

    pub fn precision(mut self, decimals: usize) -> Self {
        self.precision = Some(decimals);
        self
    }

    pub fn dimensions<S: Into<String>>(mut self, dimensions: impl IntoIterator<Item = S>) -> Self {
        self.dimensions = Some(dimensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn remove_artifact(mut self, enabled: bool) -> Self {
        self.remove_artifact = enabled;
        self
    }

    pub fn clear_view(mut self, view: impl Into<String>) -> Self {
        self.clear_view = Some(view.into());
        self
    }
}

/// Cells ready for a strategy: aligned to `dimensions`, in caller order.
#[derive(Debug)]
pub struct WriteBatch<'a> {
    pub cube: &'a str,
    pub dimensions: &'a [String],
    pub entries: Vec<(&'a Coordinate, &'a CellValue)>,
    /// Empty unless the strategy needs it
    pub measure_types: &'a MeasureTypes,
    pub options: &'a WriteOptions,
}

/// One way of applying a batch.
#[async_trait]
pub trait WriteStrategy: Send + Sync {
    fn kind(&self) -> WriteStrategyKind;

    /// Apply `batch` and account for every cell in the returned tally.
    ///
    /// Only errors that prevent accounting (transport failures before
    /// anything ran, unreadable responses) are returned as `Err`.
    async fn apply(&self, batch: &WriteBatch<'_>) -> Result<WriteTally>;
}

/// Summary of a fully applied write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub strategy: WriteStrategyKind,
    pub attempted: usize,
    pub applied: usize,
    /// Read-only targets dropped under `skip_non_updateable`
    pub skipped: usize,
    pub statuses: Vec<ExecutionStatus>,
    pub log_files: Vec<String>,
}

/// Re-order `cells` into `order`.
///
/// Named dimensions are matched ignoring case and spaces; a name outside
/// `order` fails with `UnknownDimension`. Unnamed coordinates must already
/// be in `order`.
pub fn align(cells: &CellMap, order: &[String]) -> Result<CellMap> {
    let named = cells.dimensions();
    let width_error = |coordinate: &Coordinate, width: usize| {
        CellsetError::InvalidArgument(format!(
            "coordinate {:?} has {} elements, expected {}",
            coordinate,
            coordinate.len(),
            width
        ))
    };

    if named.is_empty() {
        if let Some(bad) = cells.coordinates().find(|c| c.len() != order.len()) {
            return Err(width_error(bad, order.len()));
        }
        return Ok(cells
            .clone()
            .with_dimensions(order.iter().map(DimensionRef::new).collect()));
    }

    if let Some(unknown) = named
        .iter()
        .find(|d| !order.iter().any(|o| d.is_dimension(o)))
    {
        return Err(CellsetError::UnknownDimension {
            dimension: unknown.dimension.clone(),
            expected: order.to_vec(),
        });
    }
    let positions = order
        .iter()
        .map(|o| {
            named.iter().position(|d| d.is_dimension(o)).ok_or_else(|| {
                CellsetError::InvalidArgument(format!("no element given for dimension '{}'", o))
            })
        })
        .collect::<Result<Vec<usize>>>()?;
    if named.len() != order.len() {
        return Err(CellsetError::InvalidArgument(format!(
            "{} dimensions named for a cube of {}",
            named.len(),
            order.len()
        )));
    }

    let mut aligned = CellMap::new(positions.iter().map(|&p| named[p].clone()).collect());
    for (coordinate, value) in cells.iter() {
        if coordinate.len() != named.len() {
            return Err(width_error(coordinate, named.len()));
        }
        let elements = coordinate.elements();
        aligned.insert(
            positions.iter().map(|&p| elements[p].clone()).collect::<Coordinate>(),
            value.clone(),
        );
    }
    Ok(aligned)
}

/// Runs writes against one session.
#[derive(Clone)]
pub struct CellWriter {
    executor: CellsetExecutor,
    resolver: Arc<dyn DimensionOrderResolver>,
    config: EngineConfig,
}

impl CellWriter {
    pub fn new(
        executor: CellsetExecutor,
        resolver: Arc<dyn DimensionOrderResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            resolver,
            config,
        }
    }

    /// The strategy implementation for `kind`, configured from the engine config.
    pub fn strategy(&self, kind: WriteStrategyKind) -> Box<dyn WriteStrategy> {
        let executor = self.executor.clone();
        let correlator = LogCorrelator::new(executor.clone(), self.config.log_retry.clone());
        match kind {
            WriteStrategyKind::DirectCellset => {
                Box::new(CellsetWrite::new(executor, self.config.chunk_size))
            }
            WriteStrategyKind::UnboundProcedure => {
                let max_statements = self.config.statements_per_section(executor.session());
                Box::new(ProcedureWrite::new(executor, correlator, max_statements))
            }
            WriteStrategyKind::BulkTransfer => {
                let uploader = FileUploader::new(
                    executor.clone(),
                    self.config.part_size_bytes,
                    self.config.upload_workers,
                );
                Box::new(BulkWrite::new(executor, correlator, uploader))
            }
        }
    }

    /// Write `cells` to `cube` with the `kind` strategy.
    ///
    /// `Ok` only when every cell was applied or deliberately skipped.
    /// Otherwise `WriteFailure` (nothing applied) or `WritePartialFailure`
    /// naming the failed cells.
    #[instrument(skip_all, fields(cube = cube, cells = cells.len(), strategy = %kind))]
    pub async fn write(
        &self,
        cube: &str,
        cells: &CellMap,
        kind: WriteStrategyKind,
        options: &WriteOptions,
    ) -> Result<WriteReport> {
        if options.clear_view.is_some() && kind != WriteStrategyKind::BulkTransfer {
            return Err(CellsetError::InvalidArgument(
                "clear_view is only supported by the bulk strategy".to_string(),
            ));
        }
        if options.allow_spread && kind == WriteStrategyKind::DirectCellset {
            return Err(CellsetError::InvalidArgument(
                "allow_spread is not supported by the cellset strategy".to_string(),
            ));
        }
        if let Some((coordinate, _)) = cells
            .iter()
            .find(|(_, v)| v.as_number().is_some_and(|n| !n.is_finite()))
        {
            return Err(CellsetError::InvalidArgument(format!(
                "non-finite value for {:?}",
                coordinate
            )));
        }
        if cells.is_empty() {
            return Ok(WriteReport {
                strategy: kind,
                attempted: 0,
                applied: 0,
                skipped: 0,
                statuses: Vec::new(),
                log_files: Vec::new(),
            });
        }

        let order = match &options.dimensions {
            Some(dimensions) => dimensions.clone(),
            None => self.resolver.dimension_order(cube).await?,
        };
        let aligned = align(cells, &order)?;
        let measure_types = if kind == WriteStrategyKind::UnboundProcedure {
            self.resolver.measure_types(cube).await?
        } else {
            MeasureTypes::new()
        };

        let batch = WriteBatch {
            cube,
            dimensions: &order,
            entries: aligned.iter().collect(),
            measure_types: &measure_types,
            options,
        };
        let tally = self.strategy(kind).apply(&batch).await?.classify()?;
        info!(applied = tally.applied, skipped = tally.skipped, "write complete");
        Ok(WriteReport {
            strategy: kind,
            attempted: tally.attempted,
            applied: tally.applied,
            skipped: tally.skipped,
            statuses: tally.statuses,
            log_files: tally.log_files,
        })
    }
}

impl fmt::Debug for CellWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellWriter")
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish()
    }
}
