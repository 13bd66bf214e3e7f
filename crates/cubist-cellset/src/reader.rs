//! Partitioned parallel reads
//!
//! A cellset's ordinal space is split into contiguous partitions, each
//! fetched by its own task. At most `workers` fetches are in flight, gated
//! by a semaphore. Results are placed by partition index, so the merged
//! output is in ordinal order whatever order the tasks finish in.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{CellsetError, Result};
use crate::executor::{CellProperties, CellsetExecutor, ExecuteOptions, Execution};
use crate::metadata::{CellsetMetadata, CoordinateBuilder, NamingMode};
use crate::model::{Cell, CellMap, CellValue};
use crate::partition::{partition, Partition};
use crate::query::QuerySource;

/// Options for one read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Concurrent partition fetches; 1 takes the single round-trip path
    pub workers: usize,
    /// Keep successful partitions when others fail
    pub best_effort: bool,
    /// Drop zero, empty and null cells after merging
    pub skip_zeros: bool,
    pub skip_consolidated: bool,
    pub skip_rule_derived: bool,
    pub naming: NamingMode,
    pub execute: ExecuteOptions,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            best_effort: false,
            skip_zeros: false,
            skip_consolidated: false,
            skip_rule_derived: false,
            naming: NamingMode::UniqueNames,
            execute: ExecuteOptions::default(),
        }
    }
}

impl ReadOptions {
    /// Worker count and failure policy from the engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            workers: config.max_workers.max(1),
            best_effort: config.best_effort,
            ..Default::default()
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn best_effort(mut self, enabled: bool) -> Self {
        self.best_effort = enabled;
        self
    }

    pub fn skip_zeros(mut self, enabled: bool) -> Self {
        self.skip_zeros = enabled;
        self
    }

    pub fn skip_consolidated(mut self, enabled: bool) -> Self {
        self.skip_consolidated = enabled;
        self
    }

    pub fn skip_rule_derived(mut self, enabled: bool) -> Self {
        self.skip_rule_derived = enabled;
        self
    }

    pub fn naming(mut self, naming: NamingMode) -> Self {
        self.naming = naming;
        self
    }

    pub fn skip_contexts(mut self, enabled: bool) -> Self {
        self.execute.skip_contexts = enabled;
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.execute.top = Some(top);
        self
    }

    /// Execute options with the cell properties the filters need.
    fn execute_options(&self) -> ExecuteOptions {
        let mut options = self.execute.clone();
        options.cell_properties.consolidated |= self.skip_consolidated;
        options.cell_properties.rule_derived |= self.skip_rule_derived;
        options
    }

    fn keeps(&self, cell: &Cell) -> bool {
        !(self.skip_zeros && cell.value.is_zero_or_empty()
            || self.skip_consolidated && cell.consolidated == Some(true)
            || self.skip_rule_derived && cell.rule_derived == Some(true))
    }
}

/// Merge partition results by partition index.
///
/// `completed` may arrive in any order; the output is always the
/// concatenation of partitions `0, 1, 2, ...`.
pub fn merge_partitions(mut completed: Vec<(Partition, Vec<Cell>)>) -> Vec<Cell> {
    completed.sort_by_key(|(p, _)| p.index);
    completed.into_iter().flat_map(|(_, cells)| cells).collect()
}

/// Cells of a partitioned read plus any partitions given up on.
#[derive(Debug, Clone, Default)]
pub struct PartitionedCells {
    pub cells: Vec<Cell>,
    /// Non-empty only in best-effort mode
    pub lost: Vec<Partition>,
}

/// A finished read.
#[derive(Debug, Clone)]
pub struct CellsetData {
    metadata: CellsetMetadata,
    cells: Vec<Cell>,
    naming: NamingMode,
    skip_empty_rows: bool,
    lost: Vec<Partition>,
}

impl CellsetData {
    fn new(
        metadata: CellsetMetadata,
        cells: Vec<Cell>,
        lost: Vec<Partition>,
        options: &ReadOptions,
    ) -> Self {
        let cells = cells.into_iter().filter(|c| options.keeps(c)).collect();
        Self {
            metadata,
            cells,
            naming: options.naming,
            skip_empty_rows: options.skip_zeros,
            lost,
        }
    }

    pub fn metadata(&self) -> &CellsetMetadata {
        &self.metadata
    }

    /// Cells left after filtering, in ordinal order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Partitions that failed in best-effort mode.
    pub fn lost_partitions(&self) -> &[Partition] {
        &self.lost
    }

    pub fn is_complete(&self) -> bool {
        self.lost.is_empty()
    }

    /// Coordinate to value mapping in ordinal order.
    pub fn to_map(&self) -> Result<CellMap> {
        let builder = self.metadata.coordinates(self.naming)?;
        let mut map = CellMap::new(self.metadata.coordinate_dimensions());
        for cell in &self.cells {
            map.insert(builder.coordinate(cell.ordinal)?, cell.value.clone());
        }
        Ok(map)
    }

    /// Values in ordinal order.
    pub fn values(&self) -> Vec<CellValue> {
        self.cells.iter().map(|c| c.value.clone()).collect()
    }

    /// Lazy rows: one per row tuple (and title tuple), each carrying the
    /// values of every column. Missing cells read as empty.
    pub fn rows(&self) -> Result<Rows<'_>> {
        let builder = self.metadata.coordinates(self.naming)?;
        let counts = builder.mapper().axis_counts().to_vec();
        let columns = counts.first().copied().unwrap_or(1);
        let total = builder.mapper().cardinality();
        let row_count = if columns == 0 { 0 } else { total / columns };
        Ok(Rows {
            data: self,
            builder,
            columns,
            row_count,
            next: 0,
        })
    }

    fn value_at(&self, ordinal: u64) -> CellValue {
        self.cells
            .binary_search_by_key(&ordinal, |c| c.ordinal)
            .map(|i| self.cells[i].value.clone())
            .unwrap_or(CellValue::Empty)
    }
}

/// Iterator returned by [`CellsetData::rows`].
pub struct Rows<'a> {
    data: &'a CellsetData,
    builder: CoordinateBuilder<'a>,
    columns: u64,
    row_count: u64,
    next: u64,
}

impl Iterator for Rows<'_> {
    /// Row elements in axis order, then the column values
    type Item = (Vec<String>, Vec<CellValue>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.row_count {
            let row = self.next;
            self.next += 1;
            let first = row * self.columns;
            let values: Vec<CellValue> = (first..first + self.columns)
                .map(|o| self.data.value_at(o))
                .collect();
            if self.data.skip_empty_rows && values.iter().all(|v| *v == CellValue::Empty) {
                continue;
            }
            let indices = self.builder.mapper().decompose(first).ok()?;
            let elements = indices
                .iter()
                .enumerate()
                .skip(1)
                .flat_map(|(axis, &tuple)| self.builder.tuple_names(axis, tuple))
                .collect();
            return Some((elements, values));
        }
        None
    }
}

/// Reads cellsets, in parallel when asked to.
#[derive(Debug, Clone)]
pub struct PartitionedReader {
    executor: CellsetExecutor,
}

impl PartitionedReader {
    pub fn new(executor: CellsetExecutor) -> Self {
        Self { executor }
    }

    /// Execute `source` and read all of its cells.
    ///
    /// The server-side cellset is released after every partition has
    /// finished, on success and on failure alike.
    #[instrument(skip_all, fields(source = %source, workers = options.workers))]
    pub async fn read(&self, source: &QuerySource, options: &ReadOptions) -> Result<CellsetData> {
        if options.workers == 0 {
            return Err(CellsetError::InvalidArgument(
                "worker count must be at least 1".to_string(),
            ));
        }
        let execute_options = options.execute_options();
        match self
            .executor
            .execute(source, options.workers, &execute_options)
            .await?
        {
            Execution::Materialized { metadata, cells } => {
                info!(cells = cells.len(), "read materialized cellset");
                Ok(CellsetData::new(metadata, cells, Vec::new(), options))
            }
            Execution::Handle { handle, metadata } => {
                let outcome = match metadata.cardinality() {
                    Ok(cardinality) => {
                        self.read_partitions(
                            handle.id(),
                            cardinality,
                            execute_options.cell_properties,
                            options,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                let read = handle.release_after(outcome).await?;
                info!(
                    cells = read.cells.len(),
                    lost_partitions = read.lost.len(),
                    "read partitioned cellset"
                );
                Ok(CellsetData::new(metadata, read.cells, read.lost, options))
            }
        }
    }

    /// Fetch `[0, cardinality)` of an existing cellset.
    ///
    /// Fail-fast unless `options.best_effort`: the first failure stops new
    /// fetches, in-flight ones are awaited and discarded, and the error is
    /// returned once nothing is running against the cellset.
    pub async fn read_partitions(
        &self,
        cellset_id: &str,
        cardinality: u64,
        properties: CellProperties,
        options: &ReadOptions,
    ) -> Result<PartitionedCells> {
        let workers = options.workers.max(1);
        let partitions = partition(cardinality, workers);
        debug!(
            cellset = cellset_id,
            cardinality,
            partitions = partitions.len(),
            "reading partitions"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut pending: FuturesUnordered<_> = partitions
            .iter()
            .map(|&p| {
                let executor = self.executor.clone();
                let semaphore = semaphore.clone();
                let id = cellset_id.to_string();
                let task = tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| CellsetError::Worker(format!("partition {} cancelled", p)))?;
                    debug!(partition = %p, "fetching partition");
                    executor.partition(&id, p, properties).await
                });
                async move { (p, task.await) }
            })
            .collect();

        let mut completed = Vec::with_capacity(partitions.len());
        let mut lost = Vec::new();
        let mut first_error: Option<CellsetError> = None;

        while let Some((p, joined)) = pending.next().await {
            let outcome = joined
                .map_err(|e| CellsetError::Worker(e.to_string()))
                .and_then(|r| r);
            match outcome {
                Ok(cells) if first_error.is_none() => completed.push((p, cells)),
                Ok(_) => debug!(partition = %p, "discarding partition after failure"),
                Err(e) if first_error.is_some() => {
                    debug!(partition = %p, error = %e, "discarding error after failure")
                }
                Err(e) if options.best_effort => {
                    warn!(partition = %p, error = %e, "partition lost in best-effort read");
                    lost.push(p);
                }
                Err(e) => {
                    warn!(partition = %p, error = %e, "partition failed, aborting read");
                    semaphore.close();
                    first_error = Some(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        lost.sort_by_key(|p| p.index);
        Ok(PartitionedCells {
            cells: merge_partitions(completed),
            lost,
        })
    }
}
