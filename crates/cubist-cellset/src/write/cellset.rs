//! Direct cellset writes
//!
//! The written coordinates become the column tuples of a one-axis query,
//! so ordinal `i` of the resulting cellset is the `i`-th written cell.
//! Values are then patched by ordinal in chunks. Each chunk is atomic on
//! its own; a failing chunk leaves every earlier chunk applied.
//!
//! Read-only targets can be dropped up front by reading the cellset's
//! `Updateable` property. Spreading onto consolidations has no cellset
//! equivalent and is rejected before anything is sent.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{WriteBatch, WriteStrategy, WriteStrategyKind};
use crate::correlator::WriteTally;
use crate::error::{CellsetError, FailedCell, Result};
use crate::executor::{CellProperties, CellsetExecutor};
use crate::metadata::unique_element_name;
use crate::model::{Cell, CellValue, Coordinate, DimensionRef};
use crate::partition::Partition;
use crate::query::QuerySource;

/// `SELECT {(tuple),...} ON 0 FROM [cube]` addressing exactly `coordinates`.
pub fn write_mdx<'a, I>(cube: &str, dimensions: &[String], coordinates: I) -> String
where
    I: IntoIterator<Item = &'a Coordinate>,
{
    let dimension_refs: Vec<DimensionRef> = dimensions.iter().map(DimensionRef::new).collect();
    let tuples: Vec<String> = coordinates
        .into_iter()
        .map(|coordinate| {
            let members: Vec<String> = dimension_refs
                .iter()
                .zip(coordinate.elements())
                .map(|(d, e)| match e.split_once(':') {
                    // hierarchy:element
                    Some((hierarchy, element)) => unique_element_name(
                        &DimensionRef::with_hierarchy(d.dimension.clone(), hierarchy),
                        element,
                    ),
                    None => unique_element_name(d, e),
                })
                .collect();
            format!("({})", members.join(","))
        })
        .collect();
    format!(
        "SELECT {{{}}} ON 0 FROM [{}]",
        tuples.join(","),
        cube.replace(']', "]]")
    )
}

/// Writes by patching cells of a purpose-built cellset.
#[derive(Debug, Clone)]
pub struct CellsetWrite {
    executor: CellsetExecutor,
    chunk_size: usize,
}

impl CellsetWrite {
    pub fn new(executor: CellsetExecutor, chunk_size: usize) -> Self {
        Self {
            executor,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Values to patch, by ordinal.
    ///
    /// `current` holds the cells as they are now. With `increment`, numbers
    /// are added to the current value; with `skip_non_updateable`, cells the
    /// server marks as read-only are left out.
    fn values(batch: &WriteBatch<'_>, current: Option<&[Cell]>) -> Vec<(u64, CellValue)> {
        let options = batch.options;
        batch
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, (_, value))| {
                let cell = current.and_then(|cells| cells.get(i));
                if options.skip_non_updateable && cell.is_some_and(|c| !c.is_updateable()) {
                    return None;
                }
                let value = match value {
                    CellValue::Number(n) if options.increment => {
                        let base = cell.and_then(|c| c.value.as_number()).unwrap_or(0.0);
                        CellValue::Number(base + n)
                    }
                    v => (*v).clone(),
                };
                Some((i as u64, value))
            })
            .collect()
    }

    /// Patch `values` against `cellset_id`, chunk by chunk.
    ///
    /// Entries of `batch` without a value were skipped and are counted as such.
    pub async fn write_ordinals(
        &self,
        cellset_id: &str,
        batch: &WriteBatch<'_>,
        values: &[(u64, CellValue)],
    ) -> WriteTally {
        let mut tally = WriteTally::new(batch.entries.len());
        tally.skipped = batch.entries.len().saturating_sub(values.len());
        let mut done = 0;
        for (k, chunk) in values.chunks(self.chunk_size).enumerate() {
            debug!(chunk = k, cells = chunk.len(), "patching cells");
            if let Err(e) = self.executor.update(cellset_id, chunk).await {
                warn!(chunk = k, error = %e, applied = tally.applied, "cell update failed");
                let reason = e.to_string();
                tally.failures = values[done..]
                    .iter()
                    .filter_map(|(ordinal, _)| batch.entries.get(*ordinal as usize))
                    .map(|(coordinate, value)| {
                        FailedCell::new(coordinate.elements().to_vec(), Some((*value).clone()), reason.clone())
                    })
                    .collect();
                break;
            }
            done += chunk.len();
            tally.applied = done;
        }
        tally
    }
}

#[async_trait]
impl WriteStrategy for CellsetWrite {
    fn kind(&self) -> WriteStrategyKind {
        WriteStrategyKind::DirectCellset
    }

    #[instrument(skip_all, fields(cube = batch.cube, cells = batch.entries.len()))]
    async fn apply(&self, batch: &WriteBatch<'_>) -> Result<WriteTally> {
        let expected = batch.entries.len() as u64;
        let mdx = write_mdx(batch.cube, batch.dimensions, batch.entries.iter().map(|(c, _)| *c));
        let options = batch.options;

        self.executor
            .with_cellset(&QuerySource::mdx(mdx), |id| async move {
                let cardinality = self.executor.cellcount(&id).await?;
                if cardinality != expected {
                    return Err(CellsetError::MalformedCellsetMetadata(format!(
                        "write cellset has {} cells for {} coordinates",
                        cardinality, expected
                    )));
                }
                let current = if options.increment || options.skip_non_updateable {
                    let all = Partition {
                        index: 0,
                        start: 0,
                        end: expected,
                    };
                    let properties = CellProperties {
                        updateable: options.skip_non_updateable,
                        ..Default::default()
                    };
                    Some(self.executor.partition(&id, all, properties).await?)
                } else {
                    None
                };
                let values = Self::values(batch, current.as_deref());
                if values.len() < batch.entries.len() {
                    debug!(skipped = batch.entries.len() - values.len(), "dropping read-only cells");
                }
                let tally = self.write_ordinals(&id, batch, &values).await;
                info!(
                    applied = tally.applied,
                    skipped = tally.skipped,
                    failed = tally.failures.len(),
                    "cellset write finished"
                );
                Ok(tally)
            })
            .await
    }
}
