//! Query execution against the server
//!
//! Two paths:
//!
//! - fast path: create, extract everything in one round trip, release.
//!   Used for sequential reads.
//! - handle path: create and fetch only the structure; cells are pulled
//!   later, partition by partition, and the caller releases the handle.

use cubist_http::{odata_quote, HttpResponse, Request, SessionContext, Transport};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{CellsetError, Result};
use crate::handle::CellsetHandle;
use crate::metadata::{
    extract_cells, extract_metadata, CellsetMetadata, MemberEncoding, RawCell, RawCellset,
    RawCollection,
};
use crate::model::{Cell, CellValue, DimensionRef};
use crate::partition::Partition;
use crate::query::QuerySource;

/// Optional cell properties to request along with values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellProperties {
    pub updateable: bool,
    pub rule_derived: bool,
    pub consolidated: bool,
}

impl CellProperties {
    fn select(&self) -> String {
        let mut fields = vec!["Ordinal", "Value"];
        if self.updateable {
            fields.push("Updateable");
        }
        if self.rule_derived {
            fields.push("RuleDerived");
        }
        if self.consolidated {
            fields.push("Consolidated");
        }
        fields.join(",")
    }
}

/// How a cellset's structure and cells are requested.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Leave out the title axis
    pub skip_contexts: bool,
    /// Only the first `top` cells on the fast path
    pub top: Option<usize>,
    pub encoding: MemberEncoding,
    /// Dimension order across axes, for compact encoding
    pub dimension_hint: Option<Vec<DimensionRef>>,
    pub cell_properties: CellProperties,
    /// Element attributes to fetch with every member
    pub member_attributes: Vec<String>,
}

impl ExecuteOptions {
    fn expand(&self, with_cells: bool) -> String {
        let mut member_fields = vec!["Name".to_string()];
        if self.encoding == MemberEncoding::Verbose {
            member_fields.push("UniqueName".to_string());
        }
        member_fields.extend(self.member_attributes.iter().map(|a| format!("Attributes/{}", a)));

        let axis_filter = if self.skip_contexts {
            "$filter=Ordinal ne 2;"
        } else {
            ""
        };
        let mut expand = format!(
            "Cube($select=Name;$expand=Dimensions($select=Name)),\
             Axes({}$expand=Hierarchies($select=Name;$expand=Dimension($select=Name)),\
             Tuples($expand=Members($select={})))",
            axis_filter,
            member_fields.join(",")
        );
        if with_cells {
            expand.push_str(&format!(
                ",Cells($select={}{})",
                self.cell_properties.select(),
                self.top.map(|n| format!(";$top={}", n)).unwrap_or_default()
            ));
        }
        expand
    }
}

/// Result of executing a query.
#[derive(Debug)]
pub enum Execution {
    /// Everything fetched; the server resource is already gone
    Materialized {
        metadata: CellsetMetadata,
        cells: Vec<Cell>,
    },
    /// Structure fetched; cells remain on the server behind the handle
    Handle {
        handle: CellsetHandle,
        metadata: CellsetMetadata,
    },
}

#[derive(Deserialize)]
struct CreatedCellset {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct AxisCardinality {
    #[serde(rename = "Cardinality")]
    cardinality: u64,
}

#[derive(Deserialize)]
struct AxesOnly {
    #[serde(rename = "Axes", default)]
    axes: Vec<AxisCardinality>,
}

/// Issues cellset calls with an explicit session.
#[derive(Clone)]
pub struct CellsetExecutor {
    transport: Arc<dyn Transport>,
    session: SessionContext,
}

impl CellsetExecutor {
    pub fn new(transport: Arc<dyn Transport>, session: SessionContext) -> Self {
        Self { transport, session }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Send with session parameters, tagging failures with `context`.
    pub(crate) async fn send(&self, request: Request, context: &str) -> Result<HttpResponse> {
        self.transport
            .execute(self.session.apply(request))
            .await
            .map_err(|e| CellsetError::transport(context, e))
    }

    /// Allocate a cellset on the server.
    #[instrument(skip_all, fields(source = %source))]
    pub async fn create(&self, source: &QuerySource) -> Result<CellsetHandle> {
        let response = self
            .send(source.create_request(), "creating cellset")
            .await?;
        let created: CreatedCellset = response
            .json_as()
            .map_err(|e| CellsetError::transport("reading created cellset id", e))?;
        debug!(cellset = %created.id, "cellset created");
        Ok(CellsetHandle::new(created.id, self.clone()))
    }

    async fn fetch(&self, id: &str, options: &ExecuteOptions, with_cells: bool) -> Result<RawCellset> {
        let request = Request::get(format!("Cellsets('{}')", odata_quote(id)))
            .query("$expand", options.expand(with_cells));
        let response = self.send(request, "fetching cellset").await?;
        Ok(serde_json::from_slice(response.bytes())?)
    }

    /// Axes and cube structure without cells.
    pub async fn metadata(&self, id: &str, options: &ExecuteOptions) -> Result<CellsetMetadata> {
        let raw = self.fetch(id, options, false).await?;
        extract_metadata(&raw, options.encoding, options.dimension_hint.as_deref())
    }

    /// Structure and all cells in one round trip.
    pub async fn extract(
        &self,
        id: &str,
        options: &ExecuteOptions,
    ) -> Result<(CellsetMetadata, Vec<Cell>)> {
        let mut raw = self.fetch(id, options, true).await?;
        let metadata = extract_metadata(&raw, options.encoding, options.dimension_hint.as_deref())?;
        let cardinality = metadata.cardinality()?;
        let cells = extract_cells(std::mem::take(&mut raw.cells), cardinality)?;
        let expected = options
            .top
            .map(|top| (top as u64).min(cardinality))
            .unwrap_or(cardinality);
        if (cells.len() as u64) < expected {
            return Err(CellsetError::MalformedCellsetMetadata(format!(
                "cellset '{}' returned {} cells, expected {}",
                id,
                cells.len(),
                expected
            )));
        }
        Ok((metadata, cells))
    }

    /// Cells of one ordinal range.
    pub async fn partition(
        &self,
        id: &str,
        partition: Partition,
        properties: CellProperties,
    ) -> Result<Vec<Cell>> {
        if partition.is_empty() {
            return Ok(Vec::new());
        }
        // End is inclusive on the wire
        let request = Request::get(format!(
            "Cellsets('{}')/tm1.GetPartition(Begin={}, End={})",
            odata_quote(id),
            partition.start,
            partition.end - 1
        ))
        .query("$select", properties.select());
        let context = format!("fetching partition {}", partition);
        let response = self.send(request, &context).await?;
        let raw: RawCollection<RawCell> = serde_json::from_slice(response.bytes())?;

        let mut cells: Vec<Cell> = raw.value.into_iter().map(Cell::from).collect();
        if let Some(stray) = cells.iter().find(|c| !partition.contains(c.ordinal)) {
            return Err(CellsetError::OrdinalOutOfRange {
                ordinal: stray.ordinal,
                cardinality: partition.end,
            });
        }
        if cells.len() as u64 != partition.len() {
            return Err(CellsetError::MalformedCellsetMetadata(format!(
                "partition {} returned {} cells",
                partition,
                cells.len()
            )));
        }
        cells.sort_by_key(|c| c.ordinal);
        Ok(cells)
    }

    /// Number of cells: the product of the axis cardinalities.
    pub async fn cellcount(&self, id: &str) -> Result<u64> {
        let request = Request::get(format!("Cellsets('{}')", odata_quote(id)))
            .query("$expand", "Axes($select=Cardinality)");
        let response = self.send(request, "counting cells").await?;
        let axes: AxesOnly = serde_json::from_slice(response.bytes())?;
        axes.axes
            .iter()
            .try_fold(1u64, |acc, a| acc.checked_mul(a.cardinality))
            .ok_or_else(|| {
                CellsetError::MalformedCellsetMetadata("cell count overflows".to_string())
            })
    }

    /// Overwrite cells by ordinal.
    pub async fn update(&self, id: &str, updates: &[(u64, CellValue)]) -> Result<()> {
        let body: Vec<_> = updates
            .iter()
            .map(|(ordinal, value)| json!({ "Ordinal": ordinal, "Value": value }))
            .collect();
        let request = Request::patch(format!("Cellsets('{}')/Cells", odata_quote(id)))
            .json_value(serde_json::Value::Array(body));
        self.send(request, "updating cells").await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let request = Request::delete(format!("Cellsets('{}')", odata_quote(id)));
        self.send(request, "releasing cellset").await?;
        Ok(())
    }

    /// Execute `source`, choosing the fast path for a single worker.
    #[instrument(skip_all, fields(source = %source, workers = workers))]
    pub async fn execute(
        &self,
        source: &QuerySource,
        workers: usize,
        options: &ExecuteOptions,
    ) -> Result<Execution> {
        let handle = self.create(source).await?;
        if workers <= 1 {
            let outcome = self.extract(handle.id(), options).await;
            let (metadata, cells) = handle.release_after(outcome).await?;
            return Ok(Execution::Materialized { metadata, cells });
        }
        match self.metadata(handle.id(), options).await {
            Ok(metadata) => Ok(Execution::Handle { handle, metadata }),
            Err(e) => handle.release_after(Err(e)).await,
        }
    }

    /// Run `body` against a fresh cellset and release it on every exit path.
    pub async fn with_cellset<T, F, Fut>(&self, source: &QuerySource, body: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.create(source).await?;
        let outcome = body(handle.id().to_string()).await;
        handle.release_after(outcome).await
    }
}

impl std::fmt::Debug for CellsetExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellsetExecutor")
            .field("session", &self.session)
            .finish()
    }
}
