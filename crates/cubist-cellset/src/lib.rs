//! Cellset engine for cube servers
//!
//! Reads and writes multidimensional cells over the REST transport:
//!
//! - [`ordinal`] maps flat cell ordinals to per-axis tuple positions
//! - [`executor`] creates, pages and deletes server-side cellsets
//! - [`reader`] splits large reads over bounded concurrent workers
//! - [`write`] applies cell maps through one of three strategies
//! - [`correlator`] ties procedure error logs back to the failing cells
//!
//! [`CellsetEngine`] bundles these behind one session.

pub mod config;
pub mod correlator;
pub mod csv;
pub mod dimensions;
pub mod error;
pub mod executor;
pub mod handle;
pub mod metadata;
pub mod model;
pub mod ordinal;
pub mod partition;
pub mod query;
pub mod reader;
pub mod retry;
pub mod tokenize;
pub mod write;

use std::sync::Arc;
use tracing::debug;

use cubist_http::{SessionContext, Transport};

pub use config::EngineConfig;
pub use correlator::{ExecutionResult, ExecutionStatus, FailureRecord, WriteTally};
pub use dimensions::{
    DimensionOrderResolver, ElementKind, MeasureTypes, ServerDimensionResolver,
    StaticDimensionResolver,
};
pub use error::{CellsetError, FailedCell, Result};
pub use executor::{CellProperties, CellsetExecutor, ExecuteOptions, Execution};
pub use handle::CellsetHandle;
pub use metadata::{CellsetMetadata, MemberEncoding, NamingMode};
pub use model::{Axis, Cell, CellMap, CellValue, Coordinate, DimensionRef, Member};
pub use ordinal::OrdinalMapper;
pub use partition::Partition;
pub use query::QuerySource;
pub use reader::{CellsetData, PartitionedReader, ReadOptions};
pub use retry::LogRetryPolicy;
pub use write::{CellWriter, WriteOptions, WriteReport, WriteStrategy, WriteStrategyKind};

/// Reader and writer sharing one session and configuration.
#[derive(Clone)]
pub struct CellsetEngine {
    executor: CellsetExecutor,
    resolver: Arc<dyn DimensionOrderResolver>,
    config: EngineConfig,
}

impl CellsetEngine {
    /// Dimension order and measure types come from the server.
    pub fn new(transport: Arc<dyn Transport>, session: SessionContext, config: EngineConfig) -> Self {
        let executor = CellsetExecutor::new(transport, session);
        let resolver = Arc::new(ServerDimensionResolver::new(executor.clone()));
        Self {
            executor,
            resolver,
            config,
        }
    }

    /// Build an engine after asking the server for its version.
    pub async fn connect(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Self> {
        let session = SessionContext::discover(transport.as_ref())
            .await
            .map_err(|e| CellsetError::transport("discovering server version", e))?;
        debug!(version = ?session.server_version, "engine connected");
        Ok(Self::new(transport, session, config))
    }

    /// Resolve dimension order and measure types with `resolver` instead.
    pub fn with_resolver(mut self, resolver: Arc<dyn DimensionOrderResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn executor(&self) -> &CellsetExecutor {
        &self.executor
    }

    pub fn session(&self) -> &SessionContext {
        self.executor.session()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read options seeded from the engine configuration.
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions::from_config(&self.config)
    }

    pub fn reader(&self) -> PartitionedReader {
        PartitionedReader::new(self.executor.clone())
    }

    pub fn writer(&self) -> CellWriter {
        CellWriter::new(self.executor.clone(), self.resolver.clone(), self.config.clone())
    }

    /// Read every cell of `source`.
    pub async fn read(&self, source: &QuerySource, options: &ReadOptions) -> Result<CellsetData> {
        self.reader().read(source, options).await
    }

    /// Write `cells` into `cube` with the `kind` strategy.
    pub async fn write(
        &self,
        cube: &str,
        cells: &CellMap,
        kind: WriteStrategyKind,
        options: &WriteOptions,
    ) -> Result<WriteReport> {
        self.writer().write(cube, cells, kind, options).await
    }
}

impl std::fmt::Debug for CellsetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellsetEngine")
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish()
    }
}
