//! Authoritative dimension order and measure element types
//!
//! Writes address cells with flat element tuples. Those tuples are only
//! meaningful against the cube's own dimension order, which comes from a
//! [`DimensionOrderResolver`].

use async_trait::async_trait;
use cubist_common::{names_equal, NameKey};
use cubist_http::{odata_quote, Request};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{CellsetError, Result};
use crate::executor::CellsetExecutor;
use crate::metadata::RawCollection;

/// Dimension added to cubes on sandbox-enabled servers
pub const SANDBOX_DIMENSION: &str = "Sandboxes";

/// Element type as far as writes are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Numeric,
    String,
    Consolidated,
}

impl ElementKind {
    /// Accepts both the named and the numeric encoding of element types.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => match s.as_str() {
                "Numeric" => Some(Self::Numeric),
                "String" => Some(Self::String),
                "Consolidated" => Some(Self::Consolidated),
                _ => None,
            },
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(1) => Some(Self::Numeric),
                Some(2) => Some(Self::String),
                Some(3) => Some(Self::Consolidated),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Element types of the measure dimension, keyed case/space-insensitively.
pub type MeasureTypes = HashMap<NameKey, ElementKind>;

/// Source of a cube's dimension order.
#[async_trait]
pub trait DimensionOrderResolver: Send + Sync {
    /// Dimensions of `cube` in their natural order.
    async fn dimension_order(&self, cube: &str) -> Result<Vec<String>>;

    /// Element types of the last (measure) dimension of `cube`.
    async fn measure_types(&self, cube: &str) -> Result<MeasureTypes>;
}

#[derive(Deserialize)]
struct RawElement {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Type")]
    kind: serde_json::Value,
}

#[derive(Deserialize)]
struct RawElements {
    #[serde(rename = "Elements", default)]
    elements: Vec<RawElement>,
}

#[derive(Deserialize)]
struct RawDimension {
    #[serde(rename = "Hierarchies", default)]
    hierarchies: Vec<RawElements>,
}

#[derive(Deserialize)]
struct RawName {
    #[serde(rename = "Name")]
    name: String,
}

/// Asks the server.
#[derive(Debug, Clone)]
pub struct ServerDimensionResolver {
    executor: CellsetExecutor,
}

impl ServerDimensionResolver {
    pub fn new(executor: CellsetExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl DimensionOrderResolver for ServerDimensionResolver {
    async fn dimension_order(&self, cube: &str) -> Result<Vec<String>> {
        let request = Request::get(format!("Cubes('{}')/Dimensions", odata_quote(cube)))
            .query("$select", "Name");
        let response = self.executor.send(request, "resolving dimension order").await?;
        let raw: RawCollection<RawName> = serde_json::from_slice(response.bytes())?;
        let mut names: Vec<String> = raw.value.into_iter().map(|d| d.name).collect();
        if names
            .first()
            .is_some_and(|d| names_equal(d, SANDBOX_DIMENSION))
        {
            names.remove(0);
        }
        debug!(cube, dimensions = names.len(), "resolved dimension order");
        Ok(names)
    }

    async fn measure_types(&self, cube: &str) -> Result<MeasureTypes> {
        let order = self.dimension_order(cube).await?;
        let Some(measure) = order.last() else {
            return Ok(MeasureTypes::new());
        };
        let request = Request::get(format!("Dimensions('{}')", odata_quote(measure))).query(
            "$expand",
            "Hierarchies($select=Elements;$expand=Elements($select=Name,Type))",
        );
        let response = self.executor.send(request, "resolving measure types").await?;
        let raw: RawDimension = serde_json::from_slice(response.bytes())?;
        Ok(raw
            .hierarchies
            .into_iter()
            .flat_map(|h| h.elements)
            .filter_map(|e| ElementKind::from_json(&e.kind).map(|k| (NameKey::from(e.name), k)))
            .collect())
    }
}

/// Fixed answers, for callers that already know the layout.
#[derive(Debug, Clone, Default)]
pub struct StaticDimensionResolver {
    orders: HashMap<NameKey, Vec<String>>,
    measures: HashMap<NameKey, MeasureTypes>,
}

impl StaticDimensionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cube<S: Into<String>>(
        mut self,
        cube: impl Into<String>,
        dimensions: impl IntoIterator<Item = S>,
    ) -> Self {
        self.orders.insert(
            NameKey::from(cube.into()),
            dimensions.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_measure_types<S: Into<String>>(
        mut self,
        cube: impl Into<String>,
        types: impl IntoIterator<Item = (S, ElementKind)>,
    ) -> Self {
        self.measures.insert(
            NameKey::from(cube.into()),
            types
                .into_iter()
                .map(|(name, kind)| (NameKey::from(name.into()), kind))
                .collect(),
        );
        self
    }
}

#[async_trait]
impl DimensionOrderResolver for StaticDimensionResolver {
    async fn dimension_order(&self, cube: &str) -> Result<Vec<String>> {
        self.orders
            .get(&NameKey::from(cube))
            .cloned()
            .ok_or_else(|| {
                CellsetError::InvalidArgument(format!(
                    "no dimension order known for cube '{}'",
                    cube
                ))
            })
    }

    async fn measure_types(&self, cube: &str) -> Result<MeasureTypes> {
        Ok(self
            .measures
            .get(&NameKey::from(cube))
            .cloned()
            .unwrap_or_default())
    }
}
