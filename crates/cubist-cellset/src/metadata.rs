//! Cellset metadata extraction
//!
//! Turns the server's `Axes`/`Tuples`/`Members` payload into an ordered
//! dimension basis and per-axis tuple lists. Two member encodings are
//! understood:
//!
//! - verbose: every member carries its unique name `[dim].[hier].[elem]`,
//!   so each tuple position names its own dimension
//! - compact: bare element names only, which needs the dimension order
//!   from the axis hierarchies or from the caller

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::{CellsetError, Result};
use crate::model::{Axis, Cell, CellValue, Coordinate, DimensionRef, Member};
use crate::ordinal::OrdinalMapper;

/// Which member encoding was requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberEncoding {
    #[default]
    Verbose,
    Compact,
}

/// How elements are spelled in client-facing coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingMode {
    /// `[dim].[hier].[elem]`
    #[default]
    UniqueNames,
    /// Bare element names
    ElementNames,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawNamed {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCube {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Dimensions", default)]
    pub dimensions: Vec<RawNamed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHierarchy {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Dimension")]
    pub dimension: Option<RawNamed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMember {
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "UniqueName")]
    pub unique_name: Option<String>,
    #[serde(rename = "Ordinal")]
    pub ordinal: Option<i64>,
    #[serde(rename = "Attributes")]
    pub attributes: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTuple {
    #[serde(rename = "Members", default)]
    pub members: Vec<RawMember>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAxis {
    #[serde(rename = "Ordinal")]
    pub ordinal: Option<u32>,
    #[serde(rename = "Cardinality")]
    pub cardinality: Option<u64>,
    #[serde(rename = "Hierarchies", default)]
    pub hierarchies: Vec<RawHierarchy>,
    #[serde(rename = "Tuples", default)]
    pub tuples: Vec<RawTuple>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCellObject {
    #[serde(rename = "Ordinal")]
    pub ordinal: u64,
    #[serde(rename = "Value", default)]
    pub value: CellValue,
    #[serde(rename = "Updateable")]
    pub updateable: Option<u64>,
    #[serde(rename = "RuleDerived")]
    pub rule_derived: Option<bool>,
    #[serde(rename = "Consolidated")]
    pub consolidated: Option<bool>,
}

/// A cell in either the object form or the compact `[Ordinal, Value]` form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawCell {
    Object(RawCellObject),
    Pair(u64, CellValue),
}

impl From<RawCell> for Cell {
    fn from(raw: RawCell) -> Self {
        match raw {
            RawCell::Object(o) => Cell {
                ordinal: o.ordinal,
                value: o.value,
                updateable: o.updateable,
                rule_derived: o.rule_derived,
                consolidated: o.consolidated,
            },
            RawCell::Pair(ordinal, value) => Cell::new(ordinal, value),
        }
    }
}

/// The cellset payload as returned by `GET Cellsets('id')?$expand=...`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCellset {
    #[serde(rename = "ID")]
    pub id: Option<String>,
    #[serde(rename = "Cube")]
    pub cube: Option<RawCube>,
    #[serde(rename = "Axes", default)]
    pub axes: Vec<RawAxis>,
    #[serde(rename = "Cells", default)]
    pub cells: Vec<RawCell>,
}

/// Wrapper for collection responses such as partitions.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCollection<T> {
    pub value: Vec<T>,
}

/// Structure of a cellset, without its cells.
#[derive(Debug, Clone, PartialEq)]
pub struct CellsetMetadata {
    pub id: Option<String>,
    pub cube: Option<String>,
    /// The cube's own dimension order, when the server reported it
    pub cube_dimensions: Vec<String>,
    /// Axes in ordinal order, fastest first
    pub axes: Vec<Axis>,
}

impl CellsetMetadata {
    /// All dimensions across axes, in axis order.
    pub fn dimensions(&self) -> Vec<DimensionRef> {
        self.axes
            .iter()
            .flat_map(|a| a.dimensions.iter().cloned())
            .collect()
    }

    pub fn axis_counts(&self) -> Vec<u64> {
        self.axes.iter().map(Axis::cardinality).collect()
    }

    pub fn mapper(&self) -> Result<OrdinalMapper> {
        OrdinalMapper::new(self.axis_counts())
    }

    pub fn cardinality(&self) -> Result<u64> {
        Ok(self.mapper()?.cardinality())
    }

    /// Positions of the axis-order dimensions rearranged into cube order.
    ///
    /// Falls back to axis order when the cube's dimensions are unknown or
    /// do not cover every queried dimension.
    pub fn coordinate_order(&self) -> Vec<usize> {
        let dimensions = self.dimensions();
        let identity: Vec<usize> = (0..dimensions.len()).collect();
        if self.cube_dimensions.is_empty() {
            return identity;
        }
        let mut positions = Vec::with_capacity(dimensions.len());
        for (i, d) in dimensions.iter().enumerate() {
            match self.cube_dimensions.iter().position(|c| d.is_dimension(c)) {
                Some(p) => positions.push((p, i)),
                None => return identity,
            }
        }
        // Stable: two hierarchies of one dimension keep their axis order
        positions.sort_by_key(|&(p, _)| p);
        positions.into_iter().map(|(_, i)| i).collect()
    }

    /// Dimensions in the order coordinates are built.
    pub fn coordinate_dimensions(&self) -> Vec<DimensionRef> {
        let dimensions = self.dimensions();
        self.coordinate_order()
            .into_iter()
            .map(|i| dimensions[i].clone())
            .collect()
    }

    pub fn coordinates(&self, naming: NamingMode) -> Result<CoordinateBuilder<'_>> {
        CoordinateBuilder::new(self, naming)
    }
}

/// Builds coordinates for ordinals of one cellset.
pub struct CoordinateBuilder<'a> {
    metadata: &'a CellsetMetadata,
    mapper: OrdinalMapper,
    order: Vec<usize>,
    naming: NamingMode,
}

impl<'a> CoordinateBuilder<'a> {
    fn new(metadata: &'a CellsetMetadata, naming: NamingMode) -> Result<Self> {
        Ok(Self {
            mapper: metadata.mapper()?,
            order: metadata.coordinate_order(),
            metadata,
            naming,
        })
    }

    pub fn mapper(&self) -> &OrdinalMapper {
        &self.mapper
    }

    fn spell(&self, member: &Member) -> String {
        match self.naming {
            NamingMode::UniqueNames => member.unique_name.clone(),
            NamingMode::ElementNames => member.name.clone(),
        }
    }

    /// Elements of one tuple on one axis.
    pub fn tuple_names(&self, axis: usize, tuple: usize) -> Vec<String> {
        self.metadata
            .axes
            .get(axis)
            .and_then(|a| a.tuples.get(tuple))
            .map(|members| members.iter().map(|m| self.spell(m)).collect())
            .unwrap_or_default()
    }

    /// Coordinate of the cell at `ordinal`, in cube dimension order.
    pub fn coordinate(&self, ordinal: u64) -> Result<Coordinate> {
        let indices = self.mapper.decompose(ordinal)?;
        let mut in_axis_order = Vec::with_capacity(self.order.len());
        for (axis, &tuple) in indices.iter().enumerate() {
            in_axis_order.extend(self.tuple_names(axis, tuple));
        }
        if in_axis_order.len() != self.order.len() {
            return Err(CellsetError::MalformedCellsetMetadata(format!(
                "ordinal {} resolves to {} members, expected {}",
                ordinal,
                in_axis_order.len(),
                self.order.len()
            )));
        }
        Ok(self
            .order
            .iter()
            .map(|&i| std::mem::take(&mut in_axis_order[i]))
            .collect())
    }
}

/// Split a unique name like `[Region].[Geo].[North]` into its segments.
///
/// Brackets are escaped by doubling, so `[a]]b]` is the segment `a]b`.
pub fn parse_unique_name(unique_name: &str) -> Result<Vec<String>> {
    let malformed = || {
        CellsetError::MalformedCellsetMetadata(format!("invalid unique name '{}'", unique_name))
    };
    let mut segments = Vec::new();
    let mut chars = unique_name.chars().peekable();
    loop {
        if chars.next() != Some('[') {
            return Err(malformed());
        }
        let mut segment = String::new();
        loop {
            match chars.next() {
                Some(']') if chars.peek() == Some(&']') => {
                    chars.next();
                    segment.push(']');
                }
                Some(']') => break,
                Some(c) => segment.push(c),
                None => return Err(malformed()),
            }
        }
        segments.push(segment);
        match chars.next() {
            None => return Ok(segments),
            Some('.') => continue,
            Some(_) => return Err(malformed()),
        }
    }
}

fn bracket(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Unique name of an element in a dimension/hierarchy.
pub fn unique_element_name(dimension: &DimensionRef, element: &str) -> String {
    format!(
        "{}.{}.{}",
        bracket(&dimension.dimension),
        bracket(&dimension.hierarchy),
        bracket(element)
    )
}

fn dimension_from_unique_name(unique_name: &str) -> Result<DimensionRef> {
    let segments = parse_unique_name(unique_name)?;
    match segments.as_slice() {
        [dimension, _element] => Ok(DimensionRef::new(dimension.clone())),
        [dimension, hierarchy, _element] => Ok(DimensionRef::with_hierarchy(
            dimension.clone(),
            hierarchy.clone(),
        )),
        _ => Err(CellsetError::MalformedCellsetMetadata(format!(
            "unique name '{}' has {} segments",
            unique_name,
            segments.len()
        ))),
    }
}

/// Extract the structure of a cellset.
///
/// `dimension_hint` is the caller's dimension order across all axes; it is
/// required for compact encodings whose axes carry no hierarchy list.
pub fn extract_metadata(
    raw: &RawCellset,
    encoding: MemberEncoding,
    dimension_hint: Option<&[DimensionRef]>,
) -> Result<CellsetMetadata> {
    let mut hint_offset = 0usize;
    let mut axes = Vec::with_capacity(raw.axes.len());

    let mut raw_axes: Vec<&RawAxis> = raw.axes.iter().collect();
    raw_axes.sort_by_key(|a| a.ordinal.unwrap_or(u32::MAX));

    for (position, raw_axis) in raw_axes.into_iter().enumerate() {
        let arity = axis_arity(position, raw_axis)?;
        if let Some(reported) = raw_axis.cardinality {
            if reported != raw_axis.tuples.len() as u64 {
                return Err(CellsetError::MalformedCellsetMetadata(format!(
                    "axis {} reports cardinality {} but carries {} tuples",
                    position,
                    reported,
                    raw_axis.tuples.len()
                )));
            }
        }

        let dimensions = if !raw_axis.hierarchies.is_empty() {
            raw_axis
                .hierarchies
                .iter()
                .map(|h| match &h.dimension {
                    Some(d) => DimensionRef::with_hierarchy(d.name.clone(), h.name.clone()),
                    None => DimensionRef::new(h.name.clone()),
                })
                .collect::<Vec<_>>()
        } else if arity == 0 {
            Vec::new()
        } else {
            match encoding {
                MemberEncoding::Verbose => raw_axis.tuples[0]
                    .members
                    .iter()
                    .map(|m| {
                        let unique = m.unique_name.as_deref().ok_or_else(|| {
                            CellsetError::MalformedCellsetMetadata(format!(
                                "axis {} member without UniqueName in verbose encoding",
                                position
                            ))
                        })?;
                        dimension_from_unique_name(unique)
                    })
                    .collect::<Result<Vec<_>>>()?,
                MemberEncoding::Compact => {
                    let hint = dimension_hint.ok_or_else(|| {
                        CellsetError::MalformedCellsetMetadata(
                            "compact member encoding needs a dimension order".to_string(),
                        )
                    })?;
                    let slice = hint.get(hint_offset..hint_offset + arity).ok_or_else(|| {
                        CellsetError::MalformedCellsetMetadata(format!(
                            "dimension order lists {} dimensions, axes need more",
                            hint.len()
                        ))
                    })?;
                    hint_offset += arity;
                    slice.to_vec()
                }
            }
        };

        if arity > 0 && dimensions.len() != arity {
            return Err(CellsetError::MalformedCellsetMetadata(format!(
                "axis {} lists {} hierarchies but tuples have {} members",
                position,
                dimensions.len(),
                arity
            )));
        }

        let tuples = raw_axis
            .tuples
            .iter()
            .map(|t| {
                t.members
                    .iter()
                    .zip(&dimensions)
                    .map(|(m, d)| member_from_raw(m, d))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        axes.push(Axis { dimensions, tuples });
    }

    Ok(CellsetMetadata {
        id: raw.id.clone(),
        cube: raw.cube.as_ref().map(|c| c.name.clone()),
        cube_dimensions: raw
            .cube
            .as_ref()
            .map(|c| c.dimensions.iter().map(|d| d.name.clone()).collect())
            .unwrap_or_default(),
        axes,
    })
}

fn axis_arity(position: usize, axis: &RawAxis) -> Result<usize> {
    let mut lengths = axis.tuples.iter().map(|t| t.members.len());
    let first = match lengths.next() {
        Some(n) => n,
        None => return Ok(axis.hierarchies.len()),
    };
    if let Some(other) = lengths.find(|&n| n != first) {
        return Err(CellsetError::MalformedCellsetMetadata(format!(
            "axis {} mixes tuples of {} and {} members",
            position, first, other
        )));
    }
    Ok(first)
}

fn member_from_raw(raw: &RawMember, dimension: &DimensionRef) -> Result<Member> {
    let name = match (&raw.name, &raw.unique_name) {
        (Some(name), _) => name.clone(),
        (None, Some(unique)) => parse_unique_name(unique)?
            .pop()
            .unwrap_or_default(),
        (None, None) => {
            return Err(CellsetError::MalformedCellsetMetadata(
                "member without Name or UniqueName".to_string(),
            ))
        }
    };
    let unique_name = raw
        .unique_name
        .clone()
        .unwrap_or_else(|| unique_element_name(dimension, &name));
    Ok(Member {
        name,
        unique_name,
        ordinal: raw.ordinal,
        attributes: raw.attributes.clone().unwrap_or_default(),
    })
}

/// Convert raw cells, checking every ordinal against the cellset size.
pub fn extract_cells(raw: Vec<RawCell>, cardinality: u64) -> Result<Vec<Cell>> {
    raw.into_iter()
        .map(Cell::from)
        .map(|cell| {
            if cell.ordinal >= cardinality {
                Err(CellsetError::OrdinalOutOfRange {
                    ordinal: cell.ordinal,
                    cardinality,
                })
            } else {
                Ok(cell)
            }
        })
        .collect()
}
