//! Client-side data model: dimensions, axes, cells and coordinates

use cubist_common::{names_equal, normalize_name};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A dimension plus the hierarchy used from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionRef {
    pub dimension: String,
    pub hierarchy: String,
}

impl DimensionRef {
    /// Reference the default hierarchy, which shares the dimension's name.
    pub fn new(dimension: impl Into<String>) -> Self {
        let dimension = dimension.into();
        Self {
            hierarchy: dimension.clone(),
            dimension,
        }
    }

    pub fn with_hierarchy(dimension: impl Into<String>, hierarchy: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            hierarchy: hierarchy.into(),
        }
    }

    /// True when this reference names `dimension`, ignoring case and spaces.
    pub fn is_dimension(&self, dimension: &str) -> bool {
        names_equal(&self.dimension, dimension)
    }
}

impl PartialEq for DimensionRef {
    fn eq(&self, other: &Self) -> bool {
        names_equal(&self.dimension, &other.dimension)
            && names_equal(&self.hierarchy, &other.hierarchy)
    }
}

impl fmt::Display for DimensionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if names_equal(&self.dimension, &self.hierarchy) {
            write!(f, "{}", self.dimension)
        } else {
            write!(f, "{}:{}", self.dimension, self.hierarchy)
        }
    }
}

/// One element as it appears in an axis tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub unique_name: String,
    /// Element weight or index, when the server reported one
    pub ordinal: Option<i64>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Member {
    pub fn new(name: impl Into<String>, unique_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_name: unique_name.into(),
            ordinal: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// One side of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    /// Dimensions placed on this axis, in tuple order
    pub dimensions: Vec<DimensionRef>,
    pub tuples: Vec<Vec<Member>>,
}

impl Axis {
    pub fn cardinality(&self) -> u64 {
        self.tuples.len() as u64
    }
}

/// A cell value as the server reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    #[default]
    Empty,
}

impl CellValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, CellValue::Text(_))
    }

    /// Zero, empty string and null all count as "nothing there".
    pub fn is_zero_or_empty(&self) -> bool {
        match self {
            CellValue::Number(n) => *n == 0.0,
            CellValue::Text(s) => s.is_empty(),
            CellValue::Empty => true,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Empty => Ok(()),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

/// Updateable bit meaning the cell cannot be written
const NOT_UPDATEABLE_BIT: u64 = 1 << 28;

/// A cell at its server ordinal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cell {
    pub ordinal: u64,
    pub value: CellValue,
    /// Raw `Updateable` bitmask, when requested
    pub updateable: Option<u64>,
    pub rule_derived: Option<bool>,
    pub consolidated: Option<bool>,
}

impl Cell {
    pub fn new(ordinal: u64, value: CellValue) -> Self {
        Self {
            ordinal,
            value,
            ..Default::default()
        }
    }

    /// Unknown updateability counts as writable; the server has the final say.
    pub fn is_updateable(&self) -> bool {
        self.updateable
            .map(|mask| mask & NOT_UPDATEABLE_BIT == 0)
            .unwrap_or(true)
    }
}

/// Element identifiers of one cell, ordered like its dimensions.
///
/// Equality and hashing ignore case and whitespace.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coordinate(Vec<String>);

impl Coordinate {
    pub fn new(elements: Vec<String>) -> Self {
        Self(elements)
    }

    pub fn elements(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_elements(self) -> Vec<String> {
        self.0
    }
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|(a, b)| names_equal(a, b))
    }
}

impl Eq for Coordinate {}

impl Hash for Coordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for element in &self.0 {
            normalize_name(element).hash(state);
        }
    }
}

impl fmt::Debug for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Coordinate").field(&self.0).finish()
    }
}

impl<S: Into<String>> FromIterator<S> for Coordinate {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String> + Clone, const N: usize> From<[S; N]> for Coordinate {
    fn from(elements: [S; N]) -> Self {
        elements.into_iter().collect()
    }
}

impl From<Vec<String>> for Coordinate {
    fn from(elements: Vec<String>) -> Self {
        Self(elements)
    }
}

/// Ordered coordinate to value mapping.
///
/// Iteration follows insertion order, which for read results is ascending
/// ordinal. Re-inserting an existing coordinate replaces its value in place.
#[derive(Debug, Clone, Default)]
pub struct CellMap {
    dimensions: Vec<DimensionRef>,
    entries: Vec<(Coordinate, CellValue)>,
    index: HashMap<Coordinate, usize>,
}

impl CellMap {
    pub fn new(dimensions: Vec<DimensionRef>) -> Self {
        Self {
            dimensions,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Replace the dimension list without touching the entries.
    pub fn with_dimensions(mut self, dimensions: Vec<DimensionRef>) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Dimensions the coordinates are ordered by. Empty when the caller
    /// did not name them.
    pub fn dimensions(&self) -> &[DimensionRef] {
        &self.dimensions
    }

    pub fn insert(&mut self, coordinate: impl Into<Coordinate>, value: impl Into<CellValue>) {
        let coordinate = coordinate.into();
        let value = value.into();
        match self.index.get(&coordinate) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(coordinate.clone(), self.entries.len());
                self.entries.push((coordinate, value));
            }
        }
    }

    pub fn get(&self, coordinate: &Coordinate) -> Option<&CellValue> {
        self.index.get(coordinate).map(|&i| &self.entries[i].1)
    }

    /// Look up by element names.
    pub fn get_by<S: AsRef<str>>(&self, elements: &[S]) -> Option<&CellValue> {
        let coordinate: Coordinate = elements.iter().map(|e| e.as_ref().to_string()).collect();
        self.get(&coordinate)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Coordinate, &CellValue)> {
        self.entries.iter().map(|(c, v)| (c, v))
    }

    pub fn coordinates(&self) -> impl Iterator<Item = &Coordinate> {
        self.entries.iter().map(|(c, _)| c)
    }

    pub fn values(&self) -> impl Iterator<Item = &CellValue> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl IntoIterator for CellMap {
    type Item = (Coordinate, CellValue);
    type IntoIter = std::vec::IntoIter<(Coordinate, CellValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<C: Into<Coordinate>, V: Into<CellValue>> FromIterator<(C, V)> for CellMap {
    fn from_iter<I: IntoIterator<Item = (C, V)>>(iter: I) -> Self {
        let mut map = CellMap::default();
        for (c, v) in iter {
            map.insert(c, v);
        }
        map
    }
}
