//! Splitting the ordinal space into worker ranges

use std::fmt;

/// A contiguous ordinal range `[start, end)` owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    /// Position among all partitions; merge order
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Partition {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn contains(&self, ordinal: u64) -> bool {
        (self.start..self.end).contains(&ordinal)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}, {})", self.index, self.start, self.end)
    }
}

/// Split `[0, cardinality)` into at most `workers` ranges of `ceil(N/W)`
/// ordinals each; the last range is truncated. Empty ranges are dropped,
/// so an empty cellset yields no partitions.
pub fn partition(cardinality: u64, workers: usize) -> Vec<Partition> {
    if cardinality == 0 {
        return Vec::new();
    }
    let workers = workers.max(1) as u64;
    let size = cardinality.div_ceil(workers);
    (0..workers)
        .map(|i| (i * size, ((i + 1) * size).min(cardinality)))
        .take_while(|&(start, _)| start < cardinality)
        .enumerate()
        .map(|(index, (start, end))| Partition { index, start, end })
        .collect()
}
