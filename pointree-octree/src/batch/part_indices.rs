use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Records which logical source part each point of a batch came from.
///
/// Stored in the cheapest representation that can hold all values: a single value shared by every
/// point, or a per-point array of the narrowest sufficient integer width.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartIndices {
    /// Every point belongs to the same part.
    Shared(u32),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl PartIndices {
    /// Picks the cheapest representation for the given per-point values.
    ///
    /// Returns [`None`] if `values` is empty, since there is nothing to record.
    pub fn from_per_point(values: &[u32]) -> Option<Self> {
        let (&first, rest) = values.split_first()?;
        if rest.iter().all(|&value| value == first) {
            return Some(Self::Shared(first));
        }
        let max = values.iter().copied().max().unwrap_or(first);
        Some(if u8::try_from(max).is_ok() {
            Self::U8(values.iter().map(|&value| value as u8).collect())
        } else if u16::try_from(max).is_ok() {
            Self::U16(values.iter().map(|&value| value as u16).collect())
        } else {
            Self::U32(values.to_vec())
        })
    }

    /// The number of stored values, or [`None`] for a shared value.
    pub fn per_point_len(&self) -> Option<usize> {
        match self {
            Self::Shared(_) => None,
            Self::U8(values) => Some(values.len()),
            Self::U16(values) => Some(values.len()),
            Self::U32(values) => Some(values.len()),
        }
    }

    /// The part index of the point at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for a per-point array.
    pub fn get(&self, index: usize) -> u32 {
        match self {
            Self::Shared(value) => *value,
            Self::U8(values) => values[index].into(),
            Self::U16(values) => values[index].into(),
            Self::U32(values) => values[index],
        }
    }

    /// The smallest and largest stored part index.
    ///
    /// Returns [`None`] for an empty per-point array.
    pub fn range(&self) -> Option<PartIndexRange> {
        match self {
            Self::Shared(value) => Some(PartIndexRange::single(*value)),
            Self::U8(values) => PartIndexRange::from_values(values.iter().map(|&v| v.into())),
            Self::U16(values) => PartIndexRange::from_values(values.iter().map(|&v| v.into())),
            Self::U32(values) => PartIndexRange::from_values(values.iter().copied()),
        }
    }

    /// Expands into one value per point for a batch of `len` points.
    pub fn to_per_point(&self, len: usize) -> Vec<u32> {
        match self {
            Self::Shared(value) => vec![*value; len],
            _ => (0..len).map(|index| self.get(index)).collect(),
        }
    }

    /// Keeps only the values at `indices`; a shared value stays shared.
    pub fn subset(&self, indices: &[usize]) -> Self {
        match self {
            Self::Shared(value) => Self::Shared(*value),
            Self::U8(values) => Self::U8(indices.iter().map(|&i| values[i]).collect()),
            Self::U16(values) => Self::U16(indices.iter().map(|&i| values[i]).collect()),
            Self::U32(values) => Self::U32(indices.iter().map(|&i| values[i]).collect()),
        }
    }

    /// Keeps only the values within `range`; a shared value stays shared.
    pub fn slice(&self, range: Range<usize>) -> Self {
        match self {
            Self::Shared(value) => Self::Shared(*value),
            Self::U8(values) => Self::U8(values[range].to_vec()),
            Self::U16(values) => Self::U16(values[range].to_vec()),
            Self::U32(values) => Self::U32(values[range].to_vec()),
        }
    }

    /// Drops all per-point values beyond `len`.
    pub fn truncate(&mut self, len: usize) {
        match self {
            Self::Shared(_) => {}
            Self::U8(values) => values.truncate(len),
            Self::U16(values) => values.truncate(len),
            Self::U32(values) => values.truncate(len),
        }
    }

    /// Concatenates the part indices of two batches holding `a_len` and `b_len` points.
    pub fn concat(a: &Self, a_len: usize, b: &Self, b_len: usize) -> Self {
        if let (Self::Shared(a), Self::Shared(b)) = (a, b) {
            if a == b {
                return Self::Shared(*a);
            }
        }
        let mut values = a.to_per_point(a_len);
        values.extend(b.to_per_point(b_len));
        Self::from_per_point(&values).unwrap_or(Self::U8(Vec::new()))
    }
}

/// An inclusive range of part indices.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartIndexRange {
    pub min: u32,
    pub max: u32,
}

impl PartIndexRange {
    /// Constructs a [`PartIndexRange`] from inclusive limits.
    ///
    /// # Panics
    ///
    /// Panics if `min` exceeds `max`.
    pub const fn new(min: u32, max: u32) -> Self {
        assert!(min <= max, "min part index must not exceed max part index");
        Self { min, max }
    }

    pub const fn single(value: u32) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    /// The range covering all `values`; [`None`] if there are none.
    pub fn from_values(values: impl IntoIterator<Item = u32>) -> Option<Self> {
        values
            .into_iter()
            .map(Self::single)
            .reduce(Self::union)
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Unites two optional ranges, which is only defined if both are present.
    pub fn union_both(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        Some(a?.union(b?))
    }

    pub fn contains(self, value: u32) -> bool {
        self.min <= value && value <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cheapest_representation() {
        assert_eq!(PartIndices::from_per_point(&[]), None);
        assert_eq!(
            PartIndices::from_per_point(&[3, 3, 3]),
            Some(PartIndices::Shared(3))
        );
        assert_eq!(
            PartIndices::from_per_point(&[1, 200]),
            Some(PartIndices::U8(vec![1, 200]))
        );
        assert_eq!(
            PartIndices::from_per_point(&[1, 300]),
            Some(PartIndices::U16(vec![1, 300]))
        );
        assert_eq!(
            PartIndices::from_per_point(&[1, 70_000]),
            Some(PartIndices::U32(vec![1, 70_000]))
        );
    }

    #[test]
    fn concat_keeps_equal_shared_values_shared() {
        let a = PartIndices::Shared(4);
        assert_eq!(PartIndices::concat(&a, 10, &a, 5), PartIndices::Shared(4));
        let b = PartIndices::Shared(5);
        let merged = PartIndices::concat(&a, 2, &b, 1);
        assert_eq!(merged, PartIndices::U8(vec![4, 4, 5]));
        assert_eq!(merged.range(), Some(PartIndexRange::new(4, 5)));
    }

    #[test]
    fn concat_mixed_widths() {
        let a = PartIndices::U8(vec![0, 1]);
        let b = PartIndices::U32(vec![100_000]);
        let merged = PartIndices::concat(&a, 2, &b, 1);
        assert_eq!(merged, PartIndices::U32(vec![0, 1, 100_000]));
        assert_eq!(merged.get(2), 100_000);
    }

    #[test]
    fn subset_slice_and_truncate() {
        let mut indices = PartIndices::U16(vec![10, 11, 12, 13]);
        assert_eq!(indices.subset(&[3, 0]), PartIndices::U16(vec![13, 10]));
        assert_eq!(indices.slice(1..3), PartIndices::U16(vec![11, 12]));
        indices.truncate(2);
        assert_eq!(indices.per_point_len(), Some(2));
        assert_eq!(PartIndices::Shared(7).subset(&[0, 5]), PartIndices::Shared(7));
    }

    #[test]
    fn range_union() {
        let a = PartIndexRange::new(1, 3);
        let b = PartIndexRange::new(5, 9);
        assert_eq!(a.union(b), PartIndexRange::new(1, 9));
        assert_eq!(PartIndexRange::union_both(Some(a), None), None);
        assert!(a.union(b).contains(4));
        assert_eq!(PartIndexRange::from_values(std::iter::empty()), None);
    }
}
