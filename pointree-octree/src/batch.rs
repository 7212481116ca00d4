pub(crate) mod min_dist;
pub mod part_indices;

use std::{hash::Hash, ops::Range};

use ahash::{AHashMap, AHashSet};
use glam::{DVec3, Vec3};
use itertools::Itertools;
use pointree_lib::{bounds::Box3, cell::Cell};

pub(crate) use min_dist::PARALLEL_THRESHOLD;
pub use part_indices::{PartIndexRange, PartIndices};

use crate::error::{Error, Result};

/// An RGBA color with 8 bits per channel.
pub type Rgba = [u8; 4];

/// An immutable collection of points with optional per-point attributes.
///
/// Every present attribute holds exactly one value per position. All transformations return new
/// batches and leave the original untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointBatch {
    positions: Vec<DVec3>,
    colors: Option<Vec<Rgba>>,
    normals: Option<Vec<Vec3>>,
    intensities: Option<Vec<i32>>,
    classifications: Option<Vec<u8>>,
    part_indices: Option<PartIndices>,
    part_index_range: Option<PartIndexRange>,
    bounds: Box3,
}

/// The raw sequences a [`PointBatch`] is built from.
///
/// Sequences of different lengths are accepted; [`BatchParts::build`] truncates all of them to
/// the shortest one.
#[derive(Clone, Debug, Default)]
pub struct BatchParts {
    pub positions: Option<Vec<DVec3>>,
    pub colors: Option<Vec<Rgba>>,
    pub normals: Option<Vec<Vec3>>,
    pub intensities: Option<Vec<i32>>,
    pub classifications: Option<Vec<u8>>,
    pub part_indices: Option<PartIndices>,
    /// Computed from `part_indices` if absent.
    pub part_index_range: Option<PartIndexRange>,
    /// Computed from `positions` if absent.
    pub bounds: Option<Box3>,
}

impl BatchParts {
    pub fn new(positions: Vec<DVec3>) -> Self {
        Self {
            positions: Some(positions),
            ..Default::default()
        }
    }

    pub fn colors(mut self, colors: Vec<Rgba>) -> Self {
        self.colors = Some(colors);
        self
    }

    pub fn normals(mut self, normals: Vec<Vec3>) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn intensities(mut self, intensities: Vec<i32>) -> Self {
        self.intensities = Some(intensities);
        self
    }

    pub fn classifications(mut self, classifications: Vec<u8>) -> Self {
        self.classifications = Some(classifications);
        self
    }

    pub fn part_indices(mut self, part_indices: PartIndices) -> Self {
        self.part_indices = Some(part_indices);
        self
    }

    pub fn part_index_range(mut self, range: PartIndexRange) -> Self {
        self.part_index_range = Some(range);
        self
    }

    pub fn bounds(mut self, bounds: Box3) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Validates the parts and assembles a [`PointBatch`].
    ///
    /// Fails with [`Error::InvalidArgument`] if there are no positions. Mismatching attribute
    /// lengths are not an error; all sequences are cut to the shortest one instead.
    pub fn build(self) -> Result<PointBatch> {
        let Self {
            positions,
            mut colors,
            mut normals,
            mut intensities,
            mut classifications,
            mut part_indices,
            part_index_range,
            bounds,
        } = self;

        let mut positions = positions
            .ok_or_else(|| Error::InvalidArgument("point batch requires positions".into()))?;

        let lengths = [
            Some(positions.len()),
            colors.as_ref().map(Vec::len),
            normals.as_ref().map(Vec::len),
            intensities.as_ref().map(Vec::len),
            classifications.as_ref().map(Vec::len),
            part_indices.as_ref().and_then(PartIndices::per_point_len),
        ];
        let len = lengths.iter().flatten().copied().min().unwrap_or(0);
        let truncated = lengths.iter().flatten().any(|&other| other != len);

        if truncated {
            log::warn!(
                "point batch attribute lengths differ ({:?}); truncating to {len} points",
                lengths
            );
            positions.truncate(len);
            if let Some(colors) = &mut colors {
                colors.truncate(len);
            }
            if let Some(normals) = &mut normals {
                normals.truncate(len);
            }
            if let Some(intensities) = &mut intensities {
                intensities.truncate(len);
            }
            if let Some(classifications) = &mut classifications {
                classifications.truncate(len);
            }
            if let Some(part_indices) = &mut part_indices {
                part_indices.truncate(len);
            }
        }

        let part_index_range =
            part_index_range.or_else(|| part_indices.as_ref().and_then(PartIndices::range));
        let bounds = match bounds {
            Some(bounds) if !truncated => bounds,
            _ => Box3::from_points(&positions),
        };

        Ok(PointBatch {
            positions,
            colors,
            normals,
            intensities,
            classifications,
            part_indices,
            part_index_range,
            bounds,
        })
    }
}

/// Concatenates an attribute that both sides of a merge may carry.
///
/// An attribute carried by only one side cannot stay aligned with the positions and is dropped.
fn concat_attribute<T: Clone>(name: &str, a: Option<&[T]>, b: Option<&[T]>) -> Option<Vec<T>> {
    match (a, b) {
        (Some(a), Some(b)) => Some([a, b].concat()),
        (None, None) => None,
        _ => {
            log::warn!("dropping {name}, since only one of the merged point batches has them");
            None
        }
    }
}

fn subset_attribute<T: Clone>(values: &Option<Vec<T>>, indices: &[usize]) -> Option<Vec<T>> {
    values
        .as_ref()
        .map(|values| indices.iter().map(|&i| values[i].clone()).collect())
}

fn slice_attribute<T: Clone>(values: &Option<Vec<T>>, range: Range<usize>) -> Option<Vec<T>> {
    values.as_ref().map(|values| values[range].to_vec())
}

impl PointBatch {
    /// Constructs a [`PointBatch`] from its parts; see [`BatchParts::build`].
    pub fn new(parts: BatchParts) -> Result<Self> {
        parts.build()
    }

    /// Constructs a [`PointBatch`] holding nothing but `positions`.
    pub fn from_positions(positions: Vec<DVec3>) -> Self {
        let bounds = Box3::from_points(&positions);
        Self {
            positions,
            bounds,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[DVec3] {
        &self.positions
    }

    pub fn colors(&self) -> Option<&[Rgba]> {
        self.colors.as_deref()
    }

    pub fn normals(&self) -> Option<&[Vec3]> {
        self.normals.as_deref()
    }

    pub fn intensities(&self) -> Option<&[i32]> {
        self.intensities.as_deref()
    }

    pub fn classifications(&self) -> Option<&[u8]> {
        self.classifications.as_deref()
    }

    pub fn part_indices(&self) -> Option<&PartIndices> {
        self.part_indices.as_ref()
    }

    pub fn part_index_range(&self) -> Option<PartIndexRange> {
        self.part_index_range
    }

    /// The bounds of all positions, or the bounds supplied on construction.
    pub fn bounds(&self) -> Box3 {
        self.bounds
    }

    /// Splits into its raw parts again.
    pub fn into_parts(self) -> BatchParts {
        BatchParts {
            positions: Some(self.positions),
            colors: self.colors,
            normals: self.normals,
            intensities: self.intensities,
            classifications: self.classifications,
            part_indices: self.part_indices,
            part_index_range: self.part_index_range,
            bounds: Some(self.bounds),
        }
    }

    /// Appends the points of `other` to the points of `self`.
    ///
    /// Attributes are only kept if both batches carry them.
    pub fn merge(&self, other: &Self) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }

        let part_index_range =
            PartIndexRange::union_both(self.part_index_range, other.part_index_range);
        let (part_indices, part_index_range) = match (&self.part_indices, &other.part_indices) {
            (Some(a), Some(b)) => (
                Some(PartIndices::concat(a, self.len(), b, other.len())),
                part_index_range,
            ),
            (None, None) => (None, part_index_range),
            _ => {
                log::warn!(
                    "dropping part indices, since only one of the merged point batches has them"
                );
                (None, None)
            }
        };

        Self {
            positions: [self.positions.as_slice(), &other.positions].concat(),
            colors: concat_attribute("colors", self.colors(), other.colors()),
            normals: concat_attribute("normals", self.normals(), other.normals()),
            intensities: concat_attribute("intensities", self.intensities(), other.intensities()),
            classifications: concat_attribute(
                "classifications",
                self.classifications(),
                other.classifications(),
            ),
            part_indices,
            part_index_range,
            bounds: self.bounds.union(other.bounds),
        }
    }

    /// Merges any number of batches in order.
    pub fn merge_all<'a>(batches: impl IntoIterator<Item = &'a Self>) -> Self {
        batches
            .into_iter()
            .fold(Self::default(), |merged, batch| merged.merge(batch))
    }

    /// Keeps only the points at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let positions = indices.iter().map(|&i| self.positions[i]).collect_vec();
        let part_indices = self
            .part_indices
            .as_ref()
            .map(|part_indices| part_indices.subset(indices));
        Self {
            bounds: Box3::from_points(&positions),
            positions,
            colors: subset_attribute(&self.colors, indices),
            normals: subset_attribute(&self.normals, indices),
            intensities: subset_attribute(&self.intensities, indices),
            classifications: subset_attribute(&self.classifications, indices),
            part_index_range: self.derived_part_index_range(&part_indices),
            part_indices,
        }
    }

    /// The part index range of a batch derived from this one.
    ///
    /// Recomputed from the remaining part indices if there are any.
    fn derived_part_index_range(&self, part_indices: &Option<PartIndices>) -> Option<PartIndexRange> {
        match part_indices {
            Some(part_indices) => part_indices.range(),
            None => self.part_index_range,
        }
    }

    /// Keeps only the points within `range`.
    fn slice(&self, range: Range<usize>) -> Self {
        let positions = self.positions[range.clone()].to_vec();
        let part_indices = self
            .part_indices
            .as_ref()
            .map(|part_indices| part_indices.slice(range.clone()));
        Self {
            bounds: Box3::from_points(&positions),
            positions,
            colors: slice_attribute(&self.colors, range.clone()),
            normals: slice_attribute(&self.normals, range.clone()),
            intensities: slice_attribute(&self.intensities, range.clone()),
            classifications: slice_attribute(&self.classifications, range),
            part_index_range: self.derived_part_index_range(&part_indices),
            part_indices,
        }
    }

    /// Lazily cuts the batch into consecutive batches of at most `size` points each.
    ///
    /// Fails with [`Error::InvalidArgument`] if `size` is zero.
    pub fn split(&self, size: usize) -> Result<impl Iterator<Item = Self> + '_> {
        if size == 0 {
            return Err(Error::InvalidArgument("split size must not be zero".into()));
        }
        Ok((0..self.len())
            .step_by(size)
            .map(move |start| self.slice(start..(start + size).min(self.len()))))
    }

    /// Removes points whose position exactly equals the position of an earlier point.
    ///
    /// Returns the remaining batch together with the number of removed points.
    pub fn deduplicate(&self, verbose: bool) -> (Self, usize) {
        let mut seen = AHashSet::with_capacity(self.len());
        let keep = self
            .positions
            .iter()
            .positions(|&p| {
                // adding zero turns -0.0 into 0.0 so both hash the same
                seen.insert((p + DVec3::ZERO).to_array().map(f64::to_bits))
            })
            .collect_vec();
        let removed = self.len() - keep.len();
        if removed == 0 {
            return (self.clone(), 0);
        }
        if verbose {
            log::info!("removed {removed} duplicate points from batch of {}", self.len());
        }
        (self.subset(&keep), removed)
    }

    /// Keeps the points for which `predicate` returns `true`.
    ///
    /// The predicate receives the index of the point as well as its position.
    pub fn filter_by_predicate(&self, mut predicate: impl FnMut(usize, DVec3) -> bool) -> Self {
        let keep = self
            .positions
            .iter()
            .enumerate()
            .filter(|&(index, &p)| predicate(index, p))
            .map(|(index, _)| index)
            .collect_vec();
        if keep.len() == self.len() {
            self.clone()
        } else {
            self.subset(&keep)
        }
    }

    /// Keeps the points inside `bounds`, limits included.
    pub fn filter_by_box(&self, bounds: Box3) -> Self {
        self.filter_by_predicate(|_, p| bounds.contains(p))
    }

    /// Keeps the points whose `x` and `y` lie in `[min, max)` of `bounds`, ignoring `z`.
    pub fn filter_by_box_xy(&self, bounds: Box3) -> Self {
        self.filter_by_predicate(|_, p| {
            bounds.min.x <= p.x && p.x < bounds.max.x && bounds.min.y <= p.y && p.y < bounds.max.y
        })
    }

    /// Keeps the points inside the bounds of `cell`.
    pub fn filter_by_cell(&self, cell: Cell) -> Self {
        self.filter_by_box(cell.bounds())
    }

    /// Thins out the points so that each bin of the implicit octree below `cell` keeps at most one.
    ///
    /// Bins have an edge length of the smallest power of two of at least `min_dist`. The first
    /// point of each bin survives. Large bins are processed in parallel. A `min_dist` of zero or
    /// less keeps all points.
    pub fn filter_min_distance(&self, cell: Cell, min_dist: f64, verbose: bool) -> Self {
        if min_dist <= 0.0 || self.is_empty() {
            return self.clone();
        }
        let keep = min_dist::select(&self.positions, cell, min_dist);
        let kept = keep.iter_ones().collect_vec();
        if kept.len() == self.len() {
            return self.clone();
        }
        if verbose {
            log::info!(
                "min distance {min_dist} in cell {cell}: {} -> {} points",
                self.len(),
                kept.len()
            );
        }
        self.subset(&kept)
    }

    /// Keeps a point only if it is at least `min_dist` away from the previously kept point.
    ///
    /// Only useful for streams that are already spatially ordered, e.g. scan lines.
    pub fn filter_sequential_min_dist(&self, min_dist: f64) -> Self {
        if min_dist <= 0.0 || self.is_empty() {
            return self.clone();
        }
        let min_dist_squared = min_dist * min_dist;
        let mut last = None;
        self.filter_by_predicate(|_, p| {
            let keep = last.map_or(true, |last: DVec3| last.distance_squared(p) >= min_dist_squared);
            if keep {
                last = Some(p);
            }
            keep
        })
    }

    /// Partitions the points by `key`, in the order in which each key first appears.
    pub fn group_by<K: Hash + Eq + Clone>(
        &self,
        mut key: impl FnMut(usize, DVec3) -> K,
    ) -> Vec<(K, Self)> {
        let mut slots: AHashMap<K, usize> = AHashMap::new();
        let mut groups: Vec<(K, Vec<usize>)> = Vec::new();
        for (index, &p) in self.positions.iter().enumerate() {
            let k = key(index, p);
            match slots.get(&k) {
                Some(&slot) => groups[slot].1.push(index),
                None => {
                    slots.insert(k.clone(), groups.len());
                    groups.push((k, vec![index]));
                }
            }
        }
        groups
            .into_iter()
            .map(|(k, indices)| {
                let batch = self.subset(&indices);
                (k, batch)
            })
            .collect()
    }

    /// Replaces all positions with the result of `map`, e.g. to reproject them.
    ///
    /// Fails with [`Error::InvalidArgument`] if `map` changes the number of positions.
    pub fn map_positions(&self, map: impl FnOnce(&[DVec3]) -> Vec<DVec3>) -> Result<Self> {
        let positions = map(&self.positions);
        if positions.len() != self.len() {
            return Err(Error::InvalidArgument(format!(
                "position mapping returned {} positions for {} points",
                positions.len(),
                self.len()
            )));
        }
        Ok(Self {
            bounds: Box3::from_points(&positions),
            positions,
            ..self.clone()
        })
    }

    /// The smallest cell containing all points; [`None`] for an empty batch.
    pub fn cell(&self) -> Option<Cell> {
        Cell::enclosing_box(Box3::from_points(&self.positions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(n: usize) -> Vec<DVec3> {
        (0..n).map(|i| DVec3::new(i as f64, 0.5, -1.0)).collect()
    }

    fn full_batch(n: usize, part: u32) -> PointBatch {
        BatchParts::new(positions(n))
            .colors(vec![[1, 2, 3, 255]; n])
            .normals(vec![Vec3::Z; n])
            .intensities((0..n as i32).collect())
            .classifications(vec![2; n])
            .part_indices(PartIndices::Shared(part))
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_positions() {
        let error = BatchParts::default().build().unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(_)));
    }

    #[test]
    fn build_truncates_mismatched_lengths() {
        let batch = BatchParts::new(positions(5))
            .colors(vec![[0; 4]; 3])
            .intensities(vec![1; 4])
            .build()
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.colors().unwrap().len(), 3);
        assert_eq!(batch.intensities().unwrap().len(), 3);
        assert_eq!(batch.bounds().max.x, 2.0);
    }

    #[test]
    fn build_computes_bounds_and_range() {
        let batch = BatchParts::new(positions(4))
            .part_indices(PartIndices::U8(vec![3, 1, 2, 9]))
            .build()
            .unwrap();
        assert_eq!(batch.part_index_range(), Some(PartIndexRange::new(1, 9)));
        assert_eq!(
            batch.bounds(),
            Box3::new(DVec3::new(0.0, 0.5, -1.0), DVec3::new(3.0, 0.5, -1.0))
        );
    }

    #[test]
    fn merge_concatenates_everything() {
        let a = full_batch(3, 1);
        let b = full_batch(2, 4);
        let merged = a.merge(&b);
        assert_eq!(merged.len(), a.len() + b.len());
        assert_eq!(merged.colors().unwrap().len(), 5);
        assert_eq!(merged.intensities().unwrap(), &[0, 1, 2, 0, 1]);
        assert_eq!(
            merged.part_indices(),
            Some(&PartIndices::U8(vec![1, 1, 1, 4, 4]))
        );
        assert_eq!(merged.part_index_range(), Some(PartIndexRange::new(1, 4)));
        assert_eq!(merged.bounds(), a.bounds().union(b.bounds()));
    }

    #[test]
    fn merge_drops_one_sided_attributes_but_keeps_all_points() {
        let a = full_batch(3, 1);
        let b = PointBatch::from_positions(positions(2));
        let merged = a.merge(&b);
        assert_eq!(merged.len(), 5);
        assert_eq!(merged.colors(), None);
        assert_eq!(merged.part_indices(), None);
        assert_eq!(merged.part_index_range(), None);
    }

    #[test]
    fn merge_with_empty_returns_other() {
        let a = full_batch(3, 1);
        assert_eq!(PointBatch::default().merge(&a), a);
        assert_eq!(a.merge(&PointBatch::default()), a);
    }

    #[test]
    fn split_then_merge_reproduces_points() {
        let batch = full_batch(10, 0).merge(&full_batch(7, 3));
        let parts = batch.split(4).unwrap().collect_vec();
        assert_eq!(parts.iter().map(PointBatch::len).collect_vec(), [4, 4, 4, 4, 1]);
        assert_eq!(parts[4].part_index_range(), Some(PartIndexRange::single(3)));
        let rejoined = PointBatch::merge_all(&parts);
        assert_eq!(rejoined.positions(), batch.positions());
        assert_eq!(rejoined.intensities(), batch.intensities());
        assert!(matches!(batch.split(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn deduplicate_keeps_first_occurrence() {
        let batch = BatchParts::new(vec![
            DVec3::ONE,
            DVec3::ZERO,
            DVec3::ONE,
            DVec3::new(-0.0, 0.0, 0.0),
        ])
        .intensities(vec![1, 2, 3, 4])
        .build()
        .unwrap();
        let (deduplicated, removed) = batch.deduplicate(false);
        assert_eq!(removed, 2);
        assert_eq!(deduplicated.intensities().unwrap(), &[1, 2]);
        let (twice, removed_again) = deduplicated.deduplicate(false);
        assert_eq!(removed_again, 0);
        assert_eq!(twice, deduplicated);
    }

    #[test]
    fn filter_by_boxes() {
        let batch = PointBatch::from_positions(positions(6));
        let bounds = Box3::new(DVec3::new(1.0, 0.0, -2.0), DVec3::new(3.0, 1.0, 0.0));
        assert_eq!(batch.filter_by_box(bounds).len(), 3);
        assert_eq!(batch.filter_by_box_xy(bounds).len(), 2);
        assert_eq!(batch.filter_by_cell(Cell::new(0, 0, -1, 1)).len(), 3);
    }

    #[test]
    fn min_distance_keeps_attributes_aligned() {
        let batch = BatchParts::new(vec![
            DVec3::new(0.1, 0.1, 0.1),
            DVec3::new(0.15, 0.1, 0.1),
            DVec3::new(0.8, 0.8, 0.8),
        ])
        .intensities(vec![10, 20, 30])
        .build()
        .unwrap();
        let cell = Cell::new(0, 0, 0, 0);
        let filtered = batch.filter_min_distance(cell, 0.25, false);
        assert_eq!(filtered.intensities().unwrap(), &[10, 30]);
        assert_eq!(batch.filter_min_distance(cell, 0.0, false), batch);
    }

    #[test]
    fn sequential_min_dist() {
        let batch = PointBatch::from_positions(
            [0.0, 0.1, 0.5, 1.2, 1.3]
                .map(|x| DVec3::new(x, 0.0, 0.0))
                .to_vec(),
        );
        let filtered = batch.filter_sequential_min_dist(0.5);
        assert_eq!(
            filtered.positions().iter().map(|p| p.x).collect_vec(),
            [0.0, 0.5, 1.2]
        );
    }

    #[test]
    fn group_by_preserves_first_appearance() {
        let batch = PointBatch::from_positions(positions(6));
        let groups = batch.group_by(|index, _| index % 3 == 1);
        assert_eq!(groups.len(), 2);
        assert!(!groups[0].0);
        assert_eq!(groups[0].1.len(), 4);
        assert!(groups[1].0);
        assert_eq!(groups[1].1.positions()[1].x, 4.0);
    }

    #[test]
    fn map_positions_must_keep_count() {
        let batch = full_batch(3, 0);
        let moved = batch
            .map_positions(|ps| ps.iter().map(|&p| p + DVec3::X).collect())
            .unwrap();
        assert_eq!(moved.positions()[0], DVec3::new(1.0, 0.5, -1.0));
        assert_eq!(moved.colors(), batch.colors());
        assert!(batch.map_positions(|_| Vec::new()).is_err());
    }
}
