use arrayvec::ArrayVec;
use pointree_lib::{cell::Cell, math_enums::Corner3};
use rayon::prelude::*;

use super::{Children, NodeRef, OctreeNode, PointCloudNode};
use crate::{
    batch::{PointBatch, PARALLEL_THRESHOLD},
    error::{Error, Result},
};

/// Distributes `points` over the octants of `cell`, skipping empty octants.
///
/// Points on a splitting plane go to the lower octant.
pub(crate) fn split_by_octant(cell: Cell, points: &PointBatch) -> ArrayVec<(Corner3, PointBatch), 8> {
    points
        .group_by(|_, p| cell.octant_of_point(p))
        .into_iter()
        .collect()
}

impl OctreeNode {
    /// Builds a temporary tree holding all `points` below `cell`.
    ///
    /// Cells are subdivided until no leaf holds more than `split_limit` points. A leaf whose points
    /// all share the same position is never subdivided, no matter how many points it holds.
    pub fn build(cell: Cell, points: PointBatch, split_limit: usize) -> Result<Self> {
        if points.len() <= split_limit || points.bounds().size().max_element() == 0.0 {
            return Self::leaf(cell, points);
        }
        if !cell.bounds().encloses(points.bounds()) {
            return Err(Error::InvalidArgument(format!(
                "points with bounds {:?} do not fit into cell {cell}",
                points.bounds()
            )));
        }

        let parallel = points.len() >= PARALLEL_THRESHOLD;
        let parts = split_by_octant(cell, &points);
        drop(points);

        let build_child = |(corner, part): (Corner3, PointBatch)| {
            Self::build(cell.octant(corner), part, split_limit).map(|child| (corner, child))
        };
        let built = if parallel {
            parts
                .into_iter()
                .collect::<Vec<_>>()
                .into_par_iter()
                .map(build_child)
                .collect::<Result<Vec<_>>>()?
        } else {
            parts
                .into_iter()
                .map(build_child)
                .collect::<Result<Vec<_>>>()?
        };

        let mut children = Children::default();
        for (corner, child) in built {
            children[corner] = Some(NodeRef::new(child));
        }
        Self::inner(cell, children)
    }

    /// Builds a temporary tree holding all `points` below the smallest cell containing them.
    ///
    /// Fails with [`Error::InvalidArgument`] if there are no points.
    pub fn from_points(points: PointBatch, split_limit: usize) -> Result<Self> {
        let cell = points.cell().ok_or_else(|| {
            Error::InvalidArgument("cannot build a tree without any points".into())
        })?;
        Self::build(cell, points, split_limit)
    }

    /// Splits a leaf into an inner node with a single level of leaf children.
    ///
    /// The split limit is not considered, so children might still hold too many points.
    pub fn force_split(&self) -> Result<Self> {
        self.ensure_temporary("force splitting")?;
        if !self.is_leaf() {
            return Err(Error::invalid_operation(format!(
                "only leaves can be force split, but node {} is an inner node",
                self.id()
            )));
        }
        let points = self.points()?;
        let mut children = Children::default();
        for (corner, part) in split_by_octant(self.cell(), &points) {
            let child = Self::leaf(self.cell().octant(corner), part)?;
            children[corner] = Some(NodeRef::new(child));
        }
        Self::inner(self.cell(), children)
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::*;
    use crate::node::visit::TreeStats;

    fn grid(n: usize, spacing: f64) -> PointBatch {
        let mut positions = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    positions.push(DVec3::new(x as f64, y as f64, z as f64) * spacing + 0.01);
                }
            }
        }
        PointBatch::from_positions(positions)
    }

    #[test]
    fn small_batches_become_a_single_leaf() {
        let node = OctreeNode::from_points(grid(2, 1.0), 8).unwrap();
        assert!(node.is_leaf());
        assert_eq!(node.point_count_tree(), 8);
    }

    #[test]
    fn large_batches_are_split_until_leaves_fit() {
        let node = OctreeNode::from_points(grid(10, 0.1), 64).unwrap();
        assert!(!node.is_leaf());
        assert_eq!(node.point_count_tree(), 1000);
        let stats = TreeStats::of(&node).unwrap();
        assert_eq!(stats.point_count, 1000);
        assert!(stats.max_leaf_points <= 64);
    }

    #[test]
    fn identical_points_stay_in_one_leaf() {
        let points = PointBatch::from_positions(vec![DVec3::splat(3.0); 20]);
        let node = OctreeNode::from_points(points, 4).unwrap();
        assert!(node.is_leaf());
        assert_eq!(node.point_count_tree(), 20);
    }

    #[test]
    fn empty_batches_cannot_be_built() {
        let error = OctreeNode::from_points(PointBatch::default(), 4).unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(_)));
    }

    #[test]
    fn force_split_ignores_split_limit() {
        let cell = Cell::centered(2);
        let points = PointBatch::from_positions(vec![
            DVec3::new(-1.0, -1.0, -1.0),
            DVec3::new(-0.5, -1.0, -1.0),
            DVec3::new(1.0, 0.5, 1.0),
        ]);
        let leaf = OctreeNode::leaf(cell, points).unwrap();
        let split = leaf.force_split().unwrap();
        assert_eq!(split.cell(), cell);
        assert_eq!(split.point_count_tree(), 3);
        assert_eq!(
            split.occupied_octants(),
            Corner3::X0Y0Z0 | Corner3::X1Y1Z1
        );
        let lower = split.child(Corner3::X0Y0Z0).unwrap().unwrap();
        assert!(!lower.cell().is_centered_at_origin());
        assert_eq!(lower.point_count_cell(), 2);

        let error = split.force_split().unwrap_err();
        assert!(matches!(error, Error::InvalidOperation(_)));
    }
}
