use arrayvec::ArrayVec;
use pointree_lib::{bounds::Box3, cell::Cell};

use super::MergeEngine;
use crate::{
    error::{Error, Result},
    node::{OctreeNode, PointCloudNode},
};

/// What must hold for the result of a single merge step.
#[derive(Clone, Debug, Default)]
pub(super) struct PostCondition {
    operation: &'static str,
    /// Cells the result must contain.
    enclosed_cells: ArrayVec<Cell, 2>,
    /// The exact cell of the result.
    cell: Option<Cell>,
    point_count: Option<u64>,
    /// Whether the result must carry a part index range.
    part_index_range: bool,
    /// The result must be a leaf whose points lie within these bounds.
    leaf_within: Option<Box3>,
}

impl PostCondition {
    /// The union of `a` and `b`.
    pub(super) fn merged(a: &OctreeNode, b: &OctreeNode) -> Self {
        let non_empty = [a, b]
            .into_iter()
            .filter(|node| node.point_count_tree() > 0)
            .collect::<ArrayVec<_, 2>>();
        Self {
            operation: "merge",
            enclosed_cells: non_empty.iter().map(|node| node.cell()).collect(),
            point_count: Some(a.point_count_tree() + b.point_count_tree()),
            part_index_range: !non_empty.is_empty()
                && non_empty.iter().all(|node| node.part_index_range().is_some()),
            ..Default::default()
        }
    }

    /// A restructured version of `node` at the same cell.
    pub(super) fn preserved(operation: &'static str, node: &OctreeNode) -> Self {
        Self {
            operation,
            cell: Some(node.cell()),
            point_count: Some(node.point_count_tree()),
            part_index_range: node.point_count_tree() > 0 && node.part_index_range().is_some(),
            ..Default::default()
        }
    }

    /// `node` flattened into a single leaf whose points stay within `bounds`.
    pub(super) fn collapsed(node: &OctreeNode, bounds: Box3) -> Self {
        Self {
            leaf_within: Some(bounds),
            ..Self::preserved("collapse", node)
        }
    }

    /// Drops the point count check, since density normalization may remove points.
    fn without_point_count(self) -> Self {
        Self {
            point_count: None,
            ..self
        }
    }

    fn verify(&self, result: &OctreeNode) -> Result<()> {
        let operation = self.operation;
        let violated = |message: String| Err(Error::invariant(format!("{operation}: {message}")));

        if !result.is_temporary() {
            return violated(format!("result {} is not temporary", result.id()));
        }
        for &cell in &self.enclosed_cells {
            if !result.cell().contains(cell) {
                return violated(format!("result cell {} does not contain {cell}", result.cell()));
            }
        }
        if let Some(cell) = self.cell {
            if result.cell() != cell {
                return violated(format!("result moved from {cell} to {}", result.cell()));
            }
        }
        if let Some(count) = self.point_count {
            if result.point_count_tree() != count {
                return violated(format!(
                    "expected {count} points, but got {}",
                    result.point_count_tree()
                ));
            }
        }
        if self.part_index_range && result.part_index_range().is_none() {
            return violated("part index range got lost".into());
        }
        if let Some(bounds) = self.leaf_within {
            if !result.is_leaf() {
                return violated("result is not a leaf".into());
            }
            if !bounds.encloses(result.bounds()) {
                return violated(format!(
                    "bounds {:?} exceed {bounds:?}",
                    result.bounds()
                ));
            }
        }
        Ok(())
    }
}

impl MergeEngine<'_> {
    /// Verifies `condition` for `result` if invariant checks are enabled.
    pub(super) fn check(&self, condition: PostCondition, result: &OctreeNode) -> Result<()> {
        if !self.config.check_invariants {
            return Ok(());
        }
        if self.config.normalize_density_globally {
            condition.without_point_count().verify(result)
        } else {
            condition.verify(result)
        }
    }
}
