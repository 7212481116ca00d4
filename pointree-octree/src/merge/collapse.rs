use glam::DVec3;
use pointree_lib::bounds::Box3;

use super::{checks::PostCondition, MergeEngine};
use crate::{
    batch::PointBatch,
    error::{Error, Result},
    node::{OctreeNode, PointCloudNode},
};

/// Collapsed points may stray this far outside of the original bounds, relative to the cell size.
const COLLAPSE_TOLERANCE: f64 = 1e-5;

impl MergeEngine<'_> {
    /// Flattens `node` into a single leaf at the same cell if all of its points fit.
    ///
    /// Leaves and nodes holding more than the split limit are returned as is.
    pub fn collapse(&self, node: &OctreeNode) -> Result<OctreeNode> {
        node.ensure_temporary("collapsing")?;
        if node.is_leaf() || node.point_count_tree() > self.split_limit() {
            return Ok(node.clone());
        }

        let cell = node.cell();
        let tolerance = DVec3::splat(cell.size() * COLLAPSE_TOLERANCE);
        let points = clamp_to_bounds(node.collect_points()?, node.bounds(), tolerance)?;
        log::debug!("collapsing {} points below {cell} into a leaf", points.len());
        let result = OctreeNode::leaf(cell, self.normalize(cell, points))?;
        self.check(
            PostCondition::collapsed(node, node.bounds().enlarged(tolerance)),
            &result,
        )?;
        Ok(result)
    }
}

/// Moves points that lie slightly outside of `bounds` onto its faces.
///
/// Leaves store positions as f32 relative to their cell, so restored points can be off by a
/// rounding error. Fails with [`Error::InvariantViolation`] for points further away than
/// `tolerance`.
fn clamp_to_bounds(points: PointBatch, bounds: Box3, tolerance: DVec3) -> Result<PointBatch> {
    let enlarged = bounds.enlarged(tolerance);
    if let Some(outlier) = points.positions().iter().find(|&&p| !enlarged.contains(p)) {
        return Err(Error::invariant(format!(
            "collapsed point {outlier} lies outside of {bounds:?}"
        )));
    }
    let clamped = points
        .positions()
        .iter()
        .filter(|&&p| !bounds.contains(p))
        .count();
    if clamped == 0 {
        return Ok(points);
    }
    log::warn!("clamped {clamped} collapsed points onto {bounds:?}");
    points.map_positions(|positions| {
        positions
            .iter()
            .map(|&p| bounds.closest_point(p))
            .collect()
    })
}
