mod checks;
mod collapse;
mod join;

use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use pointree_lib::{cell::Cell, math_enums::Corner3};
use rayon::prelude::*;

use crate::{
    batch::PointBatch,
    config::ImportConfig,
    error::{Error, Result},
    node::{builder::split_by_octant, Children, NodeKind, NodeRef, OctreeNode, PointCloudNode},
};

use checks::PostCondition;

/// Reports monotonically growing point counts to the progress callback of an [`ImportConfig`].
///
/// Smaller counts than the largest one reported so far are swallowed, so nested and parallel
/// merges can report whatever they know.
pub(crate) struct Progress<'a> {
    config: &'a ImportConfig,
    reported: Mutex<u64>,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(config: &'a ImportConfig) -> Self {
        Self {
            config,
            reported: Mutex::new(0),
        }
    }

    pub(crate) fn report(&self, count: u64) {
        let Some(callback) = &self.config.progress else {
            return;
        };
        let mut reported = self.reported.lock();
        if count > *reported {
            *reported = count;
            callback(count);
        }
    }
}

/// Unites temporary octrees into one.
///
/// All operations take temporary nodes and return new temporary nodes; inputs are left as they
/// are. Passing a durable node fails with [`Error::InvalidOperation`].
pub struct MergeEngine<'a> {
    config: &'a ImportConfig,
    progress: Progress<'a>,
}

impl<'a> MergeEngine<'a> {
    pub fn new(config: &'a ImportConfig) -> Self {
        Self {
            config,
            progress: Progress::new(config),
        }
    }

    pub fn config(&self) -> &ImportConfig {
        self.config
    }

    pub(crate) fn progress(&self) -> &Progress<'a> {
        &self.progress
    }

    fn split_limit(&self) -> u64 {
        self.config.split_limit as u64
    }

    /// Thins out `points` if density is normalized globally.
    fn normalize(&self, cell: Cell, points: PointBatch) -> PointBatch {
        if self.config.normalize_density_globally {
            points.filter_min_distance(cell, self.config.min_dist, self.config.verbose)
        } else {
            points
        }
    }

    /// Builds a new subtree at `cell` from `points`.
    fn create_node(&self, cell: Cell, points: PointBatch) -> Result<OctreeNode> {
        OctreeNode::build(cell, self.normalize(cell, points), self.config.split_limit)
    }

    /// Returns the union of the two trees `a` and `b`.
    ///
    /// The resulting root is the smallest cell containing both inputs, unless one of them is empty,
    /// in which case the other one is returned untouched.
    pub fn merge(&self, a: &OctreeNode, b: &OctreeNode) -> Result<OctreeNode> {
        a.ensure_temporary("merging")?;
        b.ensure_temporary("merging")?;
        let result = self.merge_cases(a, b)?;
        self.check(PostCondition::merged(a, b), &result)?;
        self.progress.report(a.point_count_tree() + b.point_count_tree());
        Ok(result)
    }

    /// Merges two trees, picking the first matching case.
    fn merge_cases(&self, a: &OctreeNode, b: &OctreeNode) -> Result<OctreeNode> {
        if a.point_count_tree() == 0 {
            return Ok(b.clone());
        }
        if b.point_count_tree() == 0 {
            return Ok(a.clone());
        }

        if a.point_count_tree() + b.point_count_tree() <= self.split_limit() {
            let cell = Cell::enclosing(a.cell(), b.cell());
            log::debug!("merging {} and {} into a single leaf at {cell}", a.cell(), b.cell());
            let points = a.collect_points()?.merge(&b.collect_points()?);
            return OctreeNode::leaf(cell, self.normalize(cell, points));
        }

        if a.cell() == b.cell() {
            log::debug!("merging trees with identical root cell {}", a.cell());
            let merged = match (a.kind(), b.kind()) {
                (NodeKind::Leaf(_), NodeKind::Leaf(_)) => self.merge_leaves(a, b)?,
                (NodeKind::Leaf(_), NodeKind::Inner(_)) => {
                    self.inject_points_into_tree(a.points()?, Some(b), a.cell())?
                }
                (NodeKind::Inner(_), NodeKind::Leaf(_)) => {
                    self.inject_points_into_tree(b.points()?, Some(a), b.cell())?
                }
                (NodeKind::Inner(_), NodeKind::Inner(_)) => self.merge_trees(a, b)?,
            };
            return self.collapse(&merged);
        }

        if !a.cell().intersects(b.cell()) {
            let root = Cell::enclosing(a.cell(), b.cell());
            log::debug!("joining disjoint {} and {} below {root}", a.cell(), b.cell());
            let joined = self.join_non_overlapping_trees(root, a, b)?;
            return self.collapse(&joined);
        }

        if a.cell().is_centered_at_origin() || b.cell().is_centered_at_origin() {
            return self.merge_centered(a, b);
        }

        if a.cell().exponent() < b.cell().exponent() {
            return self.merge_cases(b, a);
        }
        self.merge_into_octant(a, b)
    }

    /// Merges two leaves at the same cell, splitting the result if it holds too many points.
    fn merge_leaves(&self, a: &OctreeNode, b: &OctreeNode) -> Result<OctreeNode> {
        let points = a.points()?.merge(&b.points()?);
        self.create_node(a.cell(), points)
    }

    /// Merges two inner nodes at the same cell child by child.
    fn merge_trees(&self, a: &OctreeNode, b: &OctreeNode) -> Result<OctreeNode> {
        let mut children = Children::default();
        for corner in Corner3::ALL {
            children[corner] = match (a.child(corner)?, b.child(corner)?) {
                (Some(x), Some(y)) => Some(NodeRef::new(self.merge(&x, &y)?)),
                (Some(x), None) | (None, Some(x)) => Some(NodeRef::new(x)),
                (None, None) => None,
            };
        }
        a.with_subnodes(children)
    }

    /// Merges two intersecting trees of which at least one sits at a cell centered at the origin.
    ///
    /// Centered trees are replaced by their children, which are all regular cells. All parts are
    /// then merged within the octant of the combined root they fall into, in parallel.
    fn merge_centered(&self, a: &OctreeNode, b: &OctreeNode) -> Result<OctreeNode> {
        let mut parts = Vec::new();
        for (node, other, node_first) in [(a, b, true), (b, a, false)] {
            if !node.cell().is_centered_at_origin() {
                parts.push(Arc::new(node.clone()));
                continue;
            }
            if node.is_leaf() {
                let split = self.force_split_leaf(node)?;
                return if node_first {
                    self.merge(&split, other)
                } else {
                    self.merge(other, &split)
                };
            }
            for child in node.children().into_iter().flat_map(|children| children.values()) {
                if let Some(child) = child {
                    parts.push(child.get()?);
                }
            }
        }

        match parts.len() {
            0 => {
                return Err(Error::invariant(format!(
                    "merging {} and {} left no parts",
                    a.cell(),
                    b.cell()
                )))
            }
            1 => return self.collapse(&parts[0]),
            _ => {}
        }

        let root = Cell::enclosing(a.cell(), b.cell());
        log::debug!("merging {} parts below centered root {root}", parts.len());
        let groups = parts
            .into_iter()
            .into_group_map_by(|part| part.cell().origin_octant())
            .into_iter()
            .collect_vec();
        let merged = groups
            .into_par_iter()
            .map(|(corner, parts)| -> Result<_> {
                let octant = root.octant(corner);
                let mut merged: Option<OctreeNode> = None;
                for part in parts {
                    merged = Some(match merged {
                        None => self.join_tree_to_root_cell(octant, &part)?,
                        Some(merged) => self.merge(&merged, &part)?,
                    });
                }
                // merging with an empty part hands back the other part at its own cell
                let merged = merged
                    .map(|merged| self.join_tree_to_root_cell(octant, &merged))
                    .transpose()?;
                Ok((corner, merged))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut children = Children::default();
        for (corner, merged) in merged {
            children[corner] = merged.map(NodeRef::new);
        }
        self.collapse(&OctreeNode::inner(root, children)?)
    }

    /// Merges `b` into the octant of the larger `a` that contains it.
    fn merge_into_octant(&self, a: &OctreeNode, b: &OctreeNode) -> Result<OctreeNode> {
        let corner = a.cell().octant_containing(b.cell()).ok_or_else(|| {
            Error::invariant(format!("{} is not in any octant of {}", b.cell(), a.cell()))
        })?;
        let octant = a.cell().octant(corner);
        let child = match a.child(corner)? {
            Some(existing) => self.merge(&existing, b)?,
            None => self.join_tree_to_root_cell(octant, b)?,
        };
        let mut children = a.children().cloned().unwrap_or_default();
        children[corner] = Some(NodeRef::new(child));
        let result = a.with_subnodes(children)?;

        let result = if a.is_leaf() {
            // the leaf's own points were dropped by replacing its subnodes
            self.inject_points_into_tree(a.points()?, Some(&result), a.cell())?
        } else {
            result
        };
        self.collapse(&result)
    }

    /// Splits a leaf a single level deep, regardless of the split limit.
    pub fn force_split_leaf(&self, node: &OctreeNode) -> Result<OctreeNode> {
        let result = node.force_split()?;
        self.check(PostCondition::preserved("force split", node), &result)?;
        Ok(result)
    }

    /// Distributes `points` into the existing tree `node` at `cell`.
    ///
    /// Points are pushed down into the children they fall into. Octants that have no child yet get
    /// a newly built one. Leaves receiving points are rebuilt with all of their points.
    pub fn inject_points_into_tree(
        &self,
        points: PointBatch,
        node: Option<&OctreeNode>,
        cell: Cell,
    ) -> Result<OctreeNode> {
        let Some(node) = node else {
            return self.create_node(cell, points);
        };
        node.ensure_temporary("injecting points")?;
        if node.cell() != cell {
            return Err(Error::invariant(format!(
                "injecting points for cell {cell} into node at {}",
                node.cell()
            )));
        }

        if node.is_leaf() {
            return self.create_node(cell, points.merge(&node.points()?));
        }

        let mut children = node.children().cloned().unwrap_or_default();
        for (corner, part) in split_by_octant(cell, &points) {
            let existing = node.child(corner)?;
            let child = self.inject_points_into_tree(part, existing.as_deref(), cell.octant(corner))?;
            children[corner] = Some(NodeRef::new(child));
        }
        self.collapse(&node.with_subnodes(children)?)
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;
    use pointree_lib::math_enums::Corners3;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        batch::{BatchParts, PartIndexRange, PartIndices},
        node::visit::TreeStats,
    };

    fn config(split_limit: usize) -> ImportConfig {
        ImportConfig::default()
            .with_split_limit(split_limit)
            .with_check_invariants(true)
    }

    fn points(positions: &[[f64; 3]]) -> PointBatch {
        PointBatch::from_positions(positions.iter().map(|&p| DVec3::from(p)).collect())
    }

    fn random_points(rng: &mut StdRng, count: usize, min: DVec3, max: DVec3) -> PointBatch {
        PointBatch::from_positions(
            (0..count)
                .map(|_| {
                    DVec3::new(
                        rng.gen_range(min.x..max.x),
                        rng.gen_range(min.y..max.y),
                        rng.gen_range(min.z..max.z),
                    )
                })
                .collect(),
        )
    }

    fn tree(points: PointBatch, split_limit: usize) -> OctreeNode {
        OctreeNode::from_points(points, split_limit).unwrap()
    }

    /// Positions sorted along `x`; leaves store them as f32, so compare with a tolerance.
    fn sorted_positions(node: &OctreeNode) -> Vec<DVec3> {
        let mut positions = node.collect_points().unwrap().positions().to_vec();
        positions.sort_unstable_by(|a, b| a.x.total_cmp(&b.x));
        positions
    }

    fn assert_same_positions(a: &[DVec3], b: &[DVec3]) {
        assert_eq!(a.len(), b.len());
        for (a, b) in a.iter().zip(b) {
            assert!(a.abs_diff_eq(*b, 1e-5), "{a} != {b}");
        }
    }

    #[test]
    fn empty_side_returns_the_other() {
        let config = config(8);
        let engine = MergeEngine::new(&config);
        let a = tree(points(&[[1.0, 1.0, 1.0]]), 8);
        let empty = OctreeNode::empty(Cell::new(7, 7, 7, 0));
        assert_eq!(engine.merge(&a, &empty).unwrap().id(), a.id());
        assert_eq!(engine.merge(&empty, &a).unwrap().id(), a.id());
    }

    #[test]
    fn small_trees_become_one_leaf_at_the_enclosing_cell() {
        let config = config(8);
        let engine = MergeEngine::new(&config);
        let a = OctreeNode::leaf(Cell::new(0, 0, 0, 0), points(&[[0.5, 0.5, 0.5]])).unwrap();
        let b = OctreeNode::leaf(Cell::new(5, 5, 5, 0), points(&[[5.5, 5.5, 5.5]])).unwrap();
        let merged = engine.merge(&a, &b).unwrap();
        assert!(merged.is_leaf());
        assert_eq!(merged.cell(), Cell::new(0, 0, 0, 3));
        assert_eq!(merged.point_count_tree(), 2);
    }

    #[test]
    fn disjoint_cells_join_below_a_common_root() {
        let config = config(8);
        let engine = MergeEngine::new(&config);
        let a = OctreeNode::leaf(Cell::new(0, 0, 0, 0), points(&[[0.5, 0.5, 0.5]])).unwrap();
        let b = OctreeNode::leaf(Cell::new(5, 5, 5, 0), points(&[[5.5, 5.5, 5.5]])).unwrap();
        let root = Cell::enclosing(a.cell(), b.cell());
        let joined = engine.join_non_overlapping_trees(root, &a, &b).unwrap();
        assert!(!joined.is_leaf());
        assert!(joined.cell().exponent() >= 3);
        assert_eq!(joined.occupied_octants().len(), 2);
        assert_eq!(joined.point_count_tree(), 2);
        assert!(joined.cell().contains(a.cell()) && joined.cell().contains(b.cell()));
    }

    #[test]
    fn identical_leaves_are_concatenated_and_split() {
        let config = config(8);
        let engine = MergeEngine::new(&config);
        let cell = Cell::new(0, 0, 0, 2);
        let mut rng = StdRng::seed_from_u64(1);
        let a = OctreeNode::leaf(cell, random_points(&mut rng, 6, DVec3::ZERO, DVec3::splat(4.0)))
            .unwrap();
        let b = OctreeNode::leaf(cell, random_points(&mut rng, 7, DVec3::ZERO, DVec3::splat(4.0)))
            .unwrap();
        let merged = engine.merge(&a, &b).unwrap();
        assert_eq!(merged.cell(), cell);
        assert!(!merged.is_leaf());
        assert_eq!(merged.point_count_tree(), 13);
        assert!(TreeStats::of(&merged).unwrap().max_leaf_points <= 8);
    }

    #[test]
    fn leaf_is_injected_into_tree_at_same_cell() {
        let config = config(16);
        let engine = MergeEngine::new(&config);
        let mut rng = StdRng::seed_from_u64(2);
        let cell = Cell::new(0, 0, 0, 3);
        let big = OctreeNode::build(
            cell,
            random_points(&mut rng, 100, DVec3::ZERO, DVec3::splat(8.0)),
            16,
        )
        .unwrap();
        let small = OctreeNode::leaf(
            cell,
            random_points(&mut rng, 10, DVec3::ZERO, DVec3::splat(8.0)),
        )
        .unwrap();
        let merged = engine.merge(&small, &big).unwrap();
        assert_eq!(merged.cell(), cell);
        assert_eq!(merged.point_count_tree(), 110);
        assert_eq!(merged.count_points().unwrap(), 110);
        assert!(TreeStats::of(&merged).unwrap().max_leaf_points <= 16);
    }

    #[test]
    fn nested_trees_merge_into_octant() {
        let config = config(16);
        let engine = MergeEngine::new(&config);
        let mut rng = StdRng::seed_from_u64(3);
        let outer = tree(
            random_points(&mut rng, 200, DVec3::splat(0.1), DVec3::splat(15.9)),
            16,
        );
        let inner = tree(
            random_points(&mut rng, 50, DVec3::splat(1.1), DVec3::splat(1.9)),
            16,
        );
        assert!(outer.cell().exponent() > inner.cell().exponent());
        for (a, b) in [(&outer, &inner), (&inner, &outer)] {
            let merged = engine.merge(a, b).unwrap();
            assert_eq!(merged.cell(), outer.cell());
            assert_eq!(merged.point_count_tree(), 250);
            assert_eq!(merged.count_points().unwrap(), 250);
        }
    }

    #[test]
    fn merging_is_commutative_on_point_sets() {
        let config = config(32);
        let engine = MergeEngine::new(&config);
        let mut rng = StdRng::seed_from_u64(4);
        let a = tree(random_points(&mut rng, 300, DVec3::splat(-5.0), DVec3::splat(3.0)), 32);
        let b = tree(random_points(&mut rng, 200, DVec3::splat(-1.0), DVec3::splat(9.0)), 32);
        let ab = engine.merge(&a, &b).unwrap();
        let ba = engine.merge(&b, &a).unwrap();
        assert_eq!(ab.point_count_tree(), 500);
        assert_eq!(ba.point_count_tree(), 500);
        assert_same_positions(&sorted_positions(&ab), &sorted_positions(&ba));
        assert!(TreeStats::of(&ab).unwrap().max_leaf_points <= 32);
    }

    #[test]
    fn centered_leaf_and_disjoint_leaf() {
        let config = config(4);
        let engine = MergeEngine::new(&config);
        let centered = OctreeNode::leaf(
            Cell::centered(2),
            points(&[
                [-1.0, -1.0, -1.0],
                [1.0, 1.0, 1.0],
                [-0.5, 0.5, -0.5],
                [0.5, -0.5, 0.25],
                [0.25, 0.25, 0.25],
            ]),
        )
        .unwrap();
        let far = OctreeNode::leaf(
            Cell::new(4, 4, 4, 1),
            points(&[[9.0, 9.0, 9.0], [9.5, 9.5, 9.5], [8.5, 8.5, 8.5]]),
        )
        .unwrap();
        assert!(!centered.cell().intersects(far.cell()));

        let merged = engine.merge(&centered, &far).unwrap();
        assert_eq!(merged.point_count_tree(), 8);
        assert!(merged.cell().contains(centered.cell()));
        assert!(merged.cell().contains(far.cell()));
        for child in merged.children().unwrap().values().flatten() {
            assert!(!child.get().unwrap().cell().is_centered_at_origin());
        }
    }

    #[test]
    fn centered_trees_merge_per_octant() {
        let config = config(16);
        let engine = MergeEngine::new(&config);
        let mut rng = StdRng::seed_from_u64(5);
        let a = tree(random_points(&mut rng, 150, DVec3::splat(-4.0), DVec3::splat(4.0)), 16);
        let b = tree(random_points(&mut rng, 150, DVec3::splat(-2.0), DVec3::splat(6.0)), 16);
        assert!(a.cell().is_centered_at_origin());
        assert!(b.cell().is_centered_at_origin());
        let merged = engine.merge(&a, &b).unwrap();
        assert!(merged.cell().is_centered_at_origin());
        assert_eq!(merged.point_count_tree(), 300);
        assert_eq!(merged.count_points().unwrap(), 300);

        let regular = tree(random_points(&mut rng, 40, DVec3::splat(1.0), DVec3::splat(2.0)), 16);
        let merged = engine.merge(&regular, &merged).unwrap();
        assert_eq!(merged.point_count_tree(), 340);
    }

    #[test]
    fn every_node_stays_within_its_cell() {
        let config = config(16);
        let engine = MergeEngine::new(&config);
        let mut rng = StdRng::seed_from_u64(6);
        let mut merged = OctreeNode::empty(Cell::new(0, 0, 0, 0));
        for _ in 0..6 {
            let batch = random_points(&mut rng, 40, DVec3::splat(-10.0), DVec3::splat(10.0));
            merged = engine.merge(&merged, &tree(batch, 16)).unwrap();
        }
        assert_eq!(merged.point_count_tree(), 240);
        merged
            .for_each_node(|node| {
                let tolerance = DVec3::splat(node.cell().size() * 1e-5);
                assert!(node.cell().bounds().enlarged(tolerance).encloses(node.bounds()));
                assert!(node.point_count_cell() <= 16);
            })
            .unwrap();
    }

    #[test]
    fn part_index_ranges_survive_merging() {
        let config = config(4);
        let engine = MergeEngine::new(&config);
        let part = |positions: &[[f64; 3]], index| {
            let positions = positions.iter().map(|&p| DVec3::from(p)).collect();
            tree(
                PointBatch::new(BatchParts::new(positions).part_indices(PartIndices::Shared(index)))
                    .unwrap(),
                4,
            )
        };
        let a = part(&[[0.5, 0.5, 0.5], [0.6, 0.6, 0.6], [0.7, 0.7, 0.7]], 1);
        let b = part(&[[3.5, 0.5, 0.5], [3.6, 0.6, 0.6], [3.7, 0.7, 0.7]], 4);
        let merged = engine.merge(&a, &b).unwrap();
        assert_eq!(merged.part_index_range(), Some(PartIndexRange::new(1, 4)));
        let points = merged.collect_points().unwrap();
        assert_eq!(points.part_indices().unwrap().range(), Some(PartIndexRange::new(1, 4)));
    }

    #[test]
    fn durable_nodes_are_rejected() {
        let config = config(8);
        let engine = MergeEngine::new(&config);
        let a = tree(points(&[[0.5, 0.5, 0.5]]), 8);
        let durable = a.persist(&config.storage).unwrap();
        let error = engine.merge(&a, &durable).unwrap_err();
        assert!(matches!(error, Error::InvalidOperation(_)));
        let error = engine
            .inject_points_into_tree(points(&[[0.5, 0.5, 0.5]]), Some(&durable), durable.cell())
            .unwrap_err();
        assert!(matches!(error, Error::InvalidOperation(_)));
    }

    #[test]
    fn injecting_into_nothing_builds_a_new_tree() {
        let config = config(2);
        let engine = MergeEngine::new(&config);
        let cell = Cell::new(0, 0, 0, 1);
        let node = engine
            .inject_points_into_tree(
                points(&[[0.5, 0.5, 0.5], [1.5, 0.5, 0.5], [0.5, 1.5, 1.5]]),
                None,
                cell,
            )
            .unwrap();
        assert_eq!(node.cell(), cell);
        assert_eq!(
            node.occupied_octants(),
            Corners3::from_iter([Corner3::X0Y0Z0, Corner3::X1Y0Z0, Corner3::X0Y1Z1])
        );
    }

    #[test]
    fn progress_is_reported_monotonically() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let config = config(8).with_progress(move |count| sink.lock().push(count));
        let engine = MergeEngine::new(&config);
        let mut rng = StdRng::seed_from_u64(7);
        let a = tree(random_points(&mut rng, 50, DVec3::ZERO, DVec3::ONE), 8);
        let b = tree(random_points(&mut rng, 30, DVec3::ZERO, DVec3::ONE), 8);
        engine.merge(&a, &b).unwrap();
        let reported = reported.lock();
        assert_eq!(reported.last(), Some(&80));
        assert!(reported.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn density_normalization_thins_out_merged_leaves() {
        let config = config(64)
            .with_min_dist(0.5)
            .with_normalize_density_globally(true);
        let engine = MergeEngine::new(&config);
        let a = OctreeNode::leaf(
            Cell::new(0, 0, 0, 0),
            points(&[[0.1, 0.1, 0.1], [0.2, 0.2, 0.2]]),
        )
        .unwrap();
        let b = OctreeNode::leaf(Cell::new(0, 0, 0, 0), points(&[[0.9, 0.9, 0.9]])).unwrap();
        let merged = engine.merge(&a, &b).unwrap();
        assert_eq!(merged.point_count_tree(), 2);
    }
}
