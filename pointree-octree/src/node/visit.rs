use std::{convert::Infallible, ops::ControlFlow};

use pointree_lib::geometry::Hull3;

use super::{OctreeNode, PointCloudNode};
use crate::{batch::PointBatch, error::Result};

/// Contains the callback for depth-first [`OctreeNode`] traversal.
pub trait NodeVisitor {
    /// The type within the [`ControlFlow::Break`] used to break visitation.
    type Break;

    /// Called for every visited node; `depth` is zero for the node traversal started at.
    ///
    /// Return [`VisitNode::Enter`] to visit the children of inner nodes as well.
    fn node(&mut self, node: &OctreeNode, depth: usize) -> ControlFlow<Self::Break, VisitNode>;
}

/// Whether to visit the children of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VisitNode {
    /// Skips over the children of this node.
    Skip,
    /// Visits the children of this node.
    #[default]
    Enter,
}

/// Unwraps the result of a traversal that cannot break.
fn completed(flow: ControlFlow<Infallible>) {
    match flow {
        ControlFlow::Continue(()) => {}
        ControlFlow::Break(never) => match never {},
    }
}

struct ForEach<F>(F);

impl<F: FnMut(&OctreeNode)> NodeVisitor for ForEach<F> {
    type Break = Infallible;

    fn node(&mut self, node: &OctreeNode, _depth: usize) -> ControlFlow<Self::Break, VisitNode> {
        (self.0)(node);
        ControlFlow::Continue(VisitNode::Enter)
    }
}

struct Intersecting<'a, F> {
    hull: &'a Hull3,
    f: F,
}

impl<F: FnMut(&OctreeNode, bool)> NodeVisitor for Intersecting<'_, F> {
    type Break = Infallible;

    fn node(&mut self, node: &OctreeNode, _depth: usize) -> ControlFlow<Self::Break, VisitNode> {
        let bounds = node.bounds();
        if !self.hull.intersects(bounds) {
            return ControlFlow::Continue(VisitNode::Skip);
        }
        (self.f)(node, self.hull.encloses(bounds));
        ControlFlow::Continue(VisitNode::Enter)
    }
}

impl OctreeNode {
    /// Visits this node and its descendants depth-first, loading children as needed.
    pub fn visit<V: NodeVisitor>(&self, visitor: &mut V) -> Result<ControlFlow<V::Break>> {
        self.visit_at(0, visitor)
    }

    fn visit_at<V: NodeVisitor>(
        &self,
        depth: usize,
        visitor: &mut V,
    ) -> Result<ControlFlow<V::Break>> {
        match visitor.node(self, depth) {
            ControlFlow::Break(result) => return Ok(ControlFlow::Break(result)),
            ControlFlow::Continue(VisitNode::Skip) => return Ok(ControlFlow::Continue(())),
            ControlFlow::Continue(VisitNode::Enter) => {}
        }
        if let Some(children) = self.children() {
            for child in children.values().flatten() {
                if let ControlFlow::Break(result) = child.get()?.visit_at(depth + 1, visitor)? {
                    return Ok(ControlFlow::Break(result));
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Calls `f` for this node and all of its descendants.
    pub fn for_each_node(&self, f: impl FnMut(&OctreeNode)) -> Result<()> {
        self.visit(&mut ForEach(f)).map(completed)
    }

    /// Calls `f` for every node whose points might lie inside of `hull`.
    ///
    /// The flag passed to `f` tells whether the node lies completely inside.
    pub fn for_each_intersecting_node(
        &self,
        hull: &Hull3,
        f: impl FnMut(&OctreeNode, bool),
    ) -> Result<()> {
        self.visit(&mut Intersecting { hull, f }).map(completed)
    }

    /// The number of nodes in the subtree, including this one.
    pub fn count_nodes(&self) -> Result<usize> {
        let mut count = 0;
        self.for_each_node(|_| count += 1)?;
        Ok(count)
    }

    /// The number of points in the subtree, counted leaf by leaf.
    ///
    /// Unlike [`PointCloudNode::point_count_tree`] this does not trust the stored counts.
    pub fn count_points(&self) -> Result<u64> {
        let mut count = 0;
        self.for_each_node(|node| count += node.point_count_cell() as u64)?;
        Ok(count)
    }

    /// All points of the subtree in a single batch, in depth-first order.
    pub fn collect_points(&self) -> Result<PointBatch> {
        let mut leaves = Vec::new();
        self.for_each_node(|node| {
            if node.point_count_cell() > 0 {
                leaves.push(node.points());
            }
        })?;
        let leaves = leaves.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(PointBatch::merge_all(&leaves))
    }
}

/// Aggregated shape of a tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub point_count: u64,
    /// The smallest depth of any leaf.
    pub min_depth: usize,
    /// The largest depth of any leaf.
    pub max_depth: usize,
    pub max_leaf_points: usize,
}

impl TreeStats {
    /// Walks the whole tree below `node`.
    pub fn of(node: &OctreeNode) -> Result<Self> {
        let mut stats = Self {
            min_depth: usize::MAX,
            ..Default::default()
        };
        node.visit(&mut stats).map(completed)?;
        if stats.leaf_count == 0 {
            stats.min_depth = 0;
        }
        Ok(stats)
    }
}

impl NodeVisitor for TreeStats {
    type Break = Infallible;

    fn node(&mut self, node: &OctreeNode, depth: usize) -> ControlFlow<Self::Break, VisitNode> {
        self.node_count += 1;
        if node.is_leaf() {
            self.leaf_count += 1;
            self.point_count += node.point_count_cell() as u64;
            self.min_depth = self.min_depth.min(depth);
            self.max_depth = self.max_depth.max(depth);
            self.max_leaf_points = self.max_leaf_points.max(node.point_count_cell());
        }
        ControlFlow::Continue(VisitNode::Enter)
    }
}
