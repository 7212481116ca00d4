use pointree_lib::{cell::Cell, math_enums::Corner3};

use super::MergeEngine;
use crate::{
    error::{Error, Result},
    node::{Children, NodeRef, OctreeNode, PointCloudNode},
};

impl MergeEngine<'_> {
    /// Places the disjoint trees `a` and `b` below a new inner node at `root`.
    ///
    /// A tree at a cell centered at the origin is distributed over the octants of `root` child by
    /// child, force splitting it first if it is a leaf. The root itself is not collapsed.
    ///
    /// Fails with [`Error::InvariantViolation`] if the cells intersect or `root` does not contain
    /// both of them.
    pub fn join_non_overlapping_trees(
        &self,
        root: Cell,
        a: &OctreeNode,
        b: &OctreeNode,
    ) -> Result<OctreeNode> {
        a.ensure_temporary("joining")?;
        b.ensure_temporary("joining")?;
        if a.cell().intersects(b.cell()) {
            return Err(Error::invariant(format!(
                "cannot join overlapping cells {} and {}",
                a.cell(),
                b.cell()
            )));
        }
        if !root.contains(a.cell()) || !root.contains(b.cell()) {
            return Err(Error::invariant(format!(
                "root {root} does not contain both {} and {}",
                a.cell(),
                b.cell()
            )));
        }

        if b.cell().is_centered_at_origin() {
            return self.join_non_overlapping_trees(root, b, a);
        }
        if a.cell().is_centered_at_origin() {
            return self.join_centered(root, a, b);
        }

        let corner_a = self.octant_containing(root, a)?;
        let corner_b = self.octant_containing(root, b)?;
        let mut children = Children::default();
        if corner_a == corner_b {
            let octant = root.octant(corner_a);
            children[corner_a] = Some(NodeRef::new(self.join_non_overlapping_trees(octant, a, b)?));
        } else {
            children[corner_a] = Some(NodeRef::new(
                self.join_tree_to_root_cell(root.octant(corner_a), a)?,
            ));
            children[corner_b] = Some(NodeRef::new(
                self.join_tree_to_root_cell(root.octant(corner_b), b)?,
            ));
        }
        OctreeNode::inner(root, children)
    }

    /// Joins the centered tree `a` with the regular tree `b` octant by octant.
    fn join_centered(&self, root: Cell, a: &OctreeNode, b: &OctreeNode) -> Result<OctreeNode> {
        if a.is_leaf() {
            let split = self.force_split_leaf(a)?;
            return self.join_centered(root, &split, b);
        }

        let corner_b = self.octant_containing(root, b)?;
        let mut children = Children::default();
        for corner in Corner3::ALL {
            let octant = root.octant(corner);
            let child = match (a.child(corner)?, corner == corner_b) {
                (Some(child), true) => {
                    let merged = self.merge(&child, b)?;
                    Some(self.join_tree_to_root_cell(octant, &merged)?)
                }
                (Some(child), false) => Some(self.join_tree_to_root_cell(octant, &child)?),
                (None, true) => Some(self.join_tree_to_root_cell(octant, b)?),
                (None, false) => None,
            };
            children[corner] = child.map(NodeRef::new);
        }
        OctreeNode::inner(root, children)
    }

    /// Hangs `node` below `root`, adding a chain of inner nodes for the cells in between.
    ///
    /// Every inner node of the chain is collapsed on the way up.
    pub fn join_tree_to_root_cell(&self, root: Cell, node: &OctreeNode) -> Result<OctreeNode> {
        node.ensure_temporary("joining")?;
        if node.cell() == root {
            return Ok(node.clone());
        }
        if node.cell().is_centered_at_origin() {
            return Err(Error::invariant(format!(
                "cannot move centered cell {} below {root}",
                node.cell()
            )));
        }
        let corner = self.octant_containing(root, node)?;
        let child = self.join_tree_to_root_cell(root.octant(corner), node)?;
        let mut children = Children::default();
        children[corner] = Some(NodeRef::new(child));
        self.collapse(&OctreeNode::inner(root, children)?)
    }

    fn octant_containing(&self, root: Cell, node: &OctreeNode) -> Result<Corner3> {
        root.octant_containing(node.cell()).ok_or_else(|| {
            Error::invariant(format!("{} is not within an octant of {root}", node.cell()))
        })
    }
}
