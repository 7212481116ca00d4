pub mod builder;
pub mod codec;
pub mod visit;

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use enum_map::EnumMap;
use glam::{DVec3, Vec3};
use pointree_lib::{
    bounds::Box3,
    cell::Cell,
    math_enums::{Corner3, Corners3},
    storage::BlobStore,
};
use serde::{Deserialize, Serialize};

use crate::{
    batch::{BatchParts, PartIndexRange, PartIndices, PointBatch, Rgba},
    error::{Error, Result},
};

/// The storage key of a node.
///
/// Assigned once when a node is created and never reused, even for identical content.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u128);

impl NodeId {
    /// Generates a new, globally unique [`NodeId`].
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// The key under which the node is stored.
    pub const fn to_key(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

/// Where a node is in its lifecycle.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Created during an import and not yet written; may still be replaced.
    Temporary,
    /// Written to storage exactly once and immutable from then on.
    Durable,
}

/// The eight optional children of an inner node.
pub type Children = EnumMap<Corner3, Option<NodeRef>>;

/// The points of a leaf node.
///
/// Positions are stored relative to the center of the leaf's cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    positions: Vec<Vec3>,
    colors: Option<Vec<Rgba>>,
    normals: Option<Vec<Vec3>>,
    intensities: Option<Vec<i32>>,
    classifications: Option<Vec<u8>>,
    part_indices: Option<PartIndices>,
    centroid: Vec3,
    stddev: f32,
}

impl Leaf {
    fn from_batch(cell: Cell, batch: PointBatch) -> Self {
        let center = cell.center();
        let BatchParts {
            positions,
            colors,
            normals,
            intensities,
            classifications,
            part_indices,
            ..
        } = batch.into_parts();
        let positions = positions
            .unwrap_or_default()
            .into_iter()
            .map(|p| (p - center).as_vec3())
            .collect::<Vec<_>>();

        let (centroid, stddev) = if positions.is_empty() {
            (Vec3::ZERO, 0.0)
        } else {
            let count = positions.len() as f32;
            let centroid = positions.iter().sum::<Vec3>() / count;
            let variance = positions
                .iter()
                .map(|p| p.distance_squared(centroid))
                .sum::<f32>()
                / count;
            (centroid, variance.sqrt())
        };

        Self {
            positions,
            colors,
            normals,
            intensities,
            classifications,
            part_indices,
            centroid,
            stddev,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Positions relative to the center of the cell.
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// The mean of all local positions.
    pub fn centroid(&self) -> Vec3 {
        self.centroid
    }

    /// The root mean square distance of all local positions to the [`Leaf::centroid`].
    pub fn stddev(&self) -> f32 {
        self.stddev
    }

    /// Turns the points back into a batch with absolute positions.
    fn to_batch(&self, cell: Cell, part_index_range: Option<PartIndexRange>) -> Result<PointBatch> {
        let center = cell.center();
        let mut parts = BatchParts::new(
            self.positions
                .iter()
                .map(|&p| center + p.as_dvec3())
                .collect(),
        );
        parts.colors = self.colors.clone();
        parts.normals = self.normals.clone();
        parts.intensities = self.intensities.clone();
        parts.classifications = self.classifications.clone();
        parts.part_indices = self.part_indices.clone();
        parts.part_index_range = part_index_range;
        parts.build()
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Leaf(Arc<Leaf>),
    Inner(Children),
}

/// A node of a point cloud octree.
///
/// Leaves hold up to a split limit of points; inner nodes hold none and reference up to eight
/// children instead. Nodes are never modified in place. Every change builds a new node with a new
/// [`NodeId`].
#[derive(Clone, Debug)]
pub struct OctreeNode {
    id: NodeId,
    cell: Cell,
    state: NodeState,
    /// Exact bounds of all points in the subtree.
    bounds: Box3,
    point_count_tree: u64,
    part_index_range: Option<PartIndexRange>,
    kind: NodeKind,
}

/// Read access shared by stored nodes and derived views of them.
pub trait PointCloudNode {
    fn id(&self) -> NodeId;

    fn cell(&self) -> Cell;

    /// The exact bounds of all points in the subtree, in absolute coordinates.
    fn bounds(&self) -> Box3;

    /// The number of points in the whole subtree.
    fn point_count_tree(&self) -> u64;

    /// The number of points held by this node itself; always zero for inner nodes.
    fn point_count_cell(&self) -> usize;

    fn is_leaf(&self) -> bool;

    fn part_index_range(&self) -> Option<PartIndexRange>;

    /// Positions relative to the cell center; [`None`] for inner nodes.
    fn local_positions(&self) -> Option<&[Vec3]>;

    fn colors(&self) -> Option<&[Rgba]>;

    fn normals(&self) -> Option<&[Vec3]>;

    fn intensities(&self) -> Option<&[i32]>;

    fn classifications(&self) -> Option<&[u8]>;

    fn part_indices(&self) -> Option<&PartIndices>;

    /// Returns a copy of this node holding `points` instead.
    fn with(&self, points: PointBatch) -> Result<OctreeNode>;

    /// Returns a copy of this node with the given `children` instead.
    fn with_subnodes(&self, children: Children) -> Result<OctreeNode>;

    /// Positions of the points held by this node itself, in absolute coordinates.
    fn global_positions(&self) -> Vec<DVec3> {
        let center = self.cell().center();
        self.local_positions()
            .unwrap_or_default()
            .iter()
            .map(|&p| center + p.as_dvec3())
            .collect()
    }
}

impl OctreeNode {
    /// Constructs a temporary leaf at `cell` holding all of `points`.
    ///
    /// Fails with [`Error::InvalidArgument`] if any point lies outside of `cell`.
    pub fn leaf(cell: Cell, points: PointBatch) -> Result<Self> {
        if !points.is_empty() && !cell.bounds().encloses(points.bounds()) {
            return Err(Error::InvalidArgument(format!(
                "points with bounds {:?} do not fit into cell {cell}",
                points.bounds()
            )));
        }
        let part_index_range = points.part_index_range();
        let leaf = Leaf::from_batch(cell, points);
        let center = cell.center();
        let bounds = leaf
            .positions
            .iter()
            .map(|&p| center + p.as_dvec3())
            .collect();
        Ok(Self {
            id: NodeId::random(),
            cell,
            state: NodeState::Temporary,
            bounds,
            point_count_tree: leaf.len() as u64,
            part_index_range,
            kind: NodeKind::Leaf(Arc::new(leaf)),
        })
    }

    /// Constructs a temporary leaf at `cell` without any points.
    pub fn empty(cell: Cell) -> Self {
        Self {
            id: NodeId::random(),
            cell,
            state: NodeState::Temporary,
            bounds: Box3::EMPTY,
            point_count_tree: 0,
            part_index_range: None,
            kind: NodeKind::Leaf(Arc::new(Leaf::from_batch(cell, PointBatch::default()))),
        }
    }

    /// Constructs a temporary inner node at `cell` from its `children`.
    ///
    /// Point counts, bounds and the part index range are aggregated from the children. The part
    /// index range is only known if every child has one.
    ///
    /// Fails with [`Error::InvariantViolation`] if a child is not at its octant of `cell`.
    pub fn inner(cell: Cell, children: Children) -> Result<Self> {
        let mut bounds = Box3::EMPTY;
        let mut point_count_tree = 0;
        let mut part_index_range = None;
        let mut first = true;
        for (corner, child) in &children {
            let Some(child) = child else {
                continue;
            };
            let child = child.get()?;
            if child.cell != cell.octant(corner) {
                return Err(Error::invariant(format!(
                    "child at {corner:?} of cell {cell} has cell {}",
                    child.cell
                )));
            }
            bounds = bounds.union(child.bounds);
            point_count_tree += child.point_count_tree;
            part_index_range = if first {
                child.part_index_range
            } else {
                PartIndexRange::union_both(part_index_range, child.part_index_range)
            };
            first = false;
        }
        Ok(Self {
            id: NodeId::random(),
            cell,
            state: NodeState::Temporary,
            bounds,
            point_count_tree,
            part_index_range,
            kind: NodeKind::Inner(children),
        })
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_temporary(&self) -> bool {
        self.state == NodeState::Temporary
    }

    pub fn is_durable(&self) -> bool {
        self.state == NodeState::Durable
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn leaf_data(&self) -> Option<&Leaf> {
        match &self.kind {
            NodeKind::Leaf(leaf) => Some(leaf),
            NodeKind::Inner(_) => None,
        }
    }

    pub fn children(&self) -> Option<&Children> {
        match &self.kind {
            NodeKind::Leaf(_) => None,
            NodeKind::Inner(children) => Some(children),
        }
    }

    /// Loads the child at `corner`, if there is one.
    pub fn child(&self, corner: Corner3) -> Result<Option<Arc<OctreeNode>>> {
        self.children()
            .and_then(|children| children[corner].as_ref())
            .map(NodeRef::get)
            .transpose()
    }

    /// The octants that hold a child.
    pub fn occupied_octants(&self) -> Corners3 {
        self.children()
            .map(|children| {
                children
                    .iter()
                    .filter(|(_, child)| child.is_some())
                    .map(|(corner, _)| corner)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The points held by this node itself, in absolute coordinates.
    ///
    /// Empty for inner nodes.
    pub fn points(&self) -> Result<PointBatch> {
        match &self.kind {
            NodeKind::Leaf(leaf) => leaf.to_batch(self.cell, self.part_index_range),
            NodeKind::Inner(_) => Ok(PointBatch::default()),
        }
    }

    /// Fails with [`Error::InvalidOperation`] unless this is a temporary node.
    pub(crate) fn ensure_temporary(&self, operation: &str) -> Result<()> {
        if self.is_temporary() {
            Ok(())
        } else {
            Err(Error::invalid_operation(format!(
                "{operation} is only valid for temporary import nodes, but node {} is durable",
                self.id
            )))
        }
    }
}

impl PointCloudNode for OctreeNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn cell(&self) -> Cell {
        self.cell
    }

    fn bounds(&self) -> Box3 {
        self.bounds
    }

    fn point_count_tree(&self) -> u64 {
        self.point_count_tree
    }

    fn point_count_cell(&self) -> usize {
        self.leaf_data().map_or(0, Leaf::len)
    }

    fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    fn part_index_range(&self) -> Option<PartIndexRange> {
        self.part_index_range
    }

    fn local_positions(&self) -> Option<&[Vec3]> {
        self.leaf_data().map(|leaf| leaf.positions.as_slice())
    }

    fn colors(&self) -> Option<&[Rgba]> {
        self.leaf_data().and_then(|leaf| leaf.colors.as_deref())
    }

    fn normals(&self) -> Option<&[Vec3]> {
        self.leaf_data().and_then(|leaf| leaf.normals.as_deref())
    }

    fn intensities(&self) -> Option<&[i32]> {
        self.leaf_data().and_then(|leaf| leaf.intensities.as_deref())
    }

    fn classifications(&self) -> Option<&[u8]> {
        self.leaf_data()
            .and_then(|leaf| leaf.classifications.as_deref())
    }

    fn part_indices(&self) -> Option<&PartIndices> {
        self.leaf_data().and_then(|leaf| leaf.part_indices.as_ref())
    }

    fn with(&self, points: PointBatch) -> Result<OctreeNode> {
        self.ensure_temporary("replacing points")?;
        Self::leaf(self.cell, points)
    }

    fn with_subnodes(&self, children: Children) -> Result<OctreeNode> {
        self.ensure_temporary("replacing subnodes")?;
        Self::inner(self.cell, children)
    }
}

struct NodeSlot {
    id: NodeId,
    node: OnceLock<Arc<OctreeNode>>,
    storage: Option<Arc<dyn BlobStore>>,
}

/// A reference from a parent node to one of its children.
///
/// Either holds the child directly, or loads it from storage on first access and keeps it.
/// Cloning is cheap and clones share the loaded node.
#[derive(Clone)]
pub struct NodeRef(Arc<NodeSlot>);

impl NodeRef {
    /// References a node that is already in memory.
    pub fn new(node: impl Into<Arc<OctreeNode>>) -> Self {
        let node = node.into();
        Self(Arc::new(NodeSlot {
            id: node.id,
            node: OnceLock::from(node),
            storage: None,
        }))
    }

    /// References a node in `storage` that is only loaded once needed.
    pub fn stored(id: NodeId, storage: Arc<dyn BlobStore>) -> Self {
        Self(Arc::new(NodeSlot {
            id,
            node: OnceLock::new(),
            storage: Some(storage),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn is_loaded(&self) -> bool {
        self.0.node.get().is_some()
    }

    /// Returns the referenced node, loading it first if necessary.
    ///
    /// Fails with [`Error::MissingNode`] if it is not in storage.
    pub fn get(&self) -> Result<Arc<OctreeNode>> {
        if let Some(node) = self.0.node.get() {
            return Ok(Arc::clone(node));
        }
        let storage = self.0.storage.as_ref().ok_or(Error::MissingNode(self.0.id))?;
        let node = Arc::new(OctreeNode::load(self.0.id, storage)?);
        Ok(Arc::clone(self.0.node.get_or_init(|| node)))
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.0.id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
