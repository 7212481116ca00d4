//! Lazily filtered projections of stored octrees.

use std::sync::{Arc, OnceLock};

use enum_map::EnumMap;
use glam::Vec3;
use pointree_lib::{bounds::Box3, cell::Cell, math_enums::Corner3, storage::BlobStore};
use serde::{Deserialize, Serialize};

use crate::{
    batch::{PartIndexRange, PartIndices, PointBatch, Rgba},
    error::{Error, Result},
    filter::Filter,
    node::{Children, NodeId, NodeRef, OctreeNode, PointCloudNode},
};

/// Bumped whenever the record layout changes.
const RECORD_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct ViewRecord {
    version: u16,
    id: NodeId,
    root: NodeId,
    /// The filter as JSON, so it stays readable by other tools.
    filter: String,
}

/// How much of a node's own points pass the filter.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Coverage {
    Inside,
    Outside,
    /// Ascending indices of the passing points.
    Partial(Vec<usize>),
}

#[derive(Debug, Default)]
struct Projections {
    positions: OnceLock<Option<Vec<Vec3>>>,
    colors: OnceLock<Option<Vec<Rgba>>>,
    normals: OnceLock<Option<Vec<Vec3>>>,
    intensities: OnceLock<Option<Vec<i32>>>,
    classifications: OnceLock<Option<Vec<u8>>>,
    part_indices: OnceLock<Option<PartIndices>>,
}

/// A child of a [`FilteredView`].
#[derive(Clone, Debug, Default)]
pub enum ViewChild {
    /// Every point of the stored child passes the filter.
    Base(NodeRef),
    /// Only some points of the stored child pass the filter.
    View(Arc<FilteredView>),
    /// No points pass the filter, or there is no child to begin with.
    #[default]
    Empty,
}

impl ViewChild {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The number of points passing the filter, counted exactly.
    pub fn count_points(&self) -> Result<u64> {
        match self {
            Self::Base(node) => Ok(node.get()?.point_count_tree()),
            Self::View(view) => view.count_points(),
            Self::Empty => Ok(0),
        }
    }
}

pub type ViewChildren = EnumMap<Corner3, ViewChild>;

/// A durable octree seen through a [`Filter`].
///
/// Nothing is copied up front. The passing points of the node are determined on first access and
/// every attribute is projected onto them when it is first asked for. Children are wrapped in views of their
/// own once they are first asked for.
#[derive(Debug)]
pub struct FilteredView {
    id: NodeId,
    node: Arc<OctreeNode>,
    filter: Arc<Filter>,
    coverage: OnceLock<Coverage>,
    projections: Projections,
    children: OnceLock<ViewChildren>,
}

impl FilteredView {
    /// Views the durable `node` through `filter`.
    ///
    /// Fails with [`Error::InvalidOperation`] for temporary nodes, which might still change.
    pub fn new(node: impl Into<Arc<OctreeNode>>, filter: impl Into<Arc<Filter>>) -> Result<Self> {
        Self::with_id(NodeId::random(), node, filter)
    }

    pub fn with_id(
        id: NodeId,
        node: impl Into<Arc<OctreeNode>>,
        filter: impl Into<Arc<Filter>>,
    ) -> Result<Self> {
        let node = node.into();
        let filter = filter.into();
        if !node.is_durable() {
            return Err(Error::invalid_operation(format!(
                "filtered views require durable nodes, but node {} is temporary",
                node.id()
            )));
        }
        Ok(Self {
            id,
            node,
            filter,
            coverage: OnceLock::new(),
            projections: Projections::default(),
            children: OnceLock::new(),
        })
    }

    fn coverage(&self) -> &Coverage {
        self.coverage.get_or_init(|| {
            let bounds = self.node.bounds();
            if self.filter.is_fully_inside(bounds) {
                Coverage::Inside
            } else if self.filter.is_fully_outside(bounds) {
                Coverage::Outside
            } else {
                Coverage::Partial(self.filter.filter_points(self.node.as_ref(), None))
            }
        })
    }

    /// The viewed node.
    pub fn base(&self) -> &Arc<OctreeNode> {
        &self.node
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// The indices of the base node's points that pass the filter; [`None`] if all of them do.
    pub fn active_points(&self) -> Option<&[usize]> {
        match self.coverage() {
            Coverage::Inside => None,
            Coverage::Outside => Some(&[]),
            Coverage::Partial(active) => Some(active),
        }
    }

    fn projected<'a, T: Copy>(
        &'a self,
        cache: &'a OnceLock<Option<Vec<T>>>,
        attribute: impl FnOnce(&'a OctreeNode) -> Option<&'a [T]>,
    ) -> Option<&'a [T]> {
        match self.coverage() {
            Coverage::Inside => attribute(self.node.as_ref()),
            Coverage::Outside => None,
            Coverage::Partial(active) => cache
                .get_or_init(|| {
                    attribute(self.node.as_ref())
                        .map(|values| active.iter().map(|&i| values[i]).collect())
                })
                .as_deref(),
        }
    }

    /// The points of this node that pass the filter, in absolute coordinates.
    pub fn points(&self) -> Result<PointBatch> {
        match self.coverage() {
            Coverage::Inside => self.node.points(),
            Coverage::Outside => Ok(PointBatch::default()),
            Coverage::Partial(active) => Ok(self.node.points()?.subset(active)),
        }
    }

    /// The children of the view; [`None`] for leaves.
    ///
    /// Children are resolved without loading them if the filter decides by the octant's cell alone.
    pub fn children(&self) -> Result<Option<&ViewChildren>> {
        let Some(base) = self.node.children() else {
            return Ok(None);
        };
        if let Some(children) = self.children.get() {
            return Ok(Some(children));
        }
        let mut children = ViewChildren::default();
        for (corner, child) in base {
            if let Some(child) = child {
                children[corner] = self.view_child(corner, child)?;
            }
        }
        Ok(Some(self.children.get_or_init(|| children)))
    }

    fn view_child(&self, corner: Corner3, child: &NodeRef) -> Result<ViewChild> {
        match self.coverage() {
            Coverage::Inside => return Ok(ViewChild::Base(child.clone())),
            Coverage::Outside => return Ok(ViewChild::Empty),
            Coverage::Partial(_) => {}
        }
        if self.filter.is_spatial() {
            let octant = self.cell().octant(corner).bounds();
            if self.filter.is_fully_inside(octant) {
                return Ok(ViewChild::Base(child.clone()));
            }
            if self.filter.is_fully_outside(octant) {
                return Ok(ViewChild::Empty);
            }
        }
        let node = child.get()?;
        let view = Self::new(node, Arc::clone(&self.filter))?;
        Ok(match view.coverage() {
            Coverage::Inside => ViewChild::Base(child.clone()),
            Coverage::Outside => ViewChild::Empty,
            Coverage::Partial(_) => ViewChild::View(Arc::new(view)),
        })
    }

    /// The number of passing points in the whole subtree, counted exactly.
    ///
    /// Loads every node that the filter only partially covers.
    pub fn count_points(&self) -> Result<u64> {
        let mut count = self.point_count_cell() as u64;
        if let Some(children) = self.children()? {
            for child in children.values() {
                count += child.count_points()?;
            }
        }
        Ok(count)
    }

    /// Copies the passing points into a new durable tree in `storage`.
    ///
    /// Subtrees that pass as a whole keep their ids and are copied into `storage` unless they are
    /// stored there already.
    pub fn materialize(&self, storage: &Arc<dyn BlobStore>) -> Result<OctreeNode> {
        let node = match self.children()? {
            None => OctreeNode::leaf(self.cell(), self.points()?)?,
            Some(children) => {
                let mut materialized = Children::default();
                for (corner, child) in children {
                    materialized[corner] = match child {
                        ViewChild::Base(node) => {
                            node.get()?.copy_to(storage)?;
                            Some(node.clone())
                        }
                        ViewChild::View(view) => {
                            let node = view.materialize(storage)?;
                            (node.point_count_tree() > 0).then(|| NodeRef::new(node))
                        }
                        ViewChild::Empty => None,
                    };
                }
                OctreeNode::inner(self.cell(), materialized)?
            }
        };
        node.persist(storage)
    }

    /// Serializes the view as the id of its base node and its filter.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&ViewRecord {
            version: RECORD_VERSION,
            id: self.id,
            root: self.node.id(),
            filter: self.filter.to_json_string()?,
        })?)
    }

    /// Deserializes a view, loading its base node from `storage`.
    pub fn decode(bytes: &[u8], storage: &Arc<dyn BlobStore>) -> Result<Self> {
        let record: ViewRecord = bincode::deserialize(bytes)?;
        if record.version != RECORD_VERSION {
            return Err(Error::InvalidArgument(format!(
                "unsupported view record version {}",
                record.version
            )));
        }
        let filter = Filter::from_json_str(&record.filter)?;
        let root = OctreeNode::load(record.root, storage)?;
        Self::with_id(record.id, root, filter)
    }

    /// Writes the view record to `storage` under the view's id.
    pub fn persist(&self, storage: &Arc<dyn BlobStore>) -> Result<()> {
        storage.put(&self.id.to_key(), self.encode()?);
        Ok(())
    }

    /// Loads the view stored under `id`.
    pub fn load(id: NodeId, storage: &Arc<dyn BlobStore>) -> Result<Self> {
        let bytes = storage.get(&id.to_key()).ok_or(Error::MissingNode(id))?;
        Self::decode(&bytes, storage)
    }
}

impl PointCloudNode for FilteredView {
    fn id(&self) -> NodeId {
        self.id
    }

    fn cell(&self) -> Cell {
        self.node.cell()
    }

    fn bounds(&self) -> Box3 {
        match self.coverage() {
            Coverage::Inside => self.node.bounds(),
            Coverage::Outside => Box3::EMPTY,
            Coverage::Partial(_) => self.filter.clip(self.node.bounds()),
        }
    }

    /// For partially covered inner nodes, this is the count of the base node, since the children
    /// would have to be loaded otherwise. Use [`FilteredView::count_points`] for an exact count.
    fn point_count_tree(&self) -> u64 {
        match self.coverage() {
            Coverage::Inside => self.node.point_count_tree(),
            Coverage::Outside => 0,
            Coverage::Partial(active) if self.node.is_leaf() => active.len() as u64,
            Coverage::Partial(_) => self.node.point_count_tree(),
        }
    }

    fn point_count_cell(&self) -> usize {
        match self.coverage() {
            Coverage::Inside => self.node.point_count_cell(),
            Coverage::Outside => 0,
            Coverage::Partial(active) => active.len(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.node.is_leaf()
    }

    fn part_index_range(&self) -> Option<PartIndexRange> {
        match self.coverage() {
            Coverage::Inside => self.node.part_index_range(),
            Coverage::Outside => None,
            Coverage::Partial(_) if !self.node.is_leaf() => self.node.part_index_range(),
            Coverage::Partial(active) if active.is_empty() => None,
            Coverage::Partial(_) => self
                .part_indices()
                .and_then(PartIndices::range)
                .or(self.node.part_index_range()),
        }
    }

    fn local_positions(&self) -> Option<&[Vec3]> {
        self.projected(&self.projections.positions, |node| node.local_positions())
    }

    fn colors(&self) -> Option<&[Rgba]> {
        self.projected(&self.projections.colors, |node| node.colors())
    }

    fn normals(&self) -> Option<&[Vec3]> {
        self.projected(&self.projections.normals, |node| node.normals())
    }

    fn intensities(&self) -> Option<&[i32]> {
        self.projected(&self.projections.intensities, |node| node.intensities())
    }

    fn classifications(&self) -> Option<&[u8]> {
        self.projected(&self.projections.classifications, |node| {
            node.classifications()
        })
    }

    fn part_indices(&self) -> Option<&PartIndices> {
        match self.coverage() {
            Coverage::Inside => self.node.part_indices(),
            Coverage::Outside => None,
            Coverage::Partial(active) => self
                .projections
                .part_indices
                .get_or_init(|| self.node.part_indices().map(|indices| indices.subset(active)))
                .as_ref(),
        }
    }

    fn with(&self, _points: PointBatch) -> Result<OctreeNode> {
        Err(Error::NotSupported(format!(
            "filtered view {} cannot replace its points",
            self.id
        )))
    }

    fn with_subnodes(&self, _children: Children) -> Result<OctreeNode> {
        Err(Error::NotSupported(format!(
            "filtered view {} cannot replace its subnodes",
            self.id
        )))
    }
}
