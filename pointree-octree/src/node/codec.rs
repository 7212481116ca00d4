//! Stored representation of octree nodes.
//!
//! Every durable node is written as one self-describing record under its [`NodeId`]. Inner nodes
//! only record the ids of their children, which are loaded lazily through [`NodeRef`].

use std::{borrow::Cow, sync::Arc};

use pointree_lib::{bounds::Box3, cell::Cell, math_enums::Corner3, storage::BlobStore};
use serde::{Deserialize, Serialize};

use super::{Children, Leaf, NodeId, NodeKind, NodeRef, NodeState, OctreeNode, PointCloudNode};
use crate::{
    batch::PartIndexRange,
    error::{Error, Result},
};

/// Bumped whenever the record layout changes.
const RECORD_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct NodeRecord<'a> {
    version: u16,
    id: NodeId,
    cell: Cell,
    bounds: Box3,
    point_count_tree: u64,
    part_index_range: Option<PartIndexRange>,
    kind: RecordKind<'a>,
}

#[derive(Serialize, Deserialize)]
enum RecordKind<'a> {
    Leaf(Cow<'a, Leaf>),
    /// Child ids in octant index order.
    Inner([Option<NodeId>; 8]),
}

impl OctreeNode {
    /// Serializes the node on its own, referencing children by id only.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let kind = match &self.kind {
            NodeKind::Leaf(leaf) => RecordKind::Leaf(Cow::Borrowed(leaf)),
            NodeKind::Inner(children) => {
                RecordKind::Inner(Corner3::ALL.map(|corner| {
                    children[corner].as_ref().map(NodeRef::id)
                }))
            }
        };
        Ok(bincode::serialize(&NodeRecord {
            version: RECORD_VERSION,
            id: self.id,
            cell: self.cell,
            bounds: self.bounds,
            point_count_tree: self.point_count_tree,
            part_index_range: self.part_index_range,
            kind,
        })?)
    }

    /// Deserializes a durable node whose children are loaded from `storage` on demand.
    pub fn decode(bytes: &[u8], storage: &Arc<dyn BlobStore>) -> Result<Self> {
        let record: NodeRecord = bincode::deserialize(bytes)?;
        if record.version != RECORD_VERSION {
            return Err(Error::InvalidArgument(format!(
                "unsupported node record version {}",
                record.version
            )));
        }
        let kind = match record.kind {
            RecordKind::Leaf(leaf) => NodeKind::Leaf(Arc::new(leaf.into_owned())),
            RecordKind::Inner(ids) => {
                let mut children = Children::default();
                for (corner, id) in Corner3::ALL.into_iter().zip(ids) {
                    children[corner] = id.map(|id| NodeRef::stored(id, Arc::clone(storage)));
                }
                NodeKind::Inner(children)
            }
        };
        Ok(Self {
            id: record.id,
            cell: record.cell,
            state: NodeState::Durable,
            bounds: record.bounds,
            point_count_tree: record.point_count_tree,
            part_index_range: record.part_index_range,
            kind,
        })
    }

    /// Loads the durable node stored under `id`.
    ///
    /// Fails with [`Error::MissingNode`] if there is no such node.
    pub fn load(id: NodeId, storage: &Arc<dyn BlobStore>) -> Result<Self> {
        let bytes = storage.get(&id.to_key()).ok_or(Error::MissingNode(id))?;
        let node = Self::decode(&bytes, storage)?;
        if node.id != id {
            return Err(Error::invariant(format!(
                "node stored under {id} claims to be {}",
                node.id
            )));
        }
        Ok(node)
    }

    /// Writes this temporary tree to `storage` and returns its durable version.
    ///
    /// Children are written before their parents. Durable nodes are returned as is and never
    /// written again. Ids stay the same.
    pub fn persist(&self, storage: &Arc<dyn BlobStore>) -> Result<Self> {
        if self.is_durable() {
            return Ok(self.clone());
        }
        let kind = match &self.kind {
            NodeKind::Leaf(leaf) => NodeKind::Leaf(Arc::clone(leaf)),
            NodeKind::Inner(children) => {
                let mut persisted = Children::default();
                for (corner, child) in children {
                    if let Some(child) = child {
                        persisted[corner] = Some(NodeRef::new(child.get()?.persist(storage)?));
                    }
                }
                NodeKind::Inner(persisted)
            }
        };
        let node = Self {
            state: NodeState::Durable,
            kind,
            ..self.clone()
        };
        storage.put(&node.id().to_key(), node.encode()?);
        Ok(node)
    }

    /// Writes this tree to `storage` under the same ids, skipping subtrees that are already there.
    ///
    /// Since children are always written before their parents, a stored node implies that its
    /// whole subtree is stored as well.
    pub fn copy_to(&self, storage: &Arc<dyn BlobStore>) -> Result<()> {
        let key = self.id.to_key();
        if storage.contains(&key) {
            return Ok(());
        }
        if let Some(children) = self.children() {
            for child in children.values().flatten() {
                child.get()?.copy_to(storage)?;
            }
        }
        storage.put(&key, self.encode()?);
        Ok(())
    }
}
