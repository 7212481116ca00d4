//! The key-value blob storage that octree nodes are persisted in.
//!
//! Keys are opaque byte strings handed out by whoever creates the payload. Stores are expected to
//! be append-only: writing a key again with identical content must be harmless, and callers never
//! rewrite an existing key with different content.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

/// A key-value store for opaque binary payloads.
pub trait BlobStore: Send + Sync {
    /// Stores `payload` under `key`.
    fn put(&self, key: &[u8], payload: Vec<u8>);

    /// Returns the payload stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Arc<[u8]>>;

    /// Whether anything is stored under `key`.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// A [`BlobStore`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<AHashMap<Box<[u8]>, Arc<[u8]>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored payloads.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// The total number of stored payload bytes.
    pub fn total_bytes(&self) -> usize {
        self.blobs.read().values().map(|blob| blob.len()).sum()
    }
}

impl BlobStore for MemoryStore {
    fn put(&self, key: &[u8], payload: Vec<u8>) {
        self.blobs.write().insert(key.into(), payload.into());
    }

    fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        self.blobs.read().get(key).cloned()
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.blobs.read().contains_key(key)
    }
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn put(&self, key: &[u8], payload: Vec<u8>) {
        (**self).put(key, payload);
    }

    fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        (**self).get(key)
    }

    fn contains(&self, key: &[u8]) -> bool {
        (**self).contains(key)
    }
}
