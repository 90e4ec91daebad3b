//! In-memory block store

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use super::{ClusterStore, StoreError};
use crate::cid::ContentId;

/// In-memory store using a BTreeMap and a pin set
///
/// Useful for tests and for running the server without a cluster. Clones share
/// the same underlying maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryClusterStore {
    blocks: Arc<RwLock<BTreeMap<ContentId, Bytes>>>,
    pins: Arc<RwLock<BTreeSet<ContentId>>>,
}

impl MemoryClusterStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create new memory store from a map of blocks
    pub fn new_from_blocks(blocks: BTreeMap<ContentId, Bytes>) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(blocks)),
            pins: Arc::default(),
        }
    }

    /// Get number of blocks stored
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    /// Check if store is empty
    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }

    /// Pinned roots, in CID order
    pub async fn pins(&self) -> Vec<ContentId> {
        self.pins.read().await.iter().copied().collect()
    }
}

impl ClusterStore for MemoryClusterStore {
    async fn put(&self, cid: &ContentId, data: Bytes) -> Result<(), StoreError> {
        self.blocks.write().await.insert(*cid, data);
        Ok(())
    }

    async fn pin(&self, root: &ContentId) -> Result<(), StoreError> {
        if !self.blocks.read().await.contains_key(root) {
            return Err(StoreError::MissingBlock(*root));
        }
        self.pins.write().await.insert(*root);
        Ok(())
    }

    async fn get(&self, cid: &ContentId) -> Result<Option<Bytes>, StoreError> {
        Ok(self.blocks.read().await.get(cid).cloned())
    }

    async fn has(&self, cid: &ContentId) -> Result<bool, StoreError> {
        Ok(self.blocks.read().await.contains_key(cid))
    }

    async fn is_pinned(&self, root: &ContentId) -> Result<bool, StoreError> {
        Ok(self.pins.read().await.contains(root))
    }
}
