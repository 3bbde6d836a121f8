use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The default number of metadata lock shards.
pub const DEFAULT_METADATA_LOCK_SHARDS: usize = 4;

/// Sharded read/write locks over the in-memory metadata.
///
/// Page `p` belongs to shard `p % shards`. Snapshotting a chunk for a write takes the shard of its
/// first page shared; code mutating in-memory metadata takes the shards it touches exclusively.
pub struct MetadataLocks {
    shards: Box<[RwLock<()>]>,
}

impl MetadataLocks {
    /// Panics if `shards` is zero.
    pub fn new(shards: usize) -> Self {
        assert!(shards > 0);
        MetadataLocks {
            shards: (0..shards).map(|_| RwLock::new(())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, page: u32) -> usize {
        page as usize % self.shards.len()
    }

    pub fn shared(&self, page: u32) -> RwLockReadGuard<'_, ()> {
        self.shards[self.shard_of(page)].read()
    }

    pub fn exclusive(&self, page: u32) -> RwLockWriteGuard<'_, ()> {
        self.shards[self.shard_of(page)].write()
    }

    /// Take every shard exclusively, in shard order.
    pub fn exclusive_all(&self) -> Vec<RwLockWriteGuard<'_, ()>> {
        self.shards.iter().map(|shard| shard.write()).collect()
    }
}

impl Default for MetadataLocks {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_LOCK_SHARDS)
    }
}
