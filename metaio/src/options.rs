use crate::{alloc::DEFAULT_RANGE_POOL_LIMIT, metadata_lock::DEFAULT_METADATA_LOCK_SHARDS};
use metaio_core::{IO_REQS_LIMIT, LOCK_STATUS_BITS};

/// Options when creating a [`crate::MetadataIo`] instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// The maximum number of chunks of one range in flight.
    pub(crate) io_limit: u32,
    /// An upper bound on the chunk size in pages, on top of the one imposed by the volume.
    pub(crate) max_chunk_pages: u32,
    pub(crate) metadata_lock_shards: usize,
    pub(crate) range_pool_limit: usize,
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
    /// The number of entries of the collision table of an atomic-write device.
    pub(crate) collision_table_entries: u64,
    /// The number of metadata sectors per collision table entry.
    pub(crate) line_sectors: u64,
    /// The byte offset of the collision table within the metadata area.
    pub(crate) metadata_offset: u64,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            io_limit: IO_REQS_LIMIT,
            max_chunk_pages: LOCK_STATUS_BITS,
            metadata_lock_shards: DEFAULT_METADATA_LOCK_SHARDS,
            range_pool_limit: DEFAULT_RANGE_POOL_LIMIT,
            metrics: false,
            collision_table_entries: 0,
            line_sectors: 1,
            metadata_offset: 0,
        }
    }

    /// Set the maximum number of chunks of a single range which may be in flight.
    ///
    /// Default: 128. Must be more than 0.
    pub fn io_limit(&mut self, io_limit: u32) {
        assert!(io_limit > 0);
        self.io_limit = io_limit;
    }

    /// Cap the number of pages of a chunk.
    ///
    /// Chunks are also bounded by the maximum I/O size of the volume and never span more than 64
    /// pages, whatever this is set to.
    pub fn max_chunk_pages(&mut self, max_chunk_pages: u32) {
        self.max_chunk_pages = max_chunk_pages;
    }

    /// Set the number of shards of the in-memory metadata locks.
    ///
    /// Default: 4. Must be more than 0.
    pub fn metadata_lock_shards(&mut self, shards: usize) {
        assert!(shards > 0);
        self.metadata_lock_shards = shards;
    }

    /// Set the number of outstanding ranges allowed per limited size class of the range pool.
    ///
    /// Default: 16.
    pub fn range_pool_limit(&mut self, limit: usize) {
        self.range_pool_limit = limit;
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }

    /// Describe the collision table walked by
    /// [`crate::MetadataIo::submit_sequential_atomic`].
    ///
    /// The table spans `entries * line_sectors` metadata sectors starting `offset` bytes into
    /// the metadata area of the volume.
    pub fn collision_table(&mut self, entries: u64, line_sectors: u64, offset: u64) {
        self.collision_table_entries = entries;
        self.line_sectors = line_sectors;
        self.metadata_offset = offset;
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
