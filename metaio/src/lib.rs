//! Asynchronous chunked metadata I/O for block-cache storage.
//!
//! A cache device keeps its metadata in pages. [`MetadataIo`] moves contiguous ranges of those
//! pages between memory and a [`io::Volume`], splitting every range into chunks no larger than the
//! volume accepts and keeping a bounded number of chunks in flight. On writes every page is
//! filled from in-memory state right before its chunk is submitted. On reads every page is handed
//! to the caller when its chunk completes. A single completion callback reports the outcome of
//! the whole range.
//!
//! Atomic-write devices store part of their metadata in per-sector metadata areas instead.
//! [`MetadataIo::submit_sequential_atomic`] walks that area strictly in order.

use std::{ops::Range, sync::Arc};

pub use error::{IoFailure, LockFailure, MetadataIoError};
pub use metadata_lock::MetadataLocks;
pub use metrics::{Metric, Metrics};
pub use options::Options;
pub use page_lock::{LockOutcome, PageLock, PageLockManager};
pub use queue::{InlineQueue, PushFlags, Queue, ThreadQueue};

use crate::{
    alloc::{BufferAllocator, HeapAllocator, RangePool},
    io::{IoDirection, IoFlags, Volume},
};

pub mod alloc;
mod atomic;
mod chunked;
mod error;
pub mod io;
pub mod metadata_lock;
mod metrics;
mod options;
pub mod page_lock;
pub mod queue;

pub(crate) type PageEvent = Arc<dyn Fn(&mut [u8], u32) + Send + Sync>;
pub(crate) type Completion = Box<dyn FnOnce(Result<(), MetadataIoError>) + Send>;

struct Shared {
    volume: Arc<dyn Volume>,
    allocator: Arc<dyn BufferAllocator>,
    range_pool: RangePool,
    metadata_locks: MetadataLocks,
    metrics: Metrics,
    io_limit: u32,
    max_chunk_pages: u32,
    collision_table_sectors: u64,
    metadata_offset: u64,
}

/// The metadata I/O engine of one cache device.
///
/// This is cheap to clone. All clones share the same volume, pools and locks.
#[derive(Clone)]
pub struct MetadataIo {
    shared: Arc<Shared>,
}

impl MetadataIo {
    /// Create an engine issuing I/O against `volume`, allocating chunk buffers from the heap.
    pub fn new(volume: Arc<dyn Volume>, options: Options) -> anyhow::Result<Self> {
        Self::with_allocator(volume, Arc::new(HeapAllocator::new()), options)
    }

    /// Create an engine allocating chunk buffers from `allocator`.
    pub fn with_allocator(
        volume: Arc<dyn Volume>,
        allocator: Arc<dyn BufferAllocator>,
        options: Options,
    ) -> anyhow::Result<Self> {
        let max_chunk_pages =
            metaio_core::max_chunk_pages(volume.max_io_size()).min(options.max_chunk_pages);
        if max_chunk_pages == 0 {
            anyhow::bail!(
                "volume accepts I/Os of at most {} bytes, less than a metadata page",
                volume.max_io_size()
            );
        }
        if options.line_sectors == 0 {
            anyhow::bail!("collision table lines must span at least one sector");
        }
        let Some(collision_table_sectors) = options
            .collision_table_entries
            .checked_mul(options.line_sectors)
        else {
            anyhow::bail!(
                "collision table of {} entries of {} sectors is too large",
                options.collision_table_entries,
                options.line_sectors
            );
        };

        tracing::debug!(
            max_chunk_pages,
            io_limit = options.io_limit,
            shards = options.metadata_lock_shards,
            "metadata I/O engine created"
        );

        Ok(MetadataIo {
            shared: Arc::new(Shared {
                volume,
                allocator,
                range_pool: RangePool::new(options.range_pool_limit),
                metadata_locks: MetadataLocks::new(options.metadata_lock_shards),
                metrics: Metrics::new(options.metrics),
                io_limit: options.io_limit,
                max_chunk_pages,
                collision_table_sectors,
                metadata_offset: options.metadata_offset,
            }),
        })
    }

    /// The maximum number of pages a single chunk spans.
    pub fn max_chunk_pages(&self) -> u32 {
        self.shared.max_chunk_pages
    }

    /// The locks over the in-memory metadata.
    ///
    /// Writes hold a shard shared while filling a chunk. Code mutating the in-memory metadata
    /// should hold the affected shards exclusively.
    pub fn metadata_locks(&self) -> &MetadataLocks {
        &self.shared.metadata_locks
    }

    /// The pool range-states are drawn from.
    pub fn range_pool(&self) -> &RangePool {
        &self.shared.range_pool
    }

    /// The metrics collected by this engine.
    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Write the pages `pages` to the volume.
    ///
    /// `fill` is called once for every page, right before the chunk containing it is submitted,
    /// with the page buffer and the page index. If `page_lock` is given, every chunk holds its
    /// pages in that domain from before filling until its I/O completes.
    ///
    /// On `Ok`, `on_complete` is called exactly once with the first error of the range, or
    /// `Ok(())`, possibly before this returns. An empty range is a no-op and `on_complete` is
    /// never called. On `Err` nothing was submitted.
    pub fn submit_write(
        &self,
        queue: &Arc<dyn Queue>,
        pages: Range<u32>,
        flags: IoFlags,
        fill: impl Fn(&mut [u8], u32) + Send + Sync + 'static,
        on_complete: impl FnOnce(Result<(), MetadataIoError>) + Send + 'static,
        page_lock: Option<Arc<dyn PageLock>>,
    ) -> Result<(), MetadataIoError> {
        chunked::submit(
            &self.shared,
            queue,
            chunked::RangeRequest {
                direction: IoDirection::Write,
                pages,
                flags,
                on_page: Arc::new(fill),
                on_complete: Box::new(on_complete),
                page_lock,
            },
        )
    }

    /// Read the pages `pages` from the volume.
    ///
    /// `drain` is called once for every page after the chunk containing it was read
    /// successfully. Pages of different chunks are drained in no particular order.
    ///
    /// Completion is reported as for [`MetadataIo::submit_write`].
    pub fn submit_read(
        &self,
        queue: &Arc<dyn Queue>,
        pages: Range<u32>,
        flags: IoFlags,
        drain: impl Fn(&mut [u8], u32) + Send + Sync + 'static,
        on_complete: impl FnOnce(Result<(), MetadataIoError>) + Send + 'static,
    ) -> Result<(), MetadataIoError> {
        chunked::submit(
            &self.shared,
            queue,
            chunked::RangeRequest {
                direction: IoDirection::Read,
                pages,
                flags,
                on_page: Arc::new(drain),
                on_complete: Box::new(on_complete),
                page_lock: None,
            },
        )
    }

    /// Read the collision table from the metadata area of an atomic-write device.
    ///
    /// The table is read one page worth of sectors at a time, with a single I/O in flight.
    /// `drain` receives the first sector, the sector count and the bytes of every step in
    /// increasing sector order. The first error aborts the walk.
    ///
    /// On `Ok`, `on_complete` is called exactly once, also for an empty table. On `Err` nothing
    /// was submitted.
    pub fn submit_sequential_atomic(
        &self,
        queue: &Arc<dyn Queue>,
        drain: impl FnMut(u64, u64, &[u8]) + Send + 'static,
        on_complete: impl FnOnce(Result<(), MetadataIoError>) + Send + 'static,
    ) -> Result<(), MetadataIoError> {
        atomic::submit(&self.shared, queue, Box::new(drain), Box::new(on_complete))
    }
}
