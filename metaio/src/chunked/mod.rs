//! Chunked range I/O.
//!
//! A range is executed by a fixed pool of slots. Every slot owns one buffer and repeatedly claims
//! the next chunk index from a shared cursor, runs the chunk and claims again until the range is
//! exhausted or an error has been latched. Many slots run at once, so up to `pool_width` chunks
//! are in flight.
//!
//! Two counters track the range. `remaining` counts the slots still doing I/O and fires the
//! completion callback when it reaches zero. `active` counts the slots still holding memory and
//! returns the range-state to the pool when it reaches zero. Both start at one on behalf of the
//! setup, so neither can reach zero while slots are still being started.

use crate::{
    alloc::PoolTicket,
    error::MetadataIoError,
    io::{IoBuffer, IoDirection, IoFlags},
    metrics::Metric,
    page_lock::PageLock,
    queue::Queue,
    Completion, PageEvent, Shared,
};
use metaio_core::{Chunk, ChunkPlan};
use parking_lot::Mutex;
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use self::{slot::ChunkSlot, sticky::StickyError};

mod slot;
mod sticky;

/// A request to move one range of pages.
pub(crate) struct RangeRequest {
    pub direction: IoDirection,
    pub pages: Range<u32>,
    pub flags: IoFlags,
    pub on_page: PageEvent,
    pub on_complete: Completion,
    pub page_lock: Option<Arc<dyn PageLock>>,
}

/// The state shared by all slots of a range.
struct RangeState {
    shared: Arc<Shared>,
    queue: Arc<dyn Queue>,
    direction: IoDirection,
    flags: IoFlags,
    plan: ChunkPlan,
    on_page: PageEvent,
    page_lock: Option<Arc<dyn PageLock>>,
    on_complete: Mutex<Option<Completion>>,
    error: StickyError,
    cursor: ClaimCursor,
    remaining: AtomicUsize,
    active: AtomicUsize,
    ticket: Mutex<Option<PoolTicket>>,
    started: Instant,
}

/// Start the I/O of a range.
///
/// On `Ok` the completion callback of the request is called exactly once, possibly before this
/// returns. An empty range is accepted and never completes. On `Err` nothing was started, the
/// callback is dropped and every allocation is released.
pub(crate) fn submit(
    shared: &Arc<Shared>,
    queue: &Arc<dyn Queue>,
    request: RangeRequest,
) -> Result<(), MetadataIoError> {
    let RangeRequest {
        direction,
        pages,
        flags,
        on_page,
        on_complete,
        page_lock,
    } = request;

    let count = pages.end.saturating_sub(pages.start);
    if count == 0 {
        tracing::trace!(?direction, "empty metadata range");
        return Ok(());
    }

    // unwrap: count is non-zero and start + count == pages.end fits in a u32.
    let plan = ChunkPlan::new(pages.start, count, shared.max_chunk_pages, shared.io_limit).unwrap();
    let width = plan.pool_width();

    let Some(ticket) = shared.range_pool.acquire(width as usize) else {
        tracing::debug!(?direction, ?pages, width, "range pool exhausted");
        return Err(MetadataIoError::NoMemory);
    };

    let mut buffers: Vec<IoBuffer> = Vec::new();
    if buffers.try_reserve_exact(width as usize).is_err() {
        tracing::debug!(?direction, ?pages, width, "cannot allocate range slots");
        return Err(MetadataIoError::NoMemory);
    }
    for slot in 0..width {
        match shared.allocator.alloc(plan.slot_pages(slot) as usize) {
            Some(buffer) => buffers.push(buffer),
            None => {
                tracing::debug!(?direction, ?pages, slot, "cannot allocate chunk buffer");
                for buffer in buffers {
                    shared.allocator.free(buffer);
                }
                drop(ticket);
                return Err(MetadataIoError::NoMemory);
            }
        }
    }

    tracing::debug!(
        ?direction,
        ?pages,
        chunks = plan.total_chunks(),
        width,
        "submitting metadata range"
    );
    shared.metrics.count(Metric::RangeRequests);

    let range = Arc::new(RangeState {
        shared: shared.clone(),
        queue: queue.clone(),
        direction,
        flags,
        plan,
        on_page,
        page_lock,
        on_complete: Mutex::new(Some(on_complete)),
        error: StickyError::new(),
        cursor: ClaimCursor::new(),
        remaining: AtomicUsize::new(1),
        active: AtomicUsize::new(1),
        ticket: Mutex::new(Some(ticket)),
        started: Instant::now(),
    });

    for buffer in buffers {
        ChunkSlot::start(range.clone(), buffer);
    }

    // drop the references held on behalf of the setup.
    range.io_done();
    range.release();
    Ok(())
}

/// Hands out chunk indices in increasing order.
///
/// Wider than a chunk index: every slot bumps it once past the last chunk, so it may run past
/// `u32::MAX` without handing out an index twice.
struct ClaimCursor(AtomicU64);

impl ClaimCursor {
    fn new() -> Self {
        ClaimCursor(AtomicU64::new(0))
    }

    fn claim(&self, plan: &ChunkPlan) -> Option<Chunk> {
        let index = self.0.fetch_add(1, Ordering::AcqRel);
        u32::try_from(index).ok().and_then(|index| plan.chunk(index))
    }
}

impl RangeState {
    /// Take references on behalf of a new slot.
    fn hold(&self) {
        self.remaining.fetch_add(1, Ordering::AcqRel);
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Claim the next chunk. Returns `None` once the range is exhausted or has failed.
    fn claim(&self) -> Option<Chunk> {
        if self.error.is_set() {
            return None;
        }
        self.cursor.claim(&self.plan)
    }

    fn fail(&self, chunk: &Chunk, err: MetadataIoError) {
        self.shared.metrics.count(Metric::ChunkErrors);
        if self.error.latch(err) {
            tracing::warn!(
                direction = ?self.direction,
                pages = ?chunk.pages(),
                %err,
                "metadata range failed"
            );
        } else {
            tracing::trace!(pages = ?chunk.pages(), %err, "metadata chunk failed after the range");
        }
    }

    fn free_buffer(&self, buffer: IoBuffer) {
        self.shared.allocator.free(buffer);
    }

    /// Drop one I/O reference. The last one completes the range.
    fn io_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let result = match self.error.get() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        self.shared
            .metrics
            .record(Metric::RangeTime, self.started.elapsed());
        tracing::trace!(direction = ?self.direction, ?result, "metadata range complete");

        let on_complete = self.on_complete.lock().take();
        if let Some(on_complete) = on_complete {
            on_complete(result);
        }
    }

    /// Drop one memory reference. The last one returns the range-state to the pool.
    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let ticket = self.ticket.lock().take();
        drop(ticket);
    }
}
