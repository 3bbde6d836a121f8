use super::RangeState;
use crate::{
    io::{CompleteIo, IoBuffer, IoCommand, IoDirection},
    metrics::Metric,
    page_lock::LockOutcome,
    queue::PushFlags,
};
use metaio_core::{pages_to_bytes, Chunk};
use parking_lot::Mutex;
use std::sync::Arc;

/// Where a slot resumes when it is next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Take the page lock of the claimed chunk, if any, then do its I/O.
    Restart,
    /// Do the I/O of the claimed chunk. Its pages are locked if the range has a lock domain.
    Io,
}

/// One executor of a range.
///
/// The slot is owned by whichever continuation runs it next: the queue, the page lock manager
/// while waiting for a grant, or the volume while its I/O is in flight.
pub(super) struct ChunkSlot {
    range: Arc<RangeState>,
    chunk: Chunk,
    // `None` only while the buffer is lent to the volume.
    buffer: Option<IoBuffer>,
    locked: bool,
    step: Step,
}

impl ChunkSlot {
    /// Start a slot owning `buffer`.
    pub(super) fn start(range: Arc<RangeState>, buffer: IoBuffer) {
        range.hold();
        let Some(chunk) = range.claim() else {
            retire(&range, buffer);
            return;
        };

        let slot = Box::new(ChunkSlot {
            range,
            chunk,
            buffer: Some(buffer),
            locked: false,
            step: Step::Restart,
        });
        slot.restart();
    }

    fn run(self: Box<Self>) {
        match self.step {
            Step::Restart => self.restart(),
            Step::Io => self.do_io(),
        }
    }

    fn restart(mut self: Box<Self>) {
        self.step = Step::Io;
        let Some(page_lock) = self.range.page_lock.clone() else {
            return self.do_io();
        };

        let pages = self.chunk.pages();
        let queue = self.range.queue.clone();
        let parked = Arc::new(Mutex::new(None::<Box<ChunkSlot>>));
        let on_granted = {
            let parked = parked.clone();
            Box::new(move || {
                let slot = parked.lock().take();
                if let Some(mut slot) = slot {
                    slot.locked = true;
                    queue.push(Box::new(move || slot.run()), PushFlags::ALLOW_SYNC_HIGH_PRIO);
                }
            })
        };

        // the grant may fire on another thread before `lock` returns, so park the slot first.
        let range = self.range.clone();
        let chunk = self.chunk;
        *parked.lock() = Some(self);

        match page_lock.lock(pages, on_granted) {
            Ok(LockOutcome::Acquired) => {
                let slot = parked.lock().take();
                if let Some(mut slot) = slot {
                    slot.locked = true;
                    slot.do_io();
                }
            }
            Ok(LockOutcome::Pending) => {
                range.shared.metrics.count(Metric::LockWaits);
                tracing::trace!(pages = ?chunk.pages(), "waiting for metadata page lock");
            }
            Err(failure) => {
                range.fail(&chunk, failure.into());
                let slot = parked.lock().take();
                if let Some(slot) = slot {
                    slot.finish();
                }
            }
        }
    }

    fn do_io(mut self: Box<Self>) {
        let range = self.range.clone();
        let chunk = self.chunk;
        // unwrap: the buffer is only away while the I/O is in flight, and this is not it.
        let mut buffer = self.buffer.take().unwrap();
        debug_assert!(chunk.count as usize <= buffer.capacity_pages());
        buffer.set_len(pages_to_bytes(chunk.count as u64) as usize);

        if range.direction == IoDirection::Write {
            let _shard = range.shared.metadata_locks.shared(chunk.page);
            for (i, page) in chunk.pages().enumerate() {
                (range.on_page)(buffer.page_mut(i), page);
            }
        }

        tracing::trace!(
            direction = ?range.direction,
            chunk = chunk.index,
            pages = ?chunk.pages(),
            "forwarding metadata chunk"
        );
        range.shared.metrics.count(Metric::ChunkIos);

        let command = IoCommand {
            direction: range.direction,
            offset: pages_to_bytes(chunk.page as u64),
            buffer,
            flags: range.flags,
        };
        range
            .shared
            .volume
            .forward_io(command, Box::new(move |complete| self.io_end(complete)));
    }

    fn io_end(mut self: Box<Self>, complete: CompleteIo) {
        let CompleteIo { command, result } = complete;
        let mut buffer = command.buffer;
        let range = self.range.clone();
        let chunk = self.chunk;

        match result {
            Err(failure) => range.fail(&chunk, failure.into()),
            Ok(()) => {
                range
                    .shared
                    .metrics
                    .add(Metric::PagesTransferred, chunk.count as u64);
                if range.direction == IoDirection::Read {
                    for (i, page) in chunk.pages().enumerate() {
                        (range.on_page)(buffer.page_mut(i), page);
                    }
                }
            }
        }
        self.buffer = Some(buffer);

        if self.locked {
            if let Some(page_lock) = range.page_lock.as_ref() {
                page_lock.unlock(chunk.pages());
            }
            self.locked = false;
        }

        match range.claim() {
            Some(next) => {
                self.chunk = next;
                self.step = Step::Restart;
                range
                    .queue
                    .push(Box::new(move || self.run()), PushFlags::ALLOW_SYNC_HIGH_PRIO);
            }
            None => self.finish(),
        }
    }

    fn finish(self: Box<Self>) {
        let ChunkSlot { range, buffer, .. } = *self;
        // unwrap: a slot only finishes between I/Os, when its buffer is back.
        retire(&range, buffer.unwrap());
    }
}

// The slot has no more chunks: end its I/O, free its buffer and then its share of the range.
fn retire(range: &Arc<RangeState>, buffer: IoBuffer) {
    range.io_done();
    range.free_buffer(buffer);
    range.release();
}
