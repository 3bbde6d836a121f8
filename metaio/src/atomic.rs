//! Sequential reader of the collision table of atomic-write devices.
//!
//! Only one page worth of sectors is in flight at any time, and steps are issued in increasing
//! sector order, so the drain callback sees the table strictly in order.

use crate::{
    error::MetadataIoError,
    io::{CompleteIo, IoBuffer, IoCommand, IoDirection, IoFlags},
    queue::{PushFlags, Queue},
    Completion, Shared,
};
use metaio_core::{sectors_to_bytes, SectorStep, SectorSteps, SECTORS_PER_PAGE};
use std::sync::Arc;

/// Callback receiving every step of the walk: first sector, sector count and the sectors.
pub(crate) type SectorDrain = Box<dyn FnMut(u64, u64, &[u8]) + Send>;

struct AtomicRead {
    shared: Arc<Shared>,
    queue: Arc<dyn Queue>,
    steps: SectorSteps,
    // `None` only while the buffer is lent to the volume.
    buffer: Option<IoBuffer>,
    drain: SectorDrain,
    on_complete: Option<Completion>,
}

pub(crate) fn submit(
    shared: &Arc<Shared>,
    queue: &Arc<dyn Queue>,
    drain: SectorDrain,
    on_complete: Completion,
) -> Result<(), MetadataIoError> {
    let Some(buffer) = shared.allocator.alloc(1) else {
        tracing::debug!("cannot allocate collision table buffer");
        return Err(MetadataIoError::NoMemory);
    };

    let total = shared.collision_table_sectors;
    tracing::debug!(sectors = total, "reading collision table");

    let read = Box::new(AtomicRead {
        shared: shared.clone(),
        queue: queue.clone(),
        steps: SectorSteps::new(total, SECTORS_PER_PAGE),
        buffer: Some(buffer),
        drain,
        on_complete: Some(on_complete),
    });
    queue.push(Box::new(move || read.step()), PushFlags::ALLOW_SYNC_HIGH_PRIO);
    Ok(())
}

impl AtomicRead {
    fn step(mut self: Box<Self>) {
        let Some(step) = self.steps.next() else {
            return self.complete(Ok(()));
        };

        // unwrap: only one step is in flight and it has returned the buffer.
        let mut buffer = self.buffer.take().unwrap();
        buffer.set_len(sectors_to_bytes(step.count) as usize);

        let command = IoCommand {
            direction: IoDirection::Read,
            offset: self.shared.metadata_offset + sectors_to_bytes(step.offset),
            buffer,
            flags: IoFlags::default(),
        };
        tracing::trace!(offset = step.offset, count = step.count, "reading atomic metadata");

        let shared = self.shared.clone();
        shared.volume.forward_metadata(
            command,
            Box::new(move |complete| self.step_end(step, complete)),
        );
    }

    fn step_end(mut self: Box<Self>, step: SectorStep, complete: CompleteIo) {
        let CompleteIo { command, result } = complete;
        let buffer = command.buffer;

        if let Err(failure) = result {
            tracing::warn!(
                offset = step.offset,
                count = step.count,
                code = failure.0,
                "collision table read failed"
            );
            self.buffer = Some(buffer);
            return self.complete(Err(failure.into()));
        }

        (self.drain)(step.offset, step.count, buffer.as_slice());
        self.buffer = Some(buffer);

        if self.steps.remaining() == 0 {
            return self.complete(Ok(()));
        }
        let queue = self.queue.clone();
        queue.push(Box::new(move || self.step()), PushFlags::ALLOW_SYNC_HIGH_PRIO);
    }

    fn complete(mut self: Box<Self>, result: Result<(), MetadataIoError>) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(result);
        }
        if let Some(buffer) = self.buffer.take() {
            self.shared.allocator.free(buffer);
        }
    }
}
