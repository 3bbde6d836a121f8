use super::{check_bounds, CompleteIo, IoCommand, IoDirection, IoDone, Volume};
use crate::error::IoFailure;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// The byte a fresh [`RamVolume`] is filled with, so that reads of never-written areas stand out.
pub const VOLUME_POISON: u8 = 0x13;

const DEFAULT_MAX_IO_SIZE: usize = 128 * 1024;

/// Counters of the I/O a volume has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
}

/// A volume held in memory. Every I/O completes before `forward_io` returns.
pub struct RamVolume {
    data: RwLock<Vec<u8>>,
    metadata: RwLock<Vec<u8>>,
    max_io_size: usize,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamVolume {
    /// Create a volume of `length` bytes, poisoned, with a 128 KiB maximum I/O size and no
    /// metadata area.
    pub fn new(length: usize) -> Self {
        RamVolume {
            data: RwLock::new(vec![VOLUME_POISON; length]),
            metadata: RwLock::new(Vec::new()),
            max_io_size: DEFAULT_MAX_IO_SIZE,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn with_max_io_size(mut self, max_io_size: usize) -> Self {
        self.max_io_size = max_io_size;
        self
    }

    /// Give the volume a separate per-sector metadata area of `length` bytes, as atomic-write
    /// devices have.
    pub fn with_metadata_area(self, length: usize) -> Self {
        *self.metadata.write() = vec![VOLUME_POISON; length];
        self
    }

    /// Copy `data` into the volume at `offset`, bypassing the I/O path.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.data.write()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy `len` bytes at `offset` out of the volume, bypassing the I/O path.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.read()[offset..offset + len].to_vec()
    }

    /// Copy `data` into the metadata area at `offset`.
    pub fn write_metadata_at(&self, offset: usize, data: &[u8]) {
        self.metadata.write()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn stats(&self) -> IoStats {
        IoStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    fn execute(&self, area: &RwLock<Vec<u8>>, command: &mut IoCommand) -> Result<(), IoFailure> {
        let range = command.byte_range();
        let (start, end) = (range.start as usize, range.end as usize);
        match command.direction {
            IoDirection::Read => {
                let area = area.read();
                check_bounds(command, area.len() as u64, self.max_io_size)?;
                command.buffer.as_mut_slice().copy_from_slice(&area[start..end]);
                self.reads.fetch_add(1, Ordering::Relaxed);
            }
            IoDirection::Write => {
                let mut area = area.write();
                check_bounds(command, area.len() as u64, self.max_io_size)?;
                area[start..end].copy_from_slice(command.buffer.as_slice());
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Volume for RamVolume {
    fn length(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn max_io_size(&self) -> usize {
        self.max_io_size
    }

    fn forward_io(&self, mut command: IoCommand, done: IoDone) {
        let result = self.execute(&self.data, &mut command);
        done(CompleteIo { command, result });
    }

    fn forward_metadata(&self, mut command: IoCommand, done: IoDone) {
        let result = self.execute(&self.metadata, &mut command);
        done(CompleteIo { command, result });
    }
}
