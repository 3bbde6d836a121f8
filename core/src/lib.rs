//! Core geometry of chunked metadata I/O.
//!
//! This crate decides how a contiguous range of metadata pages is split into bounded chunks
//! and how the collision table of an atomic-write device is walked in sector steps. It performs
//! no I/O, does no allocation and does not require the standard library.

#![cfg_attr(not(test), no_std)]

pub mod chunk;
pub mod sectors;

pub use chunk::{Chunk, ChunkPlan};
pub use sectors::{SectorStep, SectorSteps};

/// The size of a metadata page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The size of the per-sector metadata unit of atomic-write devices, in bytes.
pub const ATOMIC_METADATA_SIZE: usize = 512;

/// The number of atomic metadata sectors which fit in one page.
pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE / ATOMIC_METADATA_SIZE) as u64;

/// The default upper bound on the number of chunks of a single range that may be in flight.
pub const IO_REQS_LIMIT: u32 = 128;

/// The width of the per-chunk page lock status word.
///
/// A chunk never spans more pages than this.
pub const LOCK_STATUS_BITS: u32 = u64::BITS;

/// Convert a number of pages to a number of bytes.
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages * PAGE_SIZE as u64
}

/// Convert a number of atomic metadata sectors to a number of bytes.
pub const fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors * ATOMIC_METADATA_SIZE as u64
}

/// The maximum number of pages a single chunk may span on a volume with the given maximum I/O
/// size.
///
/// This is bounded both by the volume and by [`LOCK_STATUS_BITS`].
pub fn max_chunk_pages(volume_max_io_bytes: usize) -> u32 {
    let volume_pages = (volume_max_io_bytes / PAGE_SIZE).min(u32::MAX as usize) as u32;
    volume_pages.min(LOCK_STATUS_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_chunk_is_bounded_by_lock_status_word() {
        assert_eq!(max_chunk_pages(1 << 20), 64);
        assert_eq!(max_chunk_pages(128 * 1024), 32);
        assert_eq!(max_chunk_pages(PAGE_SIZE), 1);
        assert_eq!(max_chunk_pages(PAGE_SIZE - 1), 0);
    }

    #[test]
    fn byte_conversions() {
        assert_eq!(pages_to_bytes(3), 3 * 4096);
        assert_eq!(sectors_to_bytes(SECTORS_PER_PAGE), PAGE_SIZE as u64);
    }
}
