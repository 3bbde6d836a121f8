//! Splitting a page range into chunks.
//!
//! A range of `count` pages starting at `start` is covered by `ceil(count / max_count)` chunks.
//! Every chunk except possibly the last spans exactly `max_count` pages. Chunks are executed by a
//! pool of at most `io_limit` slots, each of which claims chunk indices one at a time.

use core::ops::Range;

/// A single chunk of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// The index of the chunk within its range.
    pub index: u32,
    /// The first page of the chunk.
    pub page: u32,
    /// The number of pages in the chunk. Never zero.
    pub count: u32,
}

impl Chunk {
    /// The pages spanned by the chunk.
    pub fn pages(&self) -> Range<u32> {
        self.page..self.page + self.count
    }
}

/// The chunking of a single range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    start: u32,
    count: u32,
    max_count: u32,
    total_chunks: u32,
    pool_width: u32,
}

impl ChunkPlan {
    /// Plan the chunking of `count` pages starting at `start`.
    ///
    /// Returns `None` if `count` is zero or the range does not fit in the page index space.
    ///
    /// Panics if `max_count` or `io_limit` is zero.
    pub fn new(start: u32, count: u32, max_count: u32, io_limit: u32) -> Option<Self> {
        assert!(max_count > 0, "chunks must span at least one page");
        assert!(io_limit > 0, "at least one chunk must be allowed in flight");

        if count == 0 || start.checked_add(count).is_none() {
            return None;
        }

        let total_chunks = count.div_ceil(max_count);
        Some(ChunkPlan {
            start,
            count,
            max_count,
            total_chunks,
            pool_width: total_chunks.min(io_limit),
        })
    }

    /// The first page of the range.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// The number of pages in the range.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The maximum number of pages of any chunk.
    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// The number of chunks covering the range.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// The number of slots executing the range, i.e. the bound on chunks in flight.
    pub fn pool_width(&self) -> u32 {
        self.pool_width
    }

    /// The chunk with the given index, or `None` once the range is exhausted.
    pub fn chunk(&self, index: u32) -> Option<Chunk> {
        if index >= self.total_chunks {
            return None;
        }

        // index < total_chunks, so this cannot exceed count.
        let skipped = index * self.max_count;
        Some(Chunk {
            index,
            page: self.start + skipped,
            count: self.max_count.min(self.count - skipped),
        })
    }

    /// The number of pages the buffer of the given slot must hold.
    ///
    /// Slot `i` first executes chunk `i`. It is only reused for chunks with an index of at least
    /// `pool_width`, and those are never larger than chunk `i`, so this is the buffer size for the
    /// whole life of the slot.
    ///
    /// Panics if `slot` is not below the pool width.
    pub fn slot_pages(&self, slot: u32) -> u32 {
        assert!(slot < self.pool_width);
        // unwrap: pool_width <= total_chunks.
        self.chunk(slot).unwrap().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn three_uneven_chunks() {
        let plan = ChunkPlan::new(0, 300, 128, 128).unwrap();
        assert_eq!(plan.total_chunks(), 3);
        assert_eq!(plan.pool_width(), 3);

        let counts: Vec<u32> = (0..3).map(|i| plan.chunk(i).unwrap().count).collect();
        assert_eq!(counts, vec![128, 128, 44]);
        assert_eq!(plan.chunk(2).unwrap().page, 256);
        assert_eq!(plan.chunk(3), None);
    }

    #[test]
    fn pool_width_is_capped_by_io_limit() {
        let plan = ChunkPlan::new(10, 64 * 1000, 64, 128).unwrap();
        assert_eq!(plan.total_chunks(), 1000);
        assert_eq!(plan.pool_width(), 128);
        assert_eq!(plan.slot_pages(127), 64);
    }

    #[test]
    fn empty_or_overflowing_ranges_have_no_plan() {
        assert_eq!(ChunkPlan::new(0, 0, 64, 128), None);
        assert_eq!(ChunkPlan::new(u32::MAX, 2, 64, 128), None);
    }

    #[test]
    fn chunk_pages_are_half_open() {
        let chunk = ChunkPlan::new(5, 10, 4, 2).unwrap().chunk(2).unwrap();
        assert_eq!(chunk.pages(), 13..15);
    }

    quickcheck! {
        fn chunks_tile_the_range(start: u16, count: u16, max_count: u8, io_limit: u8) -> bool {
            let max_count = max_count as u32 % 64 + 1;
            let io_limit = io_limit as u32 % 16 + 1;
            let Some(plan) = ChunkPlan::new(start as u32, count as u32, max_count, io_limit) else {
                return count == 0;
            };

            let mut next = start as u32;
            for i in 0..plan.total_chunks() {
                let chunk = plan.chunk(i).unwrap();
                if chunk.page != next || chunk.count == 0 || chunk.count > max_count {
                    return false;
                }
                if i >= plan.pool_width() {
                    let slot = i % plan.pool_width();
                    if chunk.count > plan.slot_pages(slot) {
                        return false;
                    }
                }
                next += chunk.count;
            }
            next == start as u32 + count as u32
        }
    }
}
