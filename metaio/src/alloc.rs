//! Memory for in-flight metadata I/O: chunk buffers and range-state slots.

use crate::io::IoBuffer;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Source of chunk I/O buffers.
pub trait BufferAllocator: Send + Sync {
    /// Allocate a buffer of `pages` pages, or `None` if memory is exhausted.
    fn alloc(&self, pages: usize) -> Option<IoBuffer>;

    /// Return a buffer obtained from [`BufferAllocator::alloc`].
    fn free(&self, buffer: IoBuffer);
}

/// Allocates buffers from the heap, failing instead of aborting when memory runs out.
#[derive(Default)]
pub struct HeapAllocator {
    outstanding: AtomicUsize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of buffers allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl BufferAllocator for HeapAllocator {
    fn alloc(&self, pages: usize) -> Option<IoBuffer> {
        let buffer = IoBuffer::try_new(pages)?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(buffer)
    }

    fn free(&self, buffer: IoBuffer) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        drop(buffer);
    }
}

/// The number of size classes the range pool serves: 1, 2, 4, ... 64 slots.
pub const RANGE_POOL_CLASSES: usize = 7;

/// The first size class subject to the range pool limit (16 slots). Smaller classes are unbounded.
pub const RANGE_POOL_LIMITED_CLASS: usize = 4;

/// The default number of range-states outstanding per limited size class.
pub const DEFAULT_RANGE_POOL_LIMIT: usize = 16;

/// A size-classed pool of range-state allocations.
///
/// A range executed by `n` slots is served from the class `ceil(log2(n))`. Classes of 16 slots and
/// more hold at most `limit` outstanding allocations each; once that is reached acquisition fails.
/// Ranges wider than the largest class are served by the general allocator without limit.
#[derive(Clone)]
pub struct RangePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    limit: usize,
    classes: Mutex<[usize; RANGE_POOL_CLASSES]>,
    fallback: AtomicUsize,
}

/// A range-state allocation. Dropping it returns the allocation to its [`RangePool`].
pub struct PoolTicket {
    pool: Arc<PoolInner>,
    class: Option<usize>,
}

impl RangePool {
    pub fn new(limit: usize) -> Self {
        RangePool {
            inner: Arc::new(PoolInner {
                limit,
                classes: Mutex::new([0; RANGE_POOL_CLASSES]),
                fallback: AtomicUsize::new(0),
            }),
        }
    }

    /// The size class serving a range of `slots` slots, or `None` for the general allocator.
    pub fn size_class(slots: usize) -> Option<usize> {
        let class = slots.max(1).next_power_of_two().trailing_zeros() as usize;
        (class < RANGE_POOL_CLASSES).then_some(class)
    }

    /// Acquire a range-state able to hold `slots` chunk slots.
    pub fn acquire(&self, slots: usize) -> Option<PoolTicket> {
        let class = Self::size_class(slots);
        match class {
            Some(class) => {
                let mut classes = self.inner.classes.lock();
                if class >= RANGE_POOL_LIMITED_CLASS && classes[class] >= self.inner.limit {
                    return None;
                }
                classes[class] += 1;
            }
            None => {
                self.inner.fallback.fetch_add(1, Ordering::AcqRel);
            }
        }

        Some(PoolTicket {
            pool: self.inner.clone(),
            class,
        })
    }

    /// The number of outstanding allocations in the given size class.
    pub fn in_use(&self, class: usize) -> usize {
        self.inner.classes.lock()[class]
    }

    /// The number of outstanding allocations across all classes and the general allocator.
    pub fn total_in_use(&self) -> usize {
        let pooled: usize = self.inner.classes.lock().iter().sum();
        pooled + self.inner.fallback.load(Ordering::Acquire)
    }
}

impl Drop for PoolTicket {
    fn drop(&mut self) {
        match self.class {
            Some(class) => self.pool.classes.lock()[class] -= 1,
            None => {
                self.pool.fallback.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(RangePool::size_class(1), Some(0));
        assert_eq!(RangePool::size_class(3), Some(2));
        assert_eq!(RangePool::size_class(16), Some(4));
        assert_eq!(RangePool::size_class(64), Some(6));
        assert_eq!(RangePool::size_class(65), None);
        assert_eq!(RangePool::size_class(128), None);
    }

    #[test]
    fn limited_classes_run_out() {
        let pool = RangePool::new(2);
        let a = pool.acquire(20).unwrap();
        let _b = pool.acquire(32).unwrap();
        assert!(pool.acquire(17).is_none());
        assert_eq!(pool.in_use(5), 2);

        drop(a);
        assert!(pool.acquire(17).is_some());
    }

    #[test]
    fn small_and_oversized_classes_are_unbounded() {
        let pool = RangePool::new(1);
        let small: Vec<_> = (0..10).map(|_| pool.acquire(3).unwrap()).collect();
        let large: Vec<_> = (0..10).map(|_| pool.acquire(128).unwrap()).collect();
        assert_eq!(pool.total_in_use(), 20);

        drop(small);
        drop(large);
        assert_eq!(pool.total_in_use(), 0);
    }

    #[test]
    fn heap_allocator_counts_buffers() {
        let alloc = HeapAllocator::new();
        let a = alloc.alloc(2).unwrap();
        let b = alloc.alloc(1).unwrap();
        assert_eq!(alloc.outstanding(), 2);
        alloc.free(a);
        alloc.free(b);
        assert_eq!(alloc.outstanding(), 0);
    }
}
