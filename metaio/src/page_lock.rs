//! Asynchronous multi-page locks serializing metadata I/O on overlapping page ranges.
//!
//! A request asks for every page of a range. If all of them are free it is granted on the spot.
//! Otherwise it takes the free pages in increasing page order up to the first busy one, queues for
//! that page and continues from there when the page is handed over. Since every request acquires
//! pages in the same order, overlapping requests cannot deadlock, and within a page waiters are
//! served first come, first served.

use crate::error::LockFailure;
use bitvec::prelude::*;
use metaio_core::LOCK_STATUS_BITS;
use parking_lot::Mutex;
use slab::Slab;
use std::{
    collections::{HashMap, VecDeque},
    ops::Range,
};

/// Continuation invoked once a pending request owns all of its pages.
pub type LockGranted = Box<dyn FnOnce() + Send>;

/// The immediate result of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every page is held. The continuation was dropped without being called.
    Acquired,
    /// The continuation will be called once every page is held.
    Pending,
}

/// A lock domain over metadata pages.
pub trait PageLock: Send + Sync {
    /// Request every page of `pages`.
    fn lock(&self, pages: Range<u32>, on_granted: LockGranted) -> Result<LockOutcome, LockFailure>;

    /// Release every page of `pages`, which must be held by a granted request for exactly that
    /// range.
    fn unlock(&self, pages: Range<u32>);
}

/// A [`PageLock`] over the pages `0..page_count`.
pub struct PageLockManager {
    page_count: u32,
    state: Mutex<LockState>,
}

struct LockState {
    held: BitVec,
    waiters: HashMap<u32, VecDeque<usize>>,
    pending: Slab<PendingLock>,
}

struct PendingLock {
    pages: Range<u32>,
    next: u32,
    // bit `i` set: page `pages.start + i` is held by this request.
    status: u64,
    on_granted: Option<LockGranted>,
}

impl PendingLock {
    fn is_complete(&self) -> bool {
        self.next == self.pages.end
    }
}

impl PageLockManager {
    pub fn new(page_count: u32) -> Self {
        PageLockManager {
            page_count,
            state: Mutex::new(LockState {
                held: bitvec![0; page_count as usize],
                waiters: HashMap::new(),
                pending: Slab::new(),
            }),
        }
    }

    /// Whether the given page is currently held. Pages outside the domain are never held.
    pub fn is_locked(&self, page: u32) -> bool {
        self.state
            .lock()
            .held
            .get(page as usize)
            .is_some_and(|held| *held)
    }

    /// The number of requests waiting for at least one page.
    pub fn waiting(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl LockState {
    // Take free pages for `key` in order. Returns true once it holds the whole range.
    fn acquire_from(&mut self, key: usize) -> bool {
        loop {
            let request = &mut self.pending[key];
            if request.is_complete() {
                return true;
            }
            let page = request.next;
            if self.held[page as usize] {
                self.waiters.entry(page).or_default().push_back(key);
                return false;
            }
            self.held.set(page as usize, true);
            let request = &mut self.pending[key];
            request.status |= 1 << (page - request.pages.start);
            request.next += 1;
        }
    }
}

impl PageLock for PageLockManager {
    fn lock(&self, pages: Range<u32>, on_granted: LockGranted) -> Result<LockOutcome, LockFailure> {
        if pages.is_empty()
            || pages.end > self.page_count
            || pages.len() > LOCK_STATUS_BITS as usize
        {
            return Err(LockFailure(-libc::EINVAL));
        }

        let mut state = self.state.lock();
        if state.held[pages.start as usize..pages.end as usize].not_any() {
            state.held[pages.start as usize..pages.end as usize].fill(true);
            return Ok(LockOutcome::Acquired);
        }

        let key = state.pending.insert(PendingLock {
            next: pages.start,
            pages,
            status: 0,
            on_granted: Some(on_granted),
        });
        if state.acquire_from(key) {
            // A busy page was seen above, and nothing can be released while we hold the mutex.
            unreachable!("lock request completed without waiting");
        }
        Ok(LockOutcome::Pending)
    }

    fn unlock(&self, pages: Range<u32>) {
        let mut granted = Vec::new();
        {
            let mut state = self.state.lock();
            for page in pages {
                debug_assert!(state.held[page as usize], "unlocking a free page");
                let next_waiter = state.waiters.get_mut(&page).and_then(|w| w.pop_front());
                if state.waiters.get(&page).is_some_and(|w| w.is_empty()) {
                    state.waiters.remove(&page);
                }

                let Some(key) = next_waiter else {
                    state.held.set(page as usize, false);
                    continue;
                };

                // hand the page straight over.
                let request = &mut state.pending[key];
                request.status |= 1 << (page - request.pages.start);
                request.next += 1;
                if state.acquire_from(key) {
                    let mut request = state.pending.remove(key);
                    debug_assert_eq!(
                        request.status.count_ones() as usize,
                        request.pages.len(),
                        "granted without holding every page"
                    );
                    if let Some(on_granted) = request.on_granted.take() {
                        granted.push(on_granted);
                    }
                }
            }
        }

        for on_granted in granted {
            on_granted();
        }
    }
}
