//! Work queues executing metadata I/O continuations.
//!
//! A continuation is pushed with two independent hints: it may be run synchronously on the
//! pushing thread, and it should be run ahead of normal priority work. Queues are free to honour
//! or ignore either hint; the engine is correct either way.

use crossbeam_channel::{Receiver, Sender};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    panic::AssertUnwindSafe,
};
use threadpool::ThreadPool;

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Scheduling hints given with every pushed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushFlags {
    /// The job may run on the pushing thread before `push` returns.
    pub allow_sync: bool,
    /// The job should run before normal priority jobs.
    pub high_priority: bool,
}

impl PushFlags {
    /// The flags the engine pushes all of its continuations with.
    pub const ALLOW_SYNC_HIGH_PRIO: PushFlags = PushFlags {
        allow_sync: true,
        high_priority: true,
    };
}

/// A work queue.
pub trait Queue: Send + Sync {
    fn push(&self, job: Job, flags: PushFlags);
}

thread_local! {
    static TRAMPOLINE: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
    static SYNC_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// A queue running every job on the pushing thread.
///
/// Jobs pushed while another job of the same thread is running are deferred until it returns, so
/// arbitrarily long chains of continuations run in constant stack depth. High priority jobs go to
/// the front of the deferred list.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl Queue for InlineQueue {
    fn push(&self, job: Job, flags: PushFlags) {
        let mut job = Some(job);
        let outermost = TRAMPOLINE.with(|t| {
            let mut t = t.borrow_mut();
            match t.as_mut() {
                Some(pending) => {
                    if let Some(job) = job.take() {
                        if flags.high_priority {
                            pending.push_front(job);
                        } else {
                            pending.push_back(job);
                        }
                    }
                    false
                }
                None => {
                    *t = Some(VecDeque::new());
                    true
                }
            }
        });
        if !outermost {
            return;
        }

        struct Reset;
        impl Drop for Reset {
            fn drop(&mut self) {
                TRAMPOLINE.with(|t| *t.borrow_mut() = None);
            }
        }
        let _reset = Reset;

        let mut next = job;
        while let Some(job) = next {
            job();
            next = TRAMPOLINE.with(|t| t.borrow_mut().as_mut().and_then(|p| p.pop_front()));
        }
    }
}

/// The maximum nesting of synchronously executed jobs on one thread before [`ThreadQueue`]
/// defers to its workers.
pub const MAX_SYNC_DEPTH: usize = 8;

/// A queue served by a pool of worker threads, with a high priority lane drained first.
///
/// Jobs pushed with `allow_sync` run on the pushing thread unless that thread is already
/// [`MAX_SYNC_DEPTH`] synchronous jobs deep.
///
/// Dropping the queue disconnects the workers once the queued jobs are drained.
pub struct ThreadQueue {
    high: Sender<Job>,
    normal: Sender<Job>,
    _workers_tp: ThreadPool,
}

impl ThreadQueue {
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0);
        let (high, high_rx) = crossbeam_channel::unbounded();
        let (normal, normal_rx) = crossbeam_channel::unbounded();
        let workers_tp = ThreadPool::with_name("metaio-queue".into(), workers);
        for _ in 0..workers {
            spawn_worker(&workers_tp, high_rx.clone(), normal_rx.clone());
        }

        ThreadQueue {
            high,
            normal,
            _workers_tp: workers_tp,
        }
    }
}

impl Queue for ThreadQueue {
    fn push(&self, job: Job, flags: PushFlags) {
        if flags.allow_sync && SYNC_DEPTH.with(|d| d.get()) < MAX_SYNC_DEPTH {
            SYNC_DEPTH.with(|d| d.set(d.get() + 1));
            run_job(job);
            SYNC_DEPTH.with(|d| d.set(d.get() - 1));
            return;
        }

        let lane = if flags.high_priority {
            &self.high
        } else {
            &self.normal
        };
        if lane.send(job).is_err() {
            tracing::warn!("job pushed to a queue without workers");
        }
    }
}

fn spawn_worker(workers_tp: &ThreadPool, high_rx: Receiver<Job>, normal_rx: Receiver<Job>) {
    let work = move || loop {
        let job = match high_rx.try_recv() {
            Ok(job) => Ok(job),
            Err(_) => crossbeam_channel::select! {
                recv(high_rx) -> job => job,
                recv(normal_rx) -> job => job,
            },
        };
        match job {
            Ok(job) => run_job(job),
            Err(_) => return,
        }
    };

    workers_tp.execute(work);
}

fn run_job(job: Job) {
    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("metadata I/O job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn inline_queue_defers_nested_jobs() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        InlineQueue.push(
            Box::new(move || {
                let o1 = o.clone();
                InlineQueue.push(Box::new(move || o1.lock().push(2)), PushFlags::default());
                let o2 = o.clone();
                InlineQueue.push(
                    Box::new(move || o2.lock().push(1)),
                    PushFlags::ALLOW_SYNC_HIGH_PRIO,
                );
                o.lock().push(0);
            }),
            PushFlags::default(),
        );
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn inline_queue_chain_does_not_grow_the_stack() {
        fn chain(left: usize, count: Arc<AtomicUsize>) {
            count.fetch_add(1, Ordering::Relaxed);
            if left > 0 {
                InlineQueue.push(
                    Box::new(move || chain(left - 1, count)),
                    PushFlags::ALLOW_SYNC_HIGH_PRIO,
                );
            }
        }
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        InlineQueue.push(Box::new(move || chain(100_000, c)), PushFlags::default());
        assert_eq!(count.load(Ordering::Relaxed), 100_001);
    }

    #[test]
    fn thread_queue_runs_deferred_jobs_on_workers() {
        let queue = ThreadQueue::new(2);
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..32 {
            let tx = tx.clone();
            queue.push(
                Box::new(move || {
                    let _ = tx.send(i);
                }),
                PushFlags::default(),
            );
        }
        let mut got: Vec<i32> = (0..32).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn thread_queue_drains_high_priority_first() {
        let queue = ThreadQueue::new(1);
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        queue.push(
            Box::new(move || {
                let _ = started_tx.send(());
                let _ = gate_rx.recv();
            }),
            PushFlags::default(),
        );
        // the only worker is now busy, so everything below is queued.
        started_rx.recv().unwrap();

        let high = PushFlags {
            allow_sync: false,
            high_priority: true,
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        for (i, flags) in (0..8).map(|i| (i, if i < 4 { PushFlags::default() } else { high })) {
            let tx = tx.clone();
            queue.push(
                Box::new(move || {
                    let _ = tx.send(i);
                }),
                flags,
            );
        }
        gate_tx.send(()).unwrap();

        let order: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec![4, 5, 6, 7, 0, 1, 2, 3]);
    }

    #[test]
    fn thread_queue_bounds_synchronous_nesting() {
        fn nest(queue: Arc<ThreadQueue>, depth: usize, max: Arc<AtomicUsize>, done: Sender<()>) {
            max.fetch_max(depth, Ordering::Relaxed);
            if depth == 64 {
                let _ = done.send(());
                return;
            }
            let q = queue.clone();
            queue.push(
                Box::new(move || nest(q, depth + 1, max, done)),
                PushFlags::ALLOW_SYNC_HIGH_PRIO,
            );
        }

        let queue = Arc::new(ThreadQueue::new(1));
        let max = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam_channel::bounded(1);
        nest(queue.clone(), 0, max.clone(), tx);
        rx.recv().unwrap();
        assert_eq!(max.load(Ordering::Relaxed), 64);
        assert_eq!(SYNC_DEPTH.with(|d| d.get()), 0);
    }
}
