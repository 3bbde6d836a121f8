use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Metrics collector, if active, it provides Counters and Timers
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Counter of ranges accepted for I/O
    RangeRequests,
    /// Counter of chunk I/Os submitted to the volume
    ChunkIos,
    /// Counter of pages moved by successful chunk I/Os
    PagesTransferred,
    /// Counter of chunks which had to wait for their page lock
    LockWaits,
    /// Counter of chunks which failed, whether or not their error was the one reported
    ChunkErrors,
    /// Timer used to record average range latency, from submission to completion
    RangeTime,
}

struct ActiveMetrics {
    range_requests: AtomicU64,
    chunk_ios: AtomicU64,
    pages_transferred: AtomicU64,
    lock_waits: AtomicU64,
    chunk_errors: AtomicU64,
    range_time: Timer,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    range_requests: AtomicU64::new(0),
                    chunk_ios: AtomicU64::new(0),
                    pages_transferred: AtomicU64::new(0),
                    lock_waits: AtomicU64::new(0),
                    chunk_errors: AtomicU64::new(0),
                    range_time: Timer::new(),
                }))
            } else {
                None
            },
        }
    }

    /// Increase the Counter specified by the input
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count(&self, metric: Metric) {
        self.add(metric, 1);
    }

    /// Increase the Counter specified by the input by `n`
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn add(&self, metric: Metric, n: u64) {
        if let Some(ref metrics) = self.metrics {
            metrics.counter(metric).fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record a duration measured by the caller
    ///
    /// panics if the specified [`Metric`] is not a Timer
    pub fn record(&self, metric: Metric, elapsed: Duration) {
        if let Some(ref metrics) = self.metrics {
            let timer = match metric {
                Metric::RangeTime => &metrics.range_time,
                _ => panic!("Specified metric is not a Timer"),
            };
            timer.record(elapsed);
        }
    }

    /// The current value of a Counter, or `None` if collection is not active
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn get(&self, metric: Metric) -> Option<u64> {
        self.metrics
            .as_ref()
            .map(|metrics| metrics.counter(metric).load(Ordering::Relaxed))
    }

    /// Print collected metrics to stdout
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let range_requests = metrics.range_requests.load(Ordering::Relaxed);
            println!("  range requests        {}", range_requests);

            let chunk_ios = metrics.chunk_ios.load(Ordering::Relaxed);
            println!("  chunk I/Os            {}", chunk_ios);

            let pages = metrics.pages_transferred.load(Ordering::Relaxed);
            println!("  pages transferred     {}", pages);

            if chunk_ios != 0 {
                let lock_waits = metrics.lock_waits.load(Ordering::Relaxed);
                let percentage_lock_waits = (lock_waits as f64 / chunk_ios as f64) * 100.0;
                println!(
                    "  lock waits            {} - {:.2}% of chunk I/Os",
                    lock_waits, percentage_lock_waits
                );
            }

            let chunk_errors = metrics.chunk_errors.load(Ordering::Relaxed);
            println!("  chunk errors          {}", chunk_errors);

            if let Some(mean) = metrics.range_time.mean() {
                println!("  range time mean       {}", pretty_display_ns(mean));
            }
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

impl ActiveMetrics {
    fn counter(&self, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::RangeRequests => &self.range_requests,
            Metric::ChunkIos => &self.chunk_ios,
            Metric::PagesTransferred => &self.pages_transferred,
            Metric::LockWaits => &self.lock_waits,
            Metric::ChunkErrors => &self.chunk_errors,
            _ => panic!("Specified metric is not a Counter"),
        }
    }
}

fn pretty_display_ns(ns: u64) -> String {
    // preserve 3 sig figs at minimum.
    let (val, unit) = if ns > 100 * 1_000_000_000 {
        (ns / 1_000_000_000, "s")
    } else if ns > 100 * 1_000_000 {
        (ns / 1_000_000, "ms")
    } else if ns > 100 * 1_000 {
        (ns / 1_000, "us")
    } else {
        (ns, "ns")
    };

    format!("{val} {unit}")
}

struct Timer {
    number_of_records: AtomicU64,
    sum: AtomicU64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            number_of_records: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn mean(&self) -> Option<u64> {
        let n = self.number_of_records.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        sum.checked_div(n)
    }

    fn record(&self, elapsed: Duration) {
        self.number_of_records.fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }
}
