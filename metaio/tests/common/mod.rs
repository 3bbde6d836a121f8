use metaio::{
    alloc::{BufferAllocator, HeapAllocator},
    io::{CompleteIo, IoBuffer, IoCommand, IoDone, RamVolume, Volume, PAGE_SIZE},
    queue::Job,
    IoFailure, MetadataIo, MetadataIoError, Options, PushFlags, Queue,
};
use parking_lot::Mutex;
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

pub type Outcome = Result<(), MetadataIoError>;

/// Install a subscriber printing engine logs, filtered by `RUST_LOG`.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A seeded RNG, so failures can be replayed.
#[allow(dead_code)]
pub fn rng(seed: u64) -> rand_pcg::Pcg64 {
    use rand::SeedableRng as _;
    rand_pcg::Pcg64::seed_from_u64(seed)
}

#[allow(dead_code)]
pub fn engine(volume: Arc<dyn Volume>, options: Options) -> MetadataIo {
    MetadataIo::new(volume, options).unwrap()
}

#[allow(dead_code)]
pub fn options(max_chunk_pages: u32, io_limit: u32) -> Options {
    let mut options = Options::new();
    options.max_chunk_pages(max_chunk_pages);
    options.io_limit(io_limit);
    options.metrics(true);
    options
}

/// A RAM volume able to hold `pages` metadata pages, accepting I/Os of up to 64 pages.
#[allow(dead_code)]
pub fn ram_volume(pages: usize) -> Arc<RamVolume> {
    Arc::new(RamVolume::new(pages * PAGE_SIZE).with_max_io_size(64 * PAGE_SIZE))
}

/// The byte pattern of a page written by a test.
#[allow(dead_code)]
pub fn page_pattern(page: u32, generation: u8) -> Vec<u8> {
    let mut data = vec![generation; PAGE_SIZE];
    data[..4].copy_from_slice(&page.to_le_bytes());
    data
}

#[allow(dead_code)]
pub fn fill_pattern(generation: u8) -> impl Fn(&mut [u8], u32) + Send + Sync + 'static {
    move |buf: &mut [u8], page: u32| buf.copy_from_slice(&page_pattern(page, generation))
}

/// Records the outcome of every completed request.
#[derive(Clone, Default)]
pub struct Completions(Arc<Mutex<Vec<Outcome>>>);

#[allow(dead_code)]
impl Completions {
    pub fn callback(&self) -> impl FnOnce(Outcome) + Send + 'static {
        let outcomes = self.0.clone();
        move |outcome: Outcome| outcomes.lock().push(outcome)
    }

    pub fn get(&self) -> Vec<Outcome> {
        self.0.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().len()
    }
}

/// Records every page handed to a page callback, with the first word of its contents.
#[derive(Clone, Default)]
pub struct PageLog(Arc<Mutex<Vec<(u32, u32)>>>);

#[allow(dead_code)]
impl PageLog {
    pub fn drain(&self) -> impl Fn(&mut [u8], u32) + Send + Sync + 'static {
        let log = self.0.clone();
        move |buf: &mut [u8], page: u32| {
            assert_eq!(buf.len(), PAGE_SIZE);
            let word = u32::from_le_bytes(buf[..4].try_into().unwrap());
            log.lock().push((page, word));
        }
    }

    pub fn pages(&self) -> Vec<u32> {
        self.0.lock().iter().map(|(page, _)| *page).collect()
    }

    pub fn sorted_pages(&self) -> Vec<u32> {
        let mut pages = self.pages();
        pages.sort_unstable();
        pages
    }

    /// Whether every page logged carried its own index in its first word.
    pub fn contents_match(&self) -> bool {
        self.0.lock().iter().all(|(page, word)| page == word)
    }
}

/// A queue which only runs jobs when told to.
#[derive(Default)]
pub struct ManualQueue {
    jobs: Mutex<VecDeque<Job>>,
}

#[allow(dead_code)]
impl ManualQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Run the oldest job. Returns false if there was none.
    pub fn run_next(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run a randomly chosen job. Returns false if there was none.
    pub fn run_random(&self, rng: &mut impl rand::Rng) -> bool {
        let job = {
            let mut jobs = self.jobs.lock();
            if jobs.is_empty() {
                return false;
            }
            let index = rng.gen_range(0..jobs.len());
            jobs.remove(index)
        };
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, including jobs pushed by jobs. Returns the number run.
    pub fn run_all(&self) -> usize {
        let mut n = 0;
        while self.run_next() {
            n += 1;
        }
        n
    }
}

impl Queue for ManualQueue {
    fn push(&self, job: Job, _flags: PushFlags) {
        self.jobs.lock().push_back(job);
    }
}

/// A volume holding every I/O until the test completes it.
pub struct DeferredVolume {
    inner: Arc<RamVolume>,
    // (command, done, targets the metadata area)
    pending: Mutex<Vec<(IoCommand, IoDone, bool)>>,
    fail_offsets: Mutex<HashSet<u64>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    submitted: AtomicUsize,
}

#[allow(dead_code)]
impl DeferredVolume {
    pub fn new(inner: Arc<RamVolume>) -> Arc<Self> {
        Arc::new(DeferredVolume {
            inner,
            pending: Mutex::new(Vec::new()),
            fail_offsets: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
        })
    }

    pub fn inner(&self) -> &RamVolume {
        &self.inner
    }

    /// Fail the I/O starting at byte `offset` once it is completed.
    pub fn fail_at_offset(&self, offset: u64) {
        self.fail_offsets.lock().insert(offset);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// The byte offsets of the pending I/Os, in submission order.
    pub fn pending_offsets(&self) -> Vec<u64> {
        self.pending.lock().iter().map(|(c, _, _)| c.offset).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Complete the pending I/O at `index`, failing it with `code` if its offset was marked.
    /// Returns false if there is none.
    pub fn complete(&self, index: usize, code: i32) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            if index >= pending.len() {
                return false;
            }
            pending.remove(index)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let (command, done, metadata) = entry;
        if self.fail_offsets.lock().contains(&command.offset) {
            done(CompleteIo {
                command,
                result: Err(IoFailure(code)),
            });
        } else if metadata {
            self.inner.forward_metadata(command, done);
        } else {
            self.inner.forward_io(command, done);
        }
        true
    }

    pub fn complete_next(&self, code: i32) -> bool {
        self.complete(0, code)
    }

    pub fn complete_random(&self, rng: &mut impl rand::Rng, code: i32) -> bool {
        let len = self.pending();
        if len == 0 {
            return false;
        }
        self.complete(rng.gen_range(0..len), code)
    }
}

impl Volume for DeferredVolume {
    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn max_io_size(&self) -> usize {
        self.inner.max_io_size()
    }

    fn forward_io(&self, command: IoCommand, done: IoDone) {
        self.hold(command, done, false);
    }

    fn forward_metadata(&self, command: IoCommand, done: IoDone) {
        self.hold(command, done, true);
    }
}

impl DeferredVolume {
    fn hold(&self, command: IoCommand, done: IoDone, metadata: bool) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.pending.lock().push((command, done, metadata));
    }
}

/// An allocator failing one chosen allocation.
pub struct FailingAllocator {
    heap: HeapAllocator,
    allocs: AtomicUsize,
    fail_at: usize,
}

#[allow(dead_code)]
impl FailingAllocator {
    /// Fail the `fail_at`th allocation, counting from zero.
    pub fn new(fail_at: usize) -> Arc<Self> {
        Arc::new(FailingAllocator {
            heap: HeapAllocator::new(),
            allocs: AtomicUsize::new(0),
            fail_at,
        })
    }

    pub fn outstanding(&self) -> usize {
        self.heap.outstanding()
    }

    pub fn attempts(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }
}

impl BufferAllocator for FailingAllocator {
    fn alloc(&self, pages: usize) -> Option<IoBuffer> {
        if self.allocs.fetch_add(1, Ordering::SeqCst) == self.fail_at {
            return None;
        }
        self.heap.alloc(pages)
    }

    fn free(&self, buffer: IoBuffer) {
        self.heap.free(buffer)
    }
}
