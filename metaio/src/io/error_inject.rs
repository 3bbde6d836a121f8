use super::{CompleteIo, IoCommand, IoDirection, IoDone, Volume};
use crate::error::IoFailure;
use metaio_core::ATOMIC_METADATA_SIZE;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// A volume wrapper which fails selected I/O while armed.
///
/// An I/O fails if it touches one of the configured error sectors, or if it is at least the
/// configured sequence number in its direction. Everything else is forwarded to the inner volume.
pub struct ErrorVolume<V> {
    inner: V,
    error_code: i32,
    state: Mutex<ErrorState>,
}

#[derive(Default)]
struct ErrorState {
    armed: bool,
    error_sectors: BTreeSet<u64>,
    error_seq_no: HashMap<IoDirection, u64>,
    io_seq_no: HashMap<IoDirection, u64>,
    errors: HashMap<IoDirection, u64>,
}

impl<V: Volume> ErrorVolume<V> {
    /// Wrap `inner`, armed, failing with `-EIO` and with no error sectors.
    pub fn new(inner: V) -> Self {
        ErrorVolume {
            inner,
            error_code: -libc::EIO,
            state: Mutex::new(ErrorState {
                armed: true,
                ..ErrorState::default()
            }),
        }
    }

    /// The code failed I/O completes with.
    pub fn with_error_code(mut self, code: i32) -> Self {
        self.error_code = code;
        self
    }

    /// Replace the set of sectors, in units of 512 bytes, whose I/O fails.
    pub fn set_error_sectors(&self, sectors: impl IntoIterator<Item = u64>) {
        self.state.lock().error_sectors = sectors.into_iter().collect();
    }

    /// Fail every I/O in `direction` from the `seq_no`th one on, counting from zero.
    pub fn fail_from_seq_no(&self, direction: IoDirection, seq_no: u64) {
        self.state.lock().error_seq_no.insert(direction, seq_no);
    }

    pub fn arm(&self) {
        self.state.lock().armed = true;
    }

    pub fn disarm(&self) {
        self.state.lock().armed = false;
    }

    /// Whether any I/O has been failed.
    pub fn error_triggered(&self) -> bool {
        self.state.lock().errors.values().any(|n| *n > 0)
    }

    /// The number of I/O failed in `direction`.
    pub fn errors(&self, direction: IoDirection) -> u64 {
        self.state.lock().errors.get(&direction).copied().unwrap_or(0)
    }

    pub fn inner(&self) -> &V {
        &self.inner
    }

    fn should_fail(&self, command: &IoCommand) -> bool {
        let mut state = self.state.lock();
        if !state.armed {
            return false;
        }

        let seq_no = state.io_seq_no.entry(command.direction).or_insert(0);
        let current = *seq_no;
        *seq_no += 1;

        let seq_no_match = state
            .error_seq_no
            .get(&command.direction)
            .is_some_and(|from| *from <= current);

        let range = command.byte_range();
        let first = range.start / ATOMIC_METADATA_SIZE as u64;
        let end = range.end.div_ceil(ATOMIC_METADATA_SIZE as u64);
        let sector_match = state.error_sectors.range(first..end.max(first + 1)).next().is_some();

        let fail = seq_no_match || sector_match;
        if fail {
            *state.errors.entry(command.direction).or_insert(0) += 1;
        }
        fail
    }
}

impl<V: Volume> Volume for ErrorVolume<V> {
    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn max_io_size(&self) -> usize {
        self.inner.max_io_size()
    }

    fn forward_io(&self, command: IoCommand, done: IoDone) {
        if self.should_fail(&command) {
            let result = Err(IoFailure(self.error_code));
            done(CompleteIo { command, result });
        } else {
            self.inner.forward_io(command, done);
        }
    }

    fn forward_metadata(&self, command: IoCommand, done: IoDone) {
        if self.should_fail(&command) {
            let result = Err(IoFailure(self.error_code));
            done(CompleteIo { command, result });
        } else {
            self.inner.forward_metadata(command, done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IoBuffer, IoFlags, RamVolume, PAGE_SIZE};
    use std::sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    };

    fn read_page(volume: &impl Volume, page: u64) -> i32 {
        let code = Arc::new(AtomicI32::new(1));
        let out = code.clone();
        volume.forward_io(
            IoCommand {
                direction: IoDirection::Read,
                offset: page * PAGE_SIZE as u64,
                buffer: IoBuffer::try_new(1).unwrap(),
                flags: IoFlags::default(),
            },
            Box::new(move |complete| {
                let code = match complete.result {
                    Ok(()) => 0,
                    Err(IoFailure(code)) => code,
                };
                out.store(code, Ordering::SeqCst);
            }),
        );
        code.load(Ordering::SeqCst)
    }

    #[test]
    fn fails_io_touching_error_sectors() {
        let volume = ErrorVolume::new(RamVolume::new(4 * PAGE_SIZE)).with_error_code(5);
        // sector 17 is inside page 2.
        volume.set_error_sectors([17]);

        assert_eq!(read_page(&volume, 1), 0);
        assert_eq!(read_page(&volume, 2), 5);
        assert_eq!(volume.errors(IoDirection::Read), 1);
        assert!(volume.error_triggered());

        volume.disarm();
        assert_eq!(read_page(&volume, 2), 0);
    }

    #[test]
    fn fails_from_sequence_number() {
        let volume = ErrorVolume::new(RamVolume::new(4 * PAGE_SIZE));
        volume.fail_from_seq_no(IoDirection::Read, 2);

        assert_eq!(read_page(&volume, 0), 0);
        assert_eq!(read_page(&volume, 1), 0);
        assert_eq!(read_page(&volume, 2), -libc::EIO);
        assert_eq!(read_page(&volume, 3), -libc::EIO);
        assert_eq!(volume.inner().stats().reads, 2);
    }
}
