use crate::error::MetadataIoError;
use std::sync::atomic::{AtomicU64, Ordering};

const NONE: u64 = 0;
const KIND_IO: u64 = 1;
const KIND_LOCK: u64 = 2;
const KIND_NO_MEMORY: u64 = 3;

/// The first error of a range. Once set it is never overwritten.
///
/// The error is packed in one word: the kind in the high half, the code in the low half.
pub(super) struct StickyError(AtomicU64);

impl StickyError {
    pub(super) fn new() -> Self {
        StickyError(AtomicU64::new(NONE))
    }

    /// Record `err` unless an earlier error was recorded. Returns whether `err` was recorded.
    pub(super) fn latch(&self, err: MetadataIoError) -> bool {
        self.0
            .compare_exchange(NONE, encode(err), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(super) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) != NONE
    }

    pub(super) fn get(&self) -> Option<MetadataIoError> {
        decode(self.0.load(Ordering::Acquire))
    }
}

fn encode(err: MetadataIoError) -> u64 {
    let (kind, code) = match err {
        MetadataIoError::Io(code) => (KIND_IO, code),
        MetadataIoError::Lock(code) => (KIND_LOCK, code),
        MetadataIoError::NoMemory => (KIND_NO_MEMORY, 0),
    };
    (kind << 32) | code as u32 as u64
}

fn decode(word: u64) -> Option<MetadataIoError> {
    let code = word as u32 as i32;
    match word >> 32 {
        KIND_IO => Some(MetadataIoError::Io(code)),
        KIND_LOCK => Some(MetadataIoError::Lock(code)),
        KIND_NO_MEMORY => Some(MetadataIoError::NoMemory),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let sticky = StickyError::new();
        assert_eq!(sticky.get(), None);
        assert!(sticky.latch(MetadataIoError::Io(-5)));
        assert!(!sticky.latch(MetadataIoError::Lock(3)));
        assert!(sticky.is_set());
        assert_eq!(sticky.get(), Some(MetadataIoError::Io(-5)));
    }

    #[test]
    fn codes_of_every_sign_survive_packing() {
        for err in [
            MetadataIoError::Io(0),
            MetadataIoError::Io(i32::MIN),
            MetadataIoError::Lock(i32::MAX),
            MetadataIoError::NoMemory,
        ] {
            assert_eq!(decode(encode(err)), Some(err));
        }
    }
}
