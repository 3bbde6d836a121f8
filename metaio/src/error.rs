use thiserror::Error;

/// A failure reported by a [`crate::io::Volume`] for a single I/O.
///
/// The code is opaque to the engine and handed back to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("volume I/O failed with code {0}")]
pub struct IoFailure(pub i32);

/// A failure reported by a [`crate::page_lock::PageLock`] when asked for a page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page lock request failed with code {0}")]
pub struct LockFailure(pub i32);

/// The outcome of a metadata I/O request, as seen by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MetadataIoError {
    /// The range-state, a chunk buffer or a pool slot could not be allocated.
    #[error("out of memory")]
    NoMemory,
    /// The volume failed one of the chunks of the range.
    #[error("metadata I/O failed with code {0}")]
    Io(i32),
    /// The page lock manager refused one of the chunks of the range.
    #[error("metadata page lock failed with code {0}")]
    Lock(i32),
}

impl MetadataIoError {
    /// The raw error code. Out of memory is reported as `-ENOMEM`.
    pub fn code(&self) -> i32 {
        match *self {
            MetadataIoError::NoMemory => -libc::ENOMEM,
            MetadataIoError::Io(code) | MetadataIoError::Lock(code) => code,
        }
    }
}

impl From<IoFailure> for MetadataIoError {
    fn from(IoFailure(code): IoFailure) -> Self {
        MetadataIoError::Io(code)
    }
}

impl From<LockFailure> for MetadataIoError {
    fn from(LockFailure(code): LockFailure) -> Self {
        MetadataIoError::Lock(code)
    }
}
