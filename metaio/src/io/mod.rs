//! Buffers, commands and the volume abstraction metadata I/O is issued against.

#[cfg(not(target_family = "unix"))]
std::compile_error!("metaio only supports Unix-based OSs");

use crate::error::IoFailure;
use std::ops::{Deref, DerefMut};

pub use metaio_core::PAGE_SIZE;

pub use self::{
    error_inject::ErrorVolume,
    file::FileVolume,
    ram::{IoStats, RamVolume, VOLUME_POISON},
    trace::{TraceArea, TraceEvent, TraceVolume},
};

mod error_inject;
mod file;
mod ram;
mod trace;

#[derive(Clone)]
#[repr(align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Deref for Page {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Page {
    pub fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }
}

/// A page-aligned buffer spanning a whole number of pages.
///
/// The buffer has a fixed capacity and a length, which is the number of bytes an I/O issued with
/// this buffer transfers.
pub struct IoBuffer {
    pages: Vec<Page>,
    len: usize,
}

impl IoBuffer {
    /// Allocate a zeroed buffer of `pages` pages. Returns `None` if the memory cannot be reserved.
    pub fn try_new(pages: usize) -> Option<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(pages).ok()?;
        buf.extend(std::iter::repeat_with(Page::zeroed).take(pages));
        Some(IoBuffer {
            len: pages * PAGE_SIZE,
            pages: buf,
        })
    }

    /// The capacity of the buffer in pages.
    pub fn capacity_pages(&self) -> usize {
        self.pages.len()
    }

    /// The capacity of the buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// The number of bytes transferred by an I/O using this buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the transfer length.
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "I/O length exceeds buffer capacity");
        self.len = len;
    }

    /// The first `len` bytes of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes()[..self.len]
    }

    /// The first `len` bytes of the buffer, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.bytes_mut()[..len]
    }

    /// The `index`th page of the buffer, regardless of the transfer length.
    pub fn page(&self, index: usize) -> &[u8] {
        &self.pages[index]
    }

    /// The `index`th page of the buffer, mutably.
    pub fn page_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.pages[index]
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `Page` is a 4096-byte array with no padding, so the pages are a contiguous
        // run of initialized bytes.
        unsafe { std::slice::from_raw_parts(self.pages.as_ptr() as *const u8, self.capacity()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity();
        // SAFETY: see `bytes`. The exclusive borrow of `self` covers every page.
        unsafe { std::slice::from_raw_parts_mut(self.pages.as_mut_ptr() as *mut u8, capacity) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

/// Opaque flags forwarded to the volume with every I/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IoFlags(pub u32);

/// A single I/O to be executed by a volume.
pub struct IoCommand {
    pub direction: IoDirection,
    /// Byte offset on the volume.
    pub offset: u64,
    /// The data. `buffer.len()` bytes are transferred.
    pub buffer: IoBuffer,
    pub flags: IoFlags,
}

impl IoCommand {
    /// The byte range the command touches on the volume.
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.buffer.len() as u64
    }
}

pub struct CompleteIo {
    pub command: IoCommand,
    pub result: Result<(), IoFailure>,
}

/// Continuation invoked once a volume finishes an I/O. It hands the command, and with it the
/// buffer, back to the submitter.
pub type IoDone = Box<dyn FnOnce(CompleteIo) + Send>;

/// A backing block volume.
///
/// Submission never blocks on the I/O itself. The volume calls `done` exactly once per command,
/// either from within `forward_io` or later from any thread.
pub trait Volume: Send + Sync {
    /// The length of the volume in bytes.
    fn length(&self) -> u64;

    /// The maximum number of bytes a single I/O may transfer.
    fn max_io_size(&self) -> usize;

    /// Submit an I/O against the data area of the volume.
    fn forward_io(&self, command: IoCommand, done: IoDone);

    /// Submit an I/O against the per-sector metadata area of an atomic-write device.
    ///
    /// Volumes without a separate metadata area treat this like [`Volume::forward_io`].
    fn forward_metadata(&self, command: IoCommand, done: IoDone) {
        self.forward_io(command, done)
    }
}

impl<V: Volume + ?Sized> Volume for std::sync::Arc<V> {
    fn length(&self) -> u64 {
        (**self).length()
    }

    fn max_io_size(&self) -> usize {
        (**self).max_io_size()
    }

    fn forward_io(&self, command: IoCommand, done: IoDone) {
        (**self).forward_io(command, done)
    }

    fn forward_metadata(&self, command: IoCommand, done: IoDone) {
        (**self).forward_metadata(command, done)
    }
}

/// Check that `command` fits a volume of the given length and maximum I/O size.
pub(crate) fn check_bounds(
    command: &IoCommand,
    length: u64,
    max_io_size: usize,
) -> Result<(), IoFailure> {
    let range = command.byte_range();
    if command.buffer.len() > max_io_size || range.end > length {
        return Err(IoFailure(-libc::EINVAL));
    }
    Ok(())
}
