use super::{check_bounds, CompleteIo, IoCommand, IoDirection, IoDone, Volume};
use crate::error::IoFailure;
use anyhow::Context as _;
use crossbeam_channel::{Receiver, Sender};
use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    path::Path,
    sync::Arc,
};
use threadpool::ThreadPool;

const DEFAULT_MAX_IO_SIZE: usize = 128 * 1024;

struct IoPacket {
    command: IoCommand,
    done: IoDone,
}

/// A volume backed by a regular file.
///
/// Commands are handed to a pool of I/O worker threads, which execute them with positioned reads
/// and writes and invoke the completion from the worker thread.
///
/// Dropping the volume stops accepting commands; the workers finish what was queued and exit.
pub struct FileVolume {
    length: u64,
    max_io_size: usize,
    sender: Sender<IoPacket>,
    _io_workers_tp: ThreadPool,
}

impl FileVolume {
    /// Open an existing file as a volume. Its current length is the volume length.
    pub fn open(path: impl AsRef<Path>, io_workers: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening volume file {}", path.display()))?;
        Self::from_file(file, io_workers)
    }

    /// Create or truncate a file of `length` bytes and open it as a volume.
    pub fn create(path: impl AsRef<Path>, length: u64, io_workers: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating volume file {}", path.display()))?;
        file.set_len(length)?;
        Self::from_file(file, io_workers)
    }

    fn from_file(file: File, io_workers: usize) -> anyhow::Result<Self> {
        if io_workers == 0 {
            anyhow::bail!("a file volume needs at least one I/O worker");
        }
        let length = file.metadata()?.len();
        let io_workers_tp = ThreadPool::with_name("metaio-file-io".into(), io_workers);
        let sender = start_io_workers(Arc::new(file), &io_workers_tp, io_workers);
        Ok(FileVolume {
            length,
            max_io_size: DEFAULT_MAX_IO_SIZE,
            sender,
            _io_workers_tp: io_workers_tp,
        })
    }

    pub fn with_max_io_size(mut self, max_io_size: usize) -> Self {
        self.max_io_size = max_io_size;
        self
    }
}

impl Volume for FileVolume {
    fn length(&self) -> u64 {
        self.length
    }

    fn max_io_size(&self) -> usize {
        self.max_io_size
    }

    fn forward_io(&self, command: IoCommand, done: IoDone) {
        if let Err(failure) = check_bounds(&command, self.length, self.max_io_size) {
            done(CompleteIo {
                command,
                result: Err(failure),
            });
            return;
        }

        if let Err(err) = self.sender.send(IoPacket { command, done }) {
            // The workers only go away with the volume, but fail the I/O rather than lose it.
            let IoPacket { command, done } = err.0;
            done(CompleteIo {
                command,
                result: Err(IoFailure(-libc::EIO)),
            });
        }
    }
}

fn start_io_workers(
    fd: Arc<File>,
    io_workers_tp: &ThreadPool,
    io_workers: usize,
) -> Sender<IoPacket> {
    let (command_tx, command_rx) = crossbeam_channel::unbounded();

    for _ in 0..io_workers {
        spawn_worker_thread(fd.clone(), io_workers_tp, command_rx.clone());
    }

    command_tx
}

fn spawn_worker_thread(fd: Arc<File>, io_workers_tp: &ThreadPool, command_rx: Receiver<IoPacket>) {
    let work = move || loop {
        let Ok(packet) = command_rx.recv() else {
            return;
        };
        let complete = execute(&fd, packet.command);
        (packet.done)(complete);
    };

    io_workers_tp.execute(work);
}

fn execute(fd: &File, mut command: IoCommand) -> CompleteIo {
    let raw_fd = fd.as_raw_fd();
    let total = command.buffer.len();
    let mut done = 0;

    let result = loop {
        if done == total {
            break Ok(());
        }

        let offset = (command.offset + done as u64) as libc::off_t;
        let res = match command.direction {
            IoDirection::Read => unsafe {
                let buf = &mut command.buffer.as_mut_slice()[done..];
                libc::pread(
                    raw_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len() as libc::size_t,
                    offset,
                )
            },
            IoDirection::Write => unsafe {
                let buf = &command.buffer.as_slice()[done..];
                libc::pwrite(
                    raw_fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len() as libc::size_t,
                    offset,
                )
            },
        };

        match res {
            -1 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(IoFailure(-err.raw_os_error().unwrap_or(libc::EIO)));
            }
            // the bounds were checked on submission, so hitting the end of the file means it was
            // truncated underneath us.
            0 => break Err(IoFailure(-libc::EIO)),
            n => done += n as usize,
        }
    };

    CompleteIo { command, result }
}
