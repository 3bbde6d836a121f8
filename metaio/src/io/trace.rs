use super::{IoCommand, IoDirection, IoDone, IoFlags, Volume};

/// Which area of the volume a traced I/O targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceArea {
    Data,
    Metadata,
}

/// An I/O observed by a [`TraceVolume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub area: TraceArea,
    pub direction: IoDirection,
    pub offset: u64,
    pub len: usize,
    pub flags: IoFlags,
}

/// A volume wrapper which reports every I/O to a callback before forwarding it.
pub struct TraceVolume<V, F> {
    inner: V,
    trace: F,
}

impl<V, F> TraceVolume<V, F>
where
    V: Volume,
    F: Fn(&TraceEvent) + Send + Sync,
{
    pub fn new(inner: V, trace: F) -> Self {
        TraceVolume { inner, trace }
    }

    pub fn inner(&self) -> &V {
        &self.inner
    }

    fn trace(&self, area: TraceArea, command: &IoCommand) {
        (self.trace)(&TraceEvent {
            area,
            direction: command.direction,
            offset: command.offset,
            len: command.buffer.len(),
            flags: command.flags,
        });
    }
}

impl<V, F> Volume for TraceVolume<V, F>
where
    V: Volume,
    F: Fn(&TraceEvent) + Send + Sync,
{
    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn max_io_size(&self) -> usize {
        self.inner.max_io_size()
    }

    fn forward_io(&self, command: IoCommand, done: IoDone) {
        self.trace(TraceArea::Data, &command);
        self.inner.forward_io(command, done);
    }

    fn forward_metadata(&self, command: IoCommand, done: IoDone) {
        self.trace(TraceArea::Metadata, &command);
        self.inner.forward_metadata(command, done);
    }
}
