//! Socket handle state.

use crate::error::Error;
use crate::queue::WriteQueue;
use crate::transport::{Listener, Stream};
use crate::types::{GroupId, SockKind};

/// The transport handle a socket wraps. Exactly one of the two, chosen at
/// construction.
pub(crate) enum Handle {
    Data(Box<dyn Stream>),
    Listener(Box<dyn Listener>),
}

/// One socket owned by the driver.
pub(crate) struct Socket {
    pub(crate) handle: Handle,
    pub(crate) queue: WriteQueue,
    /// Completion callbacks currently running for this socket. Flushing is
    /// suppressed while non-zero.
    pub(crate) cb_depth: u32,
    pub(crate) group: Option<GroupId>,
    pub(crate) generation: u32,
}

impl Socket {
    pub(crate) fn new(handle: Handle, generation: u32) -> Self {
        Self {
            handle,
            queue: WriteQueue::new(),
            cb_depth: 0,
            group: None,
            generation,
        }
    }

    pub(crate) fn kind(&self) -> SockKind {
        match self.handle {
            Handle::Data(_) => SockKind::Data,
            Handle::Listener(_) => SockKind::Listener,
        }
    }

    /// The data handle, or a usage error naming `op`.
    pub(crate) fn stream_mut(&mut self, op: &'static str) -> Result<&mut dyn Stream, Error> {
        match &mut self.handle {
            Handle::Data(stream) => Ok(stream.as_mut()),
            Handle::Listener(_) => {
                tracing::error!(op, "data operation on listening socket");
                Err(Error::WrongKind {
                    op,
                    expected: SockKind::Data,
                })
            }
        }
    }
}
