use crate::types::SockKind;
use std::io;

/// Errors returned by socket and poll group operations.
///
/// `WouldBlock` is a first-class "try again later" signal rather than a
/// failure. Use [`Error::is_would_block`] to tell it apart.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation could not complete without waiting.
    #[error("operation would block")]
    WouldBlock,
    /// Unknown or stale socket ID.
    #[error("socket not found")]
    InvalidSocket,
    /// Unknown poll group ID.
    #[error("poll group not found")]
    InvalidGroup,
    /// Operation issued against the wrong kind of socket.
    #[error("{op} requires a {expected} socket")]
    WrongKind {
        op: &'static str,
        expected: SockKind,
    },
    /// The socket is already a member of a poll group.
    #[error("socket already belongs to a poll group")]
    AlreadyInGroup,
    /// The socket is not a member of the given poll group.
    #[error("socket is not a member of this poll group")]
    NotInGroup,
    /// The poll group still has member sockets.
    #[error("poll group still has {0} member sockets")]
    GroupBusy(usize),
    /// Address could not be parsed as IPv4.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Hard failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
}

impl Error {
    /// Returns `true` for the would-block signal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock {
            Error::WouldBlock
        } else {
            Error::Transport(e)
        }
    }
}

/// Failure status delivered to a write request's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    /// The socket was closed with the request still queued.
    #[error("socket closed")]
    Closed,
    /// The socket was removed from its poll group with the request still queued.
    #[error("socket removed from poll group")]
    RemovedFromGroup,
    /// Flushing the socket hit a hard transport failure.
    #[error("transport failure: {0}")]
    Transport(io::ErrorKind),
    /// The request was submitted to a missing or listening socket.
    #[error("request rejected")]
    Rejected,
}

impl From<&Error> for AbortReason {
    fn from(e: &Error) -> Self {
        match e {
            Error::Transport(e) => AbortReason::Transport(e.kind()),
            Error::WouldBlock => AbortReason::Transport(io::ErrorKind::WouldBlock),
            _ => AbortReason::Rejected,
        }
    }
}
