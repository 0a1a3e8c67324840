//! Core identifier types.

use std::fmt;

/// Opaque socket identifier.
///
/// Returned when connecting, listening or accepting. Used to identify the
/// socket in every subsequent driver operation.
///
/// Internally encodes both a slot index and a generation counter so that an
/// id held after `close()` never reaches a socket that later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockId(pub(crate) u64);

impl SockId {
    /// Create a socket ID from a raw slot value (generation 0).
    ///
    /// This is primarily useful for testing purposes.
    #[inline]
    pub fn new(slot: usize) -> Self {
        Self(slot as u64)
    }

    #[inline]
    pub(crate) fn with_generation(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    /// Get the slot index from this socket ID.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Get the raw u64 value, including the generation.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Opaque poll group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) usize);

impl GroupId {
    /// Create a group ID from a raw value.
    ///
    /// This is primarily useful for testing purposes.
    #[inline]
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the raw value of the group ID.
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// The two kinds of socket. Fixed when the socket is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    /// Connected (or connecting) byte stream.
    Data,
    /// Listening socket that produces data sockets via `accept`.
    Listener,
}

impl fmt::Display for SockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockKind::Data => write!(f, "data"),
            SockKind::Listener => write!(f, "listening"),
        }
    }
}
