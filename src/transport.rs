//! Transport layer abstraction.
//!
//! The driver never touches the network directly. Connection setup, raw byte
//! transfer and readiness tracking are delegated to a [`Transport`] and the
//! handles it produces. Every handle operation is non-blocking: "try again
//! later" is reported as `io::ErrorKind::WouldBlock`.

use std::io::{self, IoSlice};
use std::net::{SocketAddr, SocketAddrV4};

/// Factory for data and listening handles, plus the global event pump.
pub trait Transport {
    /// Open an outbound connection.
    ///
    /// The returned stream may still be connecting; writes report
    /// `WouldBlock` until the connection is established.
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn Stream>>;

    /// Bind and start listening on an address.
    fn listen(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn Listener>>;

    /// Refresh readiness state for every handle this transport produced.
    ///
    /// Called once per poll cycle; a single call services all handles.
    fn pump_events(&mut self) -> io::Result<()>;
}

/// A data handle: one non-blocking byte stream.
pub trait Stream {
    /// Write from a single buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(n)` - `n` bytes were accepted, possibly fewer than `buf.len()`
    /// - `Err(WouldBlock)` - Nothing could be accepted right now
    /// - `Err(other)` - An error occurred
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Write multiple buffers in order as one operation.
    ///
    /// # Default Implementation
    ///
    /// Issues one `write()` per fragment. A short write ends the call and the
    /// bytes accepted so far are reported; a would-block after some progress
    /// is reported as that progress. Backends with a native `writev` should
    /// override this.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut total = 0;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            match self.write(buf) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Read available data into `buf`.
    ///
    /// `Ok(0)` with a non-empty `buf` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether a read would currently return data.
    fn has_readable_data(&self) -> bool;

    /// Whether the stream is connected.
    fn is_connected(&self) -> bool;

    /// Advisory receive buffer size.
    fn set_recv_buffer_size(&mut self, _size: usize) -> io::Result<()> {
        Ok(())
    }

    /// Advisory send buffer size.
    fn set_send_buffer_size(&mut self, _size: usize) -> io::Result<()> {
        Ok(())
    }

    /// Advisory minimum byte count before the stream reports readable.
    fn set_recv_lowat(&mut self, _bytes: usize) -> io::Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Address of the remote end. `NotConnected` while a connect is still
    /// in progress.
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// A listening handle.
pub trait Listener {
    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when no connection is waiting.
    fn accept(&mut self) -> io::Result<Option<Box<dyn Stream>>>;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::ErrorKind::Unsupported.into())
    }
}
