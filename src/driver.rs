//! The socket driver: lifecycle, reads and writes.

use crate::config::Config;
use crate::error::{AbortReason, Error};
use crate::group::PollGroup;
use crate::mio::MioTransport;
use crate::request::WriteRequest;
use crate::socket::{Handle, Socket};
use crate::transport::{Stream, Transport};
use crate::types::{SockId, SockKind};
use slab::Slab;
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::{debug, error, warn};

/// Non-blocking socket driver.
///
/// Owns every socket and poll group it creates and hands out opaque
/// [`SockId`] / [`GroupId`](crate::GroupId) values for them. All operations
/// return immediately; "waiting" is expressed by calling
/// [`poll_group`](SockDriver::poll_group) again.
///
/// Writes come in two flavours:
///
/// - [`writev`](SockDriver::writev) writes directly, but only once every
///   previously queued write has gone out, so it never overtakes them.
/// - [`writev_async`](SockDriver::writev_async) queues a [`WriteRequest`]
///   whose callback fires once all of its bytes are accepted (or the request
///   is aborted). Queued data is flushed on demand, on every poll of the
///   socket's group, and eagerly once enough fragments pile up.
///
/// # Usage Pattern
///
/// ```ignore
/// let mut driver = SockDriver::mio(Config::default())?;
/// let listener = driver.listen("0.0.0.0", 4420)?;
/// let group = driver.create_group();
///
/// loop {
///     while let Some(id) = driver.accept(listener)? {
///         driver.add_to_group(group, id)?;
///     }
///     for id in driver.poll_group(group, 32)? {
///         let mut buf = [0u8; 4096];
///         if let Ok(n) = driver.recv(id, &mut buf) {
///             let req = WriteRequest::from_bytes(buf[..n].to_vec());
///             driver.writev_async(id, req)?;
///         }
///     }
/// }
/// ```
///
/// The driver is single-threaded: it, its sockets and its groups are only
/// touched from the polling thread.
pub struct SockDriver {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) sockets: Slab<Socket>,
    pub(crate) groups: Slab<PollGroup>,
    pub(crate) config: Config,
    /// Generation counter for socket IDs to detect stale references.
    next_generation: u32,
}

impl SockDriver {
    /// Create a driver over `transport` with default settings.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            sockets: Slab::with_capacity(64),
            groups: Slab::with_capacity(4),
            config: Config::default(),
            next_generation: 0,
        }
    }

    /// Create a driver over `transport` with custom configuration.
    pub fn with_config(transport: Box<dyn Transport>, config: Config) -> Result<Self, Error> {
        let mut driver = Self::new(transport);
        driver.set_config(config)?;
        Ok(driver)
    }

    /// Create a driver backed by [`MioTransport`].
    pub fn mio(config: Config) -> Result<Self, Error> {
        let transport = MioTransport::with_config(&config)?;
        Self::with_config(Box::new(transport), config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the configuration.
    ///
    /// Buffer-size hints apply to sockets created afterwards. The batch size
    /// applies from the next flush.
    pub fn set_config(&mut self, config: Config) -> Result<(), Error> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.config = config;
        Ok(())
    }

    /// Number of open sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    // === Lifecycle ===

    /// Open an outbound connection to `ip:port`.
    ///
    /// The connection may still be in progress when this returns; use
    /// [`is_connected`](SockDriver::is_connected) to find out.
    pub fn connect(&mut self, ip: &str, port: u16) -> Result<SockId, Error> {
        let addr = parse_addr(ip, port)?;
        let stream = self.transport.connect(addr).map_err(Error::Transport)?;
        let id = self.insert_stream(stream);
        debug!(sock = ?id, %addr, "connect");
        Ok(id)
    }

    /// Bind and start listening on `ip:port`.
    pub fn listen(&mut self, ip: &str, port: u16) -> Result<SockId, Error> {
        let addr = parse_addr(ip, port)?;
        let listener = self.transport.listen(addr).map_err(Error::Transport)?;
        let id = self.insert(Handle::Listener(listener));
        debug!(sock = ?id, %addr, "listen");
        Ok(id)
    }

    /// Accept one pending connection on a listening socket.
    ///
    /// Returns `Ok(None)` when no connection is waiting.
    pub fn accept(&mut self, id: SockId) -> Result<Option<SockId>, Error> {
        let sock = self.socket_mut(id)?;
        let listener = match &mut sock.handle {
            Handle::Listener(listener) => listener,
            Handle::Data(_) => {
                error!(sock = ?id, "accept call on non-listening socket");
                return Err(Error::WrongKind {
                    op: "accept",
                    expected: SockKind::Listener,
                });
            }
        };

        let Some(stream) = listener.accept().map_err(Error::Transport)? else {
            return Ok(None);
        };

        let new_id = self.insert_stream(stream);
        debug!(listener = ?id, sock = ?new_id, "accepted connection");
        Ok(Some(new_id))
    }

    /// Close a socket.
    ///
    /// Every queued write is completed with [`AbortReason::Closed`] before the
    /// transport handle is released. The socket leaves its poll group.
    pub fn close(&mut self, id: SockId) -> Result<(), Error> {
        let group = self.socket(id)?.group;
        if let Some(gid) = group {
            self.detach(gid, id);
        }

        let mut sock = self.sockets.remove(id.slot());
        let pending = sock.queue.take_all();
        debug!(sock = ?id, pending = pending.len(), "close");
        for req in pending {
            req.complete(self, id, Err(AbortReason::Closed));
        }
        drop(sock);
        Ok(())
    }

    /// Get the kind of a socket.
    pub fn kind(&self, id: SockId) -> Result<SockKind, Error> {
        Ok(self.socket(id)?.kind())
    }

    /// Whether a data socket is connected.
    pub fn is_connected(&mut self, id: SockId) -> Result<bool, Error> {
        Ok(self.socket_mut(id)?.stream_mut("is_connected")?.is_connected())
    }

    /// Local address of a socket, if the transport knows it.
    pub fn local_addr(&self, id: SockId) -> Result<SocketAddr, Error> {
        let addr = match &self.socket(id)?.handle {
            Handle::Data(stream) => stream.local_addr(),
            Handle::Listener(listener) => listener.local_addr(),
        };
        addr.map_err(Error::Transport)
    }

    /// Remote address of a data socket.
    pub fn peer_addr(&mut self, id: SockId) -> Result<SocketAddr, Error> {
        self.socket_mut(id)?
            .stream_mut("peer_addr")?
            .peer_addr()
            .map_err(Error::Transport)
    }

    // === Socket options ===

    /// Receive buffer size hint. Advisory.
    pub fn set_recvbuf(&mut self, id: SockId, size: usize) -> Result<(), Error> {
        let stream = self.socket_mut(id)?.stream_mut("set_recvbuf")?;
        stream.set_recv_buffer_size(size).map_err(Error::Transport)
    }

    /// Send buffer size hint. Advisory.
    pub fn set_sendbuf(&mut self, id: SockId, size: usize) -> Result<(), Error> {
        let stream = self.socket_mut(id)?.stream_mut("set_sendbuf")?;
        stream.set_send_buffer_size(size).map_err(Error::Transport)
    }

    /// Receive low-water mark hint. Advisory.
    pub fn set_recvlowat(&mut self, id: SockId, bytes: usize) -> Result<(), Error> {
        let stream = self.socket_mut(id)?.stream_mut("set_recvlowat")?;
        stream.set_recv_lowat(bytes).map_err(Error::Transport)
    }

    // === Reads ===

    /// Receive into a single buffer. See [`readv`](SockDriver::readv).
    pub fn recv(&mut self, id: SockId, buf: &mut [u8]) -> Result<usize, Error> {
        self.readv(id, &mut [IoSliceMut::new(buf)])
    }

    /// Vectored receive.
    ///
    /// Refreshes transport readiness, then fills `bufs` in order, stopping at
    /// the first short read.
    ///
    /// # Returns
    ///
    /// - `Ok(n)` - `n > 0` bytes were read
    /// - `Ok(0)` - The peer closed the stream (or `bufs` has no room)
    /// - `Err(WouldBlock)` - No data available
    /// - `Err(other)` - An error occurred
    pub fn readv(&mut self, id: SockId, bufs: &mut [IoSliceMut<'_>]) -> Result<usize, Error> {
        self.socket_mut(id)?.stream_mut("readv")?;

        if bufs.iter().all(|b| b.is_empty()) {
            return Ok(0);
        }

        self.transport.pump_events().map_err(Error::Transport)?;

        let stream = self.socket_mut(id)?.stream_mut("readv")?;
        let mut total = 0;
        let mut eof = false;

        for buf in bufs.iter_mut() {
            if buf.is_empty() {
                continue;
            }
            match stream.read(buf) {
                Ok(0) => {
                    eof = total == 0;
                    break;
                }
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if total > 0 => {
                    // Report what was read; the error resurfaces on the next call.
                    debug!(sock = ?id, error = %e, "read error after partial progress");
                    break;
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }

        if total > 0 || eof {
            Ok(total)
        } else {
            Err(Error::WouldBlock)
        }
    }

    // === Writes ===

    /// Write a single buffer directly. See [`writev`](SockDriver::writev).
    pub fn write(&mut self, id: SockId, buf: &[u8]) -> Result<usize, Error> {
        self.writev(id, &[IoSlice::new(buf)])
    }

    /// Vectored direct write.
    ///
    /// Queued asynchronous writes are flushed first. If any are still pending
    /// afterwards this fails with `WouldBlock` rather than let the direct
    /// write overtake them.
    ///
    /// # Returns
    ///
    /// - `Ok(n)` - `n` bytes were accepted, possibly fewer than offered
    /// - `Err(WouldBlock)` - Queued writes remain, or the transport is full
    /// - `Err(other)` - An error occurred
    pub fn writev(&mut self, id: SockId, bufs: &[IoSlice<'_>]) -> Result<usize, Error> {
        self.socket_mut(id)?.stream_mut("writev")?;

        // In order to process a writev, we need to flush any asynchronous writes first.
        self.flush(id)?;

        let sock = self.socket_mut(id)?;
        if !sock.queue.is_empty() {
            return Err(Error::WouldBlock);
        }

        let n = sock.stream_mut("writev")?.write_vectored(bufs)?;
        Ok(n)
    }

    /// Queue a write request.
    ///
    /// The request's callback fires exactly once: with `Ok(())` when every
    /// byte has been accepted, or with an [`AbortReason`] if the socket is
    /// closed, leaves its group, or fails to flush first.
    ///
    /// Submitting to a missing or listening socket completes the request with
    /// [`AbortReason::Rejected`] before the usage error is returned.
    pub fn writev_async(&mut self, id: SockId, req: WriteRequest) -> Result<(), Error> {
        match self.socket(id).map(Socket::kind) {
            Ok(SockKind::Data) => {}
            Ok(SockKind::Listener) => {
                error!(sock = ?id, "async write on listening socket");
                req.complete(self, id, Err(AbortReason::Rejected));
                return Err(Error::WrongKind {
                    op: "writev_async",
                    expected: SockKind::Data,
                });
            }
            Err(e) => {
                req.complete(self, id, Err(AbortReason::Rejected));
                return Err(e);
            }
        }

        let batch = self.config.batch_size;
        let sock = self.socket_mut(id)?;
        sock.queue.enqueue(req);

        // If there are a sufficient number queued, just flush them out immediately.
        if sock.queue.queued_iovcnt() >= batch
            && let Err(e) = self.flush(id)
        {
            warn!(sock = ?id, error = %e, "eager flush failed, aborting queued writes");
            self.abort_requests(id, AbortReason::from(&e))?;
        }

        Ok(())
    }

    /// Number of queued write requests on a socket.
    pub fn queued_requests(&self, id: SockId) -> Result<usize, Error> {
        Ok(self.socket(id)?.queue.len())
    }

    /// Bytes queued on a socket but not yet accepted by the transport.
    pub fn pending_bytes(&self, id: SockId) -> Result<usize, Error> {
        Ok(self.socket(id)?.queue.pending_bytes())
    }

    // === Internals ===

    pub(crate) fn socket(&self, id: SockId) -> Result<&Socket, Error> {
        self.sockets
            .get(id.slot())
            .filter(|s| s.generation == id.generation())
            .ok_or(Error::InvalidSocket)
    }

    pub(crate) fn socket_mut(&mut self, id: SockId) -> Result<&mut Socket, Error> {
        self.sockets
            .get_mut(id.slot())
            .filter(|s| s.generation == id.generation())
            .ok_or(Error::InvalidSocket)
    }

    fn insert(&mut self, handle: Handle) -> SockId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slot = self.sockets.insert(Socket::new(handle, generation));
        SockId::with_generation(slot, generation)
    }

    fn insert_stream(&mut self, mut stream: Box<dyn Stream>) -> SockId {
        if let Err(e) = stream.set_recv_buffer_size(self.config.recv_buf_size) {
            debug!(error = %e, size = self.config.recv_buf_size, "recv buffer hint not applied");
        }
        if let Err(e) = stream.set_send_buffer_size(self.config.send_buf_size) {
            debug!(error = %e, size = self.config.send_buf_size, "send buffer hint not applied");
        }
        self.insert(Handle::Data(stream))
    }
}

fn parse_addr(ip: &str, port: u16) -> Result<SocketAddrV4, Error> {
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("{ip}:{port}")))?;
    Ok(SocketAddrV4::new(ip, port))
}
