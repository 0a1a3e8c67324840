//! Mio-based transport using epoll/kqueue.
//!
//! Handles are non-blocking TCP sockets registered with a single
//! [`mio::Poll`]. [`Transport::pump_events`] runs one zero-timeout poll and
//! records readiness on the affected handles. Notifications are
//! edge-triggered, so a handle stays readable/writable until an operation on
//! it reports would-block.

use crate::config::Config;
use crate::transport::{Listener, Stream, Transport};
use mio::event::Source;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace};

/// Readiness flags for one registered handle.
#[derive(Debug, Default)]
struct Readiness {
    readable: Cell<bool>,
    writable: Cell<bool>,
    /// Set once a connecting stream is confirmed established.
    connected: Cell<bool>,
    /// First connect failure. `SO_ERROR` clears on read, so it is kept here
    /// and reported by every later write.
    error: Cell<Option<io::ErrorKind>>,
}

/// State shared between the transport and every handle it produced.
struct Shared {
    registry: Registry,
    /// Token -> readiness of the handle registered with that token.
    sources: RefCell<Slab<Rc<Readiness>>>,
}

impl Shared {
    fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interest: Interest,
        state: Readiness,
    ) -> io::Result<(usize, Rc<Readiness>)> {
        let state = Rc::new(state);
        let mut sources = self.sources.borrow_mut();
        let entry = sources.vacant_entry();
        let token = entry.key();
        self.registry.register(source, Token(token), interest)?;
        entry.insert(state.clone());
        Ok((token, state))
    }

    fn register_stream(
        self: &Rc<Self>,
        mut stream: MioTcpStream,
        state: Readiness,
    ) -> io::Result<MioStream> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (token, state) =
            self.register(&mut stream, Interest::READABLE | Interest::WRITABLE, state)?;
        Ok(MioStream {
            stream,
            token,
            state,
            shared: self.clone(),
        })
    }

    fn deregister<S: Source + ?Sized>(&self, source: &mut S, token: usize) {
        if let Err(e) = self.registry.deregister(source) {
            debug!(token, error = %e, "deregister failed");
        }
        self.sources.borrow_mut().try_remove(token);
    }
}

/// Non-blocking TCP transport backed by mio.
pub struct MioTransport {
    poll: Poll,
    events: Events,
    shared: Rc<Shared>,
    backlog: u32,
}

impl MioTransport {
    /// Create a new mio transport with default settings.
    pub fn new() -> io::Result<Self> {
        Self::with_config(&Config::default())
    }

    /// Create a new mio transport with custom configuration.
    pub fn with_config(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            shared: Rc::new(Shared {
                registry,
                sources: RefCell::new(Slab::with_capacity(64)),
            }),
            backlog: config.backlog,
        })
    }

    /// Number of handles currently registered with the poller.
    pub fn handle_count(&self) -> usize {
        self.shared.sources.borrow().len()
    }
}

impl Transport for MioTransport {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn Stream>> {
        let stream = MioTcpStream::connect(SocketAddr::V4(addr))?;
        // Not writable until the first writable event confirms the connection.
        let stream = self.shared.register_stream(stream, Readiness::default())?;
        Ok(Box::new(stream))
    }

    fn listen(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn Listener>> {
        // Create socket with socket2 for more control
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(addr).into())?;
        socket.listen(self.backlog.min(i32::MAX as u32) as i32)?;

        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = MioTcpListener::from_std(std_listener);

        let (token, state) =
            self.shared
                .register(&mut listener, Interest::READABLE, Readiness::default())?;

        Ok(Box::new(MioListener {
            listener,
            token,
            state,
            shared: self.shared.clone(),
        }))
    }

    fn pump_events(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let sources = self.shared.sources.borrow();
        for event in self.events.iter() {
            let Some(state) = sources.get(event.token().0) else {
                continue;
            };
            if event.is_readable() {
                state.readable.set(true);
            }
            if event.is_writable() {
                state.writable.set(true);
            }
            // Surface hangups and errors through the next read or write.
            if event.is_read_closed() || event.is_write_closed() || event.is_error() {
                trace!(token = event.token().0, "closed or error event");
                state.readable.set(true);
                state.writable.set(true);
            }
        }

        Ok(())
    }
}

/// Data handle for the mio transport.
struct MioStream {
    stream: MioTcpStream,
    token: usize,
    state: Rc<Readiness>,
    shared: Rc<Shared>,
}

impl MioStream {
    /// Whether a non-blocking connect has completed. A failed connect
    /// reports its error here.
    fn confirm_connected(&self) -> io::Result<bool> {
        if self.state.connected.get() {
            return Ok(true);
        }
        if let Some(kind) = self.state.error.get() {
            return Err(kind.into());
        }
        if let Some(e) = self.stream.take_error()? {
            self.state.error.set(Some(e.kind()));
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.state.connected.set(true);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn write_with<F>(&mut self, f: F) -> io::Result<usize>
    where
        F: FnOnce(&mut MioTcpStream) -> io::Result<usize>,
    {
        if let Some(kind) = self.state.error.get() {
            return Err(kind.into());
        }
        // Don't try to send if we know the socket isn't writable yet
        // (e.g., non-blocking connect in progress)
        if !self.state.writable.get() || !self.confirm_connected()? {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        match f(&mut self.stream) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.state.writable.set(false);
                Err(e)
            }
            other => other,
        }
    }
}

impl Stream for MioStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with(|s| s.write(buf))
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.write_with(|s| s.write_vectored(bufs))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.state.readable.set(false);
                Err(e)
            }
            other => other,
        }
    }

    fn has_readable_data(&self) -> bool {
        if !self.state.readable.get() {
            return false;
        }
        // The flag is sticky; confirm there is something (data, EOF or an
        // error) for a read to return.
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.state.readable.set(false);
                false
            }
            _ => true,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.confirm_connected(), Ok(true))
    }

    fn set_recv_buffer_size(&mut self, size: usize) -> io::Result<()> {
        socket2::SockRef::from(&self.stream).set_recv_buffer_size(size)
    }

    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()> {
        socket2::SockRef::from(&self.stream).set_send_buffer_size(size)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Drop for MioStream {
    fn drop(&mut self) {
        self.shared.deregister(&mut self.stream, self.token);
    }
}

/// Listening handle for the mio transport.
struct MioListener {
    listener: MioTcpListener,
    token: usize,
    state: Rc<Readiness>,
    shared: Rc<Shared>,
}

impl Listener for MioListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Stream>>> {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.state.readable.set(false);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        trace!(%peer, "accepted");

        // Data may already be waiting on a freshly accepted socket.
        let state = Readiness {
            readable: Cell::new(true),
            writable: Cell::new(true),
            connected: Cell::new(true),
            error: Cell::new(None),
        };
        let stream = self.shared.register_stream(stream, state)?;
        Ok(Some(Box::new(stream)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Drop for MioListener {
    fn drop(&mut self) {
        self.shared.deregister(&mut self.listener, self.token);
    }
}
