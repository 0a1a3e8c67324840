//! In-memory scripted transport for tests.
//!
//! Every handle produced by [`MockTransport`] has a matching control handle
//! ([`StreamHandle`], [`ListenerHandle`]) through which a test scripts what
//! the network does: how many bytes a write accepts, which errors appear,
//! what data arrives. Nothing touches the OS.

use crate::transport::{Listener, Stream, Transport};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::Rc;

#[derive(Default)]
struct MockNet {
    streams: Vec<StreamHandle>,
    listeners: Vec<(SocketAddrV4, ListenerHandle)>,
    refused: Vec<SocketAddrV4>,
    pump_count: usize,
    pump_error: Option<io::ErrorKind>,
}

/// Scripted transport. Clones share the same state, so a test keeps one
/// clone and hands another to the driver.
#[derive(Clone, Default)]
pub struct MockTransport {
    net: Rc<RefCell<MockNet>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control handles of every stream opened through `connect`, in order.
    pub fn streams(&self) -> Vec<StreamHandle> {
        self.net.borrow().streams.clone()
    }

    /// Control handle of the listener bound to `addr`.
    pub fn listener(&self, addr: SocketAddrV4) -> Option<ListenerHandle> {
        self.net
            .borrow()
            .listeners
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, h)| h.clone())
    }

    /// Make future connects to `addr` fail with `ConnectionRefused`.
    pub fn refuse(&self, addr: SocketAddrV4) {
        self.net.borrow_mut().refused.push(addr);
    }

    /// Number of `pump_events` calls so far.
    pub fn pump_count(&self) -> usize {
        self.net.borrow().pump_count
    }

    /// Make `pump_events` fail with `kind`, or succeed again with `None`.
    pub fn fail_pump(&self, kind: Option<io::ErrorKind>) {
        self.net.borrow_mut().pump_error = kind;
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn Stream>> {
        let mut net = self.net.borrow_mut();
        if net.refused.contains(&addr) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let handle = StreamHandle::new();
        handle.set_peer_addr(SocketAddr::V4(addr));
        net.streams.push(handle.clone());
        Ok(Box::new(MockStream { state: handle }))
    }

    fn listen(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn Listener>> {
        let mut net = self.net.borrow_mut();
        if net.listeners.iter().any(|(a, h)| *a == addr && !h.is_dropped()) {
            return Err(io::ErrorKind::AddrInUse.into());
        }
        let handle = ListenerHandle::default();
        net.listeners.push((addr, handle.clone()));
        Ok(Box::new(MockListener {
            addr,
            state: handle,
        }))
    }

    fn pump_events(&mut self) -> io::Result<()> {
        let mut net = self.net.borrow_mut();
        net.pump_count += 1;
        match net.pump_error {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    written: Vec<u8>,
    write_calls: usize,
    max_iovs: usize,
    /// Bytes writes may still accept; `None` is unlimited.
    write_budget: Option<usize>,
    write_error: Option<io::ErrorKind>,
    read_error: Option<io::ErrorKind>,
    rx: VecDeque<u8>,
    eof: bool,
    connected: bool,
    recv_buf: Option<usize>,
    send_buf: Option<usize>,
    recv_lowat: Option<usize>,
    peer: Option<SocketAddr>,
    dropped: bool,
}

/// Test-side control of one mock data stream.
#[derive(Clone, Debug)]
pub struct StreamHandle(Rc<RefCell<StreamState>>);

impl StreamHandle {
    fn new() -> Self {
        Self(Rc::new(RefCell::new(StreamState {
            connected: true,
            ..Default::default()
        })))
    }

    /// Every byte the stream has accepted, in order.
    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    /// Number of write calls that accepted data or would-blocked.
    pub fn write_calls(&self) -> usize {
        self.0.borrow().write_calls
    }

    /// Largest fragment count seen in a single vectored write.
    pub fn max_iovs(&self) -> usize {
        self.0.borrow().max_iovs
    }

    /// Limit the total bytes writes accept from now on. `Some(0)` makes
    /// every write would-block.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.0.borrow_mut().write_budget = budget;
    }

    pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
        self.0.borrow_mut().write_error = kind;
    }

    pub fn fail_reads(&self, kind: Option<io::ErrorKind>) {
        self.0.borrow_mut().read_error = kind;
    }

    /// Queue bytes for the driver to read.
    pub fn push_rx(&self, data: &[u8]) {
        self.0.borrow_mut().rx.extend(data);
    }

    /// Peer closes its side once queued input is drained.
    pub fn set_eof(&self) {
        self.0.borrow_mut().eof = true;
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.borrow_mut().connected = connected;
    }

    pub fn recv_buf_size(&self) -> Option<usize> {
        self.0.borrow().recv_buf
    }

    pub fn send_buf_size(&self) -> Option<usize> {
        self.0.borrow().send_buf
    }

    pub fn recv_lowat(&self) -> Option<usize> {
        self.0.borrow().recv_lowat
    }

    /// Remote address the stream reports. Outbound streams start with the
    /// address they connected to; accepted ones have none until set.
    pub fn set_peer_addr(&self, addr: SocketAddr) {
        self.0.borrow_mut().peer = Some(addr);
    }

    /// Whether the driver has released the stream.
    pub fn is_dropped(&self) -> bool {
        self.0.borrow().dropped
    }
}

struct MockStream {
    state: StreamHandle,
}

impl Stream for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_vectored(&[IoSlice::new(buf)])
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut s = self.state.0.borrow_mut();
        if let Some(kind) = s.write_error {
            return Err(kind.into());
        }
        s.write_calls += 1;
        s.max_iovs = s.max_iovs.max(bufs.len());

        let mut budget = s.write_budget.unwrap_or(usize::MAX);
        if budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut total = 0;
        for buf in bufs {
            let n = buf.len().min(budget);
            s.written.extend_from_slice(&buf[..n]);
            total += n;
            budget -= n;
            if budget == 0 {
                break;
            }
        }
        if let Some(b) = s.write_budget.as_mut() {
            *b -= total;
        }
        Ok(total)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = self.state.0.borrow_mut();
        if let Some(kind) = s.read_error {
            return Err(kind.into());
        }
        if s.rx.is_empty() {
            return if s.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(s.rx.len());
        for (dst, src) in buf.iter_mut().zip(s.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn has_readable_data(&self) -> bool {
        let s = self.state.0.borrow();
        !s.rx.is_empty() || s.eof || s.read_error.is_some()
    }

    fn is_connected(&self) -> bool {
        self.state.0.borrow().connected
    }

    fn set_recv_buffer_size(&mut self, size: usize) -> io::Result<()> {
        self.state.0.borrow_mut().recv_buf = Some(size);
        Ok(())
    }

    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()> {
        self.state.0.borrow_mut().send_buf = Some(size);
        Ok(())
    }

    fn set_recv_lowat(&mut self, bytes: usize) -> io::Result<()> {
        self.state.0.borrow_mut().recv_lowat = Some(bytes);
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.state
            .0
            .borrow()
            .peer
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.state.0.borrow_mut().dropped = true;
    }
}

#[derive(Debug, Default)]
struct ListenerState {
    incoming: VecDeque<StreamHandle>,
    dropped: bool,
}

/// Test-side control of one mock listener.
#[derive(Clone, Debug, Default)]
pub struct ListenerHandle(Rc<RefCell<ListenerState>>);

impl ListenerHandle {
    /// Queue an inbound connection. Returns the control handle of the
    /// stream the driver will get from `accept`.
    pub fn push_incoming(&self) -> StreamHandle {
        let handle = StreamHandle::new();
        self.0.borrow_mut().incoming.push_back(handle.clone());
        handle
    }

    /// Connections waiting to be accepted.
    pub fn pending(&self) -> usize {
        self.0.borrow().incoming.len()
    }

    pub fn is_dropped(&self) -> bool {
        self.0.borrow().dropped
    }
}

struct MockListener {
    addr: SocketAddrV4,
    state: ListenerHandle,
}

impl Listener for MockListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Stream>>> {
        let next = self.state.0.borrow_mut().incoming.pop_front();
        Ok(next.map(|state| Box::new(MockStream { state }) as Box<dyn Stream>))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::V4(self.addr))
    }
}

impl Drop for MockListener {
    fn drop(&mut self) {
        self.state.0.borrow_mut().dropped = true;
    }
}
