//! Flushing queued writes to the transport.

use crate::driver::SockDriver;
use crate::error::{AbortReason, Error};
use crate::queue::IoBatch;
use crate::request::WriteRequest;
use crate::socket::{Handle, Socket};
use crate::types::{SockId, SockKind};
use std::io;
use tracing::{debug, error, trace};

impl SockDriver {
    /// Push as much queued data as the transport accepts in one vectored
    /// write, then complete every request that became fully sent.
    ///
    /// At most `batch_size` fragments are offered per call. A no-op while a
    /// completion callback for this socket is running.
    ///
    /// # Returns
    ///
    /// - `Ok(n)` - `n` bytes were accepted; `0` when nothing was queued or
    ///   the transport would block
    /// - `Err(Transport)` - Hard failure; the queue and cursors are unchanged
    pub fn flush(&mut self, id: SockId) -> Result<usize, Error> {
        let batch = self.config.batch_size;
        let Socket {
            handle,
            queue,
            cb_depth,
            ..
        } = self.socket_mut(id)?;

        let Handle::Data(stream) = handle else {
            error!(sock = ?id, "flush call on listening socket");
            return Err(Error::WrongKind {
                op: "flush",
                expected: SockKind::Data,
            });
        };

        if *cb_depth > 0 || queue.is_empty() {
            return Ok(0);
        }

        let n = {
            let mut iovs = IoBatch::new();
            queue.gather(&mut iovs, batch);

            if iovs.is_empty() {
                0
            } else {
                match stream.write_vectored(&iovs) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        debug!(sock = ?id, "flush would block");
                        0
                    }
                    Err(e) => return Err(Error::Transport(e)),
                }
            }
        };

        let done = queue.advance(n);
        trace!(sock = ?id, bytes = n, completed = done.len(), "flushed");
        self.complete_requests(id, done, Ok(()));

        Ok(n)
    }

    /// Complete every queued request on a socket with `reason`.
    ///
    /// Returns the number of requests aborted.
    pub fn abort_requests(&mut self, id: SockId, reason: AbortReason) -> Result<usize, Error> {
        let pending = self.socket_mut(id)?.queue.take_all();
        let count = pending.len();
        if count > 0 {
            debug!(sock = ?id, count, %reason, "aborting queued writes");
        }
        self.complete_requests(id, pending, Err(reason));
        Ok(count)
    }

    /// Fire completion callbacks in order with the socket's callback depth
    /// raised, so nested flushes from inside a callback are suppressed.
    pub(crate) fn complete_requests<I>(
        &mut self,
        id: SockId,
        reqs: I,
        status: Result<(), AbortReason>,
    ) where
        I: IntoIterator<Item = WriteRequest>,
    {
        let mut reqs = reqs.into_iter().peekable();
        if reqs.peek().is_none() {
            return;
        }

        if let Ok(sock) = self.socket_mut(id) {
            sock.cb_depth += 1;
        }
        for req in reqs {
            req.complete(self, id, status);
        }
        // The socket may have been closed by a callback.
        if let Ok(sock) = self.socket_mut(id) {
            sock.cb_depth = sock.cb_depth.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{AbortReason, Error};
    use crate::mock::MockTransport;
    use crate::request::WriteRequest;
    use crate::{Config, SockDriver};
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(u32, Result<(), AbortReason>)>>>;

    fn setup() -> (SockDriver, MockTransport, crate::SockId) {
        let mock = MockTransport::new();
        let mut driver = SockDriver::new(Box::new(mock.clone()));
        let id = driver.connect("127.0.0.1", 4420).unwrap();
        (driver, mock, id)
    }

    fn tracked(tag: u32, parts: &[&'static [u8]], log: &Log) -> WriteRequest {
        let log = log.clone();
        WriteRequest::new(parts.iter().map(|p| Bytes::from_static(p)).collect())
            .on_complete(move |_, _, status| log.borrow_mut().push((tag, status)))
    }

    #[test]
    fn test_flush_empty_queue() {
        let (mut driver, mock, id) = setup();
        assert_eq!(driver.flush(id).unwrap(), 0);
        assert_eq!(mock.streams()[0].write_calls(), 0);
    }

    #[test]
    fn test_flush_partial_resumes_mid_fragment() {
        let (mut driver, mock, id) = setup();
        let stream = &mock.streams()[0];
        let log = Log::default();

        driver.writev_async(id, tracked(1, &[b"abc"], &log)).unwrap();
        driver.writev_async(id, tracked(2, &[b"defgh"], &log)).unwrap();

        stream.set_write_budget(Some(4));
        assert_eq!(driver.flush(id).unwrap(), 4);
        assert_eq!(*log.borrow(), vec![(1, Ok(()))]);
        assert_eq!(driver.pending_bytes(id).unwrap(), 4);

        stream.set_write_budget(None);
        assert_eq!(driver.flush(id).unwrap(), 4);
        assert_eq!(*log.borrow(), vec![(1, Ok(())), (2, Ok(()))]);
        assert_eq!(stream.written(), b"abcdefgh");
    }

    #[test]
    fn test_flush_would_block_is_zero() {
        let (mut driver, mock, id) = setup();
        let log = Log::default();
        mock.streams()[0].set_write_budget(Some(0));
        driver.writev_async(id, tracked(1, &[b"abc"], &log)).unwrap();

        assert_eq!(driver.flush(id).unwrap(), 0);
        assert!(log.borrow().is_empty());
        assert_eq!(driver.queued_requests(id).unwrap(), 1);
    }

    #[test]
    fn test_flush_error_leaves_queue() {
        let (mut driver, mock, id) = setup();
        let log = Log::default();
        driver.writev_async(id, tracked(1, &[b"abc"], &log)).unwrap();
        mock.streams()[0].fail_writes(Some(io::ErrorKind::BrokenPipe));

        match driver.flush(id) {
            Err(Error::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(log.borrow().is_empty());
        assert_eq!(driver.pending_bytes(id).unwrap(), 3);
    }

    #[test]
    fn test_flush_caps_fragments_per_write() {
        let mock = MockTransport::new();
        let config = Config {
            batch_size: 4,
            ..Default::default()
        };
        let mut driver = SockDriver::with_config(Box::new(mock.clone()), config).unwrap();
        let id = driver.connect("127.0.0.1", 1).unwrap();
        let stream = &mock.streams()[0];
        let log = Log::default();

        driver
            .writev_async(id, tracked(1, &[b"a", b"b", b"c"], &log))
            .unwrap();
        driver
            .writev_async(id, tracked(2, &[b"d", b"e", b"f"], &log))
            .unwrap();

        // The second submission crossed the threshold and flushed 4 fragments.
        assert_eq!(stream.written(), b"abcd");
        assert_eq!(stream.max_iovs(), 4);
        assert_eq!(*log.borrow(), vec![(1, Ok(()))]);

        assert_eq!(driver.flush(id).unwrap(), 2);
        assert_eq!(stream.written(), b"abcdef");
    }

    #[test]
    fn test_zero_length_request_completes() {
        let (mut driver, mock, id) = setup();
        let log = Log::default();
        driver.writev_async(id, tracked(1, &[], &log)).unwrap();
        driver.writev_async(id, tracked(2, &[b""], &log)).unwrap();

        assert_eq!(driver.flush(id).unwrap(), 0);
        assert_eq!(*log.borrow(), vec![(1, Ok(())), (2, Ok(()))]);
        assert_eq!(mock.streams()[0].write_calls(), 0);
    }

    #[test]
    fn test_abort_requests() {
        let (mut driver, mock, id) = setup();
        let log = Log::default();
        mock.streams()[0].set_write_budget(Some(0));
        for tag in 0..3 {
            driver.writev_async(id, tracked(tag, &[b"x"], &log)).unwrap();
        }

        let reason = AbortReason::Transport(io::ErrorKind::ConnectionReset);
        assert_eq!(driver.abort_requests(id, reason).unwrap(), 3);
        assert_eq!(
            *log.borrow(),
            vec![(0, Err(reason)), (1, Err(reason)), (2, Err(reason))]
        );
        assert_eq!(driver.abort_requests(id, reason).unwrap(), 0);
    }

    #[test]
    fn test_flush_suppressed_inside_callback() {
        let (mut driver, mock, id) = setup();
        let nested = Rc::new(RefCell::new(None));
        let seen = nested.clone();

        let first = WriteRequest::from_bytes(Bytes::from_static(b"one")).on_complete(
            move |driver, id, _| {
                driver
                    .writev_async(id, WriteRequest::from_bytes(Bytes::from_static(b"two")))
                    .unwrap();
                *seen.borrow_mut() = Some(driver.flush(id).unwrap());
            },
        );
        driver.writev_async(id, first).unwrap();

        assert_eq!(driver.flush(id).unwrap(), 3);
        assert_eq!(*nested.borrow(), Some(0));
        assert_eq!(mock.streams()[0].written(), b"one");

        // The guard is released afterwards.
        assert_eq!(driver.flush(id).unwrap(), 3);
        assert_eq!(mock.streams()[0].written(), b"onetwo");
    }

    #[test]
    fn test_callback_may_close_socket() {
        let (mut driver, _mock, id) = setup();
        let log = Log::default();

        let closer = WriteRequest::from_bytes(Bytes::from_static(b"a"))
            .on_complete(|driver, id, _| driver.close(id).unwrap());
        driver.writev_async(id, closer).unwrap();
        driver.writev_async(id, tracked(2, &[b"b"], &log)).unwrap();

        // Both are sent in one write; the second still gets its success.
        assert_eq!(driver.flush(id).unwrap(), 2);
        assert_eq!(*log.borrow(), vec![(2, Ok(()))]);
        assert_eq!(driver.socket_count(), 0);
    }
}
