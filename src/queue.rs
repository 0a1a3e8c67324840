//! Per-socket FIFO of pending write requests.

use crate::config::DEFAULT_BATCH_SIZE;
use crate::request::WriteRequest;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::IoSlice;

/// Scratch space for one vectored write.
pub(crate) type IoBatch<'a> = SmallVec<[IoSlice<'a>; DEFAULT_BATCH_SIZE]>;

/// Ordered pending writes for one socket.
///
/// Insertion order is transmission order. Only the head request may have a
/// non-zero cursor.
#[derive(Debug, Default)]
pub struct WriteQueue {
    reqs: VecDeque<WriteRequest>,
    /// Fragment count across all queued requests.
    iovcnt: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request at the tail.
    pub fn enqueue(&mut self, req: WriteRequest) {
        debug_assert_eq!(req.offset(), 0);
        self.iovcnt += req.iovcnt();
        self.reqs.push_back(req);
    }

    pub fn peek_head(&self) -> Option<&WriteRequest> {
        self.reqs.front()
    }

    pub fn pop_head(&mut self) -> Option<WriteRequest> {
        let req = self.reqs.pop_front()?;
        self.iovcnt -= req.iovcnt();
        Some(req)
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    /// Number of fragments across all queued requests.
    pub fn queued_iovcnt(&self) -> usize {
        self.iovcnt
    }

    /// Bytes queued but not yet accepted by the transport.
    pub fn pending_bytes(&self) -> usize {
        self.reqs.iter().map(|r| r.remaining()).sum()
    }

    /// Collect unsent fragments from the head onward, at most `max` slices.
    pub(crate) fn gather<'a>(&'a self, iovs: &mut IoBatch<'a>, max: usize) {
        for req in &self.reqs {
            if !req.gather(iovs, max) || iovs.len() >= max {
                break;
            }
        }
    }

    /// Apply `n` accepted bytes to the queue in order.
    ///
    /// Requests that become fully sent are popped and returned in order. A
    /// request left partially sent stays at the head with its cursor moved.
    /// Leading zero-length requests are also completed.
    pub(crate) fn advance(&mut self, mut n: usize) -> Vec<WriteRequest> {
        let mut done = Vec::new();
        while let Some(head) = self.reqs.front_mut() {
            n -= head.advance(n);
            if !head.is_done() {
                break;
            }
            if let Some(req) = self.pop_head() {
                done.push(req);
            }
        }
        debug_assert_eq!(n, 0, "transport accepted more bytes than were offered");
        done
    }

    /// Remove every pending request, leaving the queue empty.
    pub(crate) fn take_all(&mut self) -> VecDeque<WriteRequest> {
        self.iovcnt = 0;
        std::mem::take(&mut self.reqs)
    }
}
