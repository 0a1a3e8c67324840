//! Scatter-gather write requests.

use crate::driver::SockDriver;
use crate::error::AbortReason;
use crate::queue::IoBatch;
use crate::types::SockId;
use bytes::Bytes;
use std::fmt;
use std::io::IoSlice;

/// Completion callback for a [`WriteRequest`].
///
/// Receives the driver so it can submit more writes, flush, or tear the
/// socket down. Fired exactly once per request.
pub type WriteCallback = Box<dyn FnOnce(&mut SockDriver, SockId, Result<(), AbortReason>)>;

/// A single caller-submitted scatter-gather write.
///
/// The fragments are reference-counted [`Bytes`]: ownership moves into the
/// request when it is submitted and is released when the request completes,
/// so the driver never copies payload data. Keep a clone of a fragment if
/// you need it after submission.
///
/// `offset` counts the bytes already accepted by the transport across the
/// whole fragment list and only ever grows. It can stop in the middle of a
/// fragment.
pub struct WriteRequest {
    bufs: Vec<Bytes>,
    offset: usize,
    len: usize,
    callback: Option<WriteCallback>,
}

impl WriteRequest {
    /// Create a request from an ordered list of fragments.
    pub fn new(bufs: Vec<Bytes>) -> Self {
        let len = bufs.iter().map(|b| b.len()).sum();
        Self {
            bufs,
            offset: 0,
            len,
            callback: None,
        }
    }

    /// Create a single-fragment request.
    pub fn from_bytes(buf: impl Into<Bytes>) -> Self {
        Self::new(vec![buf.into()])
    }

    /// Attach the completion callback.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut SockDriver, SockId, Result<(), AbortReason>) + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    /// Total bytes across all fragments.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes already accepted by the transport.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes still to send.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// Number of fragments.
    #[inline]
    pub fn iovcnt(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_done(&self) -> bool {
        self.offset == self.len
    }

    /// Append the unsent parts of this request to `iovs`, stopping once
    /// `iovs` holds `max` slices. Returns `true` if every unsent fragment fit.
    pub(crate) fn gather<'a>(&'a self, iovs: &mut IoBatch<'a>, max: usize) -> bool {
        let mut skip = self.offset;
        for buf in &self.bufs {
            // Consume any offset first
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            if iovs.len() >= max {
                return false;
            }
            iovs.push(IoSlice::new(&buf[skip..]));
            skip = 0;
        }
        true
    }

    /// Advance the cursor by up to `n` bytes. Returns how many were consumed.
    pub(crate) fn advance(&mut self, n: usize) -> usize {
        let step = n.min(self.remaining());
        self.offset += step;
        debug_assert!(self.offset <= self.len);
        step
    }

    /// Fire the completion callback. Consumes the request, releasing its
    /// fragments.
    pub(crate) fn complete(
        mut self,
        driver: &mut SockDriver,
        id: SockId,
        status: Result<(), AbortReason>,
    ) {
        if let Some(cb) = self.callback.take() {
            cb(driver, id, status);
        }
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("iovcnt", &self.bufs.len())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl From<Bytes> for WriteRequest {
    fn from(buf: Bytes) -> Self {
        Self::from_bytes(buf)
    }
}

impl From<Vec<Bytes>> for WriteRequest {
    fn from(bufs: Vec<Bytes>) -> Self {
        Self::new(bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(parts: &[&'static [u8]]) -> WriteRequest {
        WriteRequest::new(parts.iter().map(|p| Bytes::from_static(p)).collect())
    }

    fn flatten(iovs: &[IoSlice<'_>]) -> Vec<u8> {
        iovs.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn test_new() {
        let req = request(&[b"abc", b"de"]);
        assert_eq!(req.len(), 5);
        assert_eq!(req.offset(), 0);
        assert_eq!(req.remaining(), 5);
        assert_eq!(req.iovcnt(), 2);
        assert!(!req.is_done());
    }

    #[test]
    fn test_gather_from_start() {
        let req = request(&[b"abc", b"de"]);
        let mut iovs = IoBatch::new();
        assert!(req.gather(&mut iovs, 64));
        assert_eq!(iovs.len(), 2);
        assert_eq!(flatten(&iovs), b"abcde");
    }

    #[test]
    fn test_gather_mid_fragment() {
        let mut req = request(&[b"abc", b"de", b"fgh"]);
        req.advance(4);
        let mut iovs = IoBatch::new();
        assert!(req.gather(&mut iovs, 64));
        assert_eq!(iovs.len(), 2);
        assert_eq!(flatten(&iovs), b"efgh");
    }

    #[test]
    fn test_gather_at_fragment_boundary() {
        let mut req = request(&[b"abc", b"de"]);
        req.advance(3);
        let mut iovs = IoBatch::new();
        req.gather(&mut iovs, 64);
        assert_eq!(iovs.len(), 1);
        assert_eq!(flatten(&iovs), b"de");
    }

    #[test]
    fn test_gather_respects_cap() {
        let req = request(&[b"a", b"b", b"c"]);
        let mut iovs = IoBatch::new();
        assert!(!req.gather(&mut iovs, 2));
        assert_eq!(flatten(&iovs), b"ab");
    }

    #[test]
    fn test_gather_skips_empty_fragments() {
        let req = request(&[b"", b"x", b""]);
        let mut iovs = IoBatch::new();
        assert!(req.gather(&mut iovs, 64));
        assert_eq!(iovs.len(), 1);
    }

    #[test]
    fn test_advance_clamps() {
        let mut req = request(&[b"abc"]);
        assert_eq!(req.advance(2), 2);
        assert_eq!(req.advance(10), 1);
        assert!(req.is_done());
        assert_eq!(req.advance(1), 0);
    }

    #[test]
    fn test_empty_request_is_done() {
        let req = WriteRequest::new(Vec::new());
        assert!(req.is_empty());
        assert!(req.is_done());
    }

    #[test]
    fn test_debug() {
        let req = WriteRequest::from_bytes(Bytes::from_static(b"hi"));
        let s = format!("{:?}", req);
        assert!(s.contains("WriteRequest"));
        assert!(s.contains("len: 2"));
    }
}
