//! sockq - non-blocking sockets with queued scatter-gather writes.
//!
//! This crate provides a socket layer for polling-style servers: every
//! operation returns immediately, writes can be queued with a completion
//! callback, and sockets are serviced in poll groups.
//!
//! # Features
//!
//! - **Queued writes**: Scatter-gather requests drain in FIFO order with a
//!   resumable byte cursor, batched into vectored writes
//! - **Direct writes**: Never overtake queued data
//! - **Poll groups**: One call flushes every member, pumps transport events
//!   and reports read-ready sockets, rotating for fairness
//! - **Pluggable transport**: mio (epoll/kqueue) in production, a scripted
//!   in-memory transport for tests
//!
//! # Quick Start
//!
//! ```ignore
//! use sockq::{Config, SockDriver, WriteRequest};
//!
//! let mut driver = SockDriver::mio(Config::default())?;
//! let listener = driver.listen("0.0.0.0", 4420)?;
//! let group = driver.create_group();
//!
//! loop {
//!     while let Some(id) = driver.accept(listener)? {
//!         driver.add_to_group(group, id)?;
//!     }
//!
//!     for id in driver.poll_group(group, 32)? {
//!         let mut buf = [0u8; 4096];
//!         match driver.recv(id, &mut buf) {
//!             Ok(0) => driver.close(id)?,
//!             Ok(n) => {
//!                 let req = WriteRequest::from_bytes(buf[..n].to_vec())
//!                     .on_complete(|_, id, status| {
//!                         if let Err(reason) = status {
//!                             eprintln!("write on {id:?} aborted: {reason}");
//!                         }
//!                     });
//!                 driver.writev_async(id, req)?;
//!             }
//!             Err(e) if e.is_would_block() => {}
//!             Err(_) => driver.close(id)?,
//!         }
//!     }
//! }
//! ```

mod driver;
mod error;
mod flush;
mod group;
mod queue;
mod request;
mod socket;
mod types;

pub mod config;
pub mod logging;
pub mod mio;
#[doc(hidden)]
pub mod mock;
pub mod transport;

// Re-exports
pub use config::{Config, LogFormat, LoggingConfig};
pub use driver::SockDriver;
pub use error::{AbortReason, Error};
pub use queue::WriteQueue;
pub use request::{WriteCallback, WriteRequest};
pub use types::{GroupId, SockId, SockKind};

// Transport re-exports
pub use transport::{Listener, Stream, Transport};
