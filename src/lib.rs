//! Completion-callback asynchronous socket I/O emulated over epoll readiness.
//!
//! epoline presents an AIO-style API for established TCP sockets: submit a
//! read or a write with a completion handler, get called back exactly once
//! with the terminal result. Underneath there is no kernel completion queue,
//! only a small pool of threads blocking on level-triggered epoll instances;
//! the channel layer turns readiness into completions.
//!
//! Each channel allows at most one pending read and one pending write.
//! Operations complete synchronously on the calling thread when the socket
//! cooperates and the re-entrancy budget allows, and otherwise park as armed
//! readiness interest on one of the pool's workers. Handler-issued follow-up
//! operations therefore run at a bounded stack depth no matter how long the
//! callback chain.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::sync::Arc;
//!
//! use bytes::BytesMut;
//! use epoline::{
//!     Attachment, ChannelGroup, Config, Error, ReadCompletionHandler, ReadOutcome,
//! };
//!
//! struct Printer;
//!
//! impl ReadCompletionHandler for Printer {
//!     fn completed(&self, outcome: ReadOutcome, buf: Option<BytesMut>, _att: Attachment) {
//!         if let (ReadOutcome::Bytes(n), Some(buf)) = (outcome, buf) {
//!             println!("read {n} bytes: {:?}", &buf[..]);
//!         }
//!     }
//!     fn failed(&self, error: Error, _att: Attachment) {
//!         eprintln!("read failed: {error}");
//!     }
//! }
//!
//! fn main() -> Result<(), Error> {
//!     let group = ChannelGroup::new(Config::default())?;
//!     let stream = TcpStream::connect("127.0.0.1:11211")?;
//!     let channel = group.wrap(stream)?;
//!     channel.request_read(
//!         Some(BytesMut::with_capacity(4096)),
//!         epoline::no_attachment(),
//!         Arc::new(Printer),
//!     )?;
//!     // ... the handler fires on a worker thread when data arrives
//!     Ok(())
//! }
//! ```

mod channel;
mod completion;
mod config;
mod error;
mod future;
mod group;
pub mod metrics;
mod poller;
mod worker;

/// A completion-callback asynchronous socket channel.
pub use channel::AsyncChannel;

/// Opaque per-operation caller context.
pub use completion::Attachment;

/// Attachment for callers with no per-operation context.
pub use completion::no_attachment;

/// Callback for finished read operations.
pub use completion::ReadCompletionHandler;

/// Result of a read operation.
pub use completion::ReadOutcome;

/// Callback for finished write operations.
pub use completion::WriteCompletionHandler;

/// Channel group configuration.
pub use config::Config;

/// Errors returned by the channel layer.
pub use error::Error;

/// Blocking handle for reads issued without a callback.
pub use future::ReadFuture;

/// The worker pool channels are created against.
pub use group::ChannelGroup;
