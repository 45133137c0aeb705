use std::io;

use thiserror::Error;

/// Errors returned by the epoline channel layer.
///
/// Contract violations ([`Error::ReadPending`], [`Error::WritePending`]) are
/// returned synchronously at the call site. Everything else that happens after
/// an operation has been accepted is delivered through the completion
/// handler's failure path instead of being returned.
#[derive(Debug, Error)]
pub enum Error {
    /// OS-level I/O failure during a read, write, or socket teardown.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A read was requested while another read is still pending.
    #[error("read already pending on this channel")]
    ReadPending,
    /// A write was requested while another write is still pending.
    #[error("write already pending on this channel")]
    WritePending,
    /// The channel has been closed.
    #[error("channel closed")]
    ChannelClosed,
    /// A read without a buffer was requested outside low-memory mode.
    #[error("a read buffer is required unless low-memory mode is enabled")]
    BufferRequired,
    /// Registering interest with a worker's multiplexer failed.
    #[error("registration: {0}")]
    Registration(String),
    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),
    /// Pending-operation timeouts are not supported by this emulation.
    #[error("operation timeouts are not supported")]
    TimeoutUnsupported,
    /// A future-style read was cancelled by its caller.
    #[error("read cancelled")]
    Cancelled,
    /// The channel group has been shut down.
    #[error("channel group shut down")]
    Shutdown,
}
