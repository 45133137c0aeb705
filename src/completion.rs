//! Completion dispatch surface: outcomes, attachments, and handler traits.
//!
//! Handlers run synchronously on whichever thread drives an operation to
//! completion — the caller's thread for a direct (immediate) result, a worker
//! thread for a deferred one. Depth of synchronous handler→I/O→handler chains
//! is bounded by the per-iteration invoker counter (see the channel drivers).

use std::any::Any;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::Error;

/// Opaque caller context carried with a pending operation and passed back on
/// every notification for that operation.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Result of a read operation.
///
/// The low-memory sentinels are modeled as variants rather than reserved
/// integer result codes so they can never be mistaken for a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were appended to the supplied buffer. `Bytes(0)` is reported
    /// when the buffer had no spare capacity to read into.
    Bytes(usize),
    /// The peer closed its sending side; no further data will arrive.
    EndOfStream,
    /// Low-memory mode: data is pending on the socket but no buffer was
    /// supplied. Allocate one and re-issue the read.
    NeedBuffer,
    /// Low-memory mode: nothing arrived onto an empty buffer; the channel has
    /// dropped its buffer reference and the caller may drop its own. The read
    /// stays pending.
    BufferReleasable,
}

/// Callback invoked when a read operation finishes.
///
/// For every accepted read that is not cancelled, exactly one of `completed`
/// or `failed` fires with the terminal result. `BufferReleasable` is the one
/// non-terminal notification: the operation remains pending after it.
pub trait ReadCompletionHandler: Send + Sync {
    /// The read finished. `buf` is the buffer moved back out of the channel;
    /// it is `None` for the low-memory sentinel notifications.
    fn completed(&self, outcome: ReadOutcome, buf: Option<BytesMut>, attachment: Attachment);

    /// The read failed. The buffer is dropped by the channel.
    fn failed(&self, error: Error, attachment: Attachment);

    /// Polled lazily by the read driver; a cancelled operation is torn down
    /// without any notification.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// True for future-style handlers, which have no way to make progress on
    /// a zero-byte direct read and therefore prefer deferred registration.
    fn is_future(&self) -> bool {
        false
    }
}

/// Callback invoked when a write operation finishes.
pub trait WriteCompletionHandler: Send + Sync {
    /// The write finished; `bytes_written` is the full length of the supplied
    /// buffer, accumulated across however many underlying writes it took.
    fn completed(&self, bytes_written: usize, attachment: Attachment);

    /// The write failed after `failed` bytes may already have been accepted
    /// by the kernel; the channel should be closed.
    fn failed(&self, error: Error, attachment: Attachment);
}

/// Attachment for callers that have no per-operation context.
pub fn no_attachment() -> Attachment {
    Arc::new(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_outcomes_are_distinct_from_byte_counts() {
        assert_ne!(ReadOutcome::NeedBuffer, ReadOutcome::Bytes(0));
        assert_ne!(ReadOutcome::BufferReleasable, ReadOutcome::Bytes(0));
        assert_ne!(ReadOutcome::EndOfStream, ReadOutcome::Bytes(0));
    }

    #[test]
    fn attachment_downcasts() {
        let att: Attachment = Arc::new(42u32);
        assert_eq!(att.downcast_ref::<u32>(), Some(&42));
    }
}
