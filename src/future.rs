//! Blocking future handle for reads issued without a callback.
//!
//! The handle and the channel share one result slot. First writer wins:
//! either the read driver delivers a result, or [`ReadFuture::cancel`] marks
//! the slot cancelled and the driver tears the operation down the next time
//! it observes the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;

use crate::completion::{Attachment, ReadCompletionHandler, ReadOutcome};
use crate::error::Error;

struct Shared {
    slot: Mutex<Option<Result<(ReadOutcome, Option<BytesMut>), Error>>>,
    ready: Condvar,
    cancelled: AtomicBool,
}

/// Handle to a pending future-style read.
pub struct ReadFuture {
    shared: Arc<Shared>,
}

/// Handler half handed to the channel; reports into the shared slot.
struct FutureHandler {
    shared: Arc<Shared>,
}

impl ReadFuture {
    pub(crate) fn new() -> Self {
        ReadFuture {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                ready: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn handler(&self) -> Arc<dyn ReadCompletionHandler> {
        Arc::new(FutureHandler {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Whether a result is already available.
    pub fn is_done(&self) -> bool {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Mark the read cancelled. The driver observes the flag lazily, so the
    /// underlying operation may still complete internally; its result is
    /// discarded. Cancelling after completion has no effect.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.ready.notify_all();
    }

    /// Block until the read completes, consuming the handle.
    pub fn wait(self) -> Result<(ReadOutcome, Option<BytesMut>), Error> {
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            if self.shared.cancelled.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the read completes or `timeout` elapses. Expiry reports
    /// [`Error::Cancelled`]; the underlying operation stays pending.
    pub fn wait_timeout(self, timeout: Duration) -> Result<(ReadOutcome, Option<BytesMut>), Error> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            if self.shared.cancelled.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                // The handle is consumed; cancel so the driver can tear the
                // still-pending operation down instead of stranding it.
                self.shared.cancelled.store(true, Ordering::Release);
                return Err(Error::Cancelled);
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}

impl FutureHandler {
    fn deliver(&self, result: Result<(ReadOutcome, Option<BytesMut>), Error>) {
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() && !self.shared.cancelled.load(Ordering::Acquire) {
            *slot = Some(result);
            self.shared.ready.notify_all();
        }
    }
}

impl ReadCompletionHandler for FutureHandler {
    fn completed(&self, outcome: ReadOutcome, buf: Option<BytesMut>, _attachment: Attachment) {
        self.deliver(Ok((outcome, buf)));
    }

    fn failed(&self, error: Error, _attachment: Attachment) {
        self.deliver(Err(error));
    }

    fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    fn is_future(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_result_is_returned() {
        let future = ReadFuture::new();
        let handler = future.handler();
        handler.completed(
            ReadOutcome::Bytes(5),
            Some(BytesMut::from(&b"hello"[..])),
            crate::completion::no_attachment(),
        );
        let (outcome, buf) = future.wait().expect("result");
        assert_eq!(outcome, ReadOutcome::Bytes(5));
        assert_eq!(buf.expect("buf").as_ref(), b"hello");
    }

    #[test]
    fn cancel_wins_over_late_result() {
        let future = ReadFuture::new();
        let handler = future.handler();
        future.cancel();
        assert!(handler.is_cancelled());
        handler.completed(ReadOutcome::Bytes(1), None, crate::completion::no_attachment());
        assert!(matches!(future.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn wait_blocks_until_delivery() {
        let future = ReadFuture::new();
        let handler = future.handler();
        let delivery = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handler.failed(Error::ChannelClosed, crate::completion::no_attachment());
        });
        assert!(matches!(future.wait(), Err(Error::ChannelClosed)));
        delivery.join().expect("join");
    }

    #[test]
    fn timeout_expires_without_result() {
        let future = ReadFuture::new();
        let result = future.wait_timeout(Duration::from_millis(10));
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
