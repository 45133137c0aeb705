//! Channel group: the worker pool channels are created against.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::channel::AsyncChannel;
use crate::config::Config;
use crate::error::Error;
use crate::worker::Worker;

/// A fixed pool of read and common workers.
///
/// Every wrapped channel is pinned to one read worker and one common worker
/// for its lifetime, assigned round-robin at wrap time. The read workers
/// carry read interest; the common workers carry write interest, future-read
/// handoff, and deferred callback execution.
pub struct ChannelGroup {
    read_workers: Vec<Arc<Worker>>,
    common_workers: Vec<Arc<Worker>>,
    next_read: AtomicUsize,
    next_common: AtomicUsize,
    low_memory: bool,
    max_invoker: usize,
    down: AtomicBool,
}

impl ChannelGroup {
    /// Validate `config` and spawn the worker threads.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let mut read_workers = Vec::with_capacity(config.read_threads);
        for i in 0..config.read_threads {
            read_workers.push(Worker::spawn(
                format!("epoline-read-{i}"),
                config.event_capacity,
            )?);
        }
        let mut common_workers = Vec::with_capacity(config.common_threads);
        for i in 0..config.common_threads {
            common_workers.push(Worker::spawn(
                format!("epoline-common-{i}"),
                config.event_capacity,
            )?);
        }

        log::info!(
            "channel group up: {} read workers, {} common workers",
            read_workers.len(),
            common_workers.len()
        );

        Ok(ChannelGroup {
            read_workers,
            common_workers,
            next_read: AtomicUsize::new(0),
            next_common: AtomicUsize::new(0),
            low_memory: config.low_memory,
            max_invoker: config.max_invoker_depth,
            down: AtomicBool::new(false),
        })
    }

    /// Wrap an established stream into an asynchronous channel, pinning it to
    /// the next read and common workers in rotation. The stream is switched
    /// to non-blocking mode.
    pub fn wrap(&self, stream: TcpStream) -> Result<Arc<AsyncChannel>, Error> {
        if self.down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let read = self.next_read.fetch_add(1, Ordering::Relaxed) % self.read_workers.len();
        let common = self.next_common.fetch_add(1, Ordering::Relaxed) % self.common_workers.len();
        AsyncChannel::wrap(
            stream,
            Arc::clone(&self.read_workers[read]),
            Arc::clone(&self.common_workers[common]),
            self.low_memory,
            self.max_invoker,
        )
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Stop all worker threads and wait for them to exit. Idempotent.
    ///
    /// Channels wrapped by this group stop making progress; operations still
    /// pending on a worker's queue are dropped with the queue.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in self.read_workers.iter().chain(&self.common_workers) {
            worker.initiate_shutdown();
        }
        for worker in self.read_workers.iter().chain(&self.common_workers) {
            worker.join();
        }
        log::info!("channel group down");
    }
}

impl Drop for ChannelGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}
