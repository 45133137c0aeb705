//! Worker: one readiness multiplexer, one dedicated thread.
//!
//! A [`Worker`] owns a [`Poller`] through the thread that runs its event
//! loop; the poller is never touched from any other thread. Cross-thread
//! interest changes are funneled through a submission queue of closures that
//! the owning thread drains before every blocking wait, giving every
//! registration a "happens-before the next poll" guarantee.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::channel::AsyncChannel;
use crate::error::Error;
use crate::poller::{wake_eventfd, Event, Interest, Poller};

/// A unit of work executed by the worker's owning thread against its poller.
pub(crate) type Registration = Box<dyn FnOnce(&mut WorkerCore) + Send>;

struct ChannelEntry {
    chan: Arc<AsyncChannel>,
    interest: Interest,
}

/// Loop-private state: the poller plus the token table. Only ever touched by
/// the owning thread, inside the event loop or a drained registration.
pub(crate) struct WorkerCore {
    poller: Poller,
    channels: HashMap<RawFd, ChannelEntry>,
    events: Vec<Event>,
}

impl WorkerCore {
    /// Add `interest` for `fd`, registering the channel on first touch.
    pub fn arm(
        &mut self,
        fd: RawFd,
        chan: &Arc<AsyncChannel>,
        interest: Interest,
    ) -> io::Result<()> {
        match self.channels.get_mut(&fd) {
            Some(entry) => {
                entry.interest |= interest;
                self.poller.modify(fd, fd as u64, entry.interest)
            }
            None => {
                self.poller.add(fd, fd as u64, interest)?;
                self.channels.insert(
                    fd,
                    ChannelEntry {
                        chan: Arc::clone(chan),
                        interest,
                    },
                );
                Ok(())
            }
        }
    }

    /// Clear `interest` bits for `fd`. The registration itself stays alive
    /// with an empty interest set until [`remove`](Self::remove).
    pub fn disarm(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.channels.get_mut(&fd) {
            entry.interest = entry.interest.remove(interest);
            // A disarm can race with the fd closing; nothing to do on error,
            // the entry is torn down through the close path.
            let _ = self.poller.modify(fd, fd as u64, entry.interest);
        }
    }

    /// Drop the registration and the channel reference for `fd`.
    pub fn remove(&mut self, fd: RawFd) {
        if self.channels.remove(&fd).is_some() {
            let _ = self.poller.delete(fd);
        }
    }
}

/// Shared handle to one event-loop thread.
pub(crate) struct Worker {
    tx: crossbeam_channel::Sender<Registration>,
    wake_fd: RawFd,
    thread_id: OnceLock<ThreadId>,
    /// Per-iteration counter bounding synchronous re-entrant completions.
    /// Reset by the loop, incremented by drivers running on this thread.
    invoker: AtomicUsize,
    shutdown: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a named worker thread driving a fresh poller.
    pub fn spawn(name: String, event_capacity: usize) -> Result<Arc<Worker>, Error> {
        let (tx, rx) = crossbeam_channel::unbounded::<Registration>();
        let poller = Poller::new(event_capacity).map_err(Error::Io)?;
        let wake_fd = poller.wake_fd();

        let worker = Arc::new(Worker {
            tx,
            wake_fd,
            thread_id: OnceLock::new(),
            invoker: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            join: Mutex::new(None),
        });

        let core = WorkerCore {
            poller,
            channels: HashMap::new(),
            events: Vec::new(),
        };
        let loop_worker = Arc::clone(&worker);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _ = loop_worker.thread_id.set(thread::current().id());
                run_loop(&loop_worker, core, rx);
            })
            .map_err(Error::Io)?;

        *worker
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(worker)
    }

    /// Enqueue a unit of work for the owning thread. Thread-safe; wakes the
    /// blocked poll call when submitted from a foreign thread.
    pub fn add_registration(&self, f: Registration) {
        if self.tx.send(f).is_err() {
            // Loop already exited; the channel teardown path handles cleanup.
            return;
        }
        if !self.is_worker_thread() {
            let _ = wake_eventfd(self.wake_fd);
        }
    }

    /// Whether the calling thread is this worker's owning thread.
    pub fn is_worker_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Bump the per-iteration invoker counter, returning its prior value.
    /// Only meaningful on the owning thread.
    pub fn begin_invoke(&self) -> usize {
        self.invoker.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the loop to exit and wake it. Safe to call more than once.
    pub fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = wake_eventfd(self.wake_fd);
    }

    /// Join the loop thread. Must be preceded by [`initiate_shutdown`](Self::initiate_shutdown).
    pub fn join(&self) {
        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    worker: &Arc<Worker>,
    mut core: WorkerCore,
    rx: crossbeam_channel::Receiver<Registration>,
) {
    loop {
        // One reset per iteration, before any key is driven.
        worker.invoker.store(0, Ordering::Relaxed);

        // Apply queued registrations in submission order before blocking.
        while let Ok(f) = rx.try_recv() {
            f(&mut core);
        }

        if worker.shutdown.load(Ordering::Acquire) {
            return;
        }

        let WorkerCore {
            poller,
            events,
            ..
        } = &mut core;
        let n = match poller.wait(events, None) {
            Ok(n) => n,
            Err(err) => {
                log::error!("poller wait failed, worker exiting: {err}");
                return;
            }
        };

        for i in 0..n {
            let ev = core.events[i];
            let fd = ev.token as RawFd;
            let (chan, armed) = match core.channels.get(&fd) {
                Some(entry) => (Arc::clone(&entry.chan), entry.interest),
                None => continue,
            };

            let broken = ev.interest.is_error() || ev.interest.is_hup();
            let fire_read = armed.is_readable() && (ev.interest.is_readable() || broken);
            let fire_write = armed.is_writable() && (ev.interest.is_writable() || broken);

            if !fire_read && !fire_write {
                if broken && armed.is_empty() {
                    // Orphaned error/hangup on a disarmed registration would
                    // fire forever under level triggering.
                    core.remove(fd);
                }
                continue;
            }

            // Drive first, then clear the fired interest. Re-arms requested
            // by the drivers go through the queue and apply on the next
            // drain, after this direct disarm.
            if fire_read {
                chan.do_read(true);
            }
            if fire_write {
                chan.do_write();
            }

            let mut fired = Interest::NONE;
            if fire_read {
                fired |= Interest::READABLE;
            }
            if fire_write {
                fired |= Interest::WRITABLE;
            }
            core.disarm(fd, fired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn registrations_run_on_worker_thread() {
        let worker = Worker::spawn("epoline-test-worker".into(), 16).expect("spawn");
        let ran = Arc::new(AtomicU32::new(0));
        let (tx, rx) = crossbeam_channel::bounded::<ThreadId>(1);

        let ran2 = Arc::clone(&ran);
        worker.add_registration(Box::new(move |_core| {
            ran2.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(thread::current().id());
        }));

        let loop_thread = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("registration executed");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_ne!(loop_thread, thread::current().id());

        worker.initiate_shutdown();
        worker.join();
    }

    #[test]
    fn registrations_apply_in_submission_order() {
        let worker = Worker::spawn("epoline-test-order".into(), 16).expect("spawn");
        let (tx, rx) = crossbeam_channel::unbounded::<u32>();
        for i in 0..32u32 {
            let tx = tx.clone();
            worker.add_registration(Box::new(move |_core| {
                let _ = tx.send(i);
            }));
        }
        for expect in 0..32u32 {
            let got = rx.recv_timeout(Duration::from_secs(5)).expect("recv");
            assert_eq!(got, expect);
        }
        worker.initiate_shutdown();
        worker.join();
    }

    #[test]
    fn shutdown_is_idempotent_and_joins() {
        let worker = Worker::spawn("epoline-test-shutdown".into(), 16).expect("spawn");
        worker.initiate_shutdown();
        worker.initiate_shutdown();
        worker.join();
        worker.join();
        // Registrations after shutdown are dropped silently.
        worker.add_registration(Box::new(|_core| {}));
    }

    #[test]
    fn is_worker_thread_false_from_caller() {
        let worker = Worker::spawn("epoline-test-ident".into(), 16).expect("spawn");
        assert!(!worker.is_worker_thread());
        let (tx, rx) = crossbeam_channel::bounded::<bool>(1);
        let w = Arc::clone(&worker);
        // Give the loop a beat to record its thread id before asking.
        worker.add_registration(Box::new(move |_core| {
            let _ = tx.send(w.is_worker_thread());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("recv"));
        worker.initiate_shutdown();
        worker.join();
    }
}
