//! Per-connection asynchronous channel: the read and write drivers.
//!
//! An [`AsyncChannel`] wraps one established, non-blocking TCP socket and
//! tracks at most one pending read and one pending write. Each direction's
//! pending state is a single owned value behind a mutex, moved out as a unit
//! immediately before its completion handler runs, so a re-entrant request
//! issued from inside the handler always observes a clean state.
//!
//! Direct (synchronous) completion is attempted whenever the calling thread
//! is allowed to: always from the multiplexer dispatch path, and otherwise
//! only while the per-iteration invoker counter is under the configured
//! depth. Past the bound, the continuation is forced onto the deferred
//! (registered) path so handler→I/O→handler chains cannot grow the stack.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{BufMut, Bytes, BytesMut};

use crate::completion::{
    Attachment, ReadCompletionHandler, ReadOutcome, WriteCompletionHandler,
};
use crate::error::Error;
use crate::future::ReadFuture;
use crate::metrics;
use crate::poller::Interest;
use crate::worker::Worker;

/// Inline re-read attempts after a registration failure on the future-read
/// handoff path, before the error is surfaced to the handler.
const MAX_REGISTER_RETRIES: u8 = 3;

struct ReadOp {
    buf: Option<BytesMut>,
    attachment: Attachment,
    handler: Arc<dyn ReadCompletionHandler>,
    register_retries: u8,
}

struct WriteOp {
    buf: Bytes,
    written: usize,
    attachment: Attachment,
    handler: Arc<dyn WriteCompletionHandler>,
}

#[derive(Default)]
struct ReadState {
    op: Option<ReadOp>,
}

#[derive(Default)]
struct WriteState {
    op: Option<WriteOp>,
}

/// A completion-callback asynchronous socket channel.
///
/// Created through [`ChannelGroup::wrap`](crate::ChannelGroup::wrap); worker
/// assignment is fixed for the channel's lifetime.
pub struct AsyncChannel {
    /// Self-handle so registration closures can capture a strong reference,
    /// keeping the fd alive until the worker has dropped its entry.
    me: Weak<AsyncChannel>,
    fd: OwnedFd,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    read_worker: Arc<Worker>,
    common_worker: Arc<Worker>,
    low_memory: bool,
    max_invoker: usize,
    closed: AtomicBool,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    /// Recursion counter for writes issued from threads that are neither the
    /// common worker nor the read worker (e.g. a streaming producer thread).
    write_invoker: AtomicUsize,
    /// Whether a registration entry exists on the read worker's poller.
    registered_read: AtomicBool,
    /// Whether a registration entry exists on the common worker's poller
    /// (write interest, or read interest from the future-read handoff).
    registered_common: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned direction mutex means a completion handler panicked on
    // another thread; the state itself is still a consistent owned value.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AsyncChannel {
    pub(crate) fn wrap(
        stream: TcpStream,
        read_worker: Arc<Worker>,
        common_worker: Arc<Worker>,
        low_memory: bool,
        max_invoker: usize,
    ) -> Result<Arc<Self>, Error> {
        stream.set_nonblocking(true).map_err(Error::Io)?;
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        metrics::CHANNELS_OPEN.increment();
        Ok(Arc::new_cyclic(|me| AsyncChannel {
            me: me.clone(),
            fd: OwnedFd::from(stream),
            local,
            peer,
            read_worker,
            common_worker,
            low_memory,
            max_invoker,
            closed: AtomicBool::new(false),
            read: Mutex::new(ReadState::default()),
            write: Mutex::new(WriteState::default()),
            write_invoker: AtomicUsize::new(0),
            registered_read: AtomicBool::new(false),
            registered_common: AtomicBool::new(false),
        }))
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Strong self-handle for registration closures. `None` only while the
    /// last reference is being dropped, at which point no worker holds an
    /// entry for this channel either.
    fn handle(&self) -> Option<Arc<AsyncChannel>> {
        self.me.upgrade()
    }

    /// Local address recorded when the channel was wrapped.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Peer address recorded when the channel was wrapped.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the channel has not been closed yet.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    // ── Read ────────────────────────────────────────────────────────

    /// Request an asynchronous read into `buf`.
    ///
    /// `buf` may be `None` only in low-memory mode, in which case allocation
    /// is deferred until the socket is known to be readable and the handler
    /// receives [`ReadOutcome::NeedBuffer`].
    ///
    /// Fails synchronously with [`Error::ReadPending`] when a read is already
    /// in flight; the pending operation is not disturbed. A read on a closed
    /// channel is accepted and delivered through the handler's failure path.
    pub fn request_read(
        &self,
        buf: Option<BytesMut>,
        attachment: Attachment,
        handler: Arc<dyn ReadCompletionHandler>,
    ) -> Result<(), Error> {
        if buf.is_none() && !self.low_memory {
            return Err(Error::BufferRequired);
        }
        {
            let mut st = lock(&self.read);
            if st.op.is_some() {
                return Err(Error::ReadPending);
            }
            if !self.is_open() {
                drop(st);
                handler.failed(Error::ChannelClosed, attachment);
                return Ok(());
            }
            st.op = Some(ReadOp {
                buf,
                attachment,
                handler,
                register_retries: 0,
            });
        }
        self.do_read(false);
        Ok(())
    }

    /// Timeout-accepting variant of [`request_read`](Self::request_read).
    /// Pending-operation timeouts are not supported; any non-zero timeout
    /// fails fast with [`Error::TimeoutUnsupported`].
    pub fn request_read_timed(
        &self,
        buf: Option<BytesMut>,
        timeout: std::time::Duration,
        attachment: Attachment,
        handler: Arc<dyn ReadCompletionHandler>,
    ) -> Result<(), Error> {
        if !timeout.is_zero() {
            return Err(Error::TimeoutUnsupported);
        }
        self.request_read(buf, attachment, handler)
    }

    /// Issue a future-style read. The returned [`ReadFuture`] can be waited
    /// on or cancelled; cancellation is observed lazily by the read driver.
    pub fn read_future(&self, buf: Option<BytesMut>) -> Result<ReadFuture, Error> {
        let future = ReadFuture::new();
        self.request_read(buf, crate::completion::no_attachment(), future.handler())?;
        Ok(future)
    }

    /// Read driver. `direct` is true when invoked from a worker's multiplexer
    /// dispatch path.
    pub(crate) fn do_read(&self, direct: bool) {
        let mut st = lock(&self.read);
        let mut op = match st.op.take() {
            Some(op) => op,
            None => return, // resolved by a racing direct completion
        };

        // A cancelled future read is torn down without touching the buffer
        // or invoking anything.
        if op.handler.is_cancelled() {
            drop(st);
            self.clear_read_interest();
            return;
        }

        // Low-memory deferred allocation: the socket is readable but the
        // caller withheld the buffer. Hand control back so a real buffer can
        // be supplied and the read re-issued.
        if self.low_memory && direct && op.buf.is_none() {
            drop(st);
            metrics::READS_COMPLETED.increment();
            op.handler
                .completed(ReadOutcome::NeedBuffer, None, op.attachment);
            return;
        }

        let direct_read = direct
            || (self.read_worker.is_worker_thread()
                && self.read_worker.begin_invoke() < self.max_invoker);

        let mut read_size = 0usize;
        let mut eof = false;
        let mut buffer_full = false;
        if direct_read {
            if let Some(buf) = op.buf.as_mut() {
                if buf.capacity() == buf.len() {
                    buffer_full = true;
                } else {
                    match read_into(self.raw_fd(), buf) {
                        Ok(0) => eof = true,
                        Ok(n) => {
                            read_size = n;
                            buffer_full = buf.len() == buf.capacity();
                        }
                        Err(ref err)
                            if err.kind() == io::ErrorKind::WouldBlock
                                || err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            drop(st);
                            op.handler.failed(Error::Io(err), op.attachment);
                            return;
                        }
                    }
                }
            }
            // No buffer and not a direct dispatch invocation: fall through to
            // registration; the readiness event delivers NeedBuffer.
        } else if self.read_worker.is_worker_thread() {
            metrics::RECURSION_DEFERRALS.increment();
        }

        // A future-style caller cannot make progress on a zero-byte read:
        // clear read-worker interest and register with the common worker,
        // best-effort, retrying the read inline on registration failure.
        if read_size == 0 && !eof && !buffer_full && op.handler.is_future() {
            st.op = Some(op);
            drop(st);
            self.clear_read_interest();
            let chan = match self.handle() {
                Some(chan) => chan,
                None => return,
            };
            self.common_worker.add_registration(Box::new(move |core| {
                match core.arm(chan.raw_fd(), &chan, Interest::READABLE) {
                    Ok(()) => {
                        chan.registered_common.store(true, Ordering::Release);
                        metrics::REGISTRATIONS.increment();
                    }
                    Err(err) => chan.retry_read_registration(err),
                }
            }));
            return;
        }

        // Low-memory idle-buffer release: nothing arrived onto an empty
        // buffer, so drop the channel's reference and tell the caller it may
        // drop its own. The operation stays pending.
        let mut released = None;
        if self.low_memory
            && read_size == 0
            && !eof
            && !buffer_full
            && op.buf.as_ref().is_some_and(|b| b.is_empty())
        {
            op.buf = None;
            released = Some((op.handler.clone(), op.attachment.clone()));
        }

        if read_size != 0 || eof || buffer_full {
            drop(st);
            metrics::READS_COMPLETED.increment();
            metrics::BYTES_READ.add(read_size as u64);
            let ReadOp {
                buf,
                attachment,
                handler,
                ..
            } = op;
            let outcome = if eof {
                ReadOutcome::EndOfStream
            } else {
                ReadOutcome::Bytes(read_size)
            };
            handler.completed(outcome, buf, attachment);

            // The interest that backed this operation is no longer needed
            // unless the handler already re-issued a read.
            if self.registered_read.load(Ordering::Acquire) && lock(&self.read).op.is_none() {
                self.clear_read_interest();
            }
            return;
        }

        // No bytes yet, more expected: arm read interest on the owning read
        // worker (first registration and re-arm take the same path).
        st.op = Some(op);
        drop(st);
        if let Some((handler, attachment)) = released {
            handler.completed(ReadOutcome::BufferReleasable, None, attachment);
        }
        metrics::DEFERRED_READS.increment();
        let chan = match self.handle() {
            Some(chan) => chan,
            None => return,
        };
        self.read_worker.add_registration(Box::new(move |core| {
            match core.arm(chan.raw_fd(), &chan, Interest::READABLE) {
                Ok(()) => {
                    chan.registered_read.store(true, Ordering::Release);
                    metrics::REGISTRATIONS.increment();
                }
                Err(err) => chan.fail_read(Error::Registration(err.to_string())),
            }
        }));
    }

    /// Bounded retry after the future-read handoff failed to register: the
    /// handle may be closing mid-registration, so an unbounded inline retry
    /// could livelock.
    fn retry_read_registration(&self, err: io::Error) {
        let exhausted = {
            let mut st = lock(&self.read);
            match st.op.as_mut() {
                Some(op) => {
                    op.register_retries += 1;
                    op.register_retries > MAX_REGISTER_RETRIES
                }
                None => return,
            }
        };
        if exhausted {
            log::warn!(
                "read registration failed {MAX_REGISTER_RETRIES} times on {:?}: {err}",
                self.peer
            );
            self.fail_read(Error::Registration(err.to_string()));
        } else {
            self.do_read(true);
        }
    }

    fn clear_read_interest(&self) {
        if self.registered_read.load(Ordering::Acquire) {
            if let Some(chan) = self.handle() {
                self.read_worker.add_registration(Box::new(move |core| {
                    core.disarm(chan.raw_fd(), Interest::READABLE);
                }));
            }
        }
    }

    fn fail_read(&self, err: Error) {
        let op = lock(&self.read).op.take();
        match op {
            Some(op) => op.handler.failed(err, op.attachment),
            None => {
                // Defensive: an error with nobody to notify is fatal to the
                // channel.
                log::error!("read failure on {:?} with no pending operation: {err}", self.peer);
                let _ = self.close();
            }
        }
    }

    // ── Write ───────────────────────────────────────────────────────

    /// Request an asynchronous write of the whole of `buf`.
    ///
    /// The completion reports the full buffer length, accumulated across as
    /// many underlying writes as the kernel required. Fails synchronously
    /// with [`Error::WritePending`] when a write is already in flight; a
    /// write on a closed channel is accepted and delivered through the
    /// handler's failure path.
    pub fn request_write(
        &self,
        buf: Bytes,
        attachment: Attachment,
        handler: Arc<dyn WriteCompletionHandler>,
    ) -> Result<(), Error> {
        {
            let mut st = lock(&self.write);
            if st.op.is_some() {
                return Err(Error::WritePending);
            }
            if !self.is_open() {
                drop(st);
                handler.failed(Error::ChannelClosed, attachment);
                return Ok(());
            }
            st.op = Some(WriteOp {
                buf,
                written: 0,
                attachment,
                handler,
            });
        }
        self.do_write();
        Ok(())
    }

    /// Timeout-accepting variant of [`request_write`](Self::request_write);
    /// any non-zero timeout fails fast with [`Error::TimeoutUnsupported`].
    pub fn request_write_timed(
        &self,
        buf: Bytes,
        timeout: std::time::Duration,
        attachment: Attachment,
        handler: Arc<dyn WriteCompletionHandler>,
    ) -> Result<(), Error> {
        if !timeout.is_zero() {
            return Err(Error::TimeoutUnsupported);
        }
        self.request_write(buf, attachment, handler)
    }

    /// Write driver. Invoked from the request path and from the common
    /// worker's dispatch path; a write's completion handler commonly issues
    /// the next write immediately, so recursion accounting distinguishes the
    /// common worker thread, the read worker thread, and everything else.
    pub(crate) fn do_write(&self) {
        let mut st = lock(&self.write);
        let mut op = match st.op.take() {
            Some(op) => op,
            None => return,
        };

        let invoker = if self.common_worker.is_worker_thread() {
            self.common_worker.begin_invoke() + 1
        } else if self.read_worker.is_worker_thread() {
            // Read-worker callbacks unwind through the read driver's own
            // bound; writes issued from them are always direct.
            0
        } else {
            self.write_invoker.fetch_add(1, Ordering::Relaxed) + 1
        };

        if invoker < self.max_invoker {
            match write_from(self.raw_fd(), &op.buf[op.written..]) {
                Ok(n) => op.written += n,
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    drop(st);
                    op.handler.failed(Error::Io(err), op.attachment);
                    return;
                }
            }
        } else {
            self.write_invoker.store(0, Ordering::Relaxed);
            metrics::RECURSION_DEFERRALS.increment();
        }

        if op.written == op.buf.len() {
            drop(st);
            metrics::WRITES_COMPLETED.increment();
            metrics::BYTES_WRITTEN.add(op.written as u64);
            let WriteOp {
                written,
                attachment,
                handler,
                ..
            } = op;
            handler.completed(written, attachment);
            return;
        }

        // Partial write or deferred attempt: arm write interest on the
        // common worker and resume from its dispatch path.
        st.op = Some(op);
        drop(st);
        metrics::DEFERRED_WRITES.increment();
        let chan = match self.handle() {
            Some(chan) => chan,
            None => return,
        };
        self.common_worker.add_registration(Box::new(move |core| {
            match core.arm(chan.raw_fd(), &chan, Interest::WRITABLE) {
                Ok(()) => {
                    chan.registered_common.store(true, Ordering::Release);
                    metrics::REGISTRATIONS.increment();
                }
                Err(err) => chan.fail_write(Error::Registration(err.to_string())),
            }
        }));
    }

    fn fail_write(&self, err: Error) {
        let op = lock(&self.write).op.take();
        match op {
            Some(op) => op.handler.failed(err, op.attachment),
            None => {
                log::error!("write failure on {:?} with no pending operation: {err}", self.peer);
                let _ = self.close();
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Close the channel. Idempotent.
    ///
    /// The socket is shut down immediately and both workers are asked to
    /// drop their registrations; pending operations in both directions are
    /// released without invoking their handlers (a close is an implicit
    /// cancellation). The first error from shutting the socket down is
    /// remembered and re-raised after all cancellations have been issued.
    /// The raw fd itself is closed when the last reference to the channel
    /// drops, so a queued deregistration can never hit a recycled fd number.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        metrics::CHANNELS_OPEN.decrement();
        metrics::CHANNELS_CLOSED.increment();

        let mut first_err = None;
        if unsafe { libc::shutdown(self.raw_fd(), libc::SHUT_RDWR) } < 0 {
            let err = io::Error::last_os_error();
            // A never-connected or already-reset socket is not an error for
            // an idempotent close.
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                first_err = Some(err);
            }
        }

        if self.registered_read.swap(false, Ordering::AcqRel) {
            if let Some(chan) = self.handle() {
                self.read_worker.add_registration(Box::new(move |core| {
                    core.remove(chan.raw_fd());
                }));
            }
        }
        if self.registered_common.swap(false, Ordering::AcqRel) {
            if let Some(chan) = self.handle() {
                self.common_worker.add_registration(Box::new(move |core| {
                    core.remove(chan.raw_fd());
                }));
            }
        }

        lock(&self.read).op = None;
        lock(&self.write).op = None;

        first_err.map_or(Ok(()), |err| Err(Error::Io(err)))
    }

    /// Shut down the reading side of the socket.
    pub fn shutdown_input(&self) -> Result<(), Error> {
        if unsafe { libc::shutdown(self.raw_fd(), libc::SHUT_RD) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Shut down the writing side of the socket.
    pub fn shutdown_output(&self) -> Result<(), Error> {
        if unsafe { libc::shutdown(self.raw_fd(), libc::SHUT_WR) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Read into `buf`'s spare capacity. `Ok(0)` is end-of-stream; "no data" on
/// a non-blocking socket surfaces as `WouldBlock`.
fn read_into(fd: RawFd, buf: &mut BytesMut) -> io::Result<usize> {
    let dst = buf.chunk_mut();
    let n = unsafe { libc::read(fd, dst.as_mut_ptr() as *mut libc::c_void, dst.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let n = n as usize;
    unsafe {
        buf.advance_mut(n);
    }
    Ok(n)
}

fn write_from(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::write(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
