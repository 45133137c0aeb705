//! Readiness multiplexer: a thin, level-triggered epoll wrapper.
//!
//! Each [`Poller`] is owned by exactly one worker thread. The only operation
//! other threads may perform is [`Poller::wake`] (an eventfd write), which is
//! how cross-thread registration requests interrupt a blocked wait.
//!
//! Level-triggered mode is deliberate: the event loop explicitly clears fired
//! interest after dispatching it, mirroring selector semantics where a ready
//! key keeps firing until its interest set is adjusted.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Token reserved for the internal wake eventfd.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness interest flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b0001);
    pub const WRITABLE: Interest = Interest(0b0010);
    pub const ERROR: Interest = Interest(0b0100);
    pub const HUP: Interest = Interest(0b1000);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub interest: Interest,
}

/// Level-triggered epoll instance plus an eventfd for cross-thread wakeups.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
            }
            return Err(err);
        }
        let poller = Poller {
            epoll_fd,
            wake_fd,
            buf: vec![unsafe { std::mem::zeroed() }; event_capacity.max(1)],
        };
        poller.ctl(libc::EPOLL_CTL_ADD, wake_fd, Interest::READABLE, WAKE_TOKEN)?;
        Ok(poller)
    }

    /// The eventfd other threads write to in order to interrupt `wait`.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_fd
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, event_ptr) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, token)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::NONE, 0)
    }

    /// Block until readiness or wakeup. Wake notifications are drained
    /// internally and never surfaced as events. EINTR reports zero events.
    pub fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let timeout_ms = timeout.map_or(-1i32, |d| d.as_millis().min(i32::MAX as u128) as i32);

        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.buf.as_mut_ptr(),
                self.buf.len() as i32,
                timeout_ms,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for raw in &self.buf[..count as usize] {
            if raw.u64 == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            events.push(Event {
                token: raw.u64,
                interest: epoll_to_interest(raw.events),
            });
        }
        Ok(events.len())
    }

    /// Interrupt a blocked `wait`. Safe to call from any thread holding the
    /// raw wake fd; see [`wake_eventfd`].
    #[cfg(test)]
    pub fn wake(&self) -> io::Result<()> {
        wake_eventfd(self.wake_fd)
    }

    fn drain_wake(&self) {
        // Reading the eventfd resets its counter; one read clears all
        // accumulated wakeups.
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.wake_fd, &mut val as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_fd);
        }
    }
}

/// Write to a poller's wake eventfd from an arbitrary thread.
pub(crate) fn wake_eventfd(wake_fd: RawFd) -> io::Result<()> {
    let one: u64 = 1;
    let ret = unsafe { libc::write(wake_fd, &one as *const u64 as *const libc::c_void, 8) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // The counter saturating at u64::MAX - 1 would report EAGAIN; the
        // poller is awake in that case, which is all we need.
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_to_interest(events: u32) -> Interest {
    let mut interest = Interest::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        interest |= Interest::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        interest |= Interest::WRITABLE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        interest |= Interest::ERROR;
    }
    if events & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
        interest |= Interest::HUP;
    }
    interest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn readable_after_peer_write() {
        let mut poller = Poller::new(16).expect("poller");
        let (a, mut b) = UnixStream::pair().expect("pair");
        poller
            .add(a.as_raw_fd(), 7, Interest::READABLE)
            .expect("add");

        let mut events = Vec::new();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .expect("wait");
        assert_eq!(n, 0, "no data yet");

        b.write_all(b"x").expect("write");
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .expect("wait");
        assert_eq!(n, 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].interest.is_readable());
    }

    #[test]
    fn modify_clears_interest() {
        let mut poller = Poller::new(16).expect("poller");
        let (a, mut b) = UnixStream::pair().expect("pair");
        poller
            .add(a.as_raw_fd(), 1, Interest::READABLE)
            .expect("add");
        b.write_all(b"x").expect("write");

        poller
            .modify(a.as_raw_fd(), 1, Interest::NONE)
            .expect("modify");
        let mut events = Vec::new();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(20)))
            .expect("wait");
        assert_eq!(n, 0, "disarmed fd must not fire");
    }

    #[test]
    fn wake_unblocks_wait() {
        let mut poller = Poller::new(16).expect("poller");
        let wake_fd = poller.wake_fd();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            wake_eventfd(wake_fd).expect("wake");
        });

        let start = Instant::now();
        let mut events = Vec::new();
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .expect("wait");
        assert_eq!(n, 0, "wake is not surfaced as an event");
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().expect("join");
    }

    #[test]
    fn delete_stops_events() {
        let mut poller = Poller::new(16).expect("poller");
        let (a, mut b) = UnixStream::pair().expect("pair");
        poller
            .add(a.as_raw_fd(), 3, Interest::READABLE)
            .expect("add");
        poller.delete(a.as_raw_fd()).expect("delete");
        b.write_all(b"x").expect("write");

        let mut events = Vec::new();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(20)))
            .expect("wait");
        assert_eq!(n, 0);
    }

    #[test]
    fn self_wake_then_drain() {
        let mut poller = Poller::new(16).expect("poller");
        poller.wake().expect("wake");
        poller.wake().expect("wake");
        let mut events = Vec::new();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .expect("wait");
        assert_eq!(n, 0);
        // Counter was reset by the drain; a second wait must block again.
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .expect("wait");
        assert_eq!(n, 0);
    }
}
