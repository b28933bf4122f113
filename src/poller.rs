//! Readiness demultiplexing over `epoll(7)`.
//!
//! Registration interest is a bitset over read/write/peer-hangup/error plus
//! the edge-triggered and one-shot modifiers. One-shot interest is disarmed
//! by the kernel when it fires and must be re-armed with [`Poller::modify`];
//! `epoll_ctl` is kernel-serialized, so re-arming may happen from any thread
//! holding a shared reference.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

bitflags! {
    /// Interest registered for a descriptor, and the readiness reported back.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        /// Descriptor is readable.
        const READ = libc::EPOLLIN as u32;
        /// Descriptor is writable.
        const WRITE = libc::EPOLLOUT as u32;
        /// Peer shut down its writing half.
        const PEER_HUP = libc::EPOLLRDHUP as u32;
        /// Error condition; always reported, never needs registering.
        const ERROR = libc::EPOLLERR as u32;
        /// Hangup; always reported, never needs registering.
        const HUP = libc::EPOLLHUP as u32;
        /// Report readiness once per transition instead of while it holds.
        const EDGE = libc::EPOLLET as u32;
        /// Disarm after one report until re-armed via `modify`.
        const ONE_SHOT = libc::EPOLLONESHOT as u32;
    }
}

/// A single readiness report.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    fd: RawFd,
    readiness: Interest,
}

impl Event {
    /// The descriptor this report is about.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// True when the descriptor has bytes to read.
    pub fn is_readable(&self) -> bool {
        self.readiness.intersects(Interest::READ)
    }

    /// True when the descriptor can accept writes.
    pub fn is_writable(&self) -> bool {
        self.readiness.intersects(Interest::WRITE)
    }

    /// True when the peer hung up or the descriptor errored.
    pub fn is_closed(&self) -> bool {
        self.readiness
            .intersects(Interest::PEER_HUP | Interest::HUP | Interest::ERROR)
    }
}

/// Reusable buffer for readiness reports returned by [`Poller::wait`].
pub struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    /// Creates a buffer able to hold `capacity` reports per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    /// Iterates over the reports of the most recent wait.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf[..self.len].iter().map(|ev| Event {
            fd: ev.u64 as RawFd,
            readiness: Interest::from_bits_retain(ev.events),
        })
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("capacity", &self.buf.len())
            .field("len", &self.len)
            .finish()
    }
}

/// Owner of an epoll instance.
#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    /// Creates a new epoll instance.
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Starts watching `fd` with the given interest.
    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.bits())
    }

    /// Replaces the interest registered for `fd`, re-arming one-shot entries.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest.bits())
    }

    /// Stops watching `fd`.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Waits up to `timeout_ms` milliseconds for readiness (-1 blocks
    /// indefinitely, 0 polls). Returns the number of reports written into
    /// `events`. Interrupted waits are retried.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.buf.as_mut_ptr(),
                    events.buf.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                events.len = n as usize;
                return Ok(events.len);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.epfd) };
    }
}

/// Wakes a blocked [`Poller::wait`] from another thread via an eventfd
/// registered with the poller.
#[derive(Debug)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    /// Creates the eventfd and registers it for read readiness.
    pub fn new(poller: &Poller) -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let waker = Self { fd };
        poller.add(fd, Interest::READ)?;
        Ok(waker)
    }

    /// The descriptor readiness reports for this waker carry.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Makes the poller's next (or current) wait report this waker readable.
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.fd, (&one as *const u64).cast(), 8) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // counter saturated: a wake-up is already pending
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clears the pending wake-up counter.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        let _ = unsafe { libc::read(self.fd, (&mut count as *mut u64).cast(), 8) };
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.fd) };
    }
}
