//! Linux `epoll`-based poller.
//!
//! The engine registers every source descriptor once, with no interest,
//! and toggles interest as sources are resumed and suspended. All
//! registrations carry `EPOLLONESHOT`: a delivered readiness disarms the
//! descriptor in the kernel until the engine re-arms it after the queued
//! callback has run. This both serializes event delivery per source and
//! keeps suspended-but-erroring descriptors from spinning the poll loop
//! (`EPOLLERR`/`EPOLLHUP` are reported even with an empty interest set).

use super::Interest;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLIN, EPOLLONESHOT, EPOLLOUT,
    epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Reserved token for the internal wake-up eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

/// Wakes a blocked `epoll_wait` call from another thread.
pub(crate) struct Waker(RawFd);

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const _ as *const _, 8);
        }
    }
}

pub(crate) struct Poller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,

    /// Waker wrapping the internal eventfd.
    waker: Arc<Waker>,
}

unsafe impl Send for Poller {}

impl Poller {
    /// Creates the epoll instance and registers the wake eventfd as a
    /// persistent (non-oneshot) read source.
    pub(crate) fn new() -> Self {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        assert!(epoll >= 0, "epoll_create1 failed");

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(eventfd >= 0, "eventfd failed");

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) };
        assert!(rc == 0, "failed to register wake eventfd");

        Self {
            epoll,
            events: Vec::with_capacity(64),
            waker: Arc::new(Waker(eventfd)),
        }
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Registers a descriptor with no interest; the source starts suspended.
    pub(crate) fn add(&self, fd: RawFd, token: usize) {
        let mut event = epoll_event {
            events: EPOLLONESHOT as u32,
            u64: token as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
        debug_assert_eq!(rc, 0);
    }

    /// Arms the descriptor for one readiness delivery.
    pub(crate) fn arm(&self, fd: RawFd, token: usize, interest: Interest) {
        let flags = match interest {
            Interest::Read => EPOLLIN,
            Interest::Write => EPOLLOUT,
        };

        let mut event = epoll_event {
            events: (flags | EPOLLONESHOT) as u32,
            u64: token as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_MOD, fd, &mut event) };
        debug_assert_eq!(rc, 0);
    }

    /// Clears the descriptor's interest without removing it.
    pub(crate) fn disarm(&self, fd: RawFd, token: usize) {
        let mut event = epoll_event {
            events: EPOLLONESHOT as u32,
            u64: token as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_MOD, fd, &mut event) };
        debug_assert_eq!(rc, 0);
    }

    /// Removes a descriptor from the poller.
    pub(crate) fn remove(&self, fd: RawFd) {
        unsafe {
            epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Blocks until at least one source is ready or the waker fires,
    /// appending ready tokens to `tokens`.
    pub(crate) fn poll(&mut self, tokens: &mut Vec<usize>) -> io::Result<()> {
        unsafe {
            self.events.set_len(self.events.capacity());
        }

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                -1,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            unsafe { self.events.set_len(0) };
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            // Wake-up event: drain the eventfd counter
            if ev.u64 == WAKE_TOKEN {
                let mut buf = 0u64;
                unsafe {
                    libc::read(self.waker.0, &mut buf as *mut _ as *mut _, 8);
                }
                continue;
            }

            tokens.push(ev.u64 as usize);
        }

        Ok(())
    }
}
