// Copyright (c) The arbiterd Authors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Thin owned-fd wrappers around the readiness plumbing the event loop is
//! built on: eventfd for termination, timerfd for preemption timeouts and
//! epoll for the dispatch itself.

use anyhow::bail;
use anyhow::Result;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Upper bound on the number of events drained per epoll_wait call.
pub const MAX_EPOLL_EVENTS: usize = 1024;

/// Write one count to an eventfd. Async-signal-safe: a single write(2), no
/// allocation, so it may be called from a signal handler.
pub fn notify_eventfd(fd: RawFd) {
    let val: u64 = 1;
    unsafe {
        libc::write(fd, &val as *const u64 as *const libc::c_void, 8);
    }
}

pub struct EventFd(OwnedFd);

impl EventFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            bail!("eventfd failed: {}", std::io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub fn notify(&self) {
        notify_eventfd(self.0.as_raw_fd());
    }

    /// Reset the counter so the fd stops polling readable.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.0.as_raw_fd(), &mut val as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// A one-shot monotonic timer. Dropping it closes the fd and cancels the
/// expiration.
pub struct TimerFd(OwnedFd);

impl TimerFd {
    pub fn oneshot(timeout: Duration) -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            bail!("timerfd_create failed: {}", std::io::Error::last_os_error());
        }
        let timer = Self(unsafe { OwnedFd::from_raw_fd(fd) });

        // an all-zero it_value would disarm instead of firing immediately
        let timeout = timeout.max(Duration::from_nanos(1));
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(timer.0.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret < 0 {
            bail!("timerfd_settime failed: {}", std::io::Error::last_os_error());
        }
        Ok(timer)
    }

    /// Consume the expiration count so the fd stops polling readable.
    pub fn ack(&self) {
        let mut expirations: u64 = 0;
        unsafe {
            libc::read(
                self.0.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct Epoll(OwnedFd);

impl Epoll {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            bail!("epoll_create1 failed: {}", std::io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Watch fd for input readiness. The fd itself is the dispatch token.
    pub fn add(&self, fd: RawFd) -> Result<()> {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            u64: fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.0.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret < 0 {
            bail!(
                "epoll_ctl(ADD, {}) failed: {}",
                fd,
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    pub fn del(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.0.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            bail!(
                "epoll_ctl(DEL, {}) failed: {}",
                fd,
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    /// Block until at least one watched fd is ready and return the full ready
    /// batch as (fd, event mask) pairs. timeout_ms of -1 blocks indefinitely.
    pub fn wait(&self, timeout_ms: i32) -> Result<Vec<(RawFd, u32)>> {
        let mut events: [libc::epoll_event; MAX_EPOLL_EVENTS] = unsafe { std::mem::zeroed() };
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.0.as_raw_fd(),
                    events.as_mut_ptr(),
                    MAX_EPOLL_EVENTS as i32,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                bail!("epoll_wait failed: {}", err);
            }
            return Ok(events[..n as usize]
                .iter()
                .map(|ev| (ev.u64 as RawFd, ev.events))
                .collect());
        }
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
