use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};

use crate::sys::Event;
use crate::token::Token;
use crate::Interest;

const EVENT_CAPACITY: usize = 1024;

pub(crate) struct Selector {
    ep: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("ep", &self.ep.as_raw_fd())
            .finish()
    }
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector {
            ep,
            buf: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))
        .map(|_| ())
    }

    pub(crate) fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying a
                // zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        self.buf.clear();
        let n_events = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.buf.as_mut_ptr(),
            self.buf.capacity() as libc::c_int,
            timeout,
        ))?;
        // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
        unsafe { self.buf.set_len(n_events as usize) };

        for ep_event in &self.buf {
            let kind = ep_event.events as libc::c_int;
            events.push(Event {
                token: Token(ep_event.u64),
                readable: kind & (EPOLLIN | EPOLLHUP | EPOLLERR) != 0,
                writable: kind & (EPOLLOUT | EPOLLHUP | EPOLLERR) != 0,
            });
        }
        Ok(())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    // Level-triggered on purpose: callbacks stay installed until cleared, so
    // the kernel re-reporting unread readiness is the desired behavior.
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}
