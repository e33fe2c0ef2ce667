//! Poller backends.
//!
//! Each backend maintains its own descriptor index and exposes the same
//! small contract: register/reregister/deregister a descriptor with an
//! [`Interest`] set, and `select` for readiness with a timeout. The owning
//! event loop drives exactly one backend; the concrete choice is made at
//! loop construction.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::token::Token;
use crate::Interest;

mod null;
pub(crate) mod unix;

/// A readiness event, normalized across backends.
///
/// Backends that report HUP/ERR conditions fan them out as both read- and
/// write-ready so user callbacks observe remote close regardless of which
/// direction they registered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) token: Token,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Errno values that mean "nothing happened, try again later".
///
/// Spurious wakeups and transient resource shortages are swallowed at the
/// backend layer; everything else is surfaced.
pub(crate) fn ignore_errno(errno: i32) -> bool {
    if errno == libc::EINTR
        || errno == libc::EAGAIN
        || errno == libc::EWOULDBLOCK
        || errno == libc::ETIME
        || errno == libc::ENOBUFS
        || errno == libc::ENOENT
        || errno == libc::EINPROGRESS
    {
        return true;
    }
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    if errno == libc::ERESTART {
        return true;
    }
    false
}

pub(crate) fn ignore_error(err: &io::Error) -> bool {
    err.raw_os_error().map(ignore_errno).unwrap_or(false)
}

/// The backend in use by a loop. A sum over the platform's multiplexers; the
/// `Null` variant is always available and only sleeps the poll budget.
#[derive(Debug)]
pub(crate) enum Selector {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(unix::epoll::Selector),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(unix::kqueue::Selector),
    Poll(unix::poll::Selector),
    Select(unix::select::Selector),
    Null(null::Selector),
}

impl Selector {
    pub(crate) fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.register(fd, token, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Selector::Kqueue(s) => s.register(fd, token, interest),
            Selector::Poll(s) => s.register(fd, token, interest),
            Selector::Select(s) => s.register(fd, token, interest),
            Selector::Null(s) => s.register(fd, token, interest),
        }
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.reregister(fd, token, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Selector::Kqueue(s) => s.reregister(fd, token, interest),
            Selector::Poll(s) => s.reregister(fd, token, interest),
            Selector::Select(s) => s.reregister(fd, token, interest),
            Selector::Null(s) => s.reregister(fd, token, interest),
        }
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.deregister(fd),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Selector::Kqueue(s) => s.deregister(fd),
            Selector::Poll(s) => s.deregister(fd),
            Selector::Select(s) => s.deregister(fd),
            Selector::Null(s) => s.deregister(fd),
        }
    }

    /// Waits for readiness, filling `events`. Transient errors clear the
    /// event list and return `Ok`; the caller simply polls again on the next
    /// iteration.
    pub(crate) fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        let res = match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.select(events, timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Selector::Kqueue(s) => s.select(events, timeout),
            Selector::Poll(s) => s.select(events, timeout),
            Selector::Select(s) => s.select(events, timeout),
            Selector::Null(s) => s.select(events, timeout),
        };
        match res {
            Ok(()) => Ok(()),
            Err(ref err) if ignore_error(err) => {
                events.clear();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

pub(crate) fn new_selector(backend: crate::Backend) -> io::Result<Selector> {
    match backend {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        crate::Backend::Epoll => unix::epoll::Selector::new().map(Selector::Epoll),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        crate::Backend::Kqueue => unix::kqueue::Selector::new().map(Selector::Kqueue),
        crate::Backend::Poll => Ok(Selector::Poll(unix::poll::Selector::new())),
        crate::Backend::Select => Ok(Selector::Select(unix::select::Selector::new())),
        crate::Backend::Null => Ok(Selector::Null(null::Selector)),
    }
}
