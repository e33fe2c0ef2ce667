use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{cmp, ptr};

use libc::time_t;

use crate::sys::Event;
use crate::token::Token;
use crate::Interest;

const EVENT_CAPACITY: usize = 1024;

#[cfg(not(target_os = "netbsd"))]
type Filter = libc::c_short;
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;

#[cfg(target_os = "netbsd")]
type Filter = u32;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;
#[cfg(target_os = "netbsd")]
type Count = usize;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as UData,
        }
    };
}

pub(crate) struct Selector {
    kq: OwnedFd,
    buf: Vec<libc::kevent>,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("kq", &self.kq.as_raw_fd())
            .finish()
    }
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
        super::set_cloexec(kq.as_raw_fd(), true)?;
        Ok(Selector {
            kq,
            buf: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // EV_RECEIPT applies the changes and reports per-change results
        // without draining pending events.
        let flags = libc::EV_RECEIPT;
        let r = if interest.is_readable() {
            libc::EV_ADD
        } else {
            libc::EV_DELETE
        };
        let w = if interest.is_writable() {
            libc::EV_ADD
        } else {
            libc::EV_DELETE
        };
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags | r, token.0 as usize),
            kevent!(fd, libc::EVFILT_WRITE, flags | w, token.0 as usize),
        ];

        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            changes.as_mut_ptr(),
            changes.len() as Count,
            ptr::null(),
        ))?;

        for (change, dir_flags) in changes.iter().zip([r, w]) {
            debug_assert_eq!(change.flags & libc::EV_ERROR, libc::EV_ERROR);
            if change.data == 0 {
                continue;
            }
            // EV_DELETE of a filter that was never added is fine.
            if change.data as i32 == libc::ENOENT && dir_flags & libc::EV_DELETE != 0 {
                continue;
            }
            // Old macOS versions return EPIPE when registering the write
            // side of a pipe whose other end is gone; events are still
            // reported afterwards.
            if change.data as i32 == libc::EPIPE && change.filter == libc::EVFILT_WRITE as Filter {
                continue;
            }
            return Err(io::Error::from_raw_os_error(change.data as i32));
        }
        Ok(())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // EV_ADD doubles as a modify when the filter is already present.
        self.register(fd, token, interest)
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags, 0),
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
        ];

        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            changes.as_mut_ptr(),
            changes.len() as Count,
            ptr::null(),
        ))?;

        for change in changes.iter() {
            debug_assert_eq!(change.flags & libc::EV_ERROR, libc::EV_ERROR);
            if change.data != 0 && change.data as i32 != libc::ENOENT {
                return Err(io::Error::from_raw_os_error(change.data as i32));
            }
        }
        Ok(())
    }

    pub(crate) fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), time_t::MAX as u64) as time_t,
            // Nanoseconds are guaranteed to be below one billion, making the
            // cast to i32 safe; the cast itself is needed on platforms where
            // C's long is 32 bits.
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timespec = timespec
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        self.buf.clear();
        let n_events = syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            self.buf.as_mut_ptr(),
            self.buf.capacity() as Count,
            timespec,
        ))?;
        // SAFETY: `kevent` assigned the first `n_events` entries.
        unsafe { self.buf.set_len(n_events as usize) };

        for kevent in &self.buf {
            // EOF and error conditions surface on both directions so user
            // callbacks observe remote close.
            let closed = kevent.flags & (libc::EV_EOF | libc::EV_ERROR) != 0;
            events.push(Event {
                token: Token(kevent.udata as usize as u64),
                readable: kevent.filter == libc::EVFILT_READ as Filter || closed,
                writable: kevent.filter == libc::EVFILT_WRITE as Filter || closed,
            });
        }
        Ok(())
    }
}
