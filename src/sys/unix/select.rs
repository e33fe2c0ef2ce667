use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::sys::Event;
use crate::token::Token;
use crate::Interest;

/// `select(2)` backend. Kept for completeness as an explicit choice; the
/// descriptor numbers it can watch are bounded by `FD_SETSIZE`.
#[derive(Debug)]
pub(crate) struct Selector {
    entries: HashMap<RawFd, (Token, Interest)>,
}

impl Selector {
    pub(crate) fn new() -> Selector {
        Selector {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if self.entries.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        self.entries.insert(fd, (token, interest));
        Ok(())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self.entries.get_mut(&fd) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.entries
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    pub(crate) fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
        }

        let mut max_fd = -1;
        for (&fd, &(_, interest)) in &self.entries {
            if interest.is_readable() {
                unsafe { libc::FD_SET(fd, &mut readfds) };
            }
            if interest.is_writable() {
                unsafe { libc::FD_SET(fd, &mut writefds) };
            }
            max_fd = max_fd.max(fd);
        }

        let mut timeval = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs() as libc::time_t,
            tv_usec: to.subsec_micros() as libc::suseconds_t,
        });
        let timeval_ptr = timeval
            .as_mut()
            .map(|tv| tv as *mut _)
            .unwrap_or(ptr::null_mut());

        let n_ready = syscall!(select(
            max_fd + 1,
            &mut readfds,
            &mut writefds,
            ptr::null_mut(),
            timeval_ptr
        ))?;
        if n_ready == 0 {
            return Ok(());
        }

        for (&fd, &(token, _)) in &self.entries {
            let readable = unsafe { libc::FD_ISSET(fd, &readfds) };
            let writable = unsafe { libc::FD_ISSET(fd, &writefds) };
            if readable || writable {
                events.push(Event {
                    token,
                    readable,
                    writable,
                });
            }
        }
        Ok(())
    }
}
