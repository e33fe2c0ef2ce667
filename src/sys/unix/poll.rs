use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT};

use crate::sys::Event;
use crate::token::Token;
use crate::Interest;

/// `poll(2)` backend: a dense pollfd vector plus a descriptor index. Works
/// on every Unix and serves as the fallback when no kernel queue is
/// available.
pub(crate) struct Selector {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    index: HashMap<RawFd, usize>,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("registered", &self.fds.len())
            .finish()
    }
}

impl Selector {
    pub(crate) fn new() -> Selector {
        Selector {
            fds: Vec::new(),
            tokens: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: interest_to_poll(interest),
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let slot = *self
            .index
            .get(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        self.fds[slot].events = interest_to_poll(interest);
        self.tokens[slot] = token;
        Ok(())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let slot = self
            .index
            .remove(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        self.fds.swap_remove(slot);
        self.tokens.swap_remove(slot);
        if let Some(moved) = self.fds.get(slot) {
            self.index.insert(moved.fd, slot);
        }
        Ok(())
    }

    pub(crate) fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let n_events = syscall!(poll(
            self.fds.as_mut_ptr(),
            self.fds.len() as libc::nfds_t,
            timeout
        ))?;
        if n_events == 0 {
            return Ok(());
        }

        for (pollfd, token) in self.fds.iter_mut().zip(self.tokens.iter()) {
            let revents = pollfd.revents;
            pollfd.revents = 0;
            if revents == 0 {
                continue;
            }
            events.push(Event {
                token: *token,
                readable: revents & (POLLIN | POLLHUP | POLLERR) != 0,
                writable: revents & (POLLOUT | POLLHUP | POLLERR) != 0,
            });
        }
        Ok(())
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= POLLIN;
    }
    if interest.is_writable() {
        kind |= POLLOUT;
    }
    kind
}
