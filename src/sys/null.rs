use std::io;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use log::trace;

use crate::sys::Event;
use crate::token::Token;
use crate::Interest;

/// Backend that does no polling at all: `select` sleeps the poll budget and
/// reports nothing. Useful for timer-only loops.
#[derive(Debug)]
pub(crate) struct Selector;

impl Selector {
    pub(crate) fn register(&mut self, fd: RawFd, token: Token, _: Interest) -> io::Result<()> {
        trace!(
            "null backend does not poll, events for fd {} ({:?}) will be ignored",
            fd,
            token
        );
        Ok(())
    }

    pub(crate) fn reregister(&mut self, _: RawFd, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn deregister(&mut self, _: RawFd) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn select(&mut self, _: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        thread::sleep(timeout.unwrap_or(Duration::from_millis(250)));
        Ok(())
    }
}
