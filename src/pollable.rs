use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::{EventLoop, Interest};

/// Direction of I/O readiness a callback is installed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Handle to a descriptor registered with an [`EventLoop`].
///
/// Handles are generational: after [`EventLoop::pollable_destroy`] the
/// handle goes stale, and every operation through it (including event
/// dispatch already in flight) quietly resolves to nothing. This is what
/// makes destroying a pollable from inside one of its own callbacks safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollableId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// A shareable I/O callback.
///
/// Callbacks receive the owning loop, the pollable that became ready and
/// the ready direction. State travels in the closure's captures.
#[derive(Clone)]
pub struct IoCallback(pub(crate) Rc<RefCell<dyn FnMut(&mut EventLoop, PollableId, Direction)>>);

impl IoCallback {
    pub fn new<F>(f: F) -> IoCallback
    where
        F: FnMut(&mut EventLoop, PollableId, Direction) + 'static,
    {
        IoCallback(Rc::new(RefCell::new(f)))
    }
}

impl fmt::Debug for IoCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IoCallback")
    }
}

/// Slab entry behind a [`PollableId`].
pub(crate) struct Pollable {
    pub(crate) fd: RawFd,
    pub(crate) read_cb: Option<IoCallback>,
    pub(crate) write_cb: Option<IoCallback>,
    /// Set when the pollable is on the reap list; dispatch skips dead
    /// entries and the slot is released after the current iteration.
    pub(crate) dead: bool,
}

impl Pollable {
    pub(crate) fn new(fd: RawFd) -> Pollable {
        Pollable {
            fd,
            read_cb: None,
            write_cb: None,
            dead: false,
        }
    }

    /// The interest mask is derived, never stored: READ iff a read callback
    /// is installed, WRITE iff a write callback is.
    pub(crate) fn interest(&self) -> Option<Interest> {
        match (self.read_cb.is_some(), self.write_cb.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn callback(&self, dir: Direction) -> Option<IoCallback> {
        if self.dead {
            return None;
        }
        match dir {
            Direction::Read => self.read_cb.clone(),
            Direction::Write => self.write_cb.clone(),
        }
    }
}

impl fmt::Debug for Pollable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pollable")
            .field("fd", &self.fd)
            .field("read", &self.read_cb.is_some())
            .field("write", &self.write_cb.is_some())
            .field("dead", &self.dead)
            .finish()
    }
}
