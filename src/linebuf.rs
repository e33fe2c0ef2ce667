//! Delimiter-framed record streaming over a [`Vio`].
//!
//! A [`LineBuf`] frames the inbound byte stream by a configurable set of
//! single-byte delimiters (any match ends a record) and queues outbound
//! records with a configurable terminator appended, both inside bounded
//! buffers (64 KiB by default). Overflowing either buffer is surfaced
//! through the underlying VIO error hook, so consumers see one error path
//! for transport and framing failures alike.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use log::error;

use crate::pollable::{Direction, IoCallback};
use crate::vio::{Vio, VioError, VioFlags, VioOp};
use crate::EventLoop;

const DEFAULT_BUFLEN: usize = 65536;

/// Shared handle to a [`LineBuf`]; the loop-side I/O handlers hold weak
/// references to it.
pub type LineBufRef = Rc<RefCell<LineBuf>>;

/// One inbound record, stripped of its delimiter.
#[derive(Debug)]
pub struct Line<'a> {
    pub bytes: &'a [u8],
    /// The record contained an embedded zero byte. Consumers treating
    /// records as text should treat this as suspect input.
    pub had_nul: bool,
}

/// Framing-layer state bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineBufFlags(u8);

impl LineBufFlags {
    /// No further writes are accepted; the shutdown callback fires once
    /// the outbound buffer drains.
    pub const SHUTTING_DOWN: LineBufFlags = LineBufFlags(0x01);
    /// The inbound buffer filled up without containing a delimiter.
    pub const READBUF_FULL: LineBufFlags = LineBufFlags(0x02);
    /// An outbound record did not fit in the remaining buffer space.
    pub const WRITEBUF_FULL: LineBufFlags = LineBufFlags(0x04);

    pub fn contains(self, other: LineBufFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: LineBufFlags) {
        self.0 |= other.0;
    }
}

/// Bounded byte queue.
#[derive(Debug)]
struct Bounded {
    data: Vec<u8>,
    max: usize,
}

impl Bounded {
    fn new(max: usize) -> Bounded {
        Bounded {
            data: Vec::new(),
            max,
        }
    }

    fn is_full(&self) -> bool {
        self.data.len() >= self.max
    }

    fn spare(&self) -> usize {
        self.max - self.data.len().min(self.max)
    }

    /// Resizes the bound, preserving existing contents (truncating only if
    /// the new bound is smaller than what is already queued).
    fn set_max(&mut self, max: usize) {
        self.max = max;
        if self.data.len() > max {
            self.data.truncate(max);
        }
    }
}

type ReadlineCb = Rc<RefCell<dyn FnMut(&mut EventLoop, &LineBufRef, &Line<'_>)>>;
type ShutdownCb = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;

/// Framed byte-stream layer driving a [`Vio`].
pub struct LineBuf {
    vio: Vio,
    readbuf: Bounded,
    writebuf: Bounded,
    delim: Vec<u8>,
    endl: Vec<u8>,
    flags: LineBufFlags,
    readline_cb: ReadlineCb,
    shutdown_cb: Option<ShutdownCb>,
    read_handler: Option<IoCallback>,
    write_handler: Option<IoCallback>,
}

impl LineBuf {
    /// Creates a detached linebuf over `vio`. The default framing is the
    /// IRC-style `"\r\n"` delimiter set inbound (either byte ends a
    /// record) and `"\r\n"` terminator outbound.
    pub fn new<F>(vio: Vio, readline_cb: F) -> LineBufRef
    where
        F: FnMut(&mut EventLoop, &LineBufRef, &Line<'_>) + 'static,
    {
        Rc::new(RefCell::new(LineBuf {
            vio,
            readbuf: Bounded::new(DEFAULT_BUFLEN),
            writebuf: Bounded::new(DEFAULT_BUFLEN),
            delim: b"\r\n".to_vec(),
            endl: b"\r\n".to_vec(),
            flags: LineBufFlags::default(),
            readline_cb: Rc::new(RefCell::new(readline_cb)),
            shutdown_cb: None,
            read_handler: None,
            write_handler: None,
        }))
    }

    /// Sets the inbound delimiter set and the outbound terminator. Both
    /// must be non-empty.
    pub fn set_delim(&mut self, delim: &[u8], endl: &[u8]) {
        assert!(!delim.is_empty() && !endl.is_empty());
        self.delim = delim.to_vec();
        self.endl = endl.to_vec();
    }

    pub fn set_shutdown_cb<F>(&mut self, cb: F)
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        self.shutdown_cb = Some(Rc::new(RefCell::new(cb)));
    }

    pub fn set_read_buffer_len(&mut self, len: usize) {
        self.readbuf.set_max(len);
    }

    pub fn set_write_buffer_len(&mut self, len: usize) {
        self.writebuf.set_max(len);
    }

    pub fn flags(&self) -> LineBufFlags {
        self.flags
    }

    pub fn vio(&self) -> &Vio {
        &self.vio
    }

    pub fn vio_mut(&mut self) -> &mut Vio {
        &mut self.vio
    }

    /// Attaches to the loop: wraps the VIO's descriptor as a pollable and
    /// installs the read and write handlers.
    pub fn attach(lb: &LineBufRef, evloop: &mut EventLoop) -> Result<(), VioError> {
        let id = lb.borrow_mut().vio.attach(evloop)?;

        let weak = Rc::downgrade(lb);
        let read_handler = IoCallback::new(move |el, _, _| {
            if let Some(lb) = weak.upgrade() {
                read_data(el, &lb);
            }
        });
        let weak = Rc::downgrade(lb);
        let write_handler = IoCallback::new(move |el, _, _| {
            if let Some(lb) = weak.upgrade() {
                write_data(el, &lb);
            }
        });

        {
            let mut b = lb.borrow_mut();
            b.read_handler = Some(read_handler.clone());
            b.write_handler = Some(write_handler.clone());
        }
        evloop.set_select(id, Direction::Read, Some(read_handler));
        evloop.set_select(id, Direction::Write, Some(write_handler));
        Ok(())
    }

    /// Detaches from the loop, clearing both handlers and destroying the
    /// pollable. The VIO (and its descriptor) stay alive.
    pub fn detach(lb: &LineBufRef, evloop: &mut EventLoop) {
        let mut b = lb.borrow_mut();
        if let Some(id) = b.vio.pollable() {
            evloop.set_select(id, Direction::Read, None);
            evloop.set_select(id, Direction::Write, None);
        }
        b.vio.detach(evloop);
        b.read_handler = None;
        b.write_handler = None;
    }

    /// Detaches and closes the transport.
    pub fn destroy(lb: &LineBufRef, evloop: &mut EventLoop) {
        LineBuf::detach(lb, evloop);
        lb.borrow_mut().vio.close();
    }

    /// Queues `data` plus the outbound terminator and registers write
    /// interest. Writes during shutdown are dropped; an overflowing record
    /// raises WRITEBUF_FULL through the VIO error hook.
    pub fn write(lb: &LineBufRef, evloop: &mut EventLoop, data: &[u8]) {
        let armed = {
            let mut b = lb.borrow_mut();
            if b.flags.contains(LineBufFlags::SHUTTING_DOWN) {
                return;
            }
            if b.writebuf.data.len() + data.len() + b.endl.len() > b.writebuf.max {
                b.flags.insert(LineBufFlags::WRITEBUF_FULL);
                let err = VioError::custom(VioOp::Write, "write buffer full");
                b.vio.raise(err);
                return;
            }
            b.writebuf.data.extend_from_slice(data);
            let LineBuf {
                ref mut writebuf,
                ref endl,
                ..
            } = *b;
            writebuf.data.extend_from_slice(endl);
            b.vio.pollable().zip(b.write_handler.clone())
        };
        if let Some((id, handler)) = armed {
            evloop.set_select(id, Direction::Write, Some(handler));
        }
    }

    /// Formatted convenience over [`write`](LineBuf::write).
    pub fn write_fmt(lb: &LineBufRef, evloop: &mut EventLoop, args: fmt::Arguments<'_>) {
        let text = args.to_string();
        LineBuf::write(lb, evloop, text.as_bytes());
    }

    /// Stops accepting writes; once the outbound buffer drains, the
    /// shutdown callback fires.
    pub fn shut_down(lb: &LineBufRef, evloop: &mut EventLoop) {
        let drained = {
            let mut b = lb.borrow_mut();
            b.flags.insert(LineBufFlags::SHUTTING_DOWN);
            b.writebuf.data.is_empty()
        };
        if drained {
            do_shutdown(evloop, lb);
        }
    }

    /// Scans the inbound buffer for complete records, compacting the tail
    /// back to the buffer start. Sets READBUF_FULL if the buffer is at
    /// capacity without containing a single delimiter.
    fn extract_lines(&mut self) -> Vec<(Vec<u8>, bool)> {
        let data = &mut self.readbuf.data;
        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < data.len() {
            if !self.delim.contains(&data[i]) {
                i += 1;
                continue;
            }
            let line = data[start..i].to_vec();
            let had_nul = line.contains(&0);
            lines.push((line, had_nul));
            while i < data.len() && self.delim.contains(&data[i]) {
                i += 1;
            }
            start = i;
        }

        if lines.is_empty() && data.len() >= self.readbuf.max {
            // No record fits in the buffer; nothing more can ever arrive.
            self.flags.insert(LineBufFlags::READBUF_FULL);
            return lines;
        }

        data.drain(..start);
        lines
    }
}

impl fmt::Debug for LineBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineBuf")
            .field("vio", &self.vio)
            .field("inbound", &self.readbuf.data.len())
            .field("outbound", &self.writebuf.data.len())
            .field("flags", &self.flags)
            .finish()
    }
}

fn read_data(evloop: &mut EventLoop, lb: &LineBufRef) {
    enum Outcome {
        Lines(Vec<(Vec<u8>, bool)>),
        Again,
        Fatal,
    }

    let outcome = {
        let mut b = lb.borrow_mut();

        if b.readbuf.is_full() {
            b.flags.insert(LineBufFlags::READBUF_FULL);
            let err = VioError::custom(VioOp::Read, "read buffer full");
            b.vio.raise(err);
            Outcome::Fatal
        } else {
            let used = b.readbuf.data.len();
            let spare = b.readbuf.spare();
            b.readbuf.data.resize(used + spare, 0);
            let res = {
                let LineBuf {
                    ref mut vio,
                    ref mut readbuf,
                    ..
                } = *b;
                vio.read(&mut readbuf.data[used..])
            };
            match res {
                Ok(0) => {
                    b.readbuf.data.truncate(used);
                    Outcome::Again
                }
                Ok(n) => {
                    b.readbuf.data.truncate(used + n);
                    let lines = b.extract_lines();
                    if b.flags.contains(LineBufFlags::READBUF_FULL) {
                        let err = VioError::custom(VioOp::Read, "read buffer full");
                        b.vio.raise(err);
                        Outcome::Fatal
                    } else {
                        Outcome::Lines(lines)
                    }
                }
                Err(_) => {
                    // Already logged and closed by the VIO error hook.
                    b.readbuf.data.truncate(used);
                    Outcome::Fatal
                }
            }
        }
    };

    match outcome {
        Outcome::Fatal => {
            let id = lb.borrow().vio.pollable();
            if let Some(id) = id {
                evloop.set_select(id, Direction::Read, None);
            }
            do_shutdown(evloop, lb);
        }
        Outcome::Again => rearm(evloop, lb),
        Outcome::Lines(lines) => {
            rearm(evloop, lb);
            for (bytes, had_nul) in lines {
                if lb.borrow().flags.contains(LineBufFlags::SHUTTING_DOWN) {
                    break;
                }
                let cb = lb.borrow().readline_cb.clone();
                let line = Line {
                    bytes: &bytes,
                    had_nul,
                };
                let mut f = cb.borrow_mut();
                (&mut *f)(evloop, lb, &line);
            }
        }
    }
}

/// TLS sessions may need a write to finish a read (and vice versa);
/// re-arm whatever the transport says it is blocked on.
fn rearm(evloop: &mut EventLoop, lb: &LineBufRef) {
    let (id, flags, write_handler) = {
        let b = lb.borrow();
        match b.vio.pollable() {
            Some(id) => (id, b.vio.flags(), b.write_handler.clone()),
            None => return,
        }
    };
    if flags.contains(VioFlags::NEED_WRITE) {
        if let Some(handler) = write_handler {
            evloop.set_select(id, Direction::Write, Some(handler));
        }
    }
}

fn write_data(evloop: &mut EventLoop, lb: &LineBufRef) {
    enum Outcome {
        Continue,
        Drained { shutting_down: bool },
        Failed,
    }

    let outcome = {
        let mut b = lb.borrow_mut();
        let mut failed = false;
        if !b.writebuf.data.is_empty() {
            let res = {
                let LineBuf {
                    ref mut vio,
                    ref writebuf,
                    ..
                } = *b;
                vio.write(&writebuf.data)
            };
            match res {
                Ok(n) => {
                    b.writebuf.data.drain(..n);
                }
                Err(err) => {
                    // Already closed by the VIO error hook; never come back
                    // to this handler.
                    error!("linebuf write failed: {}", err);
                    failed = true;
                }
            }
        }

        if failed {
            Outcome::Failed
        } else if b.writebuf.data.is_empty() && !b.vio.flags().contains(VioFlags::NEED_WRITE) {
            Outcome::Drained {
                shutting_down: b.flags.contains(LineBufFlags::SHUTTING_DOWN),
            }
        } else {
            Outcome::Continue
        }
    };

    match outcome {
        Outcome::Failed => {
            let id = lb.borrow().vio.pollable();
            if let Some(id) = id {
                evloop.set_select(id, Direction::Write, None);
            }
        }
        Outcome::Drained { shutting_down } => {
            let id = lb.borrow().vio.pollable();
            if let Some(id) = id {
                evloop.set_select(id, Direction::Write, None);
            }
            if shutting_down {
                do_shutdown(evloop, lb);
            }
        }
        Outcome::Continue => {}
    }
}

fn do_shutdown(evloop: &mut EventLoop, lb: &LineBufRef) {
    let cb = lb.borrow().shutdown_cb.clone();
    if let Some(cb) = cb {
        let mut f = cb.borrow_mut();
        (&mut *f)(evloop);
    }
}
