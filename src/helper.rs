//! Worker child processes.
//!
//! A helper is a separate program connected to the parent's loop by a pair
//! of pipes. The parent spawns it with [`Helper::spawn`], which exports the
//! child's pipe descriptors through the `IN_FD` and `OUT_FD` environment
//! variables; the child adopts them with [`HelperChild::from_env`] and runs
//! its own event loop. `IN_FD` is the descriptor the child reads from,
//! `OUT_FD` the one it writes to.
//!
//! Helpers communicate exclusively through pipe bytes; there is no shared
//! memory between parent and child.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::{Child, Command};

use log::error;

use crate::pollable::{Direction, IoCallback, PollableId};
use crate::sys;
use crate::EventLoop;

pub const IN_FD_ENV: &str = "IN_FD";
pub const OUT_FD_ENV: &str = "OUT_FD";

/// Helpers need inheritable pipe descriptors whose numbers survive exec;
/// only Unix targets provide that plumbing. Rather than a silent stub,
/// the constructors refuse outright on anything else.
fn ensure_fd_passing_supported() -> io::Result<()> {
    if cfg!(unix) {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "helper processes are not supported on this platform",
        ))
    }
}

fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    syscall!(pipe(fds.as_mut_ptr()))?;
    // SAFETY: pipe(2) returned two fresh descriptors we own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Parent-side handle to a spawned worker process.
pub struct Helper {
    child: Child,
    /// Read end of the child→parent pipe.
    from_child: OwnedFd,
    /// Write end of the parent→child pipe.
    to_child: OwnedFd,
    read_pollable: PollableId,
    write_pollable: PollableId,
}

impl Helper {
    /// Spawns `program` with the helper pipes in place. The parent ends
    /// are wrapped as non-blocking pollables on `evloop`; the child ends
    /// are inherited across exec and their numbers exported as `IN_FD` and
    /// `OUT_FD`.
    pub fn spawn<S>(evloop: &mut EventLoop, program: S, args: &[S]) -> io::Result<Helper>
    where
        S: AsRef<OsStr>,
    {
        ensure_fd_passing_supported()?;

        // Parent→child and child→parent pipes. Only the parent ends are
        // marked close-on-exec; the child ends must survive into the child.
        let (child_read, parent_write) = pipe_pair()?;
        let (parent_read, child_write) = pipe_pair()?;
        for fd in [parent_read.as_raw_fd(), parent_write.as_raw_fd()] {
            sys::unix::set_cloexec(fd, true)?;
            sys::unix::set_nonblocking(fd, true)?;
        }

        let child = Command::new(&program)
            .args(args)
            .env(IN_FD_ENV, child_read.as_raw_fd().to_string())
            .env(OUT_FD_ENV, child_write.as_raw_fd().to_string())
            .spawn()?;

        // The child owns its ends now.
        drop(child_read);
        drop(child_write);

        let read_pollable = evloop.pollable_create(parent_read.as_raw_fd());
        let write_pollable = evloop.pollable_create(parent_write.as_raw_fd());

        Ok(Helper {
            child,
            from_child: parent_read,
            to_child: parent_write,
            read_pollable,
            write_pollable,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Descriptor carrying the child's output.
    pub fn read_fd(&self) -> RawFd {
        self.from_child.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.to_child.as_raw_fd()
    }

    /// Installs the read callback, invoked with the parent-side read
    /// descriptor whenever the child has produced output.
    pub fn set_read_cb<F>(&self, evloop: &mut EventLoop, mut cb: F)
    where
        F: FnMut(&mut EventLoop, RawFd) + 'static,
    {
        let fd = self.read_fd();
        evloop.set_select(
            self.read_pollable,
            Direction::Read,
            Some(IoCallback::new(move |el, _, _| cb(el, fd))),
        );
    }

    pub fn clear_read_cb(&self, evloop: &mut EventLoop) {
        evloop.set_select(self.read_pollable, Direction::Read, None);
    }

    /// Installs the write callback; useful for draining a backlog to a
    /// slow child.
    pub fn set_write_cb<F>(&self, evloop: &mut EventLoop, mut cb: F)
    where
        F: FnMut(&mut EventLoop, RawFd) + 'static,
    {
        let fd = self.write_fd();
        evloop.set_select(
            self.write_pollable,
            Direction::Write,
            Some(IoCallback::new(move |el, _, _| cb(el, fd))),
        );
    }

    pub fn clear_write_cb(&self, evloop: &mut EventLoop) {
        evloop.set_select(self.write_pollable, Direction::Write, None);
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        syscall!(read(
            self.from_child.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))
        .map(|n| n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(
            self.to_child.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))
        .map(|n| n as usize)
    }

    /// Terminates the child and releases the parent-side pollables and
    /// descriptors.
    pub fn destroy(mut self, evloop: &mut EventLoop) {
        evloop.pollable_destroy(self.read_pollable);
        evloop.pollable_destroy(self.write_pollable);
        if let Err(err) = self.child.kill() {
            error!("failed to kill helper {}: {}", self.child.id(), err);
        }
        let _ = self.child.wait();
        // Pipe descriptors close on drop.
    }
}

impl std::fmt::Debug for Helper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Helper")
            .field("pid", &self.child.id())
            .field("read_fd", &self.read_fd())
            .field("write_fd", &self.write_fd())
            .finish()
    }
}

/// Child-side counterpart: adopts the inherited pipe descriptors and owns
/// its own event loop.
pub struct HelperChild {
    evloop: EventLoop,
    input: OwnedFd,
    output: OwnedFd,
    read_pollable: PollableId,
}

impl HelperChild {
    /// Builds the child side from the `IN_FD`/`OUT_FD` environment. Fails
    /// gracefully when the process was not started as a helper (e.g. run
    /// from a shell by hand).
    pub fn from_env() -> io::Result<HelperChild> {
        ensure_fd_passing_supported()?;

        let input = env_fd(IN_FD_ENV)?;
        let output = env_fd(OUT_FD_ENV)?;

        // SAFETY: the fds were inherited for exactly this purpose; nothing
        // else in this process owns them.
        let input = unsafe { OwnedFd::from_raw_fd(input) };
        let output = unsafe { OwnedFd::from_raw_fd(output) };
        sys::unix::set_nonblocking(input.as_raw_fd(), true)?;
        sys::unix::set_nonblocking(output.as_raw_fd(), true)?;

        let mut evloop = EventLoop::new()?;
        let read_pollable = evloop.pollable_create(input.as_raw_fd());

        Ok(HelperChild {
            evloop,
            input,
            output,
            read_pollable,
        })
    }

    pub fn evloop(&mut self) -> &mut EventLoop {
        &mut self.evloop
    }

    /// Installs the read callback, invoked with the inherited input
    /// descriptor whenever the parent has sent bytes.
    pub fn set_read_cb<F>(&mut self, mut cb: F)
    where
        F: FnMut(&mut EventLoop, RawFd) + 'static,
    {
        let fd = self.input.as_raw_fd();
        self.evloop.set_select(
            self.read_pollable,
            Direction::Read,
            Some(IoCallback::new(move |el, _, _| cb(el, fd))),
        );
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        syscall!(read(
            self.input.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))
        .map(|n| n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(
            self.output.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))
        .map(|n| n as usize)
    }

    /// Runs the helper's loop until broken.
    pub fn run(&mut self) {
        self.evloop.run();
    }
}

impl std::fmt::Debug for HelperChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperChild")
            .field("input", &self.input.as_raw_fd())
            .field("output", &self.output.as_raw_fd())
            .finish()
    }
}

fn env_fd(name: &str) -> io::Result<RawFd> {
    match std::env::var(name) {
        Ok(value) => value.parse::<RawFd>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a descriptor number: {:?}", name, value),
            )
        }),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not set; process was not spawned as a helper", name),
        )),
    }
}
