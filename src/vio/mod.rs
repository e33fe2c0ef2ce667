//! Virtual I/O transport.
//!
//! A [`Vio`] pairs a descriptor with a [`Transport`] that interprets reads
//! and writes. The plain transport maps straight to socket calls; the TLS
//! transport (feature `tls`) runs a rustls session over the same descriptor.
//! The transport is composed at construction or upgrade time; there is no
//! mutable op-table.
//!
//! All operations share one error discipline: would-block returns `Ok(0)`
//! and sets [`VioFlags::NEED_READ`] or [`VioFlags::NEED_WRITE`] so callers
//! on edge-triggered pollers know to re-arm, while real failures are routed
//! through a single error hook that logs, closes the transport, and records
//! the error on the `Vio`.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use log::error;
use thiserror::Error;

use crate::addr::{Family, SockAddr};
use crate::pollable::PollableId;
use crate::sys;
use crate::EventLoop;

mod plain;
#[cfg(feature = "tls")]
mod tls;

pub use plain::Plain;
#[cfg(feature = "tls")]
pub use tls::Tls;

/// The operation an error was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOp {
    Socket,
    Bind,
    Listen,
    Accept,
    Connect,
    Read,
    Write,
    Close,
    Other,
}

impl fmt::Display for VioOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VioOp::Socket => "Socket",
            VioOp::Bind => "Bind",
            VioOp::Listen => "Listen",
            VioOp::Accept => "Accept",
            VioOp::Connect => "Connect",
            VioOp::Read => "Read",
            VioOp::Write => "Write",
            VioOp::Close => "Close",
            VioOp::Other => "Application",
        };
        f.write_str(name)
    }
}

/// Error category carried by a [`VioError`].
#[derive(Debug, Clone, Error)]
pub enum VioErrorKind {
    /// The peer closed a stream.
    #[error("remote host closed the socket")]
    RemoteHangup,
    /// An underlying OS error.
    #[error("{message} (errno {errno})")]
    Code { errno: i32, message: String },
    /// API misuse.
    #[error("{0}")]
    Api(String),
    /// Caller-supplied failure, e.g. a full line buffer.
    #[error("{0}")]
    Custom(String),
    /// A fatal TLS-level failure.
    #[cfg(feature = "tls")]
    #[error("tls: {0}")]
    Tls(String),
}

/// Error record of a failed transport operation.
#[derive(Debug, Clone, Error)]
#[error("{op} error: {kind}")]
pub struct VioError {
    pub op: VioOp,
    pub kind: VioErrorKind,
}

impl VioError {
    pub(crate) fn code(op: VioOp, err: &io::Error) -> VioError {
        VioError {
            op,
            kind: VioErrorKind::Code {
                errno: err.raw_os_error().unwrap_or(0),
                message: err.to_string(),
            },
        }
    }

    pub(crate) fn hangup(op: VioOp) -> VioError {
        VioError {
            op,
            kind: VioErrorKind::RemoteHangup,
        }
    }

    pub(crate) fn api(op: VioOp, message: &str) -> VioError {
        VioError {
            op,
            kind: VioErrorKind::Api(message.to_owned()),
        }
    }

    pub(crate) fn custom(op: VioOp, message: &str) -> VioError {
        VioError {
            op,
            kind: VioErrorKind::Custom(message.to_owned()),
        }
    }

    /// True when this is the peer-closed-the-stream error.
    pub fn is_hangup(&self) -> bool {
        matches!(self.kind, VioErrorKind::RemoteHangup)
    }
}

/// Per-transport state bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VioFlags(u16);

impl VioFlags {
    /// A TCP connect is still in progress.
    pub const CONNECTING: VioFlags = VioFlags(0x01);
    /// The TLS handshake has not completed yet.
    pub const TLS_HANDSHAKING: VioFlags = VioFlags(0x02);
    /// The transport has been closed.
    pub const CLOSED: VioFlags = VioFlags(0x04);
    pub const IS_CLIENT: VioFlags = VioFlags(0x08);
    pub const IS_SERVER: VioFlags = VioFlags(0x10);
    /// The transport wants another read before it can make progress.
    pub const NEED_READ: VioFlags = VioFlags(0x20);
    /// The transport wants another write before it can make progress.
    pub const NEED_WRITE: VioFlags = VioFlags(0x40);

    pub fn contains(self, other: VioFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: VioFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: VioFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: VioFlags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

/// Socket type for [`Vio::socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
}

/// Byte-level behavior of a [`Vio`]: how reads and writes against the
/// descriptor are interpreted.
///
/// Implementations signal would-block by returning `Ok(0)` after setting
/// the appropriate NEED flag; real failures are returned as errors and
/// routed through the owning `Vio`'s error hook.
pub trait Transport {
    fn read(&mut self, fd: RawFd, flags: &mut VioFlags, buf: &mut [u8]) -> Result<usize, VioError>;

    fn write(&mut self, fd: RawFd, flags: &mut VioFlags, buf: &[u8]) -> Result<usize, VioError>;

    /// Transport-level goodbye issued before the descriptor is closed.
    fn shutdown(&mut self, _fd: RawFd) {}

    fn name(&self) -> &'static str;
}

/// A virtual transport endpoint.
pub struct Vio {
    fd: Option<OwnedFd>,
    transport: Box<dyn Transport>,
    flags: VioFlags,
    last_error: Option<VioError>,
    peer: Option<SockAddr>,
    attachment: Option<PollableId>,
}

impl Vio {
    /// Creates a detached endpoint with the plain socket transport and no
    /// descriptor yet.
    pub fn new() -> Vio {
        Vio {
            fd: None,
            transport: Box::new(Plain),
            flags: VioFlags::default(),
            last_error: None,
            peer: None,
            attachment: None,
        }
    }

    fn from_accepted(fd: OwnedFd, peer: Option<SockAddr>) -> Vio {
        let mut flags = VioFlags::default();
        flags.insert(VioFlags::IS_CLIENT);
        Vio {
            fd: Some(fd),
            transport: Box::new(Plain),
            flags,
            last_error: None,
            peer,
            attachment: None,
        }
    }

    pub fn flags(&self) -> VioFlags {
        self.flags
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(VioFlags::CLOSED) || self.fd.is_none()
    }

    pub fn last_error(&self) -> Option<&VioError> {
        self.last_error.as_ref()
    }

    pub fn peer(&self) -> Option<SockAddr> {
        self.peer
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn pollable(&self) -> Option<PollableId> {
        self.attachment
    }

    fn fd_or(&self, op: VioOp) -> Result<RawFd, VioError> {
        self.fd()
            .ok_or_else(|| VioError::api(op, "operation on a closed transport"))
    }

    /// The error hook: logs the record, closes the transport, and stores
    /// the error for later inspection. Every fatal error funnels through
    /// here so callers observe one error path. Layers above (linebuf, the
    /// resolver) route their own failures through this hook too.
    pub fn raise(&mut self, err: VioError) -> VioError {
        error!("{}", err);
        self.close_quietly();
        self.last_error = Some(err.clone());
        err
    }

    fn close_quietly(&mut self) {
        if let Some(fd) = self.fd.take() {
            self.transport.shutdown(fd.as_raw_fd());
            // OwnedFd closes on drop.
        }
        self.flags.insert(VioFlags::CLOSED);
    }

    /// Opens a socket of the given family and type. The descriptor is
    /// created non-blocking and close-on-exec.
    pub fn socket(&mut self, family: Family, kind: SockType) -> Result<(), VioError> {
        let domain = match family {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        };
        let ty = match kind {
            SockType::Stream => libc::SOCK_STREAM,
            SockType::Datagram => libc::SOCK_DGRAM,
        };

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        let fd = syscall!(socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))
            .map_err(|e| self.raise(VioError::code(VioOp::Socket, &e)))?;

        // Platforms without SOCK_NONBLOCK/SOCK_CLOEXEC.
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        let fd = {
            let fd = syscall!(socket(domain, ty, 0))
                .map_err(|e| self.raise(VioError::code(VioOp::Socket, &e)))?;
            let setup = sys::unix::set_nonblocking(fd, true)
                .and_then(|()| sys::unix::set_cloexec(fd, true));
            if let Err(e) = setup {
                let _ = unsafe { libc::close(fd) };
                return Err(self.raise(VioError::code(VioOp::Socket, &e)));
            }
            fd
        };

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            let on: libc::c_int = 1;
            if let Err(e) = syscall!(setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )) {
                let _ = unsafe { libc::close(fd) };
                return Err(self.raise(VioError::code(VioOp::Socket, &e)));
            }
        }

        // SAFETY: socket(2) returned a fresh descriptor we own.
        self.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        if kind == SockType::Stream {
            self.flags.remove(VioFlags::CONNECTING);
        }
        self.flags.remove(VioFlags::CLOSED);
        Ok(())
    }

    pub fn set_reuseaddr(&mut self) -> Result<(), VioError> {
        let fd = self.fd_or(VioOp::Socket)?;
        let reuse: libc::c_int = 1;
        syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
        .map_err(|e| self.raise(VioError::code(VioOp::Socket, &e)))
    }

    pub fn bind(&mut self, addr: SockAddr) -> Result<(), VioError> {
        let fd = self.fd_or(VioOp::Bind)?;
        let (storage, len) = addr.to_raw();
        syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))
            .map_err(|e| self.raise(VioError::code(VioOp::Bind, &e)))?;
        self.peer = Some(addr);
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> Result<(), VioError> {
        let fd = self.fd_or(VioOp::Listen)?;
        syscall!(listen(fd, backlog))
            .map_err(|e| self.raise(VioError::code(VioOp::Listen, &e)))?;
        self.flags.insert(VioFlags::IS_SERVER);
        self.flags.remove(VioFlags::IS_CLIENT);
        self.flags.remove(VioFlags::CLOSED);
        Ok(())
    }

    /// Issues a non-blocking connect. An in-progress connect is not an
    /// error: the CONNECTING and NEED_WRITE flags are set and the caller
    /// waits for write readiness.
    pub fn connect(&mut self, addr: SockAddr) -> Result<(), VioError> {
        let fd = self.fd_or(VioOp::Connect)?;
        let (storage, len) = addr.to_raw();
        if let Err(e) = syscall!(connect(fd, &storage as *const _ as *const libc::sockaddr, len)) {
            if !sys::ignore_error(&e) {
                return Err(self.raise(VioError::code(VioOp::Connect, &e)));
            }
            self.flags.insert(VioFlags::NEED_WRITE);
        }
        self.peer = Some(addr);
        self.flags.insert(VioFlags::IS_CLIENT);
        self.flags.insert(VioFlags::CONNECTING);
        self.flags.remove(VioFlags::IS_SERVER);
        self.flags.remove(VioFlags::CLOSED);
        Ok(())
    }

    /// Accepts a pending connection, or `Ok(None)` when none is ready.
    /// The returned endpoint carries the plain transport; it may be
    /// upgraded to TLS afterwards.
    pub fn accept(&mut self) -> Result<Option<Vio>, VioError> {
        let fd = self.fd_or(VioOp::Accept)?;
        // SAFETY: sockaddr_storage is plain old data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let accepted = syscall!(accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ));
        let accepted = match accepted {
            Ok(fd) => fd,
            Err(ref e) if sys::ignore_error(e) => return Ok(None),
            Err(e) => return Err(self.raise(VioError::code(VioOp::Accept, &e))),
        };
        // SAFETY: accept(2) returned a fresh descriptor we own.
        let owned = unsafe { OwnedFd::from_raw_fd(accepted) };
        if let Err(e) = sys::unix::set_nonblocking(accepted, true)
            .and_then(|()| sys::unix::set_cloexec(accepted, true))
        {
            return Err(self.raise(VioError::code(VioOp::Accept, &e)));
        }
        let peer = SockAddr::from_raw(&storage, len).ok();
        Ok(Some(Vio::from_accepted(owned, peer)))
    }

    /// The local address the descriptor is bound to.
    pub fn local_addr(&mut self) -> Result<SockAddr, VioError> {
        let fd = self.fd_or(VioOp::Other)?;
        // SAFETY: sockaddr_storage is plain old data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))
        .map_err(|e| self.raise(VioError::code(VioOp::Other, &e)))?;
        SockAddr::from_raw(&storage, len).map_err(|_| {
            VioError::api(VioOp::Other, "socket bound to an unsupported address family")
        })
    }

    /// Reads through the transport. `Ok(0)` means try again later (the
    /// NEED flags say which readiness to wait for); end-of-stream closes
    /// the transport and surfaces [`VioErrorKind::RemoteHangup`] exactly
    /// once.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, VioError> {
        let fd = self.fd_or(VioOp::Read)?;
        match self.transport.read(fd, &mut self.flags, buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.raise(e)),
        }
    }

    /// Writes through the transport; `Ok(0)` means nothing could be
    /// accepted right now. Short writes set NEED_WRITE.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, VioError> {
        let fd = self.fd_or(VioOp::Write)?;
        match self.transport.write(fd, &mut self.flags, buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.raise(e)),
        }
    }

    /// Datagram send. Bypasses the transport; TLS is stream-only.
    pub fn sendto(&mut self, buf: &[u8], addr: SockAddr) -> Result<usize, VioError> {
        let fd = self.fd_or(VioOp::Write)?;
        let (storage, len) = addr.to_raw();
        match syscall!(sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            len
        )) {
            Ok(n) => {
                if (n as usize) < buf.len() {
                    self.flags.insert(VioFlags::NEED_WRITE);
                }
                Ok(n as usize)
            }
            Err(ref e) if sys::ignore_error(e) => {
                self.flags.insert(VioFlags::NEED_WRITE);
                Ok(0)
            }
            Err(e) => Err(self.raise(VioError::code(VioOp::Write, &e))),
        }
    }

    /// Datagram receive: `Ok((0, None))` when no datagram is pending.
    pub fn recvfrom(&mut self, buf: &mut [u8]) -> Result<(usize, Option<SockAddr>), VioError> {
        let fd = self.fd_or(VioOp::Read)?;
        // SAFETY: sockaddr_storage is plain old data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        match syscall!(recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        )) {
            Ok(n) => Ok((n as usize, SockAddr::from_raw(&storage, len).ok())),
            Err(ref e) if sys::ignore_error(e) => Ok((0, None)),
            Err(e) => Err(self.raise(VioError::code(VioOp::Read, &e))),
        }
    }

    /// Closes the transport: transport-level goodbye (TLS close-notify),
    /// then the descriptor. Detach from the loop first if attached.
    pub fn close(&mut self) {
        self.close_quietly();
    }

    /// Wraps the descriptor as a pollable on `evloop` (made non-blocking,
    /// as every consumer of this crate expects).
    pub fn attach(&mut self, evloop: &mut EventLoop) -> Result<PollableId, VioError> {
        let fd = self.fd_or(VioOp::Other)?;
        let id = evloop.pollable_create(fd);
        if let Err(e) = evloop.set_nonblocking(id, true) {
            evloop.pollable_destroy(id);
            return Err(self.raise(VioError::code(VioOp::Other, &e)));
        }
        self.attachment = Some(id);
        Ok(id)
    }

    /// Destroys the pollable created by [`attach`](Vio::attach).
    pub fn detach(&mut self, evloop: &mut EventLoop) {
        if let Some(id) = self.attachment.take() {
            evloop.pollable_destroy(id);
        }
    }

    /// Replaces the transport with a TLS client session over the same
    /// descriptor. The handshake is driven from subsequent `read`/`write`
    /// calls; no application bytes flow until it completes.
    #[cfg(feature = "tls")]
    pub fn upgrade_client(
        &mut self,
        config: std::sync::Arc<rustls::ClientConfig>,
        server_name: rustls::ServerName,
    ) -> Result<(), VioError> {
        let session = tls::Tls::client(config, server_name)?;
        self.transport = Box::new(session);
        self.flags.insert(VioFlags::TLS_HANDSHAKING);
        Ok(())
    }

    /// Replaces the transport with a TLS server session, typically on an
    /// accepted endpoint.
    #[cfg(feature = "tls")]
    pub fn upgrade_server(
        &mut self,
        config: std::sync::Arc<rustls::ServerConfig>,
    ) -> Result<(), VioError> {
        let session = tls::Tls::server(config)?;
        self.transport = Box::new(session);
        self.flags.insert(VioFlags::TLS_HANDSHAKING);
        Ok(())
    }
}

impl Default for Vio {
    fn default() -> Vio {
        Vio::new()
    }
}

impl fmt::Debug for Vio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vio")
            .field("fd", &self.fd())
            .field("transport", &self.transport.name())
            .field("flags", &self.flags)
            .field("peer", &self.peer)
            .finish()
    }
}
