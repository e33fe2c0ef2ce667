use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::trace;

use crate::sys;
use crate::vio::{Transport, VioError, VioErrorKind, VioFlags, VioOp};

/// TLS transport: a rustls session layered over the plain descriptor.
///
/// The handshake is re-driven from `read` and `write` while
/// [`VioFlags::TLS_HANDSHAKING`] is set; rustls' `wants_read`/`wants_write`
/// map onto the NEED_READ/NEED_WRITE flags, so callers re-arm exactly the
/// readiness the session is blocked on. Application bytes only flow once
/// the handshake has completed.
pub struct Tls {
    conn: rustls::Connection,
}

impl Tls {
    pub(crate) fn client(
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::ServerName,
    ) -> Result<Tls, VioError> {
        rustls::ClientConnection::new(config, server_name)
            .map(|conn| Tls {
                conn: rustls::Connection::Client(conn),
            })
            .map_err(|e| tls_error(VioOp::Connect, &e))
    }

    pub(crate) fn server(config: Arc<rustls::ServerConfig>) -> Result<Tls, VioError> {
        rustls::ServerConnection::new(config)
            .map(|conn| Tls {
                conn: rustls::Connection::Server(conn),
            })
            .map_err(|e| tls_error(VioOp::Accept, &e))
    }

    /// Runs the handshake as far as the socket allows. Leaves
    /// TLS_HANDSHAKING set with a NEED flag when blocked; clears it when
    /// the handshake finishes.
    fn drive_handshake(
        &mut self,
        fd: RawFd,
        flags: &mut VioFlags,
        op: VioOp,
    ) -> Result<(), VioError> {
        let mut sock = FdIo(fd);
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut sock) {
                    Ok(_) => continue,
                    Err(ref e) if retryable(e, flags) => {
                        flags.insert(VioFlags::NEED_WRITE);
                        return Ok(());
                    }
                    Err(e) => return Err(VioError::code(op, &e)),
                }
            } else if self.conn.wants_read() {
                match self.conn.read_tls(&mut sock) {
                    Ok(0) => {
                        flags.insert(VioFlags::CLOSED);
                        return Err(VioError::hangup(op));
                    }
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| tls_error(op, &e))?;
                    }
                    Err(ref e) if retryable(e, flags) => {
                        flags.insert(VioFlags::NEED_READ);
                        return Ok(());
                    }
                    Err(e) => return Err(VioError::code(op, &e)),
                }
            } else {
                break;
            }
        }

        trace!("tls handshake complete on fd {}", fd);
        flags.remove(VioFlags::TLS_HANDSHAKING);
        flags.remove(VioFlags::CONNECTING);
        flags.remove(VioFlags::NEED_READ);
        flags.remove(VioFlags::NEED_WRITE);
        Ok(())
    }

    /// Writes buffered TLS records out to the socket.
    fn flush_tls(&mut self, fd: RawFd, flags: &mut VioFlags) -> Result<(), VioError> {
        let mut sock = FdIo(fd);
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut sock) {
                Ok(_) => {}
                Err(ref e) if retryable(e, flags) => {
                    flags.insert(VioFlags::NEED_WRITE);
                    return Ok(());
                }
                Err(e) => return Err(VioError::code(VioOp::Write, &e)),
            }
        }
        Ok(())
    }
}

impl Transport for Tls {
    fn read(&mut self, fd: RawFd, flags: &mut VioFlags, buf: &mut [u8]) -> Result<usize, VioError> {
        if flags.contains(VioFlags::TLS_HANDSHAKING) {
            self.drive_handshake(fd, flags, VioOp::Read)?;
            if flags.contains(VioFlags::TLS_HANDSHAKING) {
                return Ok(0);
            }
        }

        let mut sock = FdIo(fd);
        loop {
            match self.conn.reader().read(buf) {
                // A clean close-notify from the peer is end of stream.
                Ok(0) => {
                    flags.insert(VioFlags::CLOSED);
                    return Err(VioError::hangup(VioOp::Read));
                }
                Ok(n) => {
                    flags.remove(VioFlags::NEED_READ);
                    flags.remove(VioFlags::NEED_WRITE);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; pull more records off the wire.
                    match self.conn.read_tls(&mut sock) {
                        Ok(0) => {
                            flags.insert(VioFlags::CLOSED);
                            return Err(VioError::hangup(VioOp::Read));
                        }
                        Ok(_) => {
                            self.conn
                                .process_new_packets()
                                .map_err(|e| tls_error(VioOp::Read, &e))?;
                        }
                        Err(ref e) if retryable(e, flags) => {
                            flags.insert(VioFlags::NEED_READ);
                            return Ok(0);
                        }
                        Err(e) => return Err(VioError::code(VioOp::Read, &e)),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    flags.insert(VioFlags::CLOSED);
                    return Err(VioError::hangup(VioOp::Read));
                }
                Err(e) => return Err(VioError::code(VioOp::Read, &e)),
            }
        }
    }

    fn write(&mut self, fd: RawFd, flags: &mut VioFlags, buf: &[u8]) -> Result<usize, VioError> {
        if flags.contains(VioFlags::TLS_HANDSHAKING) {
            self.drive_handshake(fd, flags, VioOp::Write)?;
            if flags.contains(VioFlags::TLS_HANDSHAKING) {
                return Ok(0);
            }
        }

        let n = self
            .conn
            .writer()
            .write(buf)
            .map_err(|e| VioError::code(VioOp::Write, &e))?;
        self.flush_tls(fd, flags)?;
        if !self.conn.wants_write() {
            flags.remove(VioFlags::NEED_WRITE);
        }
        Ok(n)
    }

    fn shutdown(&mut self, fd: RawFd) {
        // Best-effort close-notify; the peer may already be gone.
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut FdIo(fd));
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}

impl std::fmt::Debug for Tls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tls")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

fn tls_error(op: VioOp, err: &rustls::Error) -> VioError {
    VioError {
        op,
        kind: VioErrorKind::Tls(err.to_string()),
    }
}

/// Retryable at the socket layer: transient errno, or a send attempted
/// while the TCP connect is still in progress (the handshake simply waits
/// for write readiness).
fn retryable(err: &io::Error, flags: &VioFlags) -> bool {
    if sys::ignore_error(err) || err.kind() == io::ErrorKind::Interrupted {
        return true;
    }
    flags.contains(VioFlags::CONNECTING)
        && matches!(err.raw_os_error(), Some(libc::ENOTCONN) | Some(libc::EPIPE))
}

/// Raw descriptor shim giving rustls `Read`/`Write` over the socket.
struct FdIo(RawFd);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        syscall!(recv(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0))
            .map(|n| n as usize)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        syscall!(send(
            self.0,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            sys::unix::SEND_FLAGS
        ))
        .map(|n| n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
