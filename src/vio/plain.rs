use std::os::unix::io::RawFd;

use crate::sys;
use crate::vio::{Transport, VioError, VioFlags, VioOp};

/// The default transport: reads and writes map directly onto the socket.
#[derive(Debug, Clone, Copy)]
pub struct Plain;

impl Transport for Plain {
    fn read(&mut self, fd: RawFd, flags: &mut VioFlags, buf: &mut [u8]) -> Result<usize, VioError> {
        flags.remove(VioFlags::CONNECTING);

        match syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)) {
            Ok(0) => {
                // End of stream.
                flags.remove(VioFlags::NEED_READ);
                flags.insert(VioFlags::CLOSED);
                Err(VioError::hangup(VioOp::Read))
            }
            Ok(n) => {
                // Edge-triggered interfaces must re-arm until a read comes
                // up empty.
                flags.insert(VioFlags::NEED_READ);
                Ok(n as usize)
            }
            Err(ref e) if sys::ignore_error(e) => {
                flags.remove(VioFlags::NEED_READ);
                Ok(0)
            }
            Err(e) => {
                flags.remove(VioFlags::NEED_READ);
                Err(VioError::code(VioOp::Read, &e))
            }
        }
    }

    fn write(&mut self, fd: RawFd, flags: &mut VioFlags, buf: &[u8]) -> Result<usize, VioError> {
        flags.remove(VioFlags::CONNECTING);

        match syscall!(send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            sys::unix::SEND_FLAGS
        )) {
            Ok(n) => {
                flags.set(VioFlags::NEED_WRITE, (n as usize) < buf.len());
                Ok(n as usize)
            }
            Err(ref e) if sys::ignore_error(e) => {
                flags.insert(VioFlags::NEED_WRITE);
                Ok(0)
            }
            Err(e) => {
                flags.remove(VioFlags::NEED_WRITE);
                Err(VioError::code(VioOp::Write, &e))
            }
        }
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}
