#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) mod kqueue;

pub(crate) mod poll;
pub(crate) mod select;

use std::io;
use std::os::unix::io::RawFd;

/// `send(2)` flags that suppress SIGPIPE where the platform supports it;
/// Apple targets use the `SO_NOSIGPIPE` socket option instead.
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) const SEND_FLAGS: libc::c_int = 0;

/// Sets or clears `O_NONBLOCK` on a descriptor.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let new_flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if new_flags != flags {
        syscall!(fcntl(fd, libc::F_SETFL, new_flags)).map(|_| ())
    } else {
        Ok(())
    }
}

/// Sets or clears `FD_CLOEXEC` on a descriptor.
pub(crate) fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    let new_flags = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if new_flags != flags {
        syscall!(fcntl(fd, libc::F_SETFD, new_flags)).map(|_| ())
    } else {
        Ok(())
    }
}
