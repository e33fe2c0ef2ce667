use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use thiserror::Error;

/// Address family of a [`SockAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Error constructing a [`SockAddr`] from presentation form.
#[derive(Debug, Clone, Error)]
pub enum AddrError {
    #[error("'{0}' is not a valid address literal")]
    BadLiteral(String),
    #[error("'{0}' does not match the requested address family")]
    FamilyMismatch(String),
    #[error("unsupported socket address family {0}")]
    UnsupportedFamily(i32),
}

/// Family-agnostic socket address container.
///
/// Thin wrapper around [`std::net::SocketAddr`] adding construction from
/// (family, text, port) presentation form and conversion to and from the
/// raw `sockaddr_storage` the syscall boundary wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockAddr {
    inner: SocketAddr,
}

impl SockAddr {
    /// Builds an address from its presentation form, checking the literal
    /// against the requested family.
    pub fn new(family: Family, host: &str, port: u16) -> Result<SockAddr, AddrError> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| AddrError::BadLiteral(host.to_owned()))?;
        match (family, ip) {
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_)) => Ok(SockAddr {
                inner: SocketAddr::new(ip, port),
            }),
            _ => Err(AddrError::FamilyMismatch(host.to_owned())),
        }
    }

    pub fn from_std(addr: SocketAddr) -> SockAddr {
        SockAddr { inner: addr }
    }

    pub fn as_std(&self) -> SocketAddr {
        self.inner
    }

    pub fn family(&self) -> Family {
        match self.inner {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.ip()
    }

    /// Presentation form of the host part.
    pub fn host(&self) -> String {
        self.inner.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.inner.port()
    }

    /// Raw form for the syscall boundary. The returned storage is only as
    /// initialised as `len` says.
    pub(crate) fn to_raw(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        // SAFETY: sockaddr_storage is plain old data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match self.inner {
            SocketAddr::V4(v4) => {
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                // SAFETY: storage is large and aligned enough for sockaddr_in.
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr = libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    };
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                // SAFETY: storage is large and aligned enough for sockaddr_in6.
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_addr = libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    };
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    /// Rebuilds an address from raw storage filled in by the kernel.
    pub(crate) fn from_raw(
        storage: &libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> Result<SockAddr, AddrError> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
                // SAFETY: the kernel filled in a sockaddr_in.
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Ok(SockAddr {
                    inner: SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))),
                })
            }
            libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
                // SAFETY: the kernel filled in a sockaddr_in6.
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(SockAddr {
                    inner: SocketAddr::V6(SocketAddrV6::new(
                        ip,
                        u16::from_be(sin6.sin6_port),
                        sin6.sin6_flowinfo,
                        sin6.sin6_scope_id,
                    )),
                })
            }
            family => Err(AddrError::UnsupportedFamily(family)),
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> SockAddr {
        SockAddr::from_std(addr)
    }
}

impl std::fmt::Display for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presentation_round_trip() {
        let addr = SockAddr::new(Family::V4, "127.0.0.1", 53).unwrap();
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 53);
        assert_eq!(addr.family(), Family::V4);

        let addr = SockAddr::new(Family::V6, "::1", 8080).unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.family(), Family::V6);
    }

    #[test]
    fn family_is_checked() {
        assert!(matches!(
            SockAddr::new(Family::V6, "127.0.0.1", 53),
            Err(AddrError::FamilyMismatch(_))
        ));
        assert!(matches!(
            SockAddr::new(Family::V4, "not an ip", 53),
            Err(AddrError::BadLiteral(_))
        ));
    }

    #[test]
    fn raw_round_trip() {
        for text in ["10.1.2.3:4567", "[2001:db8::1]:53"] {
            let addr = SockAddr::from_std(text.parse().unwrap());
            let (storage, len) = addr.to_raw();
            assert_eq!(SockAddr::from_raw(&storage, len).unwrap(), addr);
        }
    }
}
