//! Asynchronous stub DNS resolver.
//!
//! [`DnsResolver`] speaks the RFC 1035 wire protocol directly over a UDP
//! [`Vio`](crate::vio::Vio) attached to the owning event loop. Questions go
//! to the configured recursive nameservers (from `resolv.conf` or supplied
//! programmatically) with per-server health tracking, exponential per-query
//! timeouts and rotation across servers. Reverse lookups chain into a
//! forward lookup of the returned name, the standard reverse-then-forward
//! verification.
//!
//! Every query completes exactly once, with one of the [`DnsOutcome`]
//! variants.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

use crate::addr::{Family, SockAddr};
use crate::vio::VioError;

pub(crate) mod wire;

mod resolver;

pub use resolver::{DnsResolver, QueryHandle};
pub use wire::WireError;

/// Maximum number of nameservers carried in a configuration.
pub const MAX_NAMESERVERS: usize = 10;

/// Nameservers listen here unless the configuration says otherwise.
pub const DNS_PORT: u16 = 53;

/// Record type of a forward query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Aaaa,
}

impl QueryType {
    pub(crate) fn to_wire(self) -> u16 {
        match self {
            QueryType::A => wire::T_A,
            QueryType::Aaaa => wire::T_AAAA,
        }
    }
}

/// A positive answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsReply {
    /// Canonical name the answer was for.
    pub name: String,
    /// Address record, for A/AAAA answers.
    pub addr: Option<IpAddr>,
    /// TTL of the answer record, seconds.
    pub ttl: u32,
}

/// Terminal result of a query, delivered to the callback exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsOutcome {
    Success(DnsReply),
    /// The authoritative answer is that the name does not exist.
    NxDomain,
    /// The reply could not be used: bad rcode, undecodable answer, or the
    /// resolver was restarted underneath the query.
    Invalid,
    /// All retries were exhausted without a reply.
    Timeout,
}

/// Resolver failure surfaced to the caller (as opposed to a query outcome).
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("resolver I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("resolver transport error: {0}")]
    Vio(#[from] VioError),
    #[error("malformed name: {0}")]
    Wire(#[from] wire::WireError),
}

/// Parsed resolver configuration.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub nameservers: Vec<SockAddr>,
    /// Default domain appended to single-label query names.
    pub domain: Option<String>,
    /// Where the configuration was read from, if it came from a file;
    /// `restart` re-reads it.
    pub resolv_conf: Option<PathBuf>,
}

impl DnsConfig {
    /// Parses a resolv.conf-style file: `nameserver <addr>` and
    /// `domain <name>` entries, `#`/`;` comments and blank lines ignored.
    /// Falls back to 127.0.0.1 when no usable nameserver is found.
    pub fn from_resolv_conf<P: AsRef<Path>>(path: P) -> io::Result<DnsConfig> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let mut config = DnsConfig {
            nameservers: Vec::new(),
            domain: None,
            resolv_conf: Some(path.to_owned()),
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut words = line.split_whitespace();
            let (Some(opt), Some(arg)) = (words.next(), words.next()) else {
                continue;
            };
            match opt {
                "domain" => config.domain = Some(arg.to_owned()),
                "nameserver" => config.add_nameserver(arg),
                _ => {}
            }
        }

        config.ensure_fallback();
        Ok(config)
    }

    /// The conventional system configuration.
    pub fn system() -> io::Result<DnsConfig> {
        DnsConfig::from_resolv_conf("/etc/resolv.conf")
    }

    /// Adds a nameserver, holding the [`MAX_NAMESERVERS`] bound and
    /// rejecting entries whose address family differs from the first
    /// one's (the resolver socket is bound to that family).
    pub fn add_nameserver(&mut self, literal: &str) {
        if self.nameservers.len() >= MAX_NAMESERVERS {
            warn!("too many nameservers, ignoring {}", literal);
            return;
        }
        let family = match literal.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => Family::V4,
            Ok(IpAddr::V6(_)) => Family::V6,
            Err(_) => {
                warn!("ignoring unparsable nameserver {}", literal);
                return;
            }
        };
        if let Some(first) = self.nameservers.first() {
            if first.family() != family {
                warn!(
                    "ignoring nameserver {}: family differs from {}",
                    literal,
                    first.host()
                );
                return;
            }
        }
        match SockAddr::new(family, literal, DNS_PORT) {
            Ok(addr) => self.nameservers.push(addr),
            Err(err) => warn!("ignoring nameserver {}: {}", literal, err),
        }
    }

    fn ensure_fallback(&mut self) {
        if self.nameservers.is_empty() {
            debug!("no usable nameserver entries, falling back to localhost resolver");
            self.add_nameserver("127.0.0.1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(text: &str) -> DnsConfig {
        let mut file = tempfile_path();
        std::fs::File::create(&file.0)
            .unwrap()
            .write_all(text.as_bytes())
            .unwrap();
        let config = DnsConfig::from_resolv_conf(&file.0).unwrap();
        file.cleanup();
        config
    }

    struct TempPath(std::path::PathBuf);
    impl TempPath {
        fn cleanup(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn tempfile_path() -> TempPath {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "evio-resolv-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        TempPath(path)
    }

    #[test]
    fn parses_nameservers_and_domain() {
        let config = parse(
            "# comment\n\
             ; other comment\n\
             \n\
             domain example.org\n\
             nameserver 10.0.0.1\n\
             nameserver 10.0.0.2\n",
        );
        assert_eq!(config.domain.as_deref(), Some("example.org"));
        assert_eq!(config.nameservers.len(), 2);
        assert_eq!(config.nameservers[0].host(), "10.0.0.1");
        assert_eq!(config.nameservers[0].port(), DNS_PORT);
    }

    #[test]
    fn falls_back_to_localhost() {
        let config = parse("searchdomain whatever\n");
        assert_eq!(config.nameservers.len(), 1);
        assert_eq!(config.nameservers[0].host(), "127.0.0.1");
    }

    #[test]
    fn rejects_cross_family_and_excess_servers() {
        let mut config = DnsConfig {
            nameservers: Vec::new(),
            domain: None,
            resolv_conf: None,
        };
        config.add_nameserver("10.0.0.1");
        config.add_nameserver("::1"); // family mismatch, dropped
        assert_eq!(config.nameservers.len(), 1);

        for i in 0..MAX_NAMESERVERS + 3 {
            config.add_nameserver(&format!("10.0.1.{}", i));
        }
        assert_eq!(config.nameservers.len(), MAX_NAMESERVERS);
    }
}
