//! Network endpoint addressing.
//!
//! [`HostPort`] is the value type for `host:port` addresses, used both for
//! client-side server addressing and for representing a peer's remote
//! address. `Display` and `FromStr` are inverses of each other; IPv6 hosts
//! are bracketed in the textual form.

use crate::error::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A host and a 16-bit port, with a canonical `host:port` textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Create an address from a host and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| Error::Address {
            input: s.to_string(),
            reason: "missing ':' separator".to_string(),
        })?;

        let host = if let Some(inner) = host.strip_prefix('[') {
            inner.strip_suffix(']').ok_or_else(|| Error::Address {
                input: s.to_string(),
                reason: "unclosed '[' in host".to_string(),
            })?
        } else if host.contains(':') {
            return Err(Error::Address {
                input: s.to_string(),
                reason: "IPv6 host must be bracketed".to_string(),
            });
        } else {
            host
        };

        if host.is_empty() {
            return Err(Error::Address {
                input: s.to_string(),
                reason: "empty host".to_string(),
            });
        }

        let port: u16 = port.parse().map_err(|_| Error::Address {
            input: s.to_string(),
            reason: format!("invalid port: \"{}\"", port),
        })?;

        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
