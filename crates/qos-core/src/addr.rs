// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The client address as it travels inside probes and coordinator messages.

use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Address family of an unknown address.
pub const FAMILY_UNSPEC: u16 = 0;
/// Address family tag used on the wire for IPv4.
pub const FAMILY_INET: u16 = 2;
/// Address family tag used on the wire for IPv6.
pub const FAMILY_INET6: u16 = 10;

/// A client address as seen by the coordinator or a measurement site.
///
/// Mirrors the wire layout: a family tag, a port and 16 address bytes, with
/// IPv4 addresses stored in the first four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QosAddr {
    /// One of [`FAMILY_UNSPEC`], [`FAMILY_INET`] or [`FAMILY_INET6`]. Any
    /// other value may arrive from the wire and is treated as unsupported.
    pub family: u16,
    /// The port in host byte order.
    pub port: u16,
    /// The address bytes.
    pub addr: [u8; 16],
}

impl QosAddr {
    /// The unknown address.
    pub const UNKNOWN: QosAddr = QosAddr {
        family: FAMILY_UNSPEC,
        port: 0,
        addr: [0; 16],
    };

    /// Returns true if the family is IPv4 or IPv6.
    pub fn is_supported(&self) -> bool {
        self.family == FAMILY_INET || self.family == FAMILY_INET6
    }

    /// Returns true once any family has been recorded.
    pub fn is_known(&self) -> bool {
        self.family != FAMILY_UNSPEC
    }

    /// The ip address, if the family is supported.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.family {
            FAMILY_INET => Some(IpAddr::V4(Ipv4Addr::new(
                self.addr[0],
                self.addr[1],
                self.addr[2],
                self.addr[3],
            ))),
            FAMILY_INET6 => Some(IpAddr::V6(Ipv6Addr::from(self.addr))),
            _ => None,
        }
    }

    /// Converts to a socket address, if the family is supported.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Returns a copy of this address with a different port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Compares the host portion of two addresses, ignoring the port.
    pub fn same_host(&self, other: &QosAddr) -> bool {
        if self.family != other.family {
            return false;
        }

        match self.family {
            FAMILY_INET => self.addr[..4] == other.addr[..4],
            FAMILY_INET6 => self.addr == other.addr,
            _ => false,
        }
    }
}

impl From<SocketAddr> for QosAddr {
    fn from(addr: SocketAddr) -> Self {
        let mut bytes = [0u8; 16];
        match addr.ip() {
            IpAddr::V4(v4) => {
                bytes[..4].copy_from_slice(&v4.octets());
                QosAddr {
                    family: FAMILY_INET,
                    port: addr.port(),
                    addr: bytes,
                }
            }
            IpAddr::V6(v6) => QosAddr {
                family: FAMILY_INET6,
                port: addr.port(),
                addr: v6.octets(),
            },
        }
    }
}

impl Display for QosAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V4(ip)) => write!(f, "v4[{ip}]:{}", self.port),
            Some(IpAddr::V6(ip)) => write!(f, "v6[{ip}]:{}", self.port),
            None => write!(f, "na[0]:0"),
        }
    }
}

/// Returned when text is not in the `v4[..]:port` / `v6[..]:port` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseQosAddrError(String);

impl Display for ParseQosAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid qos address: {:?}", self.0)
    }
}

impl std::error::Error for ParseQosAddrError {}

impl FromStr for QosAddr {
    type Err = ParseQosAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseQosAddrError(s.to_string());

        let (tag, rest) = s.split_once('[').ok_or_else(invalid)?;
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = tail
            .strip_prefix(':')
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(0);

        let ip: IpAddr = if tag.eq_ignore_ascii_case("v4") {
            IpAddr::V4(host.parse().map_err(|_| invalid())?)
        } else if tag.eq_ignore_ascii_case("v6") {
            IpAddr::V6(host.parse().map_err(|_| invalid())?)
        } else {
            return Err(invalid());
        };

        Ok(SocketAddr::new(ip, port).into())
    }
}

impl Serialize for QosAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for QosAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(text.parse().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_matches_coordinator_format() {
        let v4: QosAddr = "10.0.0.1:3659".parse::<SocketAddr>().unwrap().into();
        assert_eq!(v4.to_string(), "v4[10.0.0.1]:3659");

        let v6: QosAddr = "[2001:db8::1]:80".parse::<SocketAddr>().unwrap().into();
        assert_eq!(v6.to_string(), "v6[2001:db8::1]:80");

        assert_eq!(QosAddr::UNKNOWN.to_string(), "na[0]:0");
    }

    #[test]
    fn parses_text_form() {
        let addr: QosAddr = "v4[192.168.1.20]:7673".parse().unwrap();
        assert_eq!(addr.family, FAMILY_INET);
        assert_eq!(addr.port, 7673);
        assert_eq!(&addr.addr[..4], &[192, 168, 1, 20]);

        let v6: QosAddr = "V6[::1]:1".parse().unwrap();
        assert_eq!(v6.ip(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));

        assert!("na[0]:0".parse::<QosAddr>().is_err());
        assert!("garbage".parse::<QosAddr>().is_err());
    }

    #[test]
    fn missing_port_defaults_to_zero() {
        let addr: QosAddr = "v4[1.2.3.4]".parse().unwrap();
        assert_eq!(addr.port, 0);
    }

    #[test]
    fn same_host_ignores_port() {
        let a: QosAddr = "v4[1.2.3.4]:1000".parse().unwrap();
        let b: QosAddr = "v4[1.2.3.4]:2000".parse().unwrap();
        let c: QosAddr = "v4[1.2.3.5]:1000".parse().unwrap();

        assert!(a.same_host(&b));
        assert!(!a.same_host(&c));
        assert!(!QosAddr::UNKNOWN.same_host(&QosAddr::UNKNOWN));
    }

    #[test]
    fn serializes_as_text() {
        let addr: QosAddr = "v4[8.8.8.8]:53".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"v4[8.8.8.8]:53\"");

        let back: QosAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
