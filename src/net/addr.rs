//! Network names, listen addresses and the address-equality rule.
//!
//! A service may ask for `:8080` while the inherited socket reports itself as
//! `0.0.0.0:8080` or `[::]:8080`. Matching strips the "any" prefixes before
//! comparing, within the same network class.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use super::registry::ListenerError;

/// Requested network, as named by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    UnixPacket,
}

impl Network {
    /// The class used for address equality: every TCP flavour compares as `tcp`.
    pub fn class(self) -> NetworkClass {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => NetworkClass::Tcp,
            Network::Unix => NetworkClass::Unix,
            Network::UnixPacket => NetworkClass::UnixPacket,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::UnixPacket => "unix-packet",
        }
    }
}

impl FromStr for Network {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            "unix-packet" | "unixpacket" => Ok(Network::UnixPacket),
            other => Err(ListenerError::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network class of a bound or inherited socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Tcp,
    Unix,
    UnixPacket,
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkClass::Tcp => "tcp",
            NetworkClass::Unix => "unix",
            NetworkClass::UnixPacket => "unix-packet",
        };
        f.write_str(s)
    }
}

/// A resolved listen address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Inet(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

const IPV6_ANY_PREFIX: &str = "[::]";
const IPV4_ANY_PREFIX: &str = "0.0.0.0";

fn strip_any_prefix(s: &str) -> &str {
    let s = s.strip_prefix(IPV6_ANY_PREFIX).unwrap_or(s);
    s.strip_prefix(IPV4_ANY_PREFIX).unwrap_or(s)
}

/// Address equality used to match inherited sockets to requests.
pub fn is_same_addr(
    class_a: NetworkClass,
    a: &ListenAddr,
    class_b: NetworkClass,
    b: &ListenAddr,
) -> bool {
    if class_a != class_b {
        return false;
    }
    let a = a.to_string();
    let b = b.to_string();
    if a == b {
        return true;
    }
    strip_any_prefix(&a) == strip_any_prefix(&b)
}

/// Resolve `address` for `network`.
///
/// TCP accepts `host:port`, `[v6]:port` and the bare `:port` form, which means
/// the unspecified address of the requested family.
pub fn resolve(network: Network, address: &str) -> Result<ListenAddr, ListenerError> {
    match network.class() {
        NetworkClass::Unix | NetworkClass::UnixPacket => {
            if address.is_empty() {
                return Err(ListenerError::InvalidAddress {
                    address: address.to_string(),
                    reason: "empty socket path".to_string(),
                });
            }
            Ok(ListenAddr::Unix(PathBuf::from(address)))
        }
        NetworkClass::Tcp => resolve_tcp(network, address).map(ListenAddr::Inet),
    }
}

fn resolve_tcp(network: Network, address: &str) -> Result<SocketAddr, ListenerError> {
    let invalid = |reason: String| ListenerError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| invalid(format!("bad port: {e}")))?;
        let ip = match network {
            Network::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        return Ok(SocketAddr::new(ip, port));
    }

    let candidates = address
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?;
    let mut fallback = None;
    for candidate in candidates {
        let fits = match network {
            Network::Tcp4 => candidate.is_ipv4(),
            Network::Tcp6 => candidate.is_ipv6(),
            _ => true,
        };
        if fits {
            return Ok(candidate);
        }
        fallback.get_or_insert(candidate);
    }
    Err(invalid(match fallback {
        Some(addr) => format!("{addr} does not match network {network}"),
        None => "no addresses resolved".to_string(),
    }))
}
