//! Listener addresses of the form `[network/]host[:port[-port]]`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

pub const DEFAULT_NETWORK: &str = "udp";
pub const DEFAULT_PORT: u16 = 69;

/// A parsed listen address, possibly spanning a range of ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: String,
    /// Host name or IP literal without brackets; empty means all interfaces.
    pub host: String,
    pub start_port: u16,
    pub end_port: u16,
}

impl NetworkAddress {
    /// Parse `addr`, falling back to UDP and port 69 for omitted parts.
    pub fn parse(addr: &str) -> Result<Self> {
        let trimmed = addr.trim();

        let (network, rest) = match trimmed.split_once('/') {
            Some((network, rest)) => (network.to_ascii_lowercase(), rest),
            None => (DEFAULT_NETWORK.to_string(), trimmed),
        };
        if network.is_empty() {
            return Err(Error::invalid_address(addr, "empty network name"));
        }

        let (host, port) = split_host_port(rest).map_err(|reason| Error::invalid_address(addr, reason))?;

        let (start_port, end_port) = match port {
            None => (DEFAULT_PORT, DEFAULT_PORT),
            Some(range) => parse_port_range(range).map_err(|reason| Error::invalid_address(addr, reason))?,
        };

        Ok(Self {
            network,
            host: host.to_string(),
            start_port,
            end_port,
        })
    }

    /// Whether the network is datagram based.
    ///
    /// `udp` listens on both address families, while `udp4` and `udp6` restrict
    /// the listener (and host name resolution) to IPv4 or IPv6 respectively.
    pub fn is_udp(&self) -> bool {
        matches!(self.network.as_str(), "udp" | "udp4" | "udp6")
    }

    pub fn port_range_size(&self) -> u32 {
        u32::from(self.end_port) - u32::from(self.start_port) + 1
    }

    /// One single-port address per port in the range.
    pub fn expand(&self) -> impl Iterator<Item = NetworkAddress> + '_ {
        (self.start_port..=self.end_port).map(|port| Self {
            network: self.network.clone(),
            host: self.host.clone(),
            start_port: port,
            end_port: port,
        })
    }

    /// Port 0 asks the OS for an ephemeral port.
    pub fn is_ephemeral(&self) -> bool {
        self.start_port == 0 && self.end_port == 0
    }

    /// Whether listeners on `self` and `other` would contend for a port.
    ///
    /// A wildcard host (empty or unspecified) covers every address of its
    /// families, so `udp/:69` overlaps `udp4/0.0.0.0:69` and `udp/127.0.0.1:69`.
    /// Host names are not resolved here; they overlap wildcards and equal names.
    pub fn overlaps(&self, other: &NetworkAddress) -> bool {
        if self.start_port > other.end_port || other.start_port > self.end_port {
            return false;
        }

        match (self.bind_host(), other.bind_host()) {
            (BindHost::Any { v4, v6 }, BindHost::Any { v4: w4, v6: w6 }) => (v4 && w4) || (v6 && w6),
            (BindHost::Any { v4, v6 }, BindHost::Ip(ip)) | (BindHost::Ip(ip), BindHost::Any { v4, v6 }) => {
                if ip.is_ipv4() { v4 } else { v6 }
            }
            (BindHost::Any { .. }, BindHost::Name(_)) | (BindHost::Name(_), BindHost::Any { .. }) => true,
            (BindHost::Ip(a), BindHost::Ip(b)) => a == b,
            (BindHost::Name(a), BindHost::Name(b)) => a == b,
            (BindHost::Ip(_), BindHost::Name(_)) | (BindHost::Name(_), BindHost::Ip(_)) => false,
        }
    }

    fn bind_host(&self) -> BindHost {
        let families = match self.network.as_str() {
            "udp4" => (true, false),
            "udp6" => (false, true),
            _ => (true, true),
        };

        if self.host.is_empty() {
            return BindHost::Any {
                v4: families.0,
                v6: families.1,
            };
        }
        match self.host.parse::<IpAddr>() {
            // An IPv6 wildcard is dual-stack unless the network is `udp6`.
            Ok(IpAddr::V6(ip)) if ip.is_unspecified() => BindHost::Any {
                v4: families.0,
                v6: true,
            },
            Ok(IpAddr::V4(ip)) if ip.is_unspecified() => BindHost::Any { v4: true, v6: false },
            Ok(ip) => BindHost::Ip(ip.to_canonical()),
            Err(_) => BindHost::Name(self.host.to_ascii_lowercase()),
        }
    }

    /// The wildcard address to bind when no host is given.
    pub(crate) fn unspecified_ip(&self) -> IpAddr {
        match self.network.as_str() {
            "udp4" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Whether `addr` belongs to the family this network allows.
    pub(crate) fn accepts(&self, addr: &SocketAddr) -> bool {
        match self.network.as_str() {
            "udp4" => addr.is_ipv4(),
            "udp6" => addr.is_ipv6(),
            _ => true,
        }
    }
}

/// What a listener binds to, for overlap checks.
enum BindHost {
    Any { v4: bool, v6: bool },
    Ip(IpAddr),
    Name(String),
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.network)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        write!(f, ":{}", self.start_port)?;
        if self.end_port != self.start_port {
            write!(f, "-{}", self.end_port)?;
        }
        Ok(())
    }
}

fn split_host_port(s: &str) -> std::result::Result<(&str, Option<&str>), String> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or("missing ']' in address")?;
        return match after {
            "" => Ok((host, None)),
            _ => match after.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(format!("unexpected '{}' after address", after)),
            },
        };
    }

    match s.matches(':').count() {
        0 => Ok((s, None)),
        1 => {
            let (host, port) = s.split_once(':').unwrap_or((s, ""));
            Ok((host, Some(port)))
        }
        // A bare IPv6 literal without a port.
        _ => Ok((s, None)),
    }
}

fn parse_port_range(range: &str) -> std::result::Result<(u16, u16), String> {
    let parse = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}'", p))
    };

    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let port = parse(range)?;
            (port, port)
        }
    };
    if start > end {
        return Err(format!("start port {} is greater than end port {}", start, end));
    }
    Ok((start, end))
}
