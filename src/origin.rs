use std::{
    fmt,
    net::{IpAddr, Ipv6Addr},
    ops::Deref,
};

/// Headers consulted for the client address, in order, when none are
/// configured.
pub const DEFAULT_TRUSTED_HEADERS: [&str; 2] = ["CF-Connecting-IP", "X-Forwarded-For"];

/// Key identifying the origin of a request for rate limiting and abuse
/// tracking.
///
/// IPv4 addresses are used as is. IPv6 addresses are grouped to their /64
/// prefix, since a single host usually controls a whole /64.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    key: String,
    is_ipv6: bool,
}

impl ClientKey {
    /// Build the key for an address.
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                key: v4.to_string(),
                is_ipv6: false,
            },
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::from_ip(IpAddr::V4(v4)),
                None => {
                    let mut octets = v6.octets();
                    octets[8..].fill(0);

                    Self {
                        key: Ipv6Addr::from(octets).to_string(),
                        is_ipv6: true,
                    }
                }
            },
        }
    } // end method from_ip

    /// Resolve the origin of a request.
    ///
    /// `trusted_headers` are tried in order. The first entry of each header
    /// value is parsed as an address; unparsable and non-public addresses are
    /// skipped. If no header yields an address, `peer` is used.
    pub fn resolve<'a, F>(header: F, trusted_headers: &[String], peer: IpAddr) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        for name in trusted_headers {
            let Some(value) = header(name) else {
                continue;
            };

            let candidate = value.split(',').next().unwrap_or_default().trim();

            match candidate.parse::<IpAddr>() {
                Ok(ip) if is_public(&ip) => return Self::from_ip(ip),
                Ok(ip) => {
                    tracing::debug!(header = %name, ip = %ip, "Skipping non-public forwarded address");
                }
                Err(_) => {
                    tracing::debug!(header = %name, value = candidate, "Skipping unparsable forwarded address");
                }
            }
        }

        Self::from_ip(peer)
    } // end method resolve

    /// Whether the key is an IPv6 /64 group.
    pub fn is_ipv6(&self) -> bool {
        self.is_ipv6
    }
}

impl Deref for ClientKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.key
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_unspecified() || v4.is_link_local())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}
