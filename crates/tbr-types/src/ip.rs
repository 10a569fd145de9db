//! IPv6 prefix type with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

/// Returns true if `addr` is a unicast link-local address (fe80::/10).
#[inline]
pub fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Returns true if `addr` is a multicast address (ff00::/8).
#[inline]
pub fn is_multicast(addr: &Ipv6Addr) -> bool {
    addr.octets()[0] == 0xff
}

/// An IPv6 prefix in CIDR notation (e.g., 2001:db8:1::/64).
///
/// The stored address always has its host bits cleared, so two prefixes
/// written differently (`2001:db8::1/64` and `2001:db8::/64`) compare equal
/// and hash to the same table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv6Prefix {
    address: Ipv6Addr,
    prefix_len: u8,
}

impl Ipv6Prefix {
    /// Creates a new IPv6 prefix, clearing any host bits of `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length exceeds 128.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 128 {
            return Err(ParseError::InvalidIpv6Prefix(format!(
                "prefix length {} exceeds maximum 128",
                prefix_len
            )));
        }

        let masked = u128::from(address) & Self::mask(prefix_len);
        Ok(Ipv6Prefix {
            address: Ipv6Addr::from(masked),
            prefix_len,
        })
    }

    fn mask(prefix_len: u8) -> u128 {
        match prefix_len {
            0 => 0,
            len => u128::MAX << (128 - u32::from(len)),
        }
    }

    /// Returns the network address of this prefix.
    pub const fn address(&self) -> Ipv6Addr {
        self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        (u128::from(*addr) & Self::mask(self.prefix_len)) == u128::from(self.address)
    }

    /// Returns true if this prefix lies within fe80::/10.
    pub fn is_link_local(&self) -> bool {
        self.prefix_len >= 10 && is_link_local(&self.address)
    }

    /// Returns true if this prefix lies within ff00::/8.
    pub fn is_multicast(&self) -> bool {
        self.prefix_len >= 8 && is_multicast(&self.address)
    }

    /// Returns true if this prefix lies within the ULA range fc00::/7.
    pub fn is_unique_local(&self) -> bool {
        self.prefix_len >= 7 && (self.address.octets()[0] & 0xfe) == 0xfc
    }

    /// Returns true if this is the default route (::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv6Prefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpv6Prefix(s.to_string()))?;

        let address: Ipv6Addr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpv6Address(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpv6Prefix(s.to_string()))?;

        Ipv6Prefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv6Prefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv6Prefix> for String {
    fn from(prefix: Ipv6Prefix) -> Self {
        prefix.to_string()
    }
}
