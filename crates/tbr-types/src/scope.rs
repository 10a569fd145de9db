//! IPv6 multicast scope (RFC 7346).

use crate::{is_multicast, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;

/// The 4-bit scope field of an IPv6 multicast address.
///
/// Scopes are ordered by topological reach, so `scope >= MulticastScope::ADMIN_LOCAL`
/// reads the way the forwarding policy is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MulticastScope(u8);

impl MulticastScope {
    pub const INTERFACE_LOCAL: Self = MulticastScope(0x1);
    pub const LINK_LOCAL: Self = MulticastScope(0x2);
    pub const REALM_LOCAL: Self = MulticastScope(0x3);
    pub const ADMIN_LOCAL: Self = MulticastScope(0x4);
    pub const SITE_LOCAL: Self = MulticastScope(0x5);
    pub const ORGANIZATION_LOCAL: Self = MulticastScope(0x8);
    pub const GLOBAL: Self = MulticastScope(0xe);

    /// Creates a scope from the low nibble of `value`.
    pub const fn from_nibble(value: u8) -> Self {
        MulticastScope(value & 0x0f)
    }

    /// Extracts the scope of a multicast address.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not in ff00::/8.
    pub fn of(addr: &Ipv6Addr) -> Result<Self, ParseError> {
        if !is_multicast(addr) {
            return Err(ParseError::NotMulticast(addr.to_string()));
        }
        Ok(Self::from_nibble(addr.octets()[1]))
    }

    /// Returns the raw 4-bit scope value.
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Returns the RFC 7346 name of this scope.
    pub fn name(&self) -> &'static str {
        match self.0 {
            0x1 => "interface-local",
            0x2 => "link-local",
            0x3 => "realm-local",
            0x4 => "admin-local",
            0x5 => "site-local",
            0x8 => "organization-local",
            0xe => "global",
            0x0 | 0xf => "reserved",
            _ => "unassigned",
        }
    }
}

impl fmt::Display for MulticastScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}
