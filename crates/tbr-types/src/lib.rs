//! Common Thread Border Router types.
//!
//! This crate provides type-safe representations of the IPv6 primitives
//! shared by the border routing control plane and data path:
//!
//! - [`Ipv6Prefix`]: IPv6 network prefixes in canonical (host bits cleared) form
//! - [`MulticastScope`]: the 4-bit scope field of an IPv6 multicast address
//! - address helpers for link-local and multicast classification

mod ip;
mod scope;

pub use ip::{is_link_local, is_multicast, Ipv6Prefix};
pub use scope::MulticastScope;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IPv6 address format: {0}")]
    InvalidIpv6Address(String),

    #[error("invalid IPv6 prefix format: {0}")]
    InvalidIpv6Prefix(String),

    #[error("not a multicast address: {0}")]
    NotMulticast(String),
}
