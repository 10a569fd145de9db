//! Error types for tbr-routingd
//!
//! Only configuration loading, packet decoding, collaborator calls and the
//! daemon plumbing produce errors. Event handlers inside the core never do:
//! malformed input is counted and dropped, failed joins are retried.

use std::net::Ipv6Addr;
use thiserror::Error;

/// Errors that can occur in tbr-routingd
#[derive(Debug, Error)]
pub enum BorderRoutingError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A prefix failed validation for the role it was given
    #[error("Invalid prefix {prefix}: {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    /// Malformed packet
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// A collaborator rejected a link operation
    #[error("Link operation failed: {0}")]
    LinkOp(#[from] LinkOpError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The event loop is gone
    #[error("Event channel closed")]
    ChannelClosed,
}

impl BorderRoutingError {
    /// Creates an invalid prefix error.
    pub fn invalid_prefix(prefix: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidPrefix {
            prefix: prefix.to_string(),
            reason: reason.into(),
        }
    }
}

/// Reasons a packet could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("not an IPv6 packet (version {0})")]
    NotIpv6(u8),

    #[error("unsupported next header {0}")]
    UnsupportedNextHeader(u8),

    #[error("bad option length {length} for option type {option_type}")]
    BadOptionLength { option_type: u8, length: u8 },

    #[error("invalid prefix length {0}")]
    InvalidPrefixLength(u8),

    #[error("not an ICMPv6 message")]
    NotIcmpv6,

    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Failure reported by the infra or mesh collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkOpError {
    #[error("interface {0} is not available")]
    InterfaceUnavailable(String),

    #[error("failed to join group {group}: {reason}")]
    JoinFailed { group: Ipv6Addr, reason: String },

    #[error("failed to send: {0}")]
    SendFailed(String),
}

/// Result type alias for tbr-routingd operations
pub type Result<T> = std::result::Result<T, BorderRoutingError>;
