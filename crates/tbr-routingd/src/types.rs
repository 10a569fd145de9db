//! Core types for border routing
//!
//! Prefix records are owned by the prefix manager, link state by the infra
//! link coordinator; everything here is plain data shared between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tbr_types::Ipv6Prefix;

/// Identity of the infra-facing network interface (e.g. "eth0", "wlan0").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(String);

impl InterfaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InterfaceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A Thread node, identified by its RLOC16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Preferred and valid lifetimes in seconds, as carried in a Prefix
/// Information Option. `u32::MAX` means infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetimes {
    pub valid: u32,
    pub preferred: u32,
}

impl Lifetimes {
    pub const INFINITE_SECS: u32 = u32::MAX;

    pub const INFINITE: Self = Self {
        valid: Self::INFINITE_SECS,
        preferred: Self::INFINITE_SECS,
    };

    pub const fn new(valid: u32, preferred: u32) -> Self {
        Self { valid, preferred }
    }

    /// True when the preferred lifetime does not exceed the valid lifetime.
    pub fn is_consistent(&self) -> bool {
        self.preferred <= self.valid
    }

    /// Caps the valid (and with it the preferred) lifetime at `max_secs`.
    /// A `max_secs` of zero means no cap.
    pub fn clamp_valid(self, max_secs: u32) -> Self {
        if max_secs == 0 || self.valid <= max_secs {
            return self;
        }
        Self {
            valid: max_secs,
            preferred: self.preferred.min(max_secs),
        }
    }

    /// Deadline of the valid lifetime, `None` when infinite.
    pub fn valid_until(&self, now: Instant) -> Option<Instant> {
        deadline(now, self.valid)
    }

    /// Deadline of the preferred lifetime, `None` when infinite.
    pub fn preferred_until(&self, now: Instant) -> Option<Instant> {
        deadline(now, self.preferred)
    }
}

fn deadline(now: Instant, secs: u32) -> Option<Instant> {
    if secs == Lifetimes::INFINITE_SECS {
        None
    } else {
        now.checked_add(Duration::from_secs(u64::from(secs)))
    }
}

/// The role of a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixKind {
    /// Discovered on the infra link from a Router Advertisement.
    OnLink,
    /// Off-mesh-routable prefix advertised into the Thread mesh.
    Omr,
    /// The Thread mesh-local prefix.
    MeshLocal,
}

/// Where a prefix record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixOrigin {
    Learned,
    SelfGenerated,
}

/// The link a prefix record belongs to.
///
/// Infra-anchored records die with their interface identity; mesh-anchored
/// records survive infra switches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixAnchor {
    Infra(InterfaceId),
    Mesh,
}

/// Identity of a prefix record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrefixKey {
    pub prefix: Ipv6Prefix,
    pub kind: PrefixKind,
    pub anchor: PrefixAnchor,
}

impl PrefixKey {
    pub fn on_link(prefix: Ipv6Prefix, interface: InterfaceId) -> Self {
        Self {
            prefix,
            kind: PrefixKind::OnLink,
            anchor: PrefixAnchor::Infra(interface),
        }
    }

    pub fn omr(prefix: Ipv6Prefix) -> Self {
        Self {
            prefix,
            kind: PrefixKind::Omr,
            anchor: PrefixAnchor::Mesh,
        }
    }

    pub fn mesh_local(prefix: Ipv6Prefix) -> Self {
        Self {
            prefix,
            kind: PrefixKind::MeshLocal,
            anchor: PrefixAnchor::Mesh,
        }
    }
}

impl fmt::Display for PrefixKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.anchor {
            PrefixAnchor::Infra(id) => write!(f, "{:?} {} on {}", self.kind, self.prefix, id),
            PrefixAnchor::Mesh => write!(f, "{:?} {} on mesh", self.kind, self.prefix),
        }
    }
}

/// A prefix table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixRecord {
    pub key: PrefixKey,
    pub origin: PrefixOrigin,
    pub lifetimes: Lifetimes,
    /// `None` when the valid lifetime is infinite.
    pub valid_until: Option<Instant>,
    pub preferred: bool,
    /// Set when the record was last marked non-preferred.
    pub deprecated_at: Option<Instant>,
    pub last_refreshed: Instant,
}

impl PrefixRecord {
    pub fn prefix(&self) -> Ipv6Prefix {
        self.key.prefix
    }

    pub fn kind(&self) -> PrefixKind {
        self.key.kind
    }

    /// Preference as of `now`. An on-link record stops being preferred when
    /// its preferred lifetime runs out, even if no advertisement said so.
    pub fn is_preferred_at(&self, now: Instant) -> bool {
        if !self.preferred {
            return false;
        }
        match self.kind() {
            PrefixKind::OnLink => self
                .lifetimes
                .preferred_until(self.last_refreshed)
                .map_or(true, |until| now < until),
            PrefixKind::Omr | PrefixKind::MeshLocal => true,
        }
    }
}

/// Administrative/operational state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Down,
    Up,
}

/// One bring-up of an infra interface.
///
/// Every bring-up gets a fresh epoch, so anything scheduled against an
/// earlier instance of the same interface can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LinkInstance {
    pub interface: InterfaceId,
    pub epoch: u64,
}

/// Multicast Listener Registration operation from a Thread node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOp {
    Register,
    Deregister,
}

/// What kind of address a packet's source is, relative to the current
/// prefix tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceAddressKind {
    /// Inside a valid OMR prefix.
    Omr,
    /// Inside the mesh-local prefix.
    MeshLocal,
    /// fe80::/10.
    LinkLocal,
    /// Anything else.
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId(0x4c01).to_string(), "0x4c01");
    }

    #[test]
    fn test_lifetimes_infinite() {
        let now = Instant::now();
        assert_eq!(Lifetimes::INFINITE.valid_until(now), None);
        assert_eq!(
            Lifetimes::new(60, 30).valid_until(now),
            Some(now + Duration::from_secs(60))
        );
    }

    #[test]
    fn test_lifetimes_consistency() {
        assert!(Lifetimes::new(60, 30).is_consistent());
        assert!(Lifetimes::new(60, 60).is_consistent());
        assert!(!Lifetimes::new(30, 60).is_consistent());
    }

    #[test]
    fn test_lifetimes_clamp() {
        assert_eq!(Lifetimes::new(7200, 3600).clamp_valid(0), Lifetimes::new(7200, 3600));
        assert_eq!(Lifetimes::new(7200, 3600).clamp_valid(1800), Lifetimes::new(1800, 1800));
        assert_eq!(Lifetimes::INFINITE.clamp_valid(86400), Lifetimes::new(86400, 86400));
    }

    #[test]
    fn test_on_link_preference_runs_out() {
        let now = Instant::now();
        let record = PrefixRecord {
            key: PrefixKey::on_link("2001:db8:1::/64".parse().unwrap(), "eth0".into()),
            origin: PrefixOrigin::Learned,
            lifetimes: Lifetimes::new(600, 300),
            valid_until: Lifetimes::new(600, 300).valid_until(now),
            preferred: true,
            deprecated_at: None,
            last_refreshed: now,
        };
        assert!(record.is_preferred_at(now + Duration::from_secs(299)));
        assert!(!record.is_preferred_at(now + Duration::from_secs(300)));

        let omr = PrefixRecord {
            key: PrefixKey::omr("2001:db8:a::/64".parse().unwrap()),
            lifetimes: Lifetimes::new(600, 300),
            ..record
        };
        assert!(omr.is_preferred_at(now + Duration::from_secs(500)));
    }

    #[test]
    fn test_prefix_key_display() {
        let key = PrefixKey::on_link("2001:db8:1::/64".parse().unwrap(), "eth0".into());
        assert_eq!(key.to_string(), "OnLink 2001:db8:1::/64 on eth0");
        let key = PrefixKey::omr("fd00:1::/64".parse().unwrap());
        assert_eq!(key.to_string(), "Omr fd00:1::/64 on mesh");
    }
}
