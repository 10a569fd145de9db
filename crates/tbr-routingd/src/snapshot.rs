//! Consistent read-only view of the routing tables.
//!
//! The event loop builds a fresh [`TableSnapshot`] after every event and
//! swaps it in whole. Data-path readers clone the `Arc` and never see a
//! half-applied update.

use crate::infra_link::{InfraLinkCoordinator, InfraLinkStatus};
use crate::multicast::{MembershipSource, MulticastEngine};
use crate::prefix_manager::PrefixManager;
use crate::types::{
    InterfaceId, LinkState, PrefixAnchor, PrefixKind, PrefixOrigin, SourceAddressKind,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Instant;
use tbr_types::{is_link_local, Ipv6Prefix, MulticastScope};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InfraView {
    pub upstream: Option<InterfaceId>,
    pub state: LinkState,
    pub status: InfraLinkStatus,
    pub epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixView {
    pub prefix: Ipv6Prefix,
    pub kind: PrefixKind,
    pub origin: PrefixOrigin,
    pub anchor: PrefixAnchor,
    pub preferred: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    /// `None` for infinite lifetimes.
    pub valid_remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipView {
    pub group: Ipv6Addr,
    pub scope: MulticastScope,
    pub sources: Vec<MembershipSource>,
    pub join_pending: bool,
}

impl MembershipView {
    pub fn has_listeners(&self) -> bool {
        self.sources
            .iter()
            .any(|source| matches!(source, MembershipSource::ThreadListener(_)))
    }
}

/// Point-in-time copy of link state, prefixes and memberships.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSnapshot {
    /// Incremented on every publish.
    pub generation: u64,
    pub infra: InfraView,
    pub mesh: LinkState,
    /// Sorted by prefix.
    pub prefixes: Vec<PrefixView>,
    /// Sorted by group address.
    pub memberships: Vec<MembershipView>,
}

impl TableSnapshot {
    pub fn capture(
        generation: u64,
        link: &InfraLinkCoordinator,
        prefixes: &PrefixManager,
        multicast: &MulticastEngine,
        now: Instant,
    ) -> Self {
        let mut prefix_views: Vec<PrefixView> = prefixes
            .records()
            .map(|record| PrefixView {
                prefix: record.prefix(),
                kind: record.kind(),
                origin: record.origin,
                anchor: record.key.anchor.clone(),
                preferred: record.is_preferred_at(now),
                valid_lifetime: record.lifetimes.valid,
                preferred_lifetime: record.lifetimes.preferred,
                valid_remaining_secs: record
                    .valid_until
                    .map(|until| until.saturating_duration_since(now).as_secs()),
            })
            .collect();
        prefix_views.sort_by(|a, b| (a.prefix, a.kind).cmp(&(b.prefix, b.kind)));

        let mut memberships: Vec<MembershipView> = multicast
            .memberships()
            .map(|entry| MembershipView {
                group: entry.group,
                scope: entry.scope,
                sources: entry.sources(),
                join_pending: entry.join_pending,
            })
            .collect();
        memberships.sort_by_key(|view| view.group);

        Self {
            generation,
            infra: InfraView {
                upstream: link.upstream().cloned(),
                state: link.infra_state(),
                status: link.status(),
                epoch: link.instance().map(|instance| instance.epoch),
            },
            mesh: link.mesh_state(),
            prefixes: prefix_views,
            memberships,
        }
    }

    pub fn infra_up(&self) -> bool {
        self.infra.state == LinkState::Up
    }

    pub fn mesh_up(&self) -> bool {
        self.mesh == LinkState::Up
    }

    pub fn membership(&self, group: &Ipv6Addr) -> Option<&MembershipView> {
        self.memberships
            .binary_search_by_key(group, |view| view.group)
            .ok()
            .map(|index| &self.memberships[index])
    }

    /// True when at least one Thread node listens to `group`.
    pub fn has_listeners(&self, group: &Ipv6Addr) -> bool {
        self.membership(group).is_some_and(MembershipView::has_listeners)
    }

    pub fn prefixes_of(&self, kind: PrefixKind) -> impl Iterator<Item = &PrefixView> {
        self.prefixes.iter().filter(move |view| view.kind == kind)
    }

    pub fn mesh_local_prefix(&self) -> Option<Ipv6Prefix> {
        self.prefixes_of(PrefixKind::MeshLocal)
            .map(|view| view.prefix)
            .next()
    }

    pub fn is_omr_address(&self, addr: &Ipv6Addr) -> bool {
        self.prefixes_of(PrefixKind::Omr)
            .any(|view| view.prefix.contains(addr))
    }

    pub fn is_on_link_address(&self, addr: &Ipv6Addr) -> bool {
        self.prefixes_of(PrefixKind::OnLink)
            .any(|view| view.prefix.contains(addr))
    }

    pub fn is_mesh_local_address(&self, addr: &Ipv6Addr) -> bool {
        self.mesh_local_prefix()
            .is_some_and(|prefix| prefix.contains(addr))
    }

    /// Classifies a packet source against the current prefixes.
    pub fn classify_source(&self, addr: &Ipv6Addr) -> SourceAddressKind {
        if is_link_local(addr) {
            SourceAddressKind::LinkLocal
        } else if self.is_mesh_local_address(addr) {
            SourceAddressKind::MeshLocal
        } else if self.is_omr_address(addr) {
            SourceAddressKind::Omr
        } else {
            SourceAddressKind::Other
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Shared handle to the latest published snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    current: Arc<RwLock<Arc<TableSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<TableSnapshot> {
        self.current.read().clone()
    }

    pub fn store(&self, snapshot: TableSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}
