//! Prefix Lifecycle Manager
//!
//! Owns every prefix record: on-link prefixes (learned from infra Router
//! Advertisements, or self-generated while the infra link has none), OMR
//! prefixes (learned or self-generated) and the mesh-local prefix. Each
//! record with a finite valid lifetime has exactly one expiry timer keyed by
//! its identity; firing that timer is the only way a record ages out.
//!
//! Invariants maintained after every operation:
//! - at most one OMR prefix is preferred, and it is the only OMR prefix
//!   advertised into the mesh;
//! - the mesh-local prefix is deprecated iff an OMR prefix exists;
//! - a self-generated on-link prefix is preferred iff no learned on-link
//!   prefix exists on its interface.

use crate::config::PrefixConfig;
use crate::metrics::MetricsCollector;
use crate::packet::PrefixInformation;
use crate::platform::MeshOps;
use crate::types::{
    InterfaceId, Lifetimes, PrefixAnchor, PrefixKey, PrefixKind, PrefixOrigin, PrefixRecord,
};
use rand::Rng;
use std::net::Ipv6Addr;
use std::time::Instant;
use tbr_common::{SyncMap, TimerQueue};
use tbr_types::Ipv6Prefix;
use tracing::{debug, info, instrument, warn};

/// Lifetime advertised for the self-generated on-link prefix, and how long
/// it lingers deprecated once an infra router provides an on-link prefix.
pub const LOCAL_ON_LINK_LIFETIME_SECS: u32 = 1800;

/// Outcome of a prefix upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixUpdate {
    Created,
    Refreshed,
    /// A zero valid lifetime removed an existing record.
    Expired,
    Ignored,
}

pub struct PrefixManager {
    config: PrefixConfig,
    table: SyncMap<PrefixKey, PrefixRecord>,
    timers: TimerQueue<PrefixKey>,
    mesh_local: Option<Ipv6Prefix>,
    preferred_omr: Option<Ipv6Prefix>,
    /// Random ULAs picked on first self-generation, reused afterwards.
    generated_omr: Option<Ipv6Prefix>,
    generated_on_link: Option<Ipv6Prefix>,
    metrics: MetricsCollector,
}

impl PrefixManager {
    pub fn new(config: &PrefixConfig, metrics: MetricsCollector) -> Self {
        let table = match config.max_prefixes {
            0 => SyncMap::new(),
            bound => SyncMap::bounded(bound),
        };
        Self {
            config: config.clone(),
            table,
            timers: TimerQueue::new(),
            mesh_local: None,
            preferred_omr: None,
            generated_omr: None,
            generated_on_link: None,
            metrics,
        }
    }

    /// Upserts an on-link prefix learned from a Router Advertisement on
    /// `interface`.
    #[instrument(skip(self, mesh), fields(interface = %interface, prefix = %prefix))]
    pub fn on_infra_router_advertisement<M: MeshOps>(
        &mut self,
        interface: &InterfaceId,
        prefix: Ipv6Prefix,
        lifetimes: Lifetimes,
        now: Instant,
        mesh: &mut M,
    ) -> PrefixUpdate {
        if prefix.is_link_local() || prefix.is_multicast() {
            debug!("Ignoring non-routable on-link prefix");
            return PrefixUpdate::Ignored;
        }
        let key = PrefixKey::on_link(prefix, interface.clone());
        if self
            .table
            .get(&key)
            .is_some_and(|record| record.origin == PrefixOrigin::SelfGenerated)
        {
            debug!("Ignoring our own on-link prefix");
            return PrefixUpdate::Ignored;
        }
        self.upsert(key, lifetimes, PrefixOrigin::Learned, now, mesh)
    }

    /// Upserts an OMR prefix and re-evaluates the preferred OMR prefix and
    /// the mesh-local preference.
    ///
    /// Re-establishing an unchanged prefix only refreshes its lifetimes.
    #[instrument(skip(self, mesh), fields(prefix = %prefix))]
    pub fn on_omr_prefix_established<M: MeshOps>(
        &mut self,
        prefix: Ipv6Prefix,
        lifetimes: Lifetimes,
        origin: PrefixOrigin,
        now: Instant,
        mesh: &mut M,
    ) -> PrefixUpdate {
        if prefix.prefix_len() != 64 || prefix.is_link_local() || prefix.is_multicast() {
            warn!("Rejecting OMR prefix: must be a routable /64");
            self.metrics.malformed_packets_total.inc();
            return PrefixUpdate::Ignored;
        }
        self.upsert(PrefixKey::omr(prefix), lifetimes, origin, now, mesh)
    }

    /// Removes a record whose valid lifetime elapsed.
    ///
    /// Returns false if no such record exists.
    pub fn on_prefix_expired<M: MeshOps>(
        &mut self,
        key: &PrefixKey,
        now: Instant,
        mesh: &mut M,
    ) -> bool {
        match self.remove(key, now, mesh) {
            Some(_) => {
                info!(prefix = %key.prefix, kind = ?key.kind, "Prefix expired");
                true
            }
            None => false,
        }
    }

    /// Sets (or replaces) the mesh-local prefix.
    #[instrument(skip(self, mesh), fields(prefix = %prefix))]
    pub fn set_mesh_local_prefix<M: MeshOps>(
        &mut self,
        prefix: Ipv6Prefix,
        now: Instant,
        mesh: &mut M,
    ) -> PrefixUpdate {
        if prefix.prefix_len() != 64 || prefix.is_link_local() || prefix.is_multicast() {
            warn!("Rejecting mesh-local prefix: must be a unicast /64");
            self.metrics.malformed_packets_total.inc();
            return PrefixUpdate::Ignored;
        }

        let key = PrefixKey::mesh_local(prefix);
        if let Some(record) = self.table.get_mut(&key) {
            record.last_refreshed = now;
            debug!("Mesh-local prefix unchanged");
            return PrefixUpdate::Refreshed;
        }

        if let Some(old) = self.mesh_local.take() {
            self.table.remove(&PrefixKey::mesh_local(old));
            info!(old = %old, "Replacing mesh-local prefix");
        }

        if self.table.is_full() && !self.evict_one(now, mesh) {
            warn!("Prefix table full, mesh-local prefix not recorded");
            return PrefixUpdate::Ignored;
        }

        let preferred = self.preferred_omr.is_none();
        let record = PrefixRecord {
            key: key.clone(),
            origin: PrefixOrigin::Learned,
            lifetimes: Lifetimes::INFINITE,
            valid_until: None,
            preferred,
            deprecated_at: (!preferred).then_some(now),
            last_refreshed: now,
        };
        if self.table.insert(key, record).is_err() {
            return PrefixUpdate::Ignored;
        }
        self.mesh_local = Some(prefix);
        info!(preferred, "Mesh-local prefix set");

        if let Err(e) = mesh.set_mesh_local_preferred(prefix, preferred) {
            warn!(error = %e, "Failed to update mesh-local preference");
        }
        PrefixUpdate::Created
    }

    /// Expires every record whose timer is due. Returns the number removed.
    pub fn on_timer<M: MeshOps>(&mut self, now: Instant, mesh: &mut M) -> usize {
        let mut expired = 0;
        for key in self.timers.pop_expired(now) {
            if self.on_prefix_expired(&key, now, mesh) {
                expired += 1;
            }
        }
        expired
    }

    /// Removes every record anchored to `interface`.
    pub fn teardown_infra<M: MeshOps>(
        &mut self,
        interface: &InterfaceId,
        now: Instant,
        mesh: &mut M,
    ) -> usize {
        let removed = self.table.remove_where(
            |key, _| matches!(&key.anchor, PrefixAnchor::Infra(id) if id == interface),
        );
        for (key, _) in &removed {
            self.timers.cancel(key);
            self.withdraw(key, mesh);
        }
        if !removed.is_empty() {
            info!(interface = %interface, count = removed.len(), "Cleared on-link prefixes");
            self.reselect_omr(now, mesh);
        }
        removed.len()
    }

    /// Drops learned OMR prefixes when the mesh goes down.
    pub fn teardown_mesh<M: MeshOps>(&mut self, now: Instant, mesh: &mut M) -> usize {
        let removed = self.table.remove_where(|key, record| {
            key.kind == PrefixKind::Omr && record.origin == PrefixOrigin::Learned
        });
        for (key, _) in &removed {
            self.timers.cancel(key);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleared learned OMR prefixes");
            self.reselect_omr(now, mesh);
        }
        removed.len()
    }

    /// Self-generates an OMR prefix if enabled and none exists.
    ///
    /// Returns the generated prefix.
    pub fn ensure_omr<M: MeshOps>(&mut self, now: Instant, mesh: &mut M) -> Option<Ipv6Prefix> {
        if !self.config.auto_omr || self.preferred_omr.is_some() {
            return None;
        }

        let prefix = match self.config.omr_prefix.or(self.generated_omr) {
            Some(prefix) => prefix,
            None => {
                let prefix = random_ula_prefix()?;
                self.generated_omr = Some(prefix);
                prefix
            }
        };
        info!(prefix = %prefix, "Self-generating OMR prefix");

        match self.on_omr_prefix_established(
            prefix,
            Lifetimes::INFINITE,
            PrefixOrigin::SelfGenerated,
            now,
            mesh,
        ) {
            PrefixUpdate::Created => Some(prefix),
            _ => None,
        }
    }

    /// Keeps the self-generated on-link prefix of `interface` in step with
    /// the learned ones: created while none is learned, deprecated and left
    /// to expire once one is, preferred again if they all go away first.
    ///
    /// Returns true when the local prefix changed.
    #[instrument(skip(self, mesh), fields(interface = %interface))]
    pub fn ensure_on_link<M: MeshOps>(
        &mut self,
        interface: &InterfaceId,
        now: Instant,
        mesh: &mut M,
    ) -> bool {
        if !self.config.auto_on_link {
            return false;
        }
        let learned = self.has_learned_on_link(interface);
        let local = self
            .local_on_link(interface)
            .map(|record| (record.key.clone(), record.preferred));

        match local {
            Some((key, true)) if learned => {
                info!(
                    prefix = %key.prefix,
                    "Infra router provides an on-link prefix, deprecating ours"
                );
                let lifetimes = Lifetimes::new(LOCAL_ON_LINK_LIFETIME_SECS, 0);
                self.upsert(key, lifetimes, PrefixOrigin::SelfGenerated, now, mesh);
                true
            }
            Some((key, false)) if !learned => {
                info!(
                    prefix = %key.prefix,
                    "No learned on-link prefix left, preferring ours again"
                );
                self.upsert(key, Lifetimes::INFINITE, PrefixOrigin::SelfGenerated, now, mesh);
                true
            }
            Some(_) => false,
            None if learned => false,
            None => {
                let prefix = match self.config.on_link_prefix.or(self.generated_on_link) {
                    Some(prefix) => prefix,
                    None => {
                        let Some(prefix) = random_ula_prefix() else {
                            return false;
                        };
                        self.generated_on_link = Some(prefix);
                        prefix
                    }
                };
                info!(prefix = %prefix, "Self-generating on-link prefix");
                let key = PrefixKey::on_link(prefix, interface.clone());
                self.upsert(key, Lifetimes::INFINITE, PrefixOrigin::SelfGenerated, now, mesh)
                    == PrefixUpdate::Created
            }
        }
    }

    /// The Prefix Information Option advertising the self-generated on-link
    /// prefix of `interface`, with the lifetimes it has left at `now`.
    pub fn local_on_link_advertisement(
        &self,
        interface: &InterfaceId,
        now: Instant,
    ) -> Option<PrefixInformation> {
        let record = self.local_on_link(interface)?;
        let lifetimes = match (record.preferred, record.valid_until) {
            (false, Some(until)) => {
                let remaining = until.saturating_duration_since(now).as_secs();
                Lifetimes::new(u32::try_from(remaining).unwrap_or(u32::MAX), 0)
            }
            _ => Lifetimes::new(LOCAL_ON_LINK_LIFETIME_SECS, LOCAL_ON_LINK_LIFETIME_SECS),
        };
        Some(PrefixInformation {
            prefix: record.prefix(),
            on_link: true,
            autonomous: true,
            lifetimes,
        })
    }

    /// True when at least one on-link prefix exists for `interface`.
    pub fn has_on_link(&self, interface: &InterfaceId) -> bool {
        self.on_link_records(interface).next().is_some()
    }

    fn has_learned_on_link(&self, interface: &InterfaceId) -> bool {
        self.on_link_records(interface)
            .any(|record| record.origin == PrefixOrigin::Learned)
    }

    fn local_on_link<'a>(&'a self, interface: &'a InterfaceId) -> Option<&'a PrefixRecord> {
        self.on_link_records(interface)
            .find(|record| record.origin == PrefixOrigin::SelfGenerated)
    }

    fn on_link_records<'a>(
        &'a self,
        interface: &'a InterfaceId,
    ) -> impl Iterator<Item = &'a PrefixRecord> + 'a {
        self.table.values().filter(move |record| {
            record.kind() == PrefixKind::OnLink
                && matches!(&record.key.anchor, PrefixAnchor::Infra(id) if id == interface)
        })
    }

    pub fn preferred_omr(&self) -> Option<Ipv6Prefix> {
        self.preferred_omr
    }

    pub fn mesh_local_prefix(&self) -> Option<Ipv6Prefix> {
        self.mesh_local
    }

    pub fn get(&self, key: &PrefixKey) -> Option<&PrefixRecord> {
        self.table.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &PrefixRecord> {
        self.table.values()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn upsert<M: MeshOps>(
        &mut self,
        key: PrefixKey,
        lifetimes: Lifetimes,
        origin: PrefixOrigin,
        now: Instant,
        mesh: &mut M,
    ) -> PrefixUpdate {
        if !lifetimes.is_consistent() {
            warn!(
                valid = lifetimes.valid,
                preferred = lifetimes.preferred,
                "Ignoring prefix with preferred lifetime above valid lifetime"
            );
            self.metrics.malformed_packets_total.inc();
            return PrefixUpdate::Ignored;
        }
        // The cap applies to what the network tells us, not to our own prefixes.
        let lifetimes = match origin {
            PrefixOrigin::Learned => lifetimes.clamp_valid(self.config.max_valid_lifetime_secs),
            PrefixOrigin::SelfGenerated => lifetimes,
        };

        if lifetimes.valid == 0 {
            return if self.on_prefix_expired(&key, now, mesh) {
                PrefixUpdate::Expired
            } else {
                PrefixUpdate::Ignored
            };
        }

        let valid_until = lifetimes.valid_until(now);
        let update = match self.table.get_mut(&key) {
            Some(record) => {
                record.lifetimes = lifetimes;
                record.valid_until = valid_until;
                record.last_refreshed = now;
                if key.kind == PrefixKind::OnLink {
                    let preferred = lifetimes.preferred > 0;
                    if record.preferred && !preferred {
                        record.deprecated_at = Some(now);
                    } else if preferred {
                        record.deprecated_at = None;
                    }
                    record.preferred = preferred;
                }
                if origin == PrefixOrigin::Learned {
                    record.origin = origin;
                }
                debug!(valid = lifetimes.valid, "Refreshed prefix");
                PrefixUpdate::Refreshed
            }
            None => {
                if self.table.is_full() && !self.evict_one(now, mesh) {
                    warn!("Prefix table full, ignoring prefix");
                    return PrefixUpdate::Ignored;
                }
                let record = PrefixRecord {
                    key: key.clone(),
                    origin,
                    lifetimes,
                    valid_until,
                    preferred: key.kind == PrefixKind::OnLink && lifetimes.preferred > 0,
                    deprecated_at: None,
                    last_refreshed: now,
                };
                if self.table.insert(key.clone(), record).is_err() {
                    return PrefixUpdate::Ignored;
                }
                info!(kind = ?key.kind, origin = ?origin, valid = lifetimes.valid, "Added prefix");
                if key.kind == PrefixKind::OnLink {
                    advertise(mesh, key.prefix, PrefixKind::OnLink);
                }
                PrefixUpdate::Created
            }
        };

        match valid_until {
            Some(at) => {
                self.timers.schedule(key.clone(), at);
            }
            None => {
                self.timers.cancel(&key);
            }
        }

        if key.kind == PrefixKind::Omr {
            self.reselect_omr(now, mesh);
        }
        update
    }

    fn remove<M: MeshOps>(
        &mut self,
        key: &PrefixKey,
        now: Instant,
        mesh: &mut M,
    ) -> Option<PrefixRecord> {
        let record = self.table.remove(key)?;
        self.timers.cancel(key);
        match key.kind {
            PrefixKind::OnLink => self.withdraw(key, mesh),
            PrefixKind::Omr => self.reselect_omr(now, mesh),
            PrefixKind::MeshLocal => self.mesh_local = None,
        }
        Some(record)
    }

    fn withdraw<M: MeshOps>(&self, key: &PrefixKey, mesh: &mut M) {
        if key.kind != PrefixKind::OnLink {
            return;
        }
        if let Err(e) = mesh.withdraw_mesh_advertisement(key.prefix, key.kind) {
            warn!(prefix = %key.prefix, error = %e, "Failed to withdraw prefix from mesh");
        }
    }

    /// Evicts the least recently refreshed record other than the mesh-local
    /// prefix.
    fn evict_one<M: MeshOps>(&mut self, now: Instant, mesh: &mut M) -> bool {
        let victim = self
            .table
            .min_key_by(|key, record| (key.kind == PrefixKind::MeshLocal, record.last_refreshed))
            .cloned();
        let Some(victim) = victim.filter(|key| key.kind != PrefixKind::MeshLocal) else {
            return false;
        };

        warn!(
            prefix = %victim.prefix,
            kind = ?victim.kind,
            "Prefix table full, evicting least recently refreshed entry"
        );
        self.metrics.evictions_total.inc();
        self.remove(&victim, now, mesh);
        true
    }

    /// Picks the preferred OMR prefix: learned before self-generated, then
    /// the numerically smallest.
    fn reselect_omr<M: MeshOps>(&mut self, now: Instant, mesh: &mut M) {
        let best = self
            .table
            .values()
            .filter(|record| record.kind() == PrefixKind::Omr)
            .min_by_key(|record| (record.origin, record.prefix()))
            .map(PrefixRecord::prefix);

        if best != self.preferred_omr {
            if let Some(old) = self.preferred_omr {
                if let Err(e) = mesh.withdraw_mesh_advertisement(old, PrefixKind::Omr) {
                    warn!(prefix = %old, error = %e, "Failed to withdraw OMR prefix from mesh");
                }
                if let Some(record) = self.table.get_mut(&PrefixKey::omr(old)) {
                    record.preferred = false;
                    record.deprecated_at = Some(now);
                }
            }
            if let Some(new) = best {
                if let Some(record) = self.table.get_mut(&PrefixKey::omr(new)) {
                    record.preferred = true;
                    record.deprecated_at = None;
                }
                advertise(mesh, new, PrefixKind::Omr);
            }
            info!(
                old = ?self.preferred_omr.map(|p| p.to_string()),
                new = ?best.map(|p| p.to_string()),
                "Preferred OMR prefix changed"
            );
            self.preferred_omr = best;
        }

        self.update_mesh_local_preference(now, mesh);
    }

    fn update_mesh_local_preference<M: MeshOps>(&mut self, now: Instant, mesh: &mut M) {
        let Some(prefix) = self.mesh_local else {
            return;
        };
        let preferred = self.preferred_omr.is_none();
        let Some(record) = self.table.get_mut(&PrefixKey::mesh_local(prefix)) else {
            return;
        };
        if record.preferred == preferred {
            return;
        }

        record.preferred = preferred;
        record.deprecated_at = (!preferred).then_some(now);
        if preferred {
            info!(prefix = %prefix, "No OMR prefix left, mesh-local prefix preferred again");
        } else {
            info!(prefix = %prefix, "OMR prefix live, deprecating mesh-local prefix");
        }
        if let Err(e) = mesh.set_mesh_local_preferred(prefix, preferred) {
            warn!(error = %e, "Failed to update mesh-local preference");
        }
    }
}

fn advertise<M: MeshOps>(mesh: &mut M, prefix: Ipv6Prefix, kind: PrefixKind) {
    if let Err(e) = mesh.emit_mesh_advertisement(prefix, kind) {
        warn!(prefix = %prefix, error = %e, "Failed to advertise prefix into mesh");
    }
}

/// Random ULA /64: fd00::/8 followed by 56 random bits.
fn random_ula_prefix() -> Option<Ipv6Prefix> {
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    rand::thread_rng().fill(&mut octets[1..8]);
    Ipv6Prefix::new(Ipv6Addr::from(octets), 64).ok()
}
