//! Infra Link Coordinator
//!
//! State machine for the infra-facing interface:
//!
//! ```text
//! Down ──link up──▶ Up(NoOnLinkAddr) ◀──▶ Up(HasOnLinkAddr)
//!   ▲                      │                     │
//!   └──── link down / upstream switch (teardown) ┘
//! ```
//!
//! Switching the upstream identity is a teardown of the old link followed
//! by `Down` on the new one; nothing is mutated in place. Teardown is
//! delegated to the prefix manager and multicast engine, each clearing its
//! own infra-anchored state.
//!
//! The coordinator also holds the mesh link state, whose down transition
//! clears the mesh-anchored side of both tables.

use crate::config::InfraConfig;
use crate::metrics::MetricsCollector;
use crate::multicast::MulticastEngine;
use crate::packet::{PrefixInformation, RouterAdvertisementBuilder};
use crate::platform::{InfraLinkOps, MeshOps};
use crate::prefix_manager::PrefixManager;
use crate::types::{InterfaceId, Lifetimes, LinkInstance, LinkState};
use serde::Serialize;
use std::time::{Duration, Instant};
use tbr_common::TimerQueue;
use tbr_types::Ipv6Prefix;
use tracing::{debug, info, instrument, warn};

/// Observable state of the infra link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraLinkStatus {
    #[default]
    Down,
    NoOnLinkAddr,
    HasOnLinkAddr,
}

pub struct InfraLinkCoordinator {
    upstream: Option<InterfaceId>,
    /// Set iff the link is up.
    instance: Option<LinkInstance>,
    last_epoch: u64,
    status: InfraLinkStatus,
    mesh: LinkState,
    ra_timers: TimerQueue<u64>,
    ra_interval: Duration,
    route_lifetime: u32,
    advertised_omr: Option<Ipv6Prefix>,
    /// Self-generated on-link prefix in the last RA, with its preference.
    advertised_on_link: Option<(Ipv6Prefix, bool)>,
    metrics: MetricsCollector,
}

impl InfraLinkCoordinator {
    pub fn new(config: &InfraConfig, metrics: MetricsCollector) -> Self {
        metrics.set_infra_link_up(false);
        Self {
            upstream: None,
            instance: None,
            last_epoch: 0,
            status: InfraLinkStatus::Down,
            mesh: LinkState::Down,
            ra_timers: TimerQueue::new(),
            ra_interval: Duration::from_secs(config.ra_interval_secs),
            route_lifetime: config.route_lifetime_secs,
            advertised_omr: None,
            advertised_on_link: None,
            metrics,
        }
    }

    /// Selects the upstream interface. A different identity tears down all
    /// state tied to the old one and leaves the link `Down`.
    ///
    /// Returns true if the selection changed.
    #[instrument(skip_all, fields(upstream = ?upstream.as_ref().map(InterfaceId::as_str)))]
    pub fn set_upstream<P: InfraLinkOps + MeshOps>(
        &mut self,
        upstream: Option<InterfaceId>,
        prefixes: &mut PrefixManager,
        multicast: &mut MulticastEngine,
        now: Instant,
        platform: &mut P,
    ) -> bool {
        if upstream == self.upstream {
            debug!("Upstream unchanged");
            return false;
        }

        info!(
            old = ?self.upstream.as_ref().map(InterfaceId::as_str),
            "Switching upstream interface"
        );
        self.metrics.link_switches_total.inc();

        if let Some(old) = self.upstream.take() {
            let instance = self.instance.take();
            self.teardown(&old, instance.as_ref(), prefixes, multicast, now, platform);
        }
        self.upstream = upstream;
        true
    }

    /// Brings the link up for `interface`.
    ///
    /// Ignored (and counted stale) if `interface` is not the selected
    /// upstream; a no-op if the link is already up.
    #[instrument(skip_all, fields(interface = %interface))]
    pub fn on_link_up<P: InfraLinkOps + MeshOps>(
        &mut self,
        interface: &InterfaceId,
        multicast: &mut MulticastEngine,
        now: Instant,
        platform: &mut P,
    ) -> bool {
        if self.upstream.as_ref() != Some(interface) {
            debug!("Link up for an interface that is not the upstream");
            self.metrics.stale_events_total.inc();
            return false;
        }
        if self.instance.is_some() {
            debug!("Link already up");
            return false;
        }

        self.last_epoch += 1;
        let instance = LinkInstance {
            interface: interface.clone(),
            epoch: self.last_epoch,
        };
        info!(epoch = instance.epoch, "Infra link up");
        self.metrics.set_infra_link_up(true);

        if let Err(e) = platform.send_router_solicitation(interface) {
            warn!(error = %e, "Failed to send router solicitation");
        }
        multicast.on_infra_link_up(&instance, now, platform);

        self.ra_timers.schedule(instance.epoch, now + self.ra_interval);
        self.advertised_omr = None;
        self.advertised_on_link = None;
        self.instance = Some(instance);
        true
    }

    /// Takes the link down, clearing all infra-anchored state.
    ///
    /// With `interface` given, the event is stale unless it names the
    /// selected upstream.
    #[instrument(skip_all, fields(interface = ?interface.map(InterfaceId::as_str)))]
    pub fn on_link_down<P: InfraLinkOps + MeshOps>(
        &mut self,
        interface: Option<&InterfaceId>,
        prefixes: &mut PrefixManager,
        multicast: &mut MulticastEngine,
        now: Instant,
        platform: &mut P,
    ) -> bool {
        if interface.is_some() && interface != self.upstream.as_ref() {
            debug!("Link down for an interface that is not the upstream");
            self.metrics.stale_events_total.inc();
            return false;
        }
        let Some(instance) = self.instance.take() else {
            debug!("Link already down");
            return false;
        };

        info!(interface = %instance.interface, epoch = instance.epoch, "Infra link down");
        self.teardown(&instance.interface, None, prefixes, multicast, now, platform);
        true
    }

    pub fn on_mesh_link_up(&mut self) -> bool {
        if self.mesh == LinkState::Up {
            debug!("Mesh link already up");
            return false;
        }
        info!("Mesh link up");
        self.mesh = LinkState::Up;
        true
    }

    /// Takes the mesh down: every Thread listener registration and every
    /// learned OMR prefix goes with it.
    pub fn on_mesh_link_down<P: InfraLinkOps + MeshOps>(
        &mut self,
        prefixes: &mut PrefixManager,
        multicast: &mut MulticastEngine,
        now: Instant,
        platform: &mut P,
    ) -> bool {
        if self.mesh == LinkState::Down {
            debug!("Mesh link already down");
            return false;
        }
        self.mesh = LinkState::Down;
        let groups = multicast.teardown_mesh(self.instance.as_ref(), platform);
        let removed = prefixes.teardown_mesh(now, platform);
        info!(groups, prefixes = removed, "Mesh link down");
        true
    }

    /// Answers a Router Solicitation from an infra host.
    pub fn on_router_solicitation<I: InfraLinkOps>(
        &mut self,
        now: Instant,
        prefixes: &PrefixManager,
        infra: &mut I,
    ) {
        let omr = prefixes.preferred_omr();
        let on_link = self.local_on_link(prefixes, now);
        if omr.is_none() && on_link.is_none() {
            return;
        }
        let withdrawn = self.advertised_omr;
        self.send_advertisement(omr, withdrawn, on_link, infra);
        self.record_advertised(omr, on_link);
    }

    /// Emits the periodic Router Advertisement.
    pub fn on_timer<I: InfraLinkOps>(
        &mut self,
        now: Instant,
        prefixes: &PrefixManager,
        infra: &mut I,
    ) {
        for epoch in self.ra_timers.pop_expired(now) {
            let current = self.instance.as_ref().map(|instance| instance.epoch);
            if current != Some(epoch) {
                debug!(epoch, "Discarding RA timer for torn-down link");
                self.metrics.stale_events_total.inc();
                continue;
            }
            let omr = prefixes.preferred_omr();
            let on_link = self.local_on_link(prefixes, now);
            self.send_advertisement(omr, None, on_link, infra);
            self.record_advertised(omr, on_link);
            self.ra_timers.schedule(epoch, now + self.ra_interval);
        }
    }

    /// Sends an RA right away when the preferred OMR prefix or the state
    /// of the self-generated on-link prefix changed since the last one.
    pub fn refresh_advertisement<I: InfraLinkOps>(
        &mut self,
        now: Instant,
        prefixes: &PrefixManager,
        infra: &mut I,
    ) {
        if self.instance.is_none() {
            return;
        }
        let omr = prefixes.preferred_omr();
        let on_link = self.local_on_link(prefixes, now);
        if omr == self.advertised_omr && on_link.map(advertised_state) == self.advertised_on_link {
            return;
        }
        let withdrawn = self.advertised_omr;
        self.send_advertisement(omr, withdrawn, on_link, infra);
        self.record_advertised(omr, on_link);
    }

    /// Recomputes the Up sub-state from the prefix table, logging changes.
    pub fn update_status(&mut self, prefixes: &PrefixManager) -> InfraLinkStatus {
        let status = match &self.instance {
            None => InfraLinkStatus::Down,
            Some(instance) if prefixes.has_on_link(&instance.interface) => {
                InfraLinkStatus::HasOnLinkAddr
            }
            Some(_) => InfraLinkStatus::NoOnLinkAddr,
        };
        if status != self.status {
            info!(from = ?self.status, to = ?status, "Infra link state changed");
            self.status = status;
        }
        status
    }

    pub fn upstream(&self) -> Option<&InterfaceId> {
        self.upstream.as_ref()
    }

    /// The current link instance, if up.
    pub fn instance(&self) -> Option<&LinkInstance> {
        self.instance.as_ref()
    }

    pub fn status(&self) -> InfraLinkStatus {
        self.status
    }

    pub fn is_up(&self) -> bool {
        self.instance.is_some()
    }

    pub fn infra_state(&self) -> LinkState {
        if self.is_up() {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }

    pub fn mesh_state(&self) -> LinkState {
        self.mesh
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ra_timers.next_deadline()
    }

    /// Clears everything tied to `interface`. `previous` is the instance
    /// being left while still usable, if any.
    fn teardown<P: InfraLinkOps + MeshOps>(
        &mut self,
        interface: &InterfaceId,
        previous: Option<&LinkInstance>,
        prefixes: &mut PrefixManager,
        multicast: &mut MulticastEngine,
        now: Instant,
        platform: &mut P,
    ) {
        // Tell infra hosts the route and the prefix we handed out are gone.
        if let Some(previous) = previous {
            let mut builder = RouterAdvertisementBuilder::new();
            if let Some(omr) = self.advertised_omr {
                builder = builder.route_information(omr, 0);
            }
            if let Some((prefix, _)) = self.advertised_on_link {
                builder = builder.prefix_information(PrefixInformation {
                    prefix,
                    on_link: true,
                    autonomous: true,
                    lifetimes: Lifetimes::new(0, 0),
                });
            }
            if self.advertised_omr.is_some() || self.advertised_on_link.is_some() {
                let message = builder.build();
                if let Err(e) = platform.send_router_advertisement(&previous.interface, &message) {
                    debug!(error = %e, "Final RA on old upstream failed");
                }
            }
        }

        let removed = prefixes.teardown_infra(interface, now, platform);
        let dropped = multicast.teardown_infra(previous, platform);
        self.ra_timers.clear();
        self.advertised_omr = None;
        self.advertised_on_link = None;
        self.instance = None;
        self.metrics.set_infra_link_up(false);
        self.update_status(prefixes);
        info!(interface = %interface, prefixes = removed, joins = dropped, "Infra link torn down");
    }

    fn local_on_link(&self, prefixes: &PrefixManager, now: Instant) -> Option<PrefixInformation> {
        let instance = self.instance.as_ref()?;
        prefixes.local_on_link_advertisement(&instance.interface, now)
    }

    fn record_advertised(&mut self, omr: Option<Ipv6Prefix>, on_link: Option<PrefixInformation>) {
        self.advertised_omr = omr;
        self.advertised_on_link = on_link.map(advertised_state);
    }

    fn send_advertisement<I: InfraLinkOps>(
        &self,
        omr: Option<Ipv6Prefix>,
        withdrawn: Option<Ipv6Prefix>,
        on_link: Option<PrefixInformation>,
        infra: &mut I,
    ) {
        let Some(instance) = &self.instance else {
            return;
        };
        if omr.is_none() && withdrawn.is_none() && on_link.is_none() {
            return;
        }
        let mut builder = RouterAdvertisementBuilder::new();
        if let Some(pio) = on_link {
            builder = builder.prefix_information(pio);
        }
        if let Some(omr) = omr {
            builder = builder.route_information(omr, self.route_lifetime);
        }
        if let Some(withdrawn) = withdrawn.filter(|w| Some(*w) != omr) {
            builder = builder.route_information(withdrawn, 0);
        }

        debug!(interface = %instance.interface, omr = ?omr.map(|p| p.to_string()), "Sending RA");
        if let Err(e) = infra.send_router_advertisement(&instance.interface, &builder.build()) {
            warn!(
                interface = %instance.interface,
                error = %e,
                "Failed to send router advertisement"
            );
        }
    }
}

fn advertised_state(pio: PrefixInformation) -> (Ipv6Prefix, bool) {
    (pio.prefix, pio.lifetimes.preferred > 0)
}
