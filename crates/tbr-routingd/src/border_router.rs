//! The border router event context.
//!
//! [`BorderRouter`] owns the prefix manager, the multicast engine and the
//! link coordinator, and is the only place their state changes. Events and
//! timer expirations are applied one at a time; after each one a new
//! snapshot is published.

use crate::config::BorderRoutingConfig;
use crate::data_path::DataPath;
use crate::infra_link::InfraLinkCoordinator;
use crate::metrics::MetricsCollector;
use crate::multicast::MulticastEngine;
use crate::packet::{parse_infra_packet, InfraPacket};
use crate::platform::{InfraLinkOps, MeshOps};
use crate::prefix_manager::PrefixManager;
use crate::snapshot::{SnapshotHandle, TableSnapshot};
use crate::types::{InterfaceId, Lifetimes, LinkState, NodeId, PrefixOrigin, RegistrationOp};
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};
use tbr_types::Ipv6Prefix;
use tracing::{debug, info, instrument, trace};

fn default_lifetimes() -> Lifetimes {
    Lifetimes::INFINITE
}

fn default_origin() -> PrefixOrigin {
    PrefixOrigin::Learned
}

/// Every signal the core reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BorderRouterEvent {
    /// A raw IPv6 control packet captured on the infra link.
    InfraPacket {
        interface: InterfaceId,
        bytes: Vec<u8>,
    },
    /// Multicast Listener Registration from a Thread node.
    ThreadListener {
        group: Ipv6Addr,
        node: NodeId,
        op: RegistrationOp,
        #[serde(default)]
        timeout_secs: Option<u32>,
    },
    SetUpstream {
        interface: Option<InterfaceId>,
    },
    InfraLinkUp {
        interface: InterfaceId,
    },
    InfraLinkDown {
        #[serde(default)]
        interface: Option<InterfaceId>,
    },
    MeshLinkUp,
    MeshLinkDown,
    OmrPrefixEstablished {
        prefix: Ipv6Prefix,
        #[serde(default = "default_lifetimes")]
        lifetimes: Lifetimes,
        #[serde(default = "default_origin")]
        origin: PrefixOrigin,
    },
    MeshLocalPrefix {
        prefix: Ipv6Prefix,
    },
}

pub struct BorderRouter<P> {
    config: BorderRoutingConfig,
    platform: P,
    prefixes: PrefixManager,
    multicast: MulticastEngine,
    link: InfraLinkCoordinator,
    snapshot: SnapshotHandle,
    generation: u64,
    metrics: MetricsCollector,
}

impl<P: InfraLinkOps + MeshOps> BorderRouter<P> {
    pub fn new(config: BorderRoutingConfig, platform: P, metrics: MetricsCollector) -> Self {
        Self {
            prefixes: PrefixManager::new(&config.prefix, metrics.clone()),
            multicast: MulticastEngine::new(&config.multicast, metrics.clone()),
            link: InfraLinkCoordinator::new(&config.infra, metrics.clone()),
            config,
            platform,
            snapshot: SnapshotHandle::new(),
            generation: 0,
            metrics,
        }
    }

    /// Applies the statically configured upstream and mesh-local prefix.
    pub fn start(&mut self, now: Instant) {
        if let Some(prefix) = self.config.prefix.mesh_local_prefix {
            self.prefixes
                .set_mesh_local_prefix(prefix, now, &mut self.platform);
        }
        if let Some(upstream) = self.config.infra.upstream.clone() {
            self.link.set_upstream(
                Some(InterfaceId::new(upstream)),
                &mut self.prefixes,
                &mut self.multicast,
                now,
                &mut self.platform,
            );
        }
        info!(
            upstream = ?self.link.upstream().map(InterfaceId::as_str),
            "Border router started"
        );
        self.after_change(now);
    }

    #[instrument(skip_all, fields(event = event_name(&event)))]
    pub fn handle_event(&mut self, event: BorderRouterEvent, now: Instant) {
        match event {
            BorderRouterEvent::InfraPacket { interface, bytes } => {
                self.on_infra_packet(&interface, &bytes, now)
            }
            BorderRouterEvent::ThreadListener {
                group,
                node,
                op,
                timeout_secs,
            } => self.on_thread_listener(group, node, op, timeout_secs, now),
            BorderRouterEvent::SetUpstream { interface } => {
                self.link.set_upstream(
                    interface,
                    &mut self.prefixes,
                    &mut self.multicast,
                    now,
                    &mut self.platform,
                );
            }
            BorderRouterEvent::InfraLinkUp { interface } => {
                self.link
                    .on_link_up(&interface, &mut self.multicast, now, &mut self.platform);
            }
            BorderRouterEvent::InfraLinkDown { interface } => {
                self.link.on_link_down(
                    interface.as_ref(),
                    &mut self.prefixes,
                    &mut self.multicast,
                    now,
                    &mut self.platform,
                );
            }
            BorderRouterEvent::MeshLinkUp => {
                self.link.on_mesh_link_up();
            }
            BorderRouterEvent::MeshLinkDown => {
                self.link.on_mesh_link_down(
                    &mut self.prefixes,
                    &mut self.multicast,
                    now,
                    &mut self.platform,
                );
            }
            BorderRouterEvent::OmrPrefixEstablished {
                prefix,
                lifetimes,
                origin,
            } => {
                if self.link.mesh_state() == LinkState::Down {
                    debug!(prefix = %prefix, "OMR prefix while mesh is down");
                    self.metrics.stale_events_total.inc();
                } else {
                    self.prefixes.on_omr_prefix_established(
                        prefix,
                        lifetimes,
                        origin,
                        now,
                        &mut self.platform,
                    );
                }
            }
            BorderRouterEvent::MeshLocalPrefix { prefix } => {
                self.prefixes
                    .set_mesh_local_prefix(prefix, now, &mut self.platform);
            }
        }
        self.after_change(now);
    }

    /// Fires every timer due at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        let expired = self.prefixes.on_timer(now, &mut self.platform);
        self.multicast
            .on_timer(now, self.link.instance(), &mut self.platform);
        self.link.on_timer(now, &self.prefixes, &mut self.platform);
        trace!(expired, "Timers processed");
        self.after_change(now);
    }

    /// Earliest pending timer across all components.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.prefixes.next_deadline(),
            self.multicast.next_deadline(),
            self.link.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> std::sync::Arc<TableSnapshot> {
        self.snapshot.load()
    }

    /// A data-path decision function bound to this router's snapshots.
    pub fn data_path(&self) -> DataPath {
        DataPath::new(self.snapshot.clone(), self.metrics.clone())
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    fn on_infra_packet(&mut self, interface: &InterfaceId, bytes: &[u8], now: Instant) {
        let Some(link) = self
            .link
            .instance()
            .filter(|link| &link.interface == interface)
            .cloned()
        else {
            debug!(interface = %interface, "Packet from an interface that is not up");
            self.metrics.stale_events_total.inc();
            return;
        };

        let packet = match parse_infra_packet(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(interface = %interface, error = %e, "Dropping malformed infra packet");
                self.metrics.malformed_packets_total.inc();
                return;
            }
        };

        match packet {
            InfraPacket::RouterAdvertisement {
                source, prefixes, ..
            } => {
                debug!(source = %source, count = prefixes.len(), "Router advertisement");
                for pio in prefixes.iter().filter(|pio| pio.on_link) {
                    self.prefixes.on_infra_router_advertisement(
                        interface,
                        pio.prefix,
                        pio.lifetimes,
                        now,
                        &mut self.platform,
                    );
                }
            }
            InfraPacket::RouterSolicitation => {
                self.link
                    .on_router_solicitation(now, &self.prefixes, &mut self.platform);
            }
            InfraPacket::MldQuery { group } => {
                self.multicast
                    .on_infra_query(group, &link, now, &mut self.platform);
            }
            InfraPacket::MldReport { joined, left } => {
                self.multicast.observe_infra_report(&joined, &left);
            }
            InfraPacket::MldDone { group } => {
                self.multicast.observe_infra_report(&[], &[group]);
            }
            InfraPacket::Other { icmp_type } => {
                trace!(icmp_type, "Ignoring ICMPv6 message");
            }
        }
    }

    fn on_thread_listener(
        &mut self,
        group: Ipv6Addr,
        node: NodeId,
        op: RegistrationOp,
        timeout_secs: Option<u32>,
        now: Instant,
    ) {
        if self.link.mesh_state() == LinkState::Down {
            debug!(group = %group, node = %node, "Listener event while mesh is down");
            self.metrics.stale_events_total.inc();
            return;
        }
        self.multicast.on_thread_listener_event(
            group,
            node,
            op,
            timeout_secs.map(|secs| Duration::from_secs(u64::from(secs))),
            self.link.instance(),
            now,
            &mut self.platform,
        );
    }

    fn after_change(&mut self, now: Instant) {
        if self.link.mesh_state() == LinkState::Up {
            self.prefixes.ensure_omr(now, &mut self.platform);
        }
        if let Some(link) = self.link.instance() {
            self.prefixes
                .ensure_on_link(&link.interface, now, &mut self.platform);
        }
        self.link
            .refresh_advertisement(now, &self.prefixes, &mut self.platform);
        self.link.update_status(&self.prefixes);
        self.metrics
            .set_table_sizes(self.prefixes.len(), self.multicast.len());

        self.generation += 1;
        self.snapshot.store(TableSnapshot::capture(
            self.generation,
            &self.link,
            &self.prefixes,
            &self.multicast,
            now,
        ));
    }
}

fn event_name(event: &BorderRouterEvent) -> &'static str {
    match event {
        BorderRouterEvent::InfraPacket { .. } => "infra_packet",
        BorderRouterEvent::ThreadListener { .. } => "thread_listener",
        BorderRouterEvent::SetUpstream { .. } => "set_upstream",
        BorderRouterEvent::InfraLinkUp { .. } => "infra_link_up",
        BorderRouterEvent::InfraLinkDown { .. } => "infra_link_down",
        BorderRouterEvent::MeshLinkUp => "mesh_link_up",
        BorderRouterEvent::MeshLinkDown => "mesh_link_down",
        BorderRouterEvent::OmrPrefixEstablished { .. } => "omr_prefix_established",
        BorderRouterEvent::MeshLocalPrefix { .. } => "mesh_local_prefix",
    }
}
