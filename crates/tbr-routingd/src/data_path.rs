//! Per-packet forwarding decisions.
//!
//! [`DataPath`] is what a socket-owning forwarder calls for each packet it
//! receives. It never blocks the control plane: every call reads the latest
//! published snapshot and nothing else.

use crate::metrics::MetricsCollector;
use crate::multicast::{evaluate_outbound, PolicyVerdict};
use crate::packet::Ipv6Header;
use crate::snapshot::{SnapshotHandle, TableSnapshot};
use crate::unicast;
use serde::Serialize;
use tbr_types::{is_multicast, MulticastScope};
use tracing::trace;

/// The link a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ingress {
    Infra,
    Mesh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Malformed,
    HopLimit,
    /// Multicast scope is realm-local or smaller.
    ScopeTooSmall,
    /// Multicast source is not an OMR address.
    SourceNotOmr,
    /// No Thread node listens to the group.
    NoListeners,
    NoRoute,
    NonRoutableSource,
    NonRoutableDestination,
    LinkDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingDecision {
    ToMesh,
    ToInfra,
    Drop(DropReason),
}

impl ForwardingDecision {
    pub fn is_forward(&self) -> bool {
        !matches!(self, ForwardingDecision::Drop(_))
    }
}

/// Decides what to do with a packet whose header is already parsed.
pub fn decide(
    header: &Ipv6Header,
    ingress: Ingress,
    snapshot: &TableSnapshot,
) -> ForwardingDecision {
    if header.hop_limit <= 1 {
        return ForwardingDecision::Drop(DropReason::HopLimit);
    }
    if is_multicast(&header.destination) {
        decide_multicast(header, ingress, snapshot)
    } else {
        unicast::route(header, ingress, snapshot)
    }
}

fn decide_multicast(
    header: &Ipv6Header,
    ingress: Ingress,
    snapshot: &TableSnapshot,
) -> ForwardingDecision {
    let Ok(scope) = MulticastScope::of(&header.destination) else {
        return ForwardingDecision::Drop(DropReason::Malformed);
    };

    match ingress {
        Ingress::Infra => {
            if !snapshot.has_listeners(&header.destination) {
                ForwardingDecision::Drop(DropReason::NoListeners)
            } else if !snapshot.mesh_up() {
                ForwardingDecision::Drop(DropReason::LinkDown)
            } else {
                ForwardingDecision::ToMesh
            }
        }
        Ingress::Mesh => {
            match evaluate_outbound(snapshot.classify_source(&header.source), scope) {
                PolicyVerdict::Forward if snapshot.infra_up() => ForwardingDecision::ToInfra,
                PolicyVerdict::Forward => ForwardingDecision::Drop(DropReason::LinkDown),
                PolicyVerdict::ScopeTooSmall => ForwardingDecision::Drop(DropReason::ScopeTooSmall),
                PolicyVerdict::SourceNotOmr => ForwardingDecision::Drop(DropReason::SourceNotOmr),
            }
        }
    }
}

/// Forwarding decision entry point for the data plane.
#[derive(Clone)]
pub struct DataPath {
    snapshot: SnapshotHandle,
    metrics: MetricsCollector,
}

impl DataPath {
    pub fn new(snapshot: SnapshotHandle, metrics: MetricsCollector) -> Self {
        Self { snapshot, metrics }
    }

    /// Decides the fate of a raw IPv6 packet. Unparseable packets are
    /// dropped and counted.
    pub fn decide(&self, packet: &[u8], ingress: Ingress) -> ForwardingDecision {
        let header = match Ipv6Header::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                trace!(?ingress, error = %e, "Dropping malformed packet");
                self.metrics.malformed_packets_total.inc();
                return ForwardingDecision::Drop(DropReason::Malformed);
            }
        };

        let snapshot = self.snapshot.load();
        let decision = decide(&header, ingress, &snapshot);
        self.record(&header, decision);
        trace!(
            ?ingress,
            source = %header.source,
            destination = %header.destination,
            ?decision,
            "Forwarding decision"
        );
        decision
    }

    fn record(&self, header: &Ipv6Header, decision: ForwardingDecision) {
        let multicast = is_multicast(&header.destination);
        match (decision, multicast) {
            (ForwardingDecision::Drop(DropReason::Malformed), _) => {
                self.metrics.malformed_packets_total.inc()
            }
            (ForwardingDecision::Drop(_), true) => self.metrics.policy_drops_total.inc(),
            (ForwardingDecision::Drop(_), false) => self.metrics.unicast_drops_total.inc(),
            (_, true) => self.metrics.multicast_forwarded_total.inc(),
            (_, false) => self.metrics.unicast_forwarded_total.inc(),
        }
    }
}
