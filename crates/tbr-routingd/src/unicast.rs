//! Unicast forwarding between the infra link and the mesh.
//!
//! Stateless: every decision is a function of the packet header and the
//! current snapshot. No address translation.

use crate::data_path::{DropReason, ForwardingDecision, Ingress};
use crate::packet::Ipv6Header;
use crate::snapshot::TableSnapshot;
use tbr_types::is_link_local;

/// Routes a unicast packet by destination prefix.
///
/// Infra to mesh needs the destination inside an OMR prefix. Mesh to infra
/// needs the destination inside an on-link prefix and a source that can
/// leave the mesh.
pub fn route(
    header: &Ipv6Header,
    ingress: Ingress,
    snapshot: &TableSnapshot,
) -> ForwardingDecision {
    let destination = &header.destination;
    if is_link_local(destination) || snapshot.is_mesh_local_address(destination) {
        return ForwardingDecision::Drop(DropReason::NonRoutableDestination);
    }

    let source = &header.source;
    if is_link_local(source) || snapshot.is_mesh_local_address(source) {
        return ForwardingDecision::Drop(DropReason::NonRoutableSource);
    }

    match ingress {
        Ingress::Infra => {
            if !snapshot.is_omr_address(destination) {
                ForwardingDecision::Drop(DropReason::NoRoute)
            } else if !snapshot.mesh_up() {
                ForwardingDecision::Drop(DropReason::LinkDown)
            } else {
                ForwardingDecision::ToMesh
            }
        }
        Ingress::Mesh => {
            if !snapshot.is_on_link_address(destination) {
                ForwardingDecision::Drop(DropReason::NoRoute)
            } else if !snapshot.infra_up() {
                ForwardingDecision::Drop(DropReason::LinkDown)
            } else {
                ForwardingDecision::ToInfra
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NEXT_HEADER_ICMPV6;
    use crate::snapshot::PrefixView;
    use crate::types::{LinkState, PrefixAnchor, PrefixKind, PrefixOrigin};
    use pretty_assertions::assert_eq;

    fn prefix(p: &str, kind: PrefixKind) -> PrefixView {
        PrefixView {
            prefix: p.parse().unwrap(),
            kind,
            origin: PrefixOrigin::Learned,
            anchor: PrefixAnchor::Mesh,
            preferred: true,
            valid_lifetime: 1800,
            preferred_lifetime: 1800,
            valid_remaining_secs: Some(1800),
        }
    }

    fn snapshot() -> TableSnapshot {
        let mut snapshot = TableSnapshot {
            mesh: LinkState::Up,
            prefixes: vec![
                prefix("2001:db8:1::/64", PrefixKind::OnLink),
                prefix("2001:db8:a::/64", PrefixKind::Omr),
                prefix("fd11:22::/64", PrefixKind::MeshLocal),
            ],
            ..TableSnapshot::default()
        };
        snapshot.infra.state = LinkState::Up;
        snapshot
    }

    fn header(source: &str, destination: &str) -> Ipv6Header {
        Ipv6Header {
            payload_len: 0,
            next_header: NEXT_HEADER_ICMPV6,
            hop_limit: 64,
            source: source.parse().unwrap(),
            destination: destination.parse().unwrap(),
        }
    }

    #[test]
    fn test_infra_to_mesh_needs_omr_destination() {
        let snapshot = snapshot();
        assert_eq!(
            route(&header("2001:db8:1::10", "2001:db8:a::1"), Ingress::Infra, &snapshot),
            ForwardingDecision::ToMesh
        );
        assert_eq!(
            route(&header("2001:db8:1::10", "2001:db8:b::1"), Ingress::Infra, &snapshot),
            ForwardingDecision::Drop(DropReason::NoRoute)
        );
    }

    #[test]
    fn test_mesh_to_infra_needs_on_link_destination() {
        let snapshot = snapshot();
        assert_eq!(
            route(&header("2001:db8:a::1", "2001:db8:1::10"), Ingress::Mesh, &snapshot),
            ForwardingDecision::ToInfra
        );
        assert_eq!(
            route(&header("2001:db8:a::1", "2001:db8:9::10"), Ingress::Mesh, &snapshot),
            ForwardingDecision::Drop(DropReason::NoRoute)
        );
    }

    #[test]
    fn test_private_addresses_never_routed() {
        let snapshot = snapshot();
        assert_eq!(
            route(&header("fd11:22::1", "2001:db8:1::10"), Ingress::Mesh, &snapshot),
            ForwardingDecision::Drop(DropReason::NonRoutableSource)
        );
        assert_eq!(
            route(&header("fe80::1", "2001:db8:1::10"), Ingress::Mesh, &snapshot),
            ForwardingDecision::Drop(DropReason::NonRoutableSource)
        );
        assert_eq!(
            route(&header("2001:db8:1::10", "fd11:22::1"), Ingress::Infra, &snapshot),
            ForwardingDecision::Drop(DropReason::NonRoutableDestination)
        );
        assert_eq!(
            route(&header("2001:db8:1::10", "fe80::1"), Ingress::Infra, &snapshot),
            ForwardingDecision::Drop(DropReason::NonRoutableDestination)
        );
    }

    #[test]
    fn test_down_link_drops() {
        let mut snapshot = snapshot();
        snapshot.infra.state = LinkState::Down;
        snapshot.mesh = LinkState::Down;
        assert_eq!(
            route(&header("2001:db8:a::1", "2001:db8:1::10"), Ingress::Mesh, &snapshot),
            ForwardingDecision::Drop(DropReason::LinkDown)
        );
        assert_eq!(
            route(&header("2001:db8:1::10", "2001:db8:a::1"), Ingress::Infra, &snapshot),
            ForwardingDecision::Drop(DropReason::LinkDown)
        );
    }
}
