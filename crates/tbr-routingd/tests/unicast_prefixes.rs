//! Prefix lifecycle, upstream switching and unicast forwarding scenarios.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::net::Ipv6Addr;
use tbr_routingd::snapshot::PrefixView;
use tbr_routingd::types::PrefixAnchor;
use tbr_routingd::{
    BorderRouterEvent, DropReason, ForwardingDecision, Ingress, InfraLinkStatus, InterfaceId,
    Lifetimes, PlatformCall, PrefixKind, PrefixOrigin, TableSnapshot,
};

fn omr_event(prefix: &str, origin: PrefixOrigin) -> BorderRouterEvent {
    BorderRouterEvent::OmrPrefixEstablished {
        prefix: prefix.parse().unwrap(),
        lifetimes: Lifetimes::INFINITE,
        origin,
    }
}

fn learned_on_link(snapshot: &TableSnapshot) -> Vec<&PrefixView> {
    snapshot
        .prefixes_of(PrefixKind::OnLink)
        .filter(|view| view.origin == PrefixOrigin::Learned)
        .collect()
}

fn self_generated_on_link(snapshot: &TableSnapshot) -> Option<&PrefixView> {
    snapshot
        .prefixes_of(PrefixKind::OnLink)
        .find(|view| view.origin == PrefixOrigin::SelfGenerated)
}

fn mesh_local_preference_calls(h: &Harness) -> usize {
    h.br
        .platform()
        .count(|call| matches!(call, PlatformCall::SetMeshLocalPreferred { .. }))
}

// ============================================================================
// ON-LINK PREFIXES
// ============================================================================

#[test]
fn test_router_advertisement_creates_and_refreshes_on_link_prefix() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 600, 300);

    let snapshot = h.br.snapshot();
    let on_link = learned_on_link(&snapshot);
    assert_eq!(on_link.len(), 1);
    assert_eq!(on_link[0].anchor, PrefixAnchor::Infra(InterfaceId::from("eth0")));
    assert_eq!(snapshot.infra.status, InfraLinkStatus::HasOnLinkAddr);
    assert!(h
        .br
        .platform()
        .mesh_advertisements()
        .contains(&(ON_LINK.parse().unwrap(), PrefixKind::OnLink)));

    // A refresh restarts the lifetime instead of creating a second entry.
    h.advance(500);
    h.router_advertisement("eth0", ON_LINK, 600, 300);
    h.advance(500);
    let snapshot = h.br.snapshot();
    let on_link = learned_on_link(&snapshot);
    assert_eq!(on_link.len(), 1);
    assert_eq!(on_link[0].valid_remaining_secs, Some(100));
}

#[test]
fn test_on_link_prefix_expires_with_valid_lifetime() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 600, 300);

    h.advance(600);
    let snapshot = h.br.snapshot();
    assert!(learned_on_link(&snapshot).is_empty());
    // Our own prefix takes over again.
    assert!(self_generated_on_link(&snapshot).unwrap().preferred);
    assert_eq!(snapshot.infra.status, InfraLinkStatus::HasOnLinkAddr);
    assert!(!h
        .br
        .platform()
        .mesh_advertisements()
        .contains(&(ON_LINK.parse().unwrap(), PrefixKind::OnLink)));
}

#[test]
fn test_self_generated_on_link_prefix_until_infra_router_provides_one() {
    let mut h = Harness::up();
    h.advance(1000);

    let snapshot = h.br.snapshot();
    assert_eq!(snapshot.infra.status, InfraLinkStatus::HasOnLinkAddr);
    let local = self_generated_on_link(&snapshot).unwrap().prefix;
    assert!(local.is_unique_local());
    assert_eq!(local.prefix_len(), 64);

    // Every RA so far hands the prefix out for SLAAC.
    let advertisements = h.advertisements();
    assert!(advertisements.len() >= 5);
    for (pios, _) in &advertisements {
        assert_eq!(pios.len(), 1);
        assert_eq!(pios[0].prefix, local);
        assert!(pios[0].on_link && pios[0].autonomous);
        assert_eq!(pios[0].lifetimes, Lifetimes::new(1800, 1800));
    }

    // A host that configured an address from it is reachable from the mesh.
    let host = Ipv6Addr::from(u128::from(local.address()) | 0x10).to_string();
    let dp = h.br.data_path();
    assert_eq!(
        dp.decide(&data_packet(OMR_NODE, &host), Ingress::Mesh),
        ForwardingDecision::ToInfra
    );
    assert_eq!(
        dp.decide(&data_packet(&host, OMR_NODE), Ingress::Infra),
        ForwardingDecision::ToMesh
    );

    // An infra router's prefix deprecates ours right away.
    h.router_advertisement("eth0", ON_LINK, 3600, 3600);
    let (pios, _) = h.advertisements().pop().unwrap();
    assert_eq!(pios.len(), 1);
    assert_eq!(pios[0].prefix, local);
    assert_eq!(pios[0].lifetimes, Lifetimes::new(1800, 0));
    assert!(!self_generated_on_link(&h.br.snapshot()).unwrap().preferred);

    // Once its lifetime runs out it is withdrawn and no longer advertised.
    h.advance(1800);
    let snapshot = h.br.snapshot();
    assert!(self_generated_on_link(&snapshot).is_none());
    assert!(!h
        .br
        .platform()
        .mesh_advertisements()
        .contains(&(local, PrefixKind::OnLink)));
    let (pios, routes) = h.advertisements().pop().unwrap();
    assert!(pios.is_empty());
    assert_eq!(routes.len(), 1);
}

#[test]
fn test_on_link_prefix_deprecated_when_preferred_lifetime_lapses() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 1800, 300);
    assert!(learned_on_link(&h.br.snapshot())[0].preferred);

    // No new RA; the periodic RA timer republishes the tables.
    h.advance(400);
    let snapshot = h.br.snapshot();
    let view = learned_on_link(&snapshot)[0];
    assert!(!view.preferred);
    assert_eq!(view.valid_remaining_secs, Some(1400));
}

#[test]
fn test_inconsistent_lifetimes_ignored() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 300, 600);
    assert!(learned_on_link(&h.br.snapshot()).is_empty());
    assert_eq!(h.br.metrics().malformed_packets_total.get(), 1.0);
}

#[test]
fn test_clamped_valid_lifetime() {
    let mut config = config();
    config.prefix.max_valid_lifetime_secs = 3600;
    let mut h = Harness::with_config(config);
    h.event(BorderRouterEvent::SetUpstream {
        interface: Some("eth0".into()),
    });
    h.event(BorderRouterEvent::InfraLinkUp {
        interface: "eth0".into(),
    });
    h.router_advertisement("eth0", ON_LINK, Lifetimes::INFINITE_SECS, Lifetimes::INFINITE_SECS);

    let snapshot = h.br.snapshot();
    let view = learned_on_link(&snapshot)[0];
    assert_eq!(view.valid_lifetime, 3600);
    assert_eq!(view.valid_remaining_secs, Some(3600));
}

// ============================================================================
// OMR AND MESH-LOCAL PREFIXES
// ============================================================================

#[test]
fn test_omr_prefix_deprecates_mesh_local_once() {
    let mut h = Harness::new();
    h.event(BorderRouterEvent::MeshLinkUp);
    assert_eq!(h.br.platform().mesh_local_preferred(), Some(true));

    for _ in 0..3 {
        h.event(omr_event(OMR, PrefixOrigin::Learned));
    }
    assert_eq!(h.br.platform().mesh_local_preferred(), Some(false));
    // One call at start (preferred), one deprecation.
    assert_eq!(mesh_local_preference_calls(&h), 2);

    let snapshot = h.br.snapshot();
    let mesh_local = snapshot.prefixes_of(PrefixKind::MeshLocal).next().unwrap();
    assert!(!mesh_local.preferred);
}

#[test]
fn test_mesh_local_preferred_again_when_last_omr_expires() {
    let mut h = Harness::new();
    h.event(BorderRouterEvent::MeshLinkUp);
    h.event(BorderRouterEvent::OmrPrefixEstablished {
        prefix: OMR.parse().unwrap(),
        lifetimes: Lifetimes::new(1000, 1000),
        origin: PrefixOrigin::Learned,
    });
    assert_eq!(h.br.platform().mesh_local_preferred(), Some(false));

    h.advance(1000);
    assert_eq!(h.br.snapshot().prefixes_of(PrefixKind::Omr).count(), 0);
    assert_eq!(h.br.platform().mesh_local_preferred(), Some(true));
}

#[test]
fn test_learned_omr_preferred_over_self_generated() {
    let mut config = config();
    config.prefix.auto_omr = true;
    config.prefix.omr_prefix = Some("fd00:ab::/64".parse().unwrap());
    let mut h = Harness::with_config(config);

    h.event(BorderRouterEvent::MeshLinkUp);
    let generated = "fd00:ab::/64".parse().unwrap();
    assert!(h
        .br
        .platform()
        .mesh_advertisements()
        .contains(&(generated, PrefixKind::Omr)));

    h.event(omr_event(OMR, PrefixOrigin::Learned));
    let advertised = h.br.platform().mesh_advertisements();
    assert!(advertised.contains(&(OMR.parse().unwrap(), PrefixKind::Omr)));
    assert!(!advertised.contains(&(generated, PrefixKind::Omr)));

    let snapshot = h.br.snapshot();
    let preferred: Vec<_> = snapshot
        .prefixes_of(PrefixKind::Omr)
        .filter(|view| view.preferred)
        .map(|view| view.origin)
        .collect();
    assert_eq!(preferred, vec![PrefixOrigin::Learned]);
}

#[test]
fn test_self_generated_omr_is_random_ula() {
    let mut config = config();
    config.prefix.auto_omr = true;
    let mut h = Harness::with_config(config);
    h.event(BorderRouterEvent::MeshLinkUp);

    let snapshot = h.br.snapshot();
    let omr: Vec<_> = snapshot.prefixes_of(PrefixKind::Omr).collect();
    assert_eq!(omr.len(), 1);
    assert_eq!(omr[0].origin, PrefixOrigin::SelfGenerated);
    assert!(omr[0].prefix.is_unique_local());
    assert_eq!(omr[0].prefix.prefix_len(), 64);
}

#[test]
fn test_omr_prefix_advertised_to_infra() {
    let mut h = Harness::new();
    h.event(BorderRouterEvent::MeshLinkUp);
    h.event(BorderRouterEvent::SetUpstream {
        interface: Some("eth0".into()),
    });
    h.event(BorderRouterEvent::InfraLinkUp {
        interface: "eth0".into(),
    });
    let ras = |h: &Harness| {
        h.br
            .platform()
            .count(|call| matches!(call, PlatformCall::RouterAdvertisement { .. }))
    };
    // The self-generated on-link prefix goes out as soon as the link is up.
    assert_eq!(ras(&h), 1);

    h.event(omr_event(OMR, PrefixOrigin::Learned));
    assert_eq!(ras(&h), 2);
    let (_, routes) = h.advertisements().pop().unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].prefix, OMR.parse().unwrap());

    h.advance(200);
    assert_eq!(ras(&h), 3);
}

// ============================================================================
// SWITCH SAFETY
// ============================================================================

#[test]
fn test_upstream_switch_leaves_no_trace_of_old_interface() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 1800, 1800);
    h.register("ff05::1234", 1);
    assert!(h.is_joined("eth0", "ff05::1234"));

    h.event(BorderRouterEvent::SetUpstream {
        interface: Some("wlan0".into()),
    });

    let eth0 = InterfaceId::from("eth0");
    let snapshot = h.br.snapshot();
    assert!(snapshot
        .prefixes
        .iter()
        .all(|view| view.anchor != PrefixAnchor::Infra(eth0.clone())));
    assert_eq!(snapshot.infra.status, InfraLinkStatus::Down);
    assert!(h.br.platform().joined_groups(&eth0).is_empty());
    assert_eq!(h.br.metrics().link_switches_total.get(), 2.0);

    // Late traffic from the old interface is stale.
    h.router_advertisement("eth0", ON_LINK, 1800, 1800);
    assert_eq!(h.br.snapshot().prefixes_of(PrefixKind::OnLink).count(), 0);

    // Rebuilt from fresh signals on the new interface.
    h.event(BorderRouterEvent::InfraLinkUp {
        interface: "wlan0".into(),
    });
    h.router_advertisement("wlan0", "2001:db8:2::/64", 1800, 1800);
    let snapshot = h.br.snapshot();
    let on_link = learned_on_link(&snapshot);
    assert_eq!(on_link.len(), 1);
    assert_eq!(on_link[0].anchor, PrefixAnchor::Infra(InterfaceId::from("wlan0")));
    assert!(h.is_joined("wlan0", "ff05::1234"));
    assert_eq!(snapshot.infra.epoch, Some(2));

    // The OMR prefix is mesh-anchored and survives.
    assert_eq!(snapshot.prefixes_of(PrefixKind::Omr).count(), 1);
}

#[test]
fn test_link_flap_rebuilds_state() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 1800, 1800);
    h.register("ff05::1", 1);

    h.event(BorderRouterEvent::InfraLinkDown {
        interface: Some("eth0".into()),
    });
    assert_eq!(h.br.snapshot().prefixes_of(PrefixKind::OnLink).count(), 0);
    assert!(!h.is_joined("eth0", "ff05::1"));

    h.event(BorderRouterEvent::InfraLinkUp {
        interface: "eth0".into(),
    });
    assert!(h.is_joined("eth0", "ff05::1"));
    let solicitations = h
        .br
        .platform()
        .count(|call| matches!(call, PlatformCall::RouterSolicitation { .. }));
    assert_eq!(solicitations, 2);

    h.router_advertisement("eth0", ON_LINK, 1800, 1800);
    assert_eq!(learned_on_link(&h.br.snapshot()).len(), 1);
}

#[test]
fn test_expiry_of_torn_down_prefix_never_fires() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 600, 600);
    h.event(BorderRouterEvent::SetUpstream {
        interface: Some("wlan0".into()),
    });
    let withdrawals_before = h
        .br
        .platform()
        .count(|call| matches!(call, PlatformCall::WithdrawMeshAdvertisement { .. }));

    h.advance(600);
    let withdrawals_after = h
        .br
        .platform()
        .count(|call| matches!(call, PlatformCall::WithdrawMeshAdvertisement { .. }));
    assert_eq!(withdrawals_before, withdrawals_after);
}

// ============================================================================
// UNICAST FORWARDING
// ============================================================================

#[test]
fn test_unicast_between_omr_and_on_link() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 1800, 1800);
    let dp = h.br.data_path();

    assert_eq!(
        dp.decide(&data_packet(INFRA_HOST, OMR_NODE), Ingress::Infra),
        ForwardingDecision::ToMesh
    );
    assert_eq!(
        dp.decide(&data_packet(OMR_NODE, INFRA_HOST), Ingress::Mesh),
        ForwardingDecision::ToInfra
    );
    assert_eq!(
        dp.decide(&data_packet(MESH_LOCAL_NODE, INFRA_HOST), Ingress::Mesh),
        ForwardingDecision::Drop(DropReason::NonRoutableSource)
    );
    assert_eq!(
        dp.decide(&data_packet(INFRA_HOST, "2001:db8:77::1"), Ingress::Infra),
        ForwardingDecision::Drop(DropReason::NoRoute)
    );
    assert_eq!(h.br.metrics().unicast_forwarded_total.get(), 2.0);
    assert_eq!(h.br.metrics().unicast_drops_total.get(), 2.0);
}

#[test]
fn test_unicast_follows_prefix_removal() {
    let mut h = Harness::up();
    h.router_advertisement("eth0", ON_LINK, 1800, 1800);
    let dp = h.br.data_path();
    assert_eq!(
        dp.decide(&data_packet(OMR_NODE, INFRA_HOST), Ingress::Mesh),
        ForwardingDecision::ToInfra
    );

    h.event(BorderRouterEvent::InfraLinkDown { interface: None });
    assert_eq!(
        dp.decide(&data_packet(OMR_NODE, INFRA_HOST), Ingress::Mesh),
        ForwardingDecision::Drop(DropReason::NoRoute)
    );
}
