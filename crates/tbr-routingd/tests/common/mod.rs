//! Shared fixtures for the border router integration tests.

#![allow(dead_code)]

use std::net::Ipv6Addr;
use std::time::Instant;
use tbr_routingd::packet::{
    parse_infra_packet, InfraPacket, Ipv6Header, PrefixInformation, RouteInformation,
    RouterAdvertisementBuilder, NEXT_HEADER_ICMPV6,
};
use tbr_routingd::{
    BorderRouter, BorderRouterEvent, BorderRoutingConfig, Lifetimes, MetricsCollector, NodeId,
    PlatformCall, PrefixOrigin, RecordingPlatform, RegistrationOp,
};

pub const MESH_LOCAL: &str = "fd11:22::/64";
pub const OMR: &str = "2001:db8:a::/64";
pub const OMR_NODE: &str = "2001:db8:a::1234";
pub const MESH_LOCAL_NODE: &str = "fd11:22::ff:fe00:4c01";
pub const ON_LINK: &str = "2001:db8:1::/64";
pub const INFRA_HOST: &str = "2001:db8:1::10";

pub fn config() -> BorderRoutingConfig {
    let mut config = BorderRoutingConfig::default();
    config.prefix.auto_omr = false;
    config.prefix.mesh_local_prefix = Some(MESH_LOCAL.parse().unwrap());
    config
}

/// A router with `eth0` up, the mesh up and an OMR prefix established.
pub struct Harness {
    pub br: BorderRouter<RecordingPlatform>,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: BorderRoutingConfig) -> Self {
        let mut br = BorderRouter::new(
            config,
            RecordingPlatform::new(),
            MetricsCollector::new().unwrap(),
        );
        let now = Instant::now();
        br.start(now);
        Self { br, now }
    }

    /// Brings everything up the way a freshly attached border router sees it.
    pub fn up() -> Self {
        let mut h = Self::new();
        h.event(BorderRouterEvent::MeshLinkUp);
        h.event(BorderRouterEvent::SetUpstream {
            interface: Some("eth0".into()),
        });
        h.event(BorderRouterEvent::InfraLinkUp {
            interface: "eth0".into(),
        });
        h.event(BorderRouterEvent::OmrPrefixEstablished {
            prefix: OMR.parse().unwrap(),
            lifetimes: Lifetimes::INFINITE,
            origin: PrefixOrigin::Learned,
        });
        h
    }

    pub fn event(&mut self, event: BorderRouterEvent) {
        self.br.handle_event(event, self.now);
    }

    pub fn advance(&mut self, secs: u64) {
        self.now += std::time::Duration::from_secs(secs);
        while let Some(deadline) = self.br.next_deadline() {
            if deadline > self.now {
                break;
            }
            self.br.on_timer(deadline);
        }
    }

    pub fn register(&mut self, group: &str, node: u16) {
        self.listener(group, node, RegistrationOp::Register, None);
    }

    pub fn deregister(&mut self, group: &str, node: u16) {
        self.listener(group, node, RegistrationOp::Deregister, None);
    }

    pub fn listener(
        &mut self,
        group: &str,
        node: u16,
        op: RegistrationOp,
        timeout_secs: Option<u32>,
    ) {
        self.event(BorderRouterEvent::ThreadListener {
            group: group.parse().unwrap(),
            node: NodeId(node),
            op,
            timeout_secs,
        });
    }

    pub fn router_advertisement(
        &mut self,
        interface: &str,
        prefix: &str,
        valid: u32,
        preferred: u32,
    ) {
        self.event(BorderRouterEvent::InfraPacket {
            interface: interface.into(),
            bytes: ra_packet(prefix, valid, preferred),
        });
    }

    /// Prefix and route options of every RA sent so far, oldest first.
    pub fn advertisements(&self) -> Vec<(Vec<PrefixInformation>, Vec<RouteInformation>)> {
        self.br
            .platform()
            .calls()
            .iter()
            .filter_map(|call| match call {
                PlatformCall::RouterAdvertisement { message, .. } => Some(message),
                _ => None,
            })
            .map(|message| match parse_infra_packet(&control_packet(message)).unwrap() {
                InfraPacket::RouterAdvertisement {
                    prefixes, routes, ..
                } => (prefixes, routes),
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    pub fn is_joined(&self, interface: &str, group: &str) -> bool {
        self.br
            .platform()
            .is_joined(&interface.into(), &group.parse().unwrap())
    }
}

pub fn addr(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

fn control_packet(body: &[u8]) -> Vec<u8> {
    Ipv6Header {
        payload_len: 0,
        next_header: NEXT_HEADER_ICMPV6,
        hop_limit: 255,
        source: addr("fe80::1"),
        destination: addr("ff02::1"),
    }
    .encode(body)
}

pub fn ra_packet(prefix: &str, valid: u32, preferred: u32) -> Vec<u8> {
    let body = RouterAdvertisementBuilder::new()
        .router_lifetime(1800)
        .prefix_information(PrefixInformation {
            prefix: prefix.parse().unwrap(),
            on_link: true,
            autonomous: true,
            lifetimes: Lifetimes::new(valid, preferred),
        })
        .build();
    control_packet(&body)
}

/// An MLDv1 general query.
pub fn mld_query() -> Vec<u8> {
    let mut body = vec![130, 0, 0, 0, 0x27, 0x10, 0, 0];
    body.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
    control_packet(&body)
}

/// A data packet with an empty UDP-ish payload.
pub fn data_packet(source: &str, destination: &str) -> Vec<u8> {
    Ipv6Header {
        payload_len: 0,
        next_header: 17,
        hop_limit: 64,
        source: addr(source),
        destination: addr(destination),
    }
    .encode(&[0; 8])
}
