//! Infra-link control packet codec
//!
//! Decodes the IPv6 control traffic the border router listens to on the
//! infra link (Router Advertisements and MLD) and encodes the Router
//! Advertisements it emits. Header and message access goes through
//! `smoltcp::wire`; only the Route Information Option, which smoltcp does
//! not model, is read and written by hand.
//!
//! Decoding is strict about lengths and lenient about content: unknown
//! ICMPv6 types and unknown options are skipped.

use crate::error::PacketError;
use crate::types::Lifetimes;
use smoltcp::time::Duration;
use smoltcp::wire::{
    Icmpv6Packet, IpProtocol, Ipv6Address, Ipv6ExtHeader, Ipv6Packet, Ipv6Repr, MldAddressRecord,
    MldRepr, NdiscOption, NdiscOptionRepr, NdiscPrefixInfoFlags, NdiscPrefixInformation,
    NdiscRepr, NdiscRouterFlags,
};
use std::net::Ipv6Addr;
use tbr_types::Ipv6Prefix;

pub const IPV6_HEADER_LEN: usize = 40;

pub const NEXT_HEADER_HOP_BY_HOP: u8 = 0;
pub const NEXT_HEADER_ICMPV6: u8 = 58;

pub const ICMPV6_MLD_QUERY: u8 = 130;
pub const ICMPV6_MLD_REPORT: u8 = 131;
pub const ICMPV6_MLD_DONE: u8 = 132;
pub const ICMPV6_ROUTER_SOLICITATION: u8 = 133;
pub const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;
pub const ICMPV6_MLDV2_REPORT: u8 = 143;

pub const ND_OPT_PREFIX_INFORMATION: u8 = 3;
pub const ND_OPT_ROUTE_INFORMATION: u8 = 24;

const RA_HEADER_LEN: usize = 16;
const PIO_LEN: usize = 32;
const MLD_LEN: usize = 24;
const MLDV2_RECORD_HEADER_LEN: usize = 20;

// MLDv2 multicast record types (RFC 3810 section 5.2.12)
const MLDV2_MODE_IS_INCLUDE: u8 = 1;
const MLDV2_MODE_IS_EXCLUDE: u8 = 2;
const MLDV2_CHANGE_TO_INCLUDE: u8 = 3;
const MLDV2_CHANGE_TO_EXCLUDE: u8 = 4;
const MLDV2_ALLOW_NEW_SOURCES: u8 = 5;

/// The fixed IPv6 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
}

impl Ipv6Header {
    /// Parses the fixed header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        ensure_len(bytes, IPV6_HEADER_LEN)?;
        let packet = Ipv6Packet::new_unchecked(bytes);

        let version = packet.version();
        if version != 6 {
            return Err(PacketError::NotIpv6(version));
        }

        Ok(Self {
            payload_len: packet.payload_len(),
            next_header: u8::from(packet.next_header()),
            hop_limit: packet.hop_limit(),
            source: to_std(packet.src_addr()),
            destination: to_std(packet.dst_addr()),
        })
    }

    /// Encodes this header followed by `payload`. The payload length field
    /// is taken from `payload`, not from `self`.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let repr = Ipv6Repr {
            src_addr: Ipv6Address(self.source.octets()),
            dst_addr: Ipv6Address(self.destination.octets()),
            next_header: IpProtocol::from(self.next_header),
            payload_len: payload.len(),
            hop_limit: self.hop_limit,
        };
        let mut out = vec![0u8; repr.buffer_len() + payload.len()];
        repr.emit(&mut Ipv6Packet::new_unchecked(&mut out[..]));
        out[IPV6_HEADER_LEN..].copy_from_slice(payload);
        out
    }
}

/// A Prefix Information Option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInformation {
    pub prefix: Ipv6Prefix,
    pub on_link: bool,
    pub autonomous: bool,
    pub lifetimes: Lifetimes,
}

/// A Route Information Option (RFC 4191).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInformation {
    pub prefix: Ipv6Prefix,
    pub lifetime: u32,
}

/// A decoded infra-link control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraPacket {
    RouterAdvertisement {
        source: Ipv6Addr,
        router_lifetime: u16,
        prefixes: Vec<PrefixInformation>,
        routes: Vec<RouteInformation>,
    },
    RouterSolicitation,
    /// General query when `group` is `None`.
    MldQuery {
        group: Option<Ipv6Addr>,
    },
    /// MLDv1 report or MLDv2 report, split into joined and left groups.
    MldReport {
        joined: Vec<Ipv6Addr>,
        left: Vec<Ipv6Addr>,
    },
    MldDone {
        group: Ipv6Addr,
    },
    Other {
        icmp_type: u8,
    },
}

/// Decodes a full IPv6 packet received on the infra link.
pub fn parse_infra_packet(bytes: &[u8]) -> Result<InfraPacket, PacketError> {
    let header = Ipv6Header::parse(bytes)?;
    let packet = Ipv6Packet::new_checked(bytes).map_err(|_| PacketError::Truncated {
        needed: IPV6_HEADER_LEN + usize::from(header.payload_len),
        actual: bytes.len(),
    })?;

    let mut next_header = packet.next_header();
    let mut payload = packet.payload();
    loop {
        match next_header {
            IpProtocol::Icmpv6 => break,
            IpProtocol::HopByHop | IpProtocol::Ipv6Opts => {
                ensure_len(payload, 2)?;
                let ext = Ipv6ExtHeader::new_unchecked(payload);
                let ext_len = (usize::from(ext.header_len()) + 1) * 8;
                ensure_len(payload, ext_len)?;
                next_header = ext.next_header();
                payload = &payload[ext_len..];
            }
            IpProtocol::Ipv6Frag => {
                return Err(PacketError::UnsupportedNextHeader(u8::from(next_header)))
            }
            _ => return Err(PacketError::NotIcmpv6),
        }
    }

    parse_icmpv6(header.source, payload)
}

fn parse_icmpv6(source: Ipv6Addr, icmp: &[u8]) -> Result<InfraPacket, PacketError> {
    ensure_len(icmp, 4)?;
    let packet = Icmpv6Packet::new_unchecked(icmp);

    match u8::from(packet.msg_type()) {
        ICMPV6_ROUTER_ADVERTISEMENT => parse_router_advertisement(source, icmp),
        ICMPV6_ROUTER_SOLICITATION => parse_router_solicitation(icmp),
        // MLDv1 messages share one layout; checked by hand because smoltcp
        // sizes a query as MLDv2.
        ICMPV6_MLD_QUERY => {
            ensure_len(icmp, MLD_LEN)?;
            let group = to_std(packet.mcast_addr());
            Ok(InfraPacket::MldQuery {
                group: (!group.is_unspecified()).then_some(group),
            })
        }
        ICMPV6_MLD_REPORT => {
            ensure_len(icmp, MLD_LEN)?;
            Ok(InfraPacket::MldReport {
                joined: vec![to_std(packet.mcast_addr())],
                left: Vec::new(),
            })
        }
        ICMPV6_MLD_DONE => {
            ensure_len(icmp, MLD_LEN)?;
            Ok(InfraPacket::MldDone {
                group: to_std(packet.mcast_addr()),
            })
        }
        ICMPV6_MLDV2_REPORT => parse_mldv2_report(icmp),
        icmp_type => Ok(InfraPacket::Other { icmp_type }),
    }
}

fn parse_router_solicitation(icmp: &[u8]) -> Result<InfraPacket, PacketError> {
    let packet = Icmpv6Packet::new_checked(icmp).map_err(|_| truncated(icmp, 8))?;
    match NdiscRepr::parse(&packet) {
        Ok(NdiscRepr::RouterSolicit { .. }) => Ok(InfraPacket::RouterSolicitation),
        _ => Err(PacketError::Malformed("router solicitation")),
    }
}

fn parse_router_advertisement(source: Ipv6Addr, icmp: &[u8]) -> Result<InfraPacket, PacketError> {
    let packet = Icmpv6Packet::new_checked(icmp).map_err(|_| truncated(icmp, RA_HEADER_LEN))?;
    let router_lifetime = u16::try_from(packet.router_lifetime().secs()).unwrap_or(u16::MAX);

    let mut prefixes = Vec::new();
    let mut routes = Vec::new();
    let mut options = packet.payload();

    while !options.is_empty() {
        ensure_len(options, 2)?;
        let option = NdiscOption::new_unchecked(options);
        let option_type = u8::from(option.option_type());
        let length = option.data_len();
        // smoltcp accepts a zero length, which would never advance.
        if length == 0 {
            return Err(PacketError::BadOptionLength {
                option_type,
                length,
            });
        }
        let option_len = usize::from(length) * 8;
        ensure_len(options, option_len)?;
        let (body, rest) = options.split_at(option_len);

        match option_type {
            ND_OPT_PREFIX_INFORMATION => prefixes.push(parse_prefix_information(body)?),
            ND_OPT_ROUTE_INFORMATION => routes.push(parse_route_information(body)?),
            _ => {}
        }
        options = rest;
    }

    Ok(InfraPacket::RouterAdvertisement {
        source,
        router_lifetime,
        prefixes,
        routes,
    })
}

fn parse_prefix_information(body: &[u8]) -> Result<PrefixInformation, PacketError> {
    let bad_length = PacketError::BadOptionLength {
        option_type: ND_OPT_PREFIX_INFORMATION,
        length: body[1],
    };
    let option = NdiscOption::new_checked(body).map_err(|_| bad_length.clone())?;
    let info = match NdiscOptionRepr::parse(&option) {
        Ok(NdiscOptionRepr::PrefixInformation(info)) => info,
        _ => return Err(bad_length),
    };

    let prefix = Ipv6Prefix::new(to_std(info.prefix), info.prefix_len)
        .map_err(|_| PacketError::InvalidPrefixLength(info.prefix_len))?;
    Ok(PrefixInformation {
        prefix,
        on_link: info.flags.contains(NdiscPrefixInfoFlags::ON_LINK),
        autonomous: info.flags.contains(NdiscPrefixInfoFlags::ADDRCONF),
        lifetimes: Lifetimes::new(
            lifetime_secs(info.valid_lifetime),
            lifetime_secs(info.preferred_lifetime),
        ),
    })
}

fn parse_route_information(body: &[u8]) -> Result<RouteInformation, PacketError> {
    let length = body[1];
    if length > 3 {
        return Err(PacketError::BadOptionLength {
            option_type: ND_OPT_ROUTE_INFORMATION,
            length,
        });
    }
    let prefix_len = body[2];
    // The prefix field is truncated to the option length.
    let mut octets = [0u8; 16];
    let carried = body.len() - 8;
    octets[..carried].copy_from_slice(&body[8..]);
    if usize::from(prefix_len) > carried * 8 {
        return Err(PacketError::InvalidPrefixLength(prefix_len));
    }
    let prefix = Ipv6Prefix::new(Ipv6Addr::from(octets), prefix_len)
        .map_err(|_| PacketError::InvalidPrefixLength(prefix_len))?;

    Ok(RouteInformation {
        prefix,
        lifetime: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
    })
}

fn parse_mldv2_report(icmp: &[u8]) -> Result<InfraPacket, PacketError> {
    let packet = Icmpv6Packet::new_checked(icmp).map_err(|_| truncated(icmp, 8))?;
    let (record_count, mut records) = match MldRepr::parse(&packet) {
        Ok(MldRepr::Report {
            nr_mcast_addr_rcrds,
            data,
        }) => (nr_mcast_addr_rcrds, data),
        _ => return Err(PacketError::Malformed("MLDv2 report")),
    };

    let mut joined = Vec::new();
    let mut left = Vec::new();

    for _ in 0..record_count {
        let record = MldAddressRecord::new_checked(records)
            .map_err(|_| truncated(records, MLDV2_RECORD_HEADER_LEN))?;
        let sources = usize::from(record.num_srcs());
        let record_len =
            MLDV2_RECORD_HEADER_LEN + sources * 16 + usize::from(record.aux_data_len()) * 4;
        ensure_len(records, record_len)?;
        let group = to_std(record.mcast_addr());

        match u8::from(record.record_type()) {
            MLDV2_MODE_IS_EXCLUDE | MLDV2_CHANGE_TO_EXCLUDE => joined.push(group),
            MLDV2_MODE_IS_INCLUDE | MLDV2_CHANGE_TO_INCLUDE | MLDV2_ALLOW_NEW_SOURCES
                if sources > 0 =>
            {
                joined.push(group)
            }
            MLDV2_MODE_IS_INCLUDE | MLDV2_CHANGE_TO_INCLUDE => left.push(group),
            _ => {}
        }
        records = &records[record_len..];
    }

    Ok(InfraPacket::MldReport { joined, left })
}

/// Builds the ICMPv6 body of a Router Advertisement.
///
/// The checksum is left zero; the platform's raw socket computes it.
#[derive(Debug, Clone, Default)]
pub struct RouterAdvertisementBuilder {
    router_lifetime: u16,
    prefixes: Vec<PrefixInformation>,
    routes: Vec<RouteInformation>,
}

impl RouterAdvertisementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router_lifetime(mut self, secs: u16) -> Self {
        self.router_lifetime = secs;
        self
    }

    pub fn prefix_information(mut self, info: PrefixInformation) -> Self {
        self.prefixes.push(info);
        self
    }

    pub fn route_information(mut self, prefix: Ipv6Prefix, lifetime: u32) -> Self {
        self.routes.push(RouteInformation { prefix, lifetime });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let len = RA_HEADER_LEN
            + PIO_LEN * self.prefixes.len()
            + self
                .routes
                .iter()
                .map(|rio| route_information_len(rio.prefix))
                .sum::<usize>();
        let mut out = vec![0u8; len];

        let header = NdiscRepr::RouterAdvert {
            hop_limit: 0,
            flags: NdiscRouterFlags::empty(),
            router_lifetime: Duration::from_secs(u64::from(self.router_lifetime)),
            reachable_time: Duration::from_millis(0),
            retrans_time: Duration::from_millis(0),
            lladdr: None,
            mtu: None,
            prefix_info: None,
        };
        header.emit(&mut Icmpv6Packet::new_unchecked(&mut out[..RA_HEADER_LEN]));

        let mut offset = RA_HEADER_LEN;
        for pio in &self.prefixes {
            let mut flags = NdiscPrefixInfoFlags::empty();
            if pio.on_link {
                flags |= NdiscPrefixInfoFlags::ON_LINK;
            }
            if pio.autonomous {
                flags |= NdiscPrefixInfoFlags::ADDRCONF;
            }
            let option = NdiscOptionRepr::PrefixInformation(NdiscPrefixInformation {
                prefix_len: pio.prefix.prefix_len(),
                flags,
                valid_lifetime: Duration::from_secs(u64::from(pio.lifetimes.valid)),
                preferred_lifetime: Duration::from_secs(u64::from(pio.lifetimes.preferred)),
                prefix: Ipv6Address(pio.prefix.address().octets()),
            });
            option.emit(&mut NdiscOption::new_unchecked(&mut out[offset..offset + PIO_LEN]));
            offset += PIO_LEN;
        }

        for rio in &self.routes {
            let end = offset + route_information_len(rio.prefix);
            write_route_information(&mut out[offset..end], rio);
            offset = end;
        }

        out
    }
}

/// RIO size: the prefix field carries 0, 8 or 16 bytes.
fn route_information_len(prefix: Ipv6Prefix) -> usize {
    match prefix.prefix_len() {
        0 => 8,
        1..=64 => 16,
        _ => 24,
    }
}

fn write_route_information(out: &mut [u8], rio: &RouteInformation) {
    out[0] = ND_OPT_ROUTE_INFORMATION;
    out[1] = (out.len() / 8) as u8;
    out[2] = rio.prefix.prefix_len();
    // Preference bits left at 00 (medium).
    out[3] = 0;
    out[4..8].copy_from_slice(&rio.lifetime.to_be_bytes());
    let carried = out.len() - 8;
    out[8..].copy_from_slice(&rio.prefix.address().octets()[..carried]);
}

fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.secs()).unwrap_or(Lifetimes::INFINITE_SECS)
}

fn to_std(addr: Ipv6Address) -> Ipv6Addr {
    Ipv6Addr::from(addr.0)
}

fn truncated(bytes: &[u8], needed: usize) -> PacketError {
    PacketError::Truncated {
        needed,
        actual: bytes.len(),
    }
}

fn ensure_len(bytes: &[u8], needed: usize) -> Result<(), PacketError> {
    if bytes.len() < needed {
        return Err(truncated(bytes, needed));
    }
    Ok(())
}
