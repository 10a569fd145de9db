//! Collaborator interfaces
//!
//! The core never touches sockets or the Thread stack directly. Everything
//! it needs from the outside world goes through these two traits, which the
//! daemon implements on top of the platform and tests implement with
//! [`RecordingPlatform`].

use crate::error::LinkOpError;
use crate::types::{InterfaceId, PrefixKind};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv6Addr;
use tbr_types::Ipv6Prefix;
use tracing::info;

/// Operations on the infrastructure link.
pub trait InfraLinkOps {
    /// Joins `group` on `interface` (sends an MLD report).
    fn join_group(&mut self, interface: &InterfaceId, group: Ipv6Addr) -> Result<(), LinkOpError>;

    /// Leaves `group` on `interface` (sends an MLD done).
    fn leave_group(&mut self, interface: &InterfaceId, group: Ipv6Addr)
        -> Result<(), LinkOpError>;

    /// Sends a Router Solicitation on `interface`.
    fn send_router_solicitation(&mut self, interface: &InterfaceId) -> Result<(), LinkOpError>;

    /// Sends an ICMPv6 Router Advertisement body on `interface`.
    ///
    /// The platform fills in the IPv6 header and checksum.
    fn send_router_advertisement(
        &mut self,
        interface: &InterfaceId,
        message: &[u8],
    ) -> Result<(), LinkOpError>;
}

/// Operations on the Thread mesh.
pub trait MeshOps {
    /// Advertises `prefix` into the mesh (OMR prefix or external route).
    fn emit_mesh_advertisement(
        &mut self,
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    ) -> Result<(), LinkOpError>;

    /// Withdraws a previous advertisement.
    fn withdraw_mesh_advertisement(
        &mut self,
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    ) -> Result<(), LinkOpError>;

    /// Marks the mesh-local address preferred or deprecated.
    fn set_mesh_local_preferred(
        &mut self,
        prefix: Ipv6Prefix,
        preferred: bool,
    ) -> Result<(), LinkOpError>;
}

/// Platform that only logs what it is asked to do.
///
/// Used by the daemon when driven from the JSON control channel.
#[derive(Debug, Default)]
pub struct LoggingPlatform;

impl InfraLinkOps for LoggingPlatform {
    fn join_group(&mut self, interface: &InterfaceId, group: Ipv6Addr) -> Result<(), LinkOpError> {
        info!(interface = %interface, group = %group, "platform: join group");
        Ok(())
    }

    fn leave_group(
        &mut self,
        interface: &InterfaceId,
        group: Ipv6Addr,
    ) -> Result<(), LinkOpError> {
        info!(interface = %interface, group = %group, "platform: leave group");
        Ok(())
    }

    fn send_router_solicitation(&mut self, interface: &InterfaceId) -> Result<(), LinkOpError> {
        info!(interface = %interface, "platform: send RS");
        Ok(())
    }

    fn send_router_advertisement(
        &mut self,
        interface: &InterfaceId,
        message: &[u8],
    ) -> Result<(), LinkOpError> {
        info!(interface = %interface, len = message.len(), "platform: send RA");
        Ok(())
    }
}

impl MeshOps for LoggingPlatform {
    fn emit_mesh_advertisement(
        &mut self,
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    ) -> Result<(), LinkOpError> {
        info!(prefix = %prefix, kind = ?kind, "platform: advertise into mesh");
        Ok(())
    }

    fn withdraw_mesh_advertisement(
        &mut self,
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    ) -> Result<(), LinkOpError> {
        info!(prefix = %prefix, kind = ?kind, "platform: withdraw from mesh");
        Ok(())
    }

    fn set_mesh_local_preferred(
        &mut self,
        prefix: Ipv6Prefix,
        preferred: bool,
    ) -> Result<(), LinkOpError> {
        info!(prefix = %prefix, preferred, "platform: mesh-local preference");
        Ok(())
    }
}

/// A single call made on a [`RecordingPlatform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    JoinGroup {
        interface: InterfaceId,
        group: Ipv6Addr,
    },
    LeaveGroup {
        interface: InterfaceId,
        group: Ipv6Addr,
    },
    RouterSolicitation {
        interface: InterfaceId,
    },
    RouterAdvertisement {
        interface: InterfaceId,
        message: Vec<u8>,
    },
    EmitMeshAdvertisement {
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    },
    WithdrawMeshAdvertisement {
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    },
    SetMeshLocalPreferred {
        prefix: Ipv6Prefix,
        preferred: bool,
    },
}

/// In-memory platform that records every call and tracks the resulting
/// link-side state (joined groups, live mesh advertisements).
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    calls: Vec<PlatformCall>,
    joined: BTreeMap<InterfaceId, BTreeSet<Ipv6Addr>>,
    advertised: BTreeSet<(Ipv6Prefix, PrefixKind)>,
    mesh_local_preferred: Option<bool>,
    fail_joins: bool,
    failed_joins: usize,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent join fail until reset.
    pub fn set_join_failure(&mut self, fail: bool) {
        self.fail_joins = fail;
    }

    pub fn calls(&self) -> &[PlatformCall] {
        &self.calls
    }

    /// Returns and forgets the calls recorded so far.
    pub fn take_calls(&mut self) -> Vec<PlatformCall> {
        std::mem::take(&mut self.calls)
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&PlatformCall) -> bool) -> usize {
        self.calls.iter().filter(|call| pred(call)).count()
    }

    /// Groups currently joined on `interface`.
    pub fn joined_groups(&self, interface: &InterfaceId) -> BTreeSet<Ipv6Addr> {
        self.joined.get(interface).cloned().unwrap_or_default()
    }

    pub fn is_joined(&self, interface: &InterfaceId, group: &Ipv6Addr) -> bool {
        self.joined
            .get(interface)
            .is_some_and(|groups| groups.contains(group))
    }

    /// Advertisements currently live in the mesh.
    pub fn mesh_advertisements(&self) -> &BTreeSet<(Ipv6Prefix, PrefixKind)> {
        &self.advertised
    }

    /// Last preference pushed for the mesh-local prefix.
    pub fn mesh_local_preferred(&self) -> Option<bool> {
        self.mesh_local_preferred
    }

    pub fn failed_joins(&self) -> usize {
        self.failed_joins
    }
}

impl InfraLinkOps for RecordingPlatform {
    fn join_group(&mut self, interface: &InterfaceId, group: Ipv6Addr) -> Result<(), LinkOpError> {
        if self.fail_joins {
            self.failed_joins += 1;
            return Err(LinkOpError::JoinFailed {
                group,
                reason: "injected failure".to_string(),
            });
        }
        self.joined
            .entry(interface.clone())
            .or_default()
            .insert(group);
        self.calls.push(PlatformCall::JoinGroup {
            interface: interface.clone(),
            group,
        });
        Ok(())
    }

    fn leave_group(
        &mut self,
        interface: &InterfaceId,
        group: Ipv6Addr,
    ) -> Result<(), LinkOpError> {
        if let Some(groups) = self.joined.get_mut(interface) {
            groups.remove(&group);
        }
        self.calls.push(PlatformCall::LeaveGroup {
            interface: interface.clone(),
            group,
        });
        Ok(())
    }

    fn send_router_solicitation(&mut self, interface: &InterfaceId) -> Result<(), LinkOpError> {
        self.calls.push(PlatformCall::RouterSolicitation {
            interface: interface.clone(),
        });
        Ok(())
    }

    fn send_router_advertisement(
        &mut self,
        interface: &InterfaceId,
        message: &[u8],
    ) -> Result<(), LinkOpError> {
        self.calls.push(PlatformCall::RouterAdvertisement {
            interface: interface.clone(),
            message: message.to_vec(),
        });
        Ok(())
    }
}

impl MeshOps for RecordingPlatform {
    fn emit_mesh_advertisement(
        &mut self,
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    ) -> Result<(), LinkOpError> {
        self.advertised.insert((prefix, kind));
        self.calls
            .push(PlatformCall::EmitMeshAdvertisement { prefix, kind });
        Ok(())
    }

    fn withdraw_mesh_advertisement(
        &mut self,
        prefix: Ipv6Prefix,
        kind: PrefixKind,
    ) -> Result<(), LinkOpError> {
        self.advertised.remove(&(prefix, kind));
        self.calls
            .push(PlatformCall::WithdrawMeshAdvertisement { prefix, kind });
        Ok(())
    }

    fn set_mesh_local_preferred(
        &mut self,
        prefix: Ipv6Prefix,
        preferred: bool,
    ) -> Result<(), LinkOpError> {
        self.mesh_local_preferred = Some(preferred);
        self.calls
            .push(PlatformCall::SetMeshLocalPreferred { prefix, preferred });
        Ok(())
    }
}
