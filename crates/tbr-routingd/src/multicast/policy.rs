//! Scope and source-kind gate for mesh-originated multicast.
//!
//! Pure functions only: nothing here reads or writes the membership table,
//! and verdicts are never cached.

use crate::types::SourceAddressKind;
use serde::Serialize;
use tbr_types::MulticastScope;

/// Smallest scope allowed to leave the mesh.
pub const MIN_FORWARDED_SCOPE: MulticastScope = MulticastScope::ADMIN_LOCAL;

/// Result of evaluating the gate for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerdict {
    Forward,
    /// Destination scope is realm-local or smaller.
    ScopeTooSmall,
    /// Source is not an OMR address.
    SourceNotOmr,
}

/// Evaluates a mesh-to-infra multicast packet.
///
/// Forwarded iff the destination scope is admin-local or larger and the
/// source is an OMR address. The scope check comes first, so a realm-local
/// packet from a link-local source reports `ScopeTooSmall`.
pub fn evaluate_outbound(source: SourceAddressKind, destination: MulticastScope) -> PolicyVerdict {
    if destination < MIN_FORWARDED_SCOPE {
        return PolicyVerdict::ScopeTooSmall;
    }
    match source {
        SourceAddressKind::Omr => PolicyVerdict::Forward,
        SourceAddressKind::MeshLocal | SourceAddressKind::LinkLocal | SourceAddressKind::Other => {
            PolicyVerdict::SourceNotOmr
        }
    }
}

/// Convenience form of [`evaluate_outbound`].
pub fn outbound_allowed(source: SourceAddressKind, destination: MulticastScope) -> bool {
    evaluate_outbound(source, destination) == PolicyVerdict::Forward
}
