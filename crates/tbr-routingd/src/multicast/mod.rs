//! Multicast forwarding: membership table, engine, and the outbound policy
//! gate.

pub mod engine;
pub mod membership;
pub mod policy;

pub use engine::MulticastEngine;
pub use membership::{GroupMembership, ListenerChange, MembershipSource, MembershipTable};
pub use policy::{evaluate_outbound, outbound_allowed, PolicyVerdict};
