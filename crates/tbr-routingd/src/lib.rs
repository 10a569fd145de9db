//! Thread Border Router border routing and multicast forwarding core
//!
//! Bridges a Thread mesh and an IPv6 infrastructure link:
//!
//! - [`prefix_manager`]: on-link, OMR and mesh-local prefix lifecycle
//! - [`infra_link`]: infra link up/down/switch state machine and teardown
//! - [`multicast`]: Thread listener bookkeeping, infra joins, and the
//!   scope/source gate for mesh-originated multicast
//! - [`unicast`] and [`data_path`]: per-packet forwarding decisions
//!
//! # Architecture
//!
//! ```text
//!  infra packets ─┐                         ┌─▶ InfraLinkOps (joins, RS/RA)
//!  listener regs ─┼─▶ BorderRouter ─────────┤
//!  link commands ─┘   (one event at a time) └─▶ MeshOps (prefix adverts)
//!                          │
//!                          ▼ publish
//!                    TableSnapshot ◀── DataPath::decide (any thread)
//! ```

pub mod border_router;
pub mod config;
pub mod daemon;
pub mod data_path;
pub mod error;
pub mod infra_link;
pub mod metrics;
pub mod multicast;
pub mod packet;
pub mod platform;
pub mod prefix_manager;
pub mod snapshot;
pub mod types;
pub mod unicast;

pub use border_router::{BorderRouter, BorderRouterEvent};
pub use config::BorderRoutingConfig;
pub use daemon::{Daemon, DaemonHandle};
pub use data_path::{DataPath, DropReason, ForwardingDecision, Ingress};
pub use error::{BorderRoutingError, LinkOpError, PacketError, Result};
pub use infra_link::{InfraLinkCoordinator, InfraLinkStatus};
pub use metrics::MetricsCollector;
pub use multicast::{MulticastEngine, PolicyVerdict};
pub use platform::{InfraLinkOps, LoggingPlatform, MeshOps, PlatformCall, RecordingPlatform};
pub use prefix_manager::{PrefixManager, PrefixUpdate};
pub use snapshot::{SnapshotHandle, TableSnapshot};
pub use types::{
    InterfaceId, Lifetimes, LinkState, NodeId, PrefixKey, PrefixKind, PrefixOrigin, RegistrationOp,
    SourceAddressKind,
};
