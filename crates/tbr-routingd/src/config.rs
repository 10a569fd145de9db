//! Configuration file support for tbr-routingd
//!
//! Loads and validates border routing configuration from TOML files.
//! Default location: /etc/tbr/routingd.toml

use crate::error::{BorderRoutingError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tbr_types::Ipv6Prefix;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tbr/routingd.toml";

/// Registrations shorter than this are raised to it.
pub const MIN_REGISTRATION_TIMEOUT_SECS: u64 = 300;

/// Prefix table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixConfig {
    /// Maximum number of prefix records (0 = unbounded)
    #[serde(default = "default_max_prefixes")]
    pub max_prefixes: usize,

    /// Cap applied to advertised valid lifetimes (0 = no cap)
    #[serde(default)]
    pub max_valid_lifetime_secs: u32,

    /// Fixed OMR prefix to use when self-generating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omr_prefix: Option<Ipv6Prefix>,

    /// Generate an OMR prefix when the mesh has none
    #[serde(default = "default_auto_omr")]
    pub auto_omr: bool,

    /// Fixed on-link prefix to advertise when the infra link has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_link_prefix: Option<Ipv6Prefix>,

    /// Advertise a self-generated on-link prefix while no infra router does
    #[serde(default = "default_auto_on_link")]
    pub auto_on_link: bool,

    /// Mesh-local prefix known at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_local_prefix: Option<Ipv6Prefix>,
}

/// Multicast forwarding configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticastConfig {
    /// Maximum number of multicast groups (0 = unbounded)
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    /// Default listener registration timeout in seconds
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,

    /// Delay before retrying a failed infra join, in seconds
    #[serde(default = "default_join_retry")]
    pub join_retry_secs: u64,
}

/// Infrastructure link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Upstream interface selected at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    /// Router Advertisement emission interval in seconds
    #[serde(default = "default_ra_interval")]
    pub ra_interval_secs: u64,

    /// Route lifetime carried in emitted Route Information Options
    #[serde(default = "default_route_lifetime")]
    pub route_lifetime_secs: u32,
}

/// Complete tbr-routingd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BorderRoutingConfig {
    #[serde(default)]
    pub prefix: PrefixConfig,

    #[serde(default)]
    pub multicast: MulticastConfig,

    #[serde(default)]
    pub infra: InfraConfig,
}

// Default functions
fn default_max_prefixes() -> usize {
    32
}

fn default_auto_omr() -> bool {
    true
}

fn default_auto_on_link() -> bool {
    true
}

fn default_max_groups() -> usize {
    256
}

fn default_registration_timeout() -> u64 {
    3600
}

fn default_join_retry() -> u64 {
    5
}

fn default_ra_interval() -> u64 {
    200
}

fn default_route_lifetime() -> u32 {
    1800
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            max_prefixes: default_max_prefixes(),
            max_valid_lifetime_secs: 0,
            omr_prefix: None,
            auto_omr: default_auto_omr(),
            on_link_prefix: None,
            auto_on_link: default_auto_on_link(),
            mesh_local_prefix: None,
        }
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            max_groups: default_max_groups(),
            registration_timeout_secs: default_registration_timeout(),
            join_retry_secs: default_join_retry(),
        }
    }
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            ra_interval_secs: default_ra_interval(),
            route_lifetime_secs: default_route_lifetime(),
        }
    }
}

impl BorderRoutingConfig {
    /// Load and validate configuration from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            BorderRoutingError::TomlParse(e) => BorderRoutingError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            )),
            other => other,
        })
    }

    /// Load from `path`, falling back to defaults if the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match Self::load(path) {
            Err(BorderRoutingError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Registration timeout with the 300 s floor applied.
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(
            self.multicast
                .registration_timeout_secs
                .max(MIN_REGISTRATION_TIMEOUT_SECS),
        )
    }

    pub fn join_retry_interval(&self) -> Duration {
        Duration::from_secs(self.multicast.join_retry_secs)
    }

    pub fn ra_interval(&self) -> Duration {
        Duration::from_secs(self.infra.ra_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(omr) = &self.prefix.omr_prefix {
            if omr.prefix_len() != 64 {
                return Err(BorderRoutingError::Config(format!(
                    "omr_prefix {} must be a /64",
                    omr
                )));
            }
            if omr.is_link_local() || omr.is_multicast() {
                return Err(BorderRoutingError::Config(format!(
                    "omr_prefix {} must be a routable unicast prefix",
                    omr
                )));
            }
        }

        if let Some(on_link) = &self.prefix.on_link_prefix {
            if on_link.prefix_len() != 64 || on_link.is_link_local() || on_link.is_multicast() {
                return Err(BorderRoutingError::Config(format!(
                    "on_link_prefix {} must be a routable /64",
                    on_link
                )));
            }
        }

        if let Some(mesh_local) = &self.prefix.mesh_local_prefix {
            if mesh_local.prefix_len() != 64 {
                return Err(BorderRoutingError::Config(format!(
                    "mesh_local_prefix {} must be a /64",
                    mesh_local
                )));
            }
        }

        if self.multicast.join_retry_secs == 0 {
            return Err(BorderRoutingError::Config(
                "join_retry_secs must be > 0".to_string(),
            ));
        }

        if self.infra.ra_interval_secs == 0 {
            return Err(BorderRoutingError::Config(
                "ra_interval_secs must be > 0".to_string(),
            ));
        }

        if self.infra.route_lifetime_secs == 0 {
            return Err(BorderRoutingError::Config(
                "route_lifetime_secs must be > 0".to_string(),
            ));
        }

        if matches!(&self.infra.upstream, Some(name) if name.is_empty()) {
            return Err(BorderRoutingError::Config(
                "upstream must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
