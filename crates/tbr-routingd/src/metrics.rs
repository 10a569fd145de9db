//! Prometheus metrics collection for tbr-routingd
//!
//! Every drop, eviction and stale event in the core is recoverable and
//! surfaces only here.

use prometheus::{Counter, Gauge, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the border routing core.
///
/// Cheap to clone; all clones update the same registry.
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    pub malformed_packets_total: Counter,
    pub policy_drops_total: Counter,
    pub unicast_drops_total: Counter,
    pub multicast_forwarded_total: Counter,
    pub unicast_forwarded_total: Counter,
    pub evictions_total: Counter,
    pub stale_events_total: Counter,
    pub group_joins_total: Counter,
    pub group_leaves_total: Counter,
    pub join_failures_total: Counter,
    pub link_switches_total: Counter,
    pub mld_reports_observed_total: Counter,

    // Gauges
    pub prefixes: Gauge,
    pub groups: Gauge,
    pub infra_link_up: Gauge,

    // Registry for export
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        Ok(Self {
            malformed_packets_total: counter(
                &registry,
                "tbr_malformed_packets_total",
                "Total number of unparseable packets and registrations dropped",
            )?,
            policy_drops_total: counter(
                &registry,
                "tbr_policy_drops_total",
                "Total number of multicast packets dropped by the scope/source gate",
            )?,
            unicast_drops_total: counter(
                &registry,
                "tbr_unicast_drops_total",
                "Total number of unicast packets with no matching prefix",
            )?,
            multicast_forwarded_total: counter(
                &registry,
                "tbr_multicast_forwarded_total",
                "Total number of multicast packets forwarded",
            )?,
            unicast_forwarded_total: counter(
                &registry,
                "tbr_unicast_forwarded_total",
                "Total number of unicast packets forwarded",
            )?,
            evictions_total: counter(
                &registry,
                "tbr_evictions_total",
                "Total number of table entries evicted because a table was full",
            )?,
            stale_events_total: counter(
                &registry,
                "tbr_stale_events_total",
                "Total number of events discarded because their link was torn down",
            )?,
            group_joins_total: counter(
                &registry,
                "tbr_group_joins_total",
                "Total number of multicast groups joined on the infra link",
            )?,
            group_leaves_total: counter(
                &registry,
                "tbr_group_leaves_total",
                "Total number of multicast groups left on the infra link",
            )?,
            join_failures_total: counter(
                &registry,
                "tbr_join_failures_total",
                "Total number of failed infra group joins",
            )?,
            link_switches_total: counter(
                &registry,
                "tbr_link_switches_total",
                "Total number of upstream interface switches",
            )?,
            mld_reports_observed_total: counter(
                &registry,
                "tbr_mld_reports_observed_total",
                "Total number of MLD reports and dones seen on the infra link",
            )?,
            prefixes: gauge(&registry, "tbr_prefixes", "Current number of prefix records")?,
            groups: gauge(
                &registry,
                "tbr_groups",
                "Current number of multicast groups with listeners",
            )?,
            infra_link_up: gauge(
                &registry,
                "tbr_infra_link_up",
                "Infra link status (1=up, 0=down)",
            )?,
            registry: Arc::new(registry),
        })
    }

    /// Record an infra link state change
    pub fn set_infra_link_up(&self, up: bool) {
        self.infra_link_up.set(if up { 1.0 } else { 0.0 });
    }

    /// Record the current table sizes
    pub fn set_table_sizes(&self, prefixes: usize, groups: usize) {
        self.prefixes.set(prefixes as f64);
        self.groups.set(groups as f64);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
