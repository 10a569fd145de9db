//! Multicast Forwarding Engine: membership bookkeeping and infra joins.
//!
//! A group is joined on the infra link while at least one Thread node holds
//! a registration for it, whatever its scope. Joins that fail are retried on
//! a timer bound to the link instance they were issued for; tearing that
//! instance down cancels them.

use super::membership::{GroupMembership, ListenerChange, MembershipTable};
use crate::config::{MulticastConfig, MIN_REGISTRATION_TIMEOUT_SECS};
use crate::metrics::MetricsCollector;
use crate::platform::InfraLinkOps;
use crate::types::{LinkInstance, NodeId, RegistrationOp};
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};
use tbr_common::TimerQueue;
use tbr_types::MulticastScope;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MulticastTimer {
    Registration { group: Ipv6Addr, node: NodeId },
    JoinRetry { group: Ipv6Addr, epoch: u64 },
}

impl MulticastTimer {
    fn group(&self) -> Ipv6Addr {
        match self {
            Self::Registration { group, .. } | Self::JoinRetry { group, .. } => *group,
        }
    }
}

pub struct MulticastEngine {
    table: MembershipTable,
    timers: TimerQueue<MulticastTimer>,
    registration_timeout: Duration,
    join_retry: Duration,
    metrics: MetricsCollector,
}

impl MulticastEngine {
    pub fn new(config: &MulticastConfig, metrics: MetricsCollector) -> Self {
        Self {
            table: MembershipTable::new(config.max_groups),
            timers: TimerQueue::new(),
            registration_timeout: Duration::from_secs(
                config
                    .registration_timeout_secs
                    .max(MIN_REGISTRATION_TIMEOUT_SECS),
            ),
            join_retry: Duration::from_secs(config.join_retry_secs),
            metrics,
        }
    }

    /// Applies a Multicast Listener Registration from a Thread node.
    ///
    /// `link` is the infra link instance that is currently up, if any. With
    /// no link up the registration is still recorded and the join is issued
    /// on the next bring-up.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, link, infra), fields(group = %group, node = %node))]
    pub fn on_thread_listener_event<I: InfraLinkOps>(
        &mut self,
        group: Ipv6Addr,
        node: NodeId,
        op: RegistrationOp,
        timeout: Option<Duration>,
        link: Option<&LinkInstance>,
        now: Instant,
        infra: &mut I,
    ) {
        let Ok(scope) = MulticastScope::of(&group) else {
            warn!("Dropping registration for non-multicast group");
            self.metrics.malformed_packets_total.inc();
            return;
        };

        match op {
            RegistrationOp::Register => {
                self.register(group, scope, node, timeout, link, now, infra)
            }
            RegistrationOp::Deregister => {
                self.timers
                    .cancel(&MulticastTimer::Registration { group, node });
                if self.table.has_listener(&group, node) {
                    self.remove_listener(group, node, link, infra);
                } else {
                    debug!("Deregistration for unknown listener");
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register<I: InfraLinkOps>(
        &mut self,
        group: Ipv6Addr,
        scope: MulticastScope,
        node: NodeId,
        timeout: Option<Duration>,
        link: Option<&LinkInstance>,
        now: Instant,
        infra: &mut I,
    ) {
        let timeout = timeout
            .unwrap_or(self.registration_timeout)
            .max(Duration::from_secs(MIN_REGISTRATION_TIMEOUT_SECS));
        let expires = now + timeout;

        if self.table.get(&group).is_none() && self.table.is_full() {
            self.evict_least_recently_refreshed(link, infra);
        }

        match self.table.add_listener(group, scope, node, expires, now) {
            Ok(change) => {
                self.timers
                    .schedule(MulticastTimer::Registration { group, node }, expires);
                match change {
                    ListenerChange::NewGroup => {
                        info!(scope = %scope, "First listener registered for group")
                    }
                    ListenerChange::NewListener => info!("Listener added to group"),
                    ListenerChange::Refreshed => debug!("Listener registration refreshed"),
                }
                if let Some(link) = link {
                    self.ensure_joined(group, link, now, infra);
                }
            }
            Err(e) => warn!(error = %e, "Membership table full, registration dropped"),
        }
    }

    /// Fires due registration expiries and join retries.
    pub fn on_timer<I: InfraLinkOps>(
        &mut self,
        now: Instant,
        link: Option<&LinkInstance>,
        infra: &mut I,
    ) {
        for timer in self.timers.pop_expired(now) {
            match timer {
                MulticastTimer::Registration { group, node } => {
                    info!(group = %group, node = %node, "Listener registration expired");
                    self.remove_listener(group, node, link, infra);
                }
                MulticastTimer::JoinRetry { group, epoch } => match link {
                    Some(link) if link.epoch == epoch => {
                        debug!(group = %group, "Retrying infra join");
                        self.ensure_joined(group, link, now, infra);
                    }
                    _ => {
                        debug!(group = %group, epoch, "Discarding join retry for torn-down link");
                        self.metrics.stale_events_total.inc();
                    }
                },
            }
        }
    }

    /// Issues joins for every group that still has listeners.
    pub fn on_infra_link_up<I: InfraLinkOps>(
        &mut self,
        link: &LinkInstance,
        now: Instant,
        infra: &mut I,
    ) -> usize {
        let groups = self.table.group_addrs();
        for group in &groups {
            self.ensure_joined(*group, link, now, infra);
        }
        if !groups.is_empty() {
            info!(interface = %link.interface, count = groups.len(), "Re-issued infra joins");
        }
        groups.len()
    }

    /// An MLD Query on the infra link: retry pending joins right away.
    pub fn on_infra_query<I: InfraLinkOps>(
        &mut self,
        queried: Option<Ipv6Addr>,
        link: &LinkInstance,
        now: Instant,
        infra: &mut I,
    ) -> usize {
        let pending: Vec<Ipv6Addr> = self
            .table
            .iter()
            .filter(|entry| entry.join_pending && queried.map_or(true, |g| g == entry.group))
            .map(|entry| entry.group)
            .collect();
        for group in &pending {
            self.timers.cancel(&MulticastTimer::JoinRetry {
                group: *group,
                epoch: link.epoch,
            });
            self.ensure_joined(*group, link, now, infra);
        }
        pending.len()
    }

    /// MLD reports from other infra hosts are only counted; they never
    /// create Thread-side state.
    pub fn observe_infra_report(&self, joined: &[Ipv6Addr], left: &[Ipv6Addr]) {
        self.metrics.mld_reports_observed_total.inc();
        debug!(joined = joined.len(), left = left.len(), "Observed infra MLD report");
    }

    /// Drops every infra-side join. Thread listeners stay so the joins can
    /// be re-issued when a link comes up again.
    ///
    /// With `leave_on` set, leaves are sent on that (still usable) link.
    pub fn teardown_infra<I: InfraLinkOps>(
        &mut self,
        leave_on: Option<&LinkInstance>,
        infra: &mut I,
    ) -> usize {
        let mut dropped = 0;
        for group in self.table.group_addrs() {
            let Some(entry) = self.table.get_mut(&group) else {
                continue;
            };
            if entry.infra_joined {
                dropped += 1;
                if let Some(link) = leave_on {
                    if let Err(e) = infra.leave_group(&link.interface, group) {
                        debug!(group = %group, error = %e, "Leave on torn-down link failed");
                    }
                }
            }
            entry.infra_joined = false;
            entry.join_pending = false;
        }
        let retries = self
            .timers
            .cancel_where(|timer| matches!(timer, MulticastTimer::JoinRetry { .. }));
        if dropped > 0 || retries > 0 {
            info!(joins = dropped, retries, "Cleared infra multicast state");
        }
        dropped
    }

    /// Drops every Thread listener, withdrawing the corresponding joins.
    pub fn teardown_mesh<I: InfraLinkOps>(
        &mut self,
        link: Option<&LinkInstance>,
        infra: &mut I,
    ) -> usize {
        let entries = self.table.drain();
        for entry in &entries {
            if entry.infra_joined {
                if let Some(link) = link {
                    self.leave(entry.group, link, infra);
                }
            }
        }
        self.timers.clear();
        if !entries.is_empty() {
            info!(count = entries.len(), "Cleared all Thread listener registrations");
        }
        entries.len()
    }

    pub fn has_listeners(&self, group: &Ipv6Addr) -> bool {
        self.table.get(group).is_some_and(GroupMembership::has_listeners)
    }

    pub fn get(&self, group: &Ipv6Addr) -> Option<&GroupMembership> {
        self.table.get(group)
    }

    pub fn memberships(&self) -> impl Iterator<Item = &GroupMembership> {
        self.table.iter()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn ensure_joined<I: InfraLinkOps>(
        &mut self,
        group: Ipv6Addr,
        link: &LinkInstance,
        now: Instant,
        infra: &mut I,
    ) {
        let Some(entry) = self.table.get_mut(&group) else {
            return;
        };
        if entry.infra_joined {
            return;
        }

        match infra.join_group(&link.interface, group) {
            Ok(()) => {
                entry.infra_joined = true;
                entry.join_pending = false;
                self.metrics.group_joins_total.inc();
                info!(group = %group, interface = %link.interface, "Joined group on infra link");
            }
            Err(e) => {
                entry.join_pending = true;
                self.metrics.join_failures_total.inc();
                warn!(
                    group = %group,
                    error = %e,
                    retry_in_secs = self.join_retry.as_secs(),
                    "Infra join failed, retry scheduled"
                );
                self.timers.schedule(
                    MulticastTimer::JoinRetry {
                        group,
                        epoch: link.epoch,
                    },
                    now + self.join_retry,
                );
            }
        }
    }

    fn leave<I: InfraLinkOps>(&self, group: Ipv6Addr, link: &LinkInstance, infra: &mut I) {
        match infra.leave_group(&link.interface, group) {
            Ok(()) => {
                self.metrics.group_leaves_total.inc();
                info!(group = %group, interface = %link.interface, "Left group on infra link");
            }
            Err(e) => warn!(group = %group, error = %e, "Infra leave failed"),
        }
    }

    fn remove_listener<I: InfraLinkOps>(
        &mut self,
        group: Ipv6Addr,
        node: NodeId,
        link: Option<&LinkInstance>,
        infra: &mut I,
    ) {
        let Some(entry) = self.table.remove_listener(&group, node) else {
            debug!(group = %group, node = %node, "Listener removed, group still has listeners");
            return;
        };
        self.drop_group(entry, link, infra);
        info!(group = %group, "Last listener gone, group removed");
    }

    fn evict_least_recently_refreshed<I: InfraLinkOps>(
        &mut self,
        link: Option<&LinkInstance>,
        infra: &mut I,
    ) {
        let Some(victim) = self.table.least_recently_refreshed() else {
            return;
        };
        if let Some(entry) = self.table.remove(&victim) {
            warn!(
                group = %victim,
                "Membership table full, evicting least recently refreshed group"
            );
            self.metrics.evictions_total.inc();
            self.drop_group(entry, link, infra);
        }
    }

    /// Cancels the timers of a group that left the table and withdraws its
    /// join.
    fn drop_group<I: InfraLinkOps>(
        &mut self,
        entry: GroupMembership,
        link: Option<&LinkInstance>,
        infra: &mut I,
    ) {
        self.timers
            .cancel_where(|timer| timer.group() == entry.group);
        if entry.infra_joined {
            if let Some(link) = link {
                self.leave(entry.group, link, infra);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformCall, RecordingPlatform};
    use crate::types::InterfaceId;
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn engine(config: MulticastConfig) -> MulticastEngine {
        MulticastEngine::new(&config, MetricsCollector::new().unwrap())
    }

    fn eth0(epoch: u64) -> LinkInstance {
        LinkInstance {
            interface: InterfaceId::from("eth0"),
            epoch,
        }
    }

    fn register(
        mfe: &mut MulticastEngine,
        group: Ipv6Addr,
        node: u16,
        link: Option<&LinkInstance>,
        now: Instant,
        infra: &mut RecordingPlatform,
    ) {
        mfe.on_thread_listener_event(
            group,
            NodeId(node),
            RegistrationOp::Register,
            None,
            link,
            now,
            infra,
        );
    }

    fn deregister(
        mfe: &mut MulticastEngine,
        group: Ipv6Addr,
        node: u16,
        link: Option<&LinkInstance>,
        now: Instant,
        infra: &mut RecordingPlatform,
    ) {
        mfe.on_thread_listener_event(
            group,
            NodeId(node),
            RegistrationOp::Deregister,
            None,
            link,
            now,
            infra,
        );
    }

    #[test]
    fn test_join_follows_listeners() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let now = Instant::now();
        let g = addr("ff05::1234");

        register(&mut mfe, g, 1, Some(&link), now, &mut infra);
        register(&mut mfe, g, 2, Some(&link), now, &mut infra);
        register(&mut mfe, g, 1, Some(&link), now, &mut infra);
        assert!(infra.is_joined(&link.interface, &g));
        assert_eq!(
            infra.count(|c| matches!(c, PlatformCall::JoinGroup { .. })),
            1
        );

        deregister(&mut mfe, g, 1, Some(&link), now, &mut infra);
        assert!(infra.is_joined(&link.interface, &g));
        deregister(&mut mfe, g, 2, Some(&link), now, &mut infra);
        assert!(!infra.is_joined(&link.interface, &g));
        assert!(mfe.is_empty());
        assert_eq!(mfe.next_deadline(), None);
    }

    #[test]
    fn test_join_is_unconditional_on_scope() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let g = addr("ff03::1234");

        register(&mut mfe, g, 1, Some(&link), Instant::now(), &mut infra);
        assert!(infra.is_joined(&link.interface, &g));
    }

    #[test]
    fn test_non_multicast_registration_is_malformed() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        register(&mut mfe, addr("2001:db8::1"), 1, Some(&eth0(1)), Instant::now(), &mut infra);
        assert!(mfe.is_empty());
        assert_eq!(mfe.metrics.malformed_packets_total.get(), 1.0);
    }

    #[test]
    fn test_registration_expiry() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let now = Instant::now();
        let g = addr("ff05::1");

        // Requested timeout below the floor is raised to 300 s.
        mfe.on_thread_listener_event(
            g,
            NodeId(1),
            RegistrationOp::Register,
            Some(Duration::from_secs(10)),
            Some(&link),
            now,
            &mut infra,
        );
        assert_eq!(mfe.next_deadline(), Some(now + Duration::from_secs(300)));

        mfe.on_timer(now + Duration::from_secs(299), Some(&link), &mut infra);
        assert!(mfe.has_listeners(&g));
        mfe.on_timer(now + Duration::from_secs(300), Some(&link), &mut infra);
        assert!(!mfe.has_listeners(&g));
        assert!(!infra.is_joined(&link.interface, &g));
    }

    #[test]
    fn test_reregistration_refreshes_expiry() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let now = Instant::now();
        let g = addr("ff05::1");

        register(&mut mfe, g, 1, Some(&link), now, &mut infra);
        let later = now + Duration::from_secs(1800);
        register(&mut mfe, g, 1, Some(&link), later, &mut infra);

        mfe.on_timer(now + Duration::from_secs(3600), Some(&link), &mut infra);
        assert!(mfe.has_listeners(&g));
        assert_eq!(mfe.next_deadline(), Some(later + Duration::from_secs(3600)));
    }

    #[test]
    fn test_failed_join_retried() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let now = Instant::now();
        let g = addr("ff05::1");

        infra.set_join_failure(true);
        register(&mut mfe, g, 1, Some(&link), now, &mut infra);
        assert!(mfe.get(&g).unwrap().join_pending);
        assert_eq!(mfe.next_deadline(), Some(now + Duration::from_secs(5)));

        infra.set_join_failure(false);
        mfe.on_timer(now + Duration::from_secs(5), Some(&link), &mut infra);
        let entry = mfe.get(&g).unwrap();
        assert!(entry.infra_joined);
        assert!(!entry.join_pending);
        assert!(infra.is_joined(&link.interface, &g));
    }

    #[test]
    fn test_query_retries_pending_join() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let now = Instant::now();
        let g = addr("ff05::1");

        infra.set_join_failure(true);
        register(&mut mfe, g, 1, Some(&link), now, &mut infra);
        infra.set_join_failure(false);

        assert_eq!(mfe.on_infra_query(None, &link, now, &mut infra), 1);
        assert!(infra.is_joined(&link.interface, &g));
    }

    #[test]
    fn test_teardown_cancels_retries_and_rejoins_on_up() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let old = eth0(1);
        let now = Instant::now();
        let g = addr("ff05::1");

        infra.set_join_failure(true);
        register(&mut mfe, g, 1, Some(&old), now, &mut infra);
        mfe.teardown_infra(None, &mut infra);
        infra.set_join_failure(false);

        // The retry for the old link never fires.
        mfe.on_timer(now + Duration::from_secs(5), None, &mut infra);
        assert!(!infra.is_joined(&old.interface, &g));
        assert!(mfe.has_listeners(&g));

        let new = LinkInstance {
            interface: InterfaceId::from("wlan0"),
            epoch: 2,
        };
        assert_eq!(mfe.on_infra_link_up(&new, now, &mut infra), 1);
        assert!(infra.is_joined(&new.interface, &g));
    }

    #[test]
    fn test_stale_retry_discarded() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let now = Instant::now();
        let g = addr("ff05::1");

        infra.set_join_failure(true);
        register(&mut mfe, g, 1, Some(&eth0(1)), now, &mut infra);
        infra.set_join_failure(false);

        // Same interface, later bring-up.
        mfe.on_timer(now + Duration::from_secs(5), Some(&eth0(2)), &mut infra);
        assert_eq!(mfe.metrics.stale_events_total.get(), 1.0);
        assert!(!mfe.get(&g).unwrap().infra_joined);
    }

    #[test]
    fn test_registration_without_link_joins_on_up() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let now = Instant::now();
        let g = addr("ff04::1");

        register(&mut mfe, g, 1, None, now, &mut infra);
        assert!(infra.calls().is_empty());

        let link = eth0(1);
        mfe.on_infra_link_up(&link, now, &mut infra);
        assert!(infra.is_joined(&link.interface, &g));
    }

    #[test]
    fn test_teardown_mesh_leaves_groups() {
        let mut mfe = engine(MulticastConfig::default());
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let now = Instant::now();

        register(&mut mfe, addr("ff05::1"), 1, Some(&link), now, &mut infra);
        register(&mut mfe, addr("ff05::2"), 2, Some(&link), now, &mut infra);
        assert_eq!(mfe.teardown_mesh(Some(&link), &mut infra), 2);
        assert!(infra.joined_groups(&link.interface).is_empty());
        assert_eq!(mfe.next_deadline(), None);
    }

    #[test]
    fn test_eviction_when_full() {
        let mut mfe = engine(MulticastConfig {
            max_groups: 1,
            ..MulticastConfig::default()
        });
        let mut infra = RecordingPlatform::new();
        let link = eth0(1);
        let now = Instant::now();

        register(&mut mfe, addr("ff05::1"), 1, Some(&link), now, &mut infra);
        register(&mut mfe, addr("ff05::2"), 1, Some(&link), now, &mut infra);

        assert_eq!(mfe.len(), 1);
        assert!(mfe.has_listeners(&addr("ff05::2")));
        assert!(!infra.is_joined(&link.interface, &addr("ff05::1")));
        assert_eq!(mfe.metrics.evictions_total.get(), 1.0);
    }
}
