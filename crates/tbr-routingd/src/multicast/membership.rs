//! Multicast group membership table.

use crate::types::NodeId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::time::Instant;
use tbr_common::{SyncMap, SyncMapError};
use tbr_types::MulticastScope;

/// How a group came to be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "via", content = "node")]
pub enum MembershipSource {
    ThreadListener(NodeId),
    InfraJoin,
}

/// One group and everyone who asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub group: Ipv6Addr,
    pub scope: MulticastScope,
    /// Registered Thread nodes and when each registration expires.
    pub listeners: BTreeMap<NodeId, Instant>,
    /// The infra link reports membership in this group.
    pub infra_joined: bool,
    /// A join failed and is waiting for a retry.
    pub join_pending: bool,
    pub last_refreshed: Instant,
}

impl GroupMembership {
    fn new(group: Ipv6Addr, scope: MulticastScope, now: Instant) -> Self {
        Self {
            group,
            scope,
            listeners: BTreeMap::new(),
            infra_joined: false,
            join_pending: false,
            last_refreshed: now,
        }
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn sources(&self) -> Vec<MembershipSource> {
        let mut sources: Vec<_> = self
            .listeners
            .keys()
            .map(|node| MembershipSource::ThreadListener(*node))
            .collect();
        if self.infra_joined {
            sources.push(MembershipSource::InfraJoin);
        }
        sources
    }
}

/// What a listener upsert changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerChange {
    /// First listener of a new group.
    NewGroup,
    /// Another node joined an existing group.
    NewListener,
    /// Same (group, node) registered again.
    Refreshed,
}

/// Groups keyed by address. A group exists iff it has at least one listener.
#[derive(Debug)]
pub struct MembershipTable {
    groups: SyncMap<Ipv6Addr, GroupMembership>,
}

impl MembershipTable {
    /// `bound` of zero means unbounded.
    pub fn new(bound: usize) -> Self {
        let groups = match bound {
            0 => SyncMap::new(),
            bound => SyncMap::bounded(bound),
        };
        Self { groups }
    }

    /// Adds or refreshes the registration of `node` for `group`.
    ///
    /// Fails with [`SyncMapError::Full`] if the group is new and the table
    /// is full.
    pub fn add_listener(
        &mut self,
        group: Ipv6Addr,
        scope: MulticastScope,
        node: NodeId,
        expires: Instant,
        now: Instant,
    ) -> Result<ListenerChange, SyncMapError> {
        if let Some(entry) = self.groups.get_mut(&group) {
            entry.last_refreshed = now;
            return Ok(match entry.listeners.insert(node, expires) {
                Some(_) => ListenerChange::Refreshed,
                None => ListenerChange::NewListener,
            });
        }

        let mut entry = GroupMembership::new(group, scope, now);
        entry.listeners.insert(node, expires);
        self.groups.insert(group, entry)?;
        Ok(ListenerChange::NewGroup)
    }

    /// Removes the registration of `node` for `group`.
    ///
    /// Returns the group entry if this was its last listener; the entry is
    /// then gone from the table. Returns `None` otherwise.
    pub fn remove_listener(&mut self, group: &Ipv6Addr, node: NodeId) -> Option<GroupMembership> {
        let entry = self.groups.get_mut(group)?;
        entry.listeners.remove(&node);
        if entry.has_listeners() {
            return None;
        }
        self.groups.remove(group)
    }

    pub fn has_listener(&self, group: &Ipv6Addr, node: NodeId) -> bool {
        self.groups
            .get(group)
            .is_some_and(|entry| entry.listeners.contains_key(&node))
    }

    pub fn get(&self, group: &Ipv6Addr) -> Option<&GroupMembership> {
        self.groups.get(group)
    }

    pub fn get_mut(&mut self, group: &Ipv6Addr) -> Option<&mut GroupMembership> {
        self.groups.get_mut(group)
    }

    pub fn remove(&mut self, group: &Ipv6Addr) -> Option<GroupMembership> {
        self.groups.remove(group)
    }

    pub fn drain(&mut self) -> Vec<GroupMembership> {
        self.groups
            .drain()
            .into_iter()
            .map(|(_, entry)| entry)
            .collect()
    }

    pub fn is_full(&self) -> bool {
        self.groups.is_full()
    }

    /// The group refreshed longest ago.
    pub fn least_recently_refreshed(&self) -> Option<Ipv6Addr> {
        self.groups
            .min_key_by(|_, entry| entry.last_refreshed)
            .copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupMembership> {
        self.groups.values()
    }

    /// Addresses of every group, detached from the table.
    pub fn group_addrs(&self) -> Vec<Ipv6Addr> {
        self.groups.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
