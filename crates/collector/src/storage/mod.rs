// Copyright 2024 Mastermind Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The snapshot container.
//!
//! A [`Storage`] owns every entity observed in the cluster. Lookups are by
//! stable string or integer keys; cross-entity links are keys resolved on
//! read, never owning pointers, so the whole graph deep-clones cheaply at
//! the start of a round. Entities are created on first observation and
//! never deleted within a round.

pub mod backend;
pub mod couple;
pub mod filesystem;
pub mod group;
pub mod history;
pub mod host;
pub mod job;
pub mod node;

use std::collections::{BTreeMap, BTreeSet};

use mastermind_common::Stopwatch;
use mastermind_config::Config;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::filter::{item_types, Filter};
use crate::storage::backend::BackendStatus;
use crate::storage::couple::{Couple, CoupleStatus};
use crate::storage::group::{BackendRef, Group, GroupStatus};
use crate::storage::history::GroupHistoryEntry;
use crate::storage::host::Host;
use crate::storage::job::Job;
use crate::storage::node::Node;

/// Replication group identifier.
pub type GroupId = u64;

/// Keys of entities picked out of a snapshot by a filter.
#[derive(Debug, Clone, Default)]
pub struct SelectedEntries {
    pub hosts: BTreeSet<String>,
    pub nodes: BTreeSet<String>,
    pub backends: BTreeSet<String>,
    pub filesystems: BTreeSet<String>,
    pub groups: BTreeSet<GroupId>,
    pub couples: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
    pub jobs: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Storage {
    hosts: BTreeMap<String, Host>,
    nodes: BTreeMap<String, Node>,
    groups: BTreeMap<GroupId, Group>,
    couples: BTreeMap<String, Couple>,
    /// Active jobs keyed by the group they operate on.
    jobs: BTreeMap<GroupId, Job>,
    jobs_ts: u64,
    /// Pending history entries, the latest one per group.
    group_history: BTreeMap<GroupId, GroupHistoryEntry>,
    group_history_ts: u64,
    /// Per-namespace settings. There is no feed populating this yet; the
    /// `forbidden_ns_without_settings` check reads it.
    namespace_settings: BTreeMap<String, Value>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hosts(&self) -> &BTreeMap<String, Host> {
        &self.hosts
    }

    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut BTreeMap<String, Node> {
        &mut self.nodes
    }

    pub fn groups(&self) -> &BTreeMap<GroupId, Group> {
        &self.groups
    }

    pub fn couples(&self) -> &BTreeMap<String, Couple> {
        &self.couples
    }

    pub fn jobs(&self) -> &BTreeMap<GroupId, Job> {
        &self.jobs
    }

    pub fn group_history_ts(&self) -> u64 {
        self.group_history_ts
    }

    pub fn set_namespace_settings(&mut self, namespace: impl Into<String>, settings: Value) {
        self.namespace_settings.insert(namespace.into(), settings);
    }

    pub fn get_host(&mut self, addr: &str) -> &mut Host {
        self.hosts
            .entry(addr.to_string())
            .or_insert_with(|| Host::new(addr))
    }

    pub fn has_node(&self, addr: &str, port: u16, family: i32) -> bool {
        self.nodes.contains_key(&Node::key_for(addr, port, family))
    }

    pub fn add_node(&mut self, addr: &str, port: u16, family: i32) -> &mut Node {
        self.get_host(addr);
        self.nodes
            .entry(Node::key_for(addr, port, family))
            .or_insert_with(|| Node::new(addr, port, family))
    }

    pub fn get_or_create_group(&mut self, group_id: GroupId) -> &mut Group {
        self.groups.entry(group_id).or_insert_with(|| Group::new(group_id))
    }

    pub fn get_group(&self, group_id: GroupId) -> Option<&Group> {
        self.groups.get(&group_id)
    }

    pub fn get_group_mut(&mut self, group_id: GroupId) -> Option<&mut Group> {
        self.groups.get_mut(&group_id)
    }

    fn backend_by_ref(&self, backend: &BackendRef) -> Option<&backend::Backend> {
        self.nodes.get(&backend.node)?.backend(backend.backend_id)
    }

    /// Replace the active job set with a fresh fetch.
    pub fn save_new_jobs(&mut self, jobs: Vec<Job>, timestamp_ns: u64) {
        self.jobs.clear();
        for job in jobs {
            self.jobs.insert(job.group, job);
        }
        self.jobs_ts = timestamp_ns;
    }

    /// Remember freshly fetched history entries, the newest per group.
    pub fn save_group_history(&mut self, entries: Vec<GroupHistoryEntry>, fetch_ts_ns: u64) {
        for entry in entries {
            if entry.is_empty() {
                continue;
            }
            let slot = self.group_history.entry(entry.group_id());
            match slot {
                std::collections::btree_map::Entry::Occupied(mut existing) => {
                    if existing.get().timestamp() < entry.timestamp() {
                        existing.insert(entry);
                    }
                }
                std::collections::btree_map::Entry::Vacant(vacant) => {
                    vacant.insert(entry);
                }
            }
        }
        self.group_history_ts = fetch_ts_ns;
    }

    /// Reconcile backend→group assignments with reported group ids, then
    /// apply history entries to group backend sets.
    pub fn process_node_backends(&mut self) {
        // Re-home backends whose reported group id differs from the
        // assigned one. New backends have no assignment yet.
        let mut moves: Vec<(BackendRef, GroupId, Option<GroupId>)> = Vec::new();
        for (node_key, node) in &self.nodes {
            for (backend_id, backend) in node.backends() {
                let reported = backend.stat().group;
                if backend.group() != Some(reported) {
                    moves.push((
                        BackendRef::new(node_key.clone(), *backend_id),
                        reported,
                        backend.group(),
                    ));
                }
            }
        }

        for (backend_ref, new_group, old_group) in moves {
            if let Some(old_id) = old_group {
                info!(
                    "Backend {} moves from group {} to group {}",
                    backend_ref.key(),
                    old_id,
                    new_group
                );
                if let Some(old) = self.groups.get_mut(&old_id) {
                    old.remove_backend(&backend_ref);
                }
            }
            self.get_or_create_group(new_group).add_backend(backend_ref.clone());
            if let Some(node) = self.nodes.get_mut(&backend_ref.node) {
                if let Some(backend) = node.backend_mut(backend_ref.backend_id) {
                    backend.set_group(Some(new_group));
                }
            }
        }

        self.apply_group_history();
    }

    /// Rewrite group backend sets from pending history entries.
    ///
    /// A history entry only removes: a backend stays if the entry lists it
    /// or if the backend was observed after the entry was written. Backends
    /// never observed cannot be fabricated from history.
    fn apply_group_history(&mut self) {
        let pending: Vec<(GroupId, GroupHistoryEntry)> = self
            .group_history
            .iter()
            .filter(|(group_id, entry)| match self.groups.get(*group_id) {
                Some(group) => entry.timestamp() > group.history_applied_ts(),
                None => false,
            })
            .map(|(group_id, entry)| (*group_id, entry.clone()))
            .collect();

        for (group_id, entry) in pending {
            let mut removals: Vec<BackendRef> = Vec::new();

            {
                let group = &self.groups[&group_id];
                for backend_ref in group.backends() {
                    let Some(node) = self.nodes.get(&backend_ref.node) else {
                        continue;
                    };
                    let Some(backend) = node.backend(backend_ref.backend_id) else {
                        continue;
                    };

                    // Observed after the entry was written: monitor data wins.
                    if (backend.stat().ts_sec as f64) >= entry.timestamp() {
                        continue;
                    }

                    let host_name = self
                        .hosts
                        .get(node.host_addr())
                        .map(|h| h.name().to_string())
                        .unwrap_or_default();

                    let listed = entry.backends().iter().any(|b| {
                        b.backend_id == backend_ref.backend_id
                            && b.port == node.port()
                            && b.family == node.family()
                            && (b.hostname == host_name || b.hostname == node.host_addr())
                    });

                    if !listed {
                        removals.push(backend_ref.clone());
                    }
                }
            }

            let group = self.groups.get_mut(&group_id).expect("filtered above");
            for backend_ref in &removals {
                info!(
                    "History entry for group {} removes backend {}",
                    group_id,
                    backend_ref.key()
                );
                group.remove_backend(backend_ref);
            }
            group.set_history_applied_ts(entry.timestamp());

            for backend_ref in &removals {
                if let Some(node) = self.nodes.get_mut(&backend_ref.node) {
                    if let Some(backend) = node.backend_mut(backend_ref.backend_id) {
                        backend.set_group(None);
                    }
                }
            }
        }
    }

    /// Link freshly fetched jobs to their groups.
    pub fn process_new_jobs(&mut self) {
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for group_id in ids {
            let job_id = self.jobs.get(&group_id).map(|job| job.id.clone());
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.set_active_job(job_id);
            }
        }
    }

    /// The derive-and-status pass: recompute derived fields bottom-up and
    /// propagate status backend → filesystem → group → couple.
    pub fn update(&mut self, config: &Config) {
        let stall_timeout = config.node_backend_stat_stale_timeout;

        for node in self.nodes.values_mut() {
            node.update_backend_status(stall_timeout);
            node.update_filesystems(stall_timeout);
        }

        // Parse pending group metadata.
        let group_ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for group_id in &group_ids {
            let group = self.groups.get_mut(group_id).expect("iterating own keys");
            if !group.metadata_parse_pending() {
                continue;
            }
            let mut elapsed = 0;
            let result = {
                let _watch = Stopwatch::new(&mut elapsed);
                group.parse_metadata()
            };
            group.set_metadata_parse_duration(elapsed);
            if let Err(e) = result {
                error!("Failed to parse metadata of group {}: {}", group_id, e);
            }
        }

        self.build_couples();

        // Couple construction may have created groups that exist only by
        // reference; status them too.
        let group_ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for group_id in &group_ids {
            let (status, text) = self.compute_group_status(*group_id, config);
            if let Some(group) = self.groups.get_mut(group_id) {
                group.set_status(status, text);
            }
        }

        let couple_keys: Vec<String> = self.couples.keys().cloned().collect();
        for key in couple_keys {
            let mut elapsed = 0;
            let outcome = {
                let _watch = Stopwatch::new(&mut elapsed);
                self.compute_couple_status(&key, config)
            };
            if let Some(couple) = self.couples.get_mut(&key) {
                couple.set_status(outcome.status, outcome.text);
                if let Some(time) = outcome.modified_time {
                    couple.touch_modified_time(time);
                }
                couple.set_update_status_duration(elapsed);
            }
        }
    }

    /// Create couples declared by group metadata, together with any groups
    /// that exist only by reference.
    fn build_couples(&mut self) {
        let mut new_couples: Vec<Vec<GroupId>> = Vec::new();
        for group in self.groups.values() {
            if !group.metadata_parsed() || group.metadata().couple.is_empty() {
                continue;
            }
            let key = Couple::key_for(&group.metadata().couple);
            if !self.couples.contains_key(&key)
                && !new_couples.iter().any(|ids| Couple::key_for(ids) == key)
            {
                new_couples.push(group.metadata().couple.clone());
            }
        }

        for member_ids in new_couples {
            for member in &member_ids {
                self.get_or_create_group(*member);
            }
            let couple = Couple::new(member_ids);
            self.couples.insert(couple.key().to_string(), couple);
        }

        // Tie member groups to their couple; the first assignment sticks.
        let assignments: Vec<(GroupId, String)> = self
            .couples
            .values()
            .flat_map(|couple| {
                couple
                    .groups()
                    .iter()
                    .map(|id| (*id, couple.key().to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (group_id, key) in assignments {
            if let Some(group) = self.groups.get_mut(&group_id) {
                if group.couple_key().is_none() {
                    group.set_couple_key(key);
                }
            }
        }
    }

    fn group_backend_statuses(&self, group: &Group) -> Vec<(BackendRef, BackendStatus)> {
        group
            .backends()
            .iter()
            .filter_map(|r| self.backend_by_ref(r).map(|b| (r.clone(), b.status())))
            .collect()
    }

    fn compute_group_status(&self, group_id: GroupId, config: &Config) -> (GroupStatus, String) {
        let group = &self.groups[&group_id];

        if group.backends().is_empty() {
            let text = if group.metadata_parsed() {
                format!("Group {group_id} has no backends")
            } else {
                format!("Group {group_id} has no backends and no metadata")
            };
            return (GroupStatus::Init, text);
        }

        if config.forbidden_dht_groups {
            let hosts: BTreeSet<&str> = group
                .backends()
                .iter()
                .filter_map(|r| self.nodes.get(&r.node))
                .map(|n| n.host_addr())
                .collect();
            if hosts.len() > 1 {
                return (
                    GroupStatus::Broken,
                    format!("Group {group_id} is a forbidden DHT group with backends on {} hosts", hosts.len()),
                );
            }
        }

        let statuses = self.group_backend_statuses(group);

        if let Some((backend_ref, _)) = statuses
            .iter()
            .find(|(_, status)| *status == BackendStatus::Broken)
        {
            return (
                GroupStatus::Broken,
                format!("Group {group_id} has broken backend {}", backend_ref.key()),
            );
        }

        if !group.metadata_parsed() {
            let text = match group.metadata_download_error() {
                Some(e) => format!("Group {group_id} metadata download failed: {e}"),
                None => format!("Group {group_id} metadata is not parsed"),
            };
            return (GroupStatus::Init, text);
        }

        let metadata = group.metadata();

        if metadata.couple.is_empty() {
            return (
                GroupStatus::Init,
                format!("Group {group_id} has no couple in metadata"),
            );
        }

        if metadata.namespace.is_empty() {
            return (
                GroupStatus::Bad,
                format!("Group {group_id} has empty namespace in metadata"),
            );
        }

        if !metadata.couple.contains(&group_id) {
            return (
                GroupStatus::Bad,
                format!("Group {group_id} is missing from its metadata couple list"),
            );
        }

        for sibling_id in &metadata.couple {
            if *sibling_id == group_id {
                continue;
            }
            if let Some(sibling) = self.groups.get(sibling_id) {
                if sibling.metadata_parsed() && group.has_metadata_conflict(sibling) {
                    return (
                        GroupStatus::Bad,
                        format!("Groups {group_id} and {sibling_id} have different metadata"),
                    );
                }
            }
        }

        if let Some((backend_ref, _)) = statuses
            .iter()
            .find(|(_, status)| *status == BackendStatus::Stalled)
        {
            return (
                GroupStatus::Bad,
                format!("Group {group_id} has stalled backend {}", backend_ref.key()),
            );
        }

        if statuses.iter().any(|(_, status)| *status == BackendStatus::Ro) {
            if metadata.service.migrating {
                let job_matches = self
                    .jobs
                    .get(&group_id)
                    .map(|job| job.id == metadata.service.job_id && job.type_.is_service())
                    .unwrap_or(false);
                if job_matches {
                    return (
                        GroupStatus::Migrating,
                        format!("Group {group_id} is migrating, job id {}", metadata.service.job_id),
                    );
                }
                return (
                    GroupStatus::Bad,
                    format!(
                        "Group {group_id} is marked migrating but job {} is not active",
                        metadata.service.job_id
                    ),
                );
            }
            return (
                GroupStatus::Ro,
                format!("Group {group_id} has read-only backends"),
            );
        }

        (GroupStatus::Coupled, format!("Group {group_id} is OK"))
    }

    fn group_full(&self, group_id: GroupId) -> bool {
        self.groups
            .get(&group_id)
            .map(|group| {
                group
                    .backends()
                    .iter()
                    .filter_map(|r| self.backend_by_ref(r))
                    .any(|b| b.full())
            })
            .unwrap_or(false)
    }

    fn group_total_space(&self, group_id: GroupId) -> u64 {
        self.groups
            .get(&group_id)
            .map(|group| {
                group
                    .backends()
                    .iter()
                    .filter_map(|r| self.backend_by_ref(r))
                    .map(|b| b.calculated().total_space)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Two groups cannot form a couple if their metadata disagrees, or if
    /// one of them has metadata and the other does not.
    fn couple_metadata_conflict(&self, a: GroupId, b: GroupId) -> bool {
        match (self.groups.get(&a), self.groups.get(&b)) {
            (Some(first), Some(second)) => first.has_metadata_conflict(second),
            (Some(first), None) => first.metadata_parsed(),
            (None, Some(second)) => second.metadata_parsed(),
            (None, None) => false,
        }
    }

    fn compute_couple_status(&self, key: &str, config: &Config) -> CoupleStatusOutcome {
        let couple = &self.couples[key];
        let members = couple.groups();
        let first = members[0];

        for &other in &members[1..] {
            if self.couple_metadata_conflict(first, other) {
                let outcome = CoupleStatusOutcome::bad(format!(
                    "Groups {first} and {other} have different metadata."
                ));
                return self.account_job_in_status(members, outcome);
            }
        }

        if let Some(frozen) = members
            .iter()
            .find(|id| self.groups.get(*id).map(|g| g.frozen()).unwrap_or(false))
        {
            return CoupleStatusOutcome::plain(
                CoupleStatus::Frozen,
                format!("Group {frozen} is frozen."),
            );
        }

        if config.forbidden_dc_sharing_among_groups {
            if let Some(outcome) = self.check_dc_sharing(members) {
                return outcome;
            }
        }

        if config.forbidden_ns_without_settings {
            let namespace = self
                .groups
                .get(&first)
                .map(|g| g.metadata().namespace.clone())
                .unwrap_or_default();
            if !self.namespace_settings.contains_key(&namespace) {
                return CoupleStatusOutcome::plain(
                    CoupleStatus::Broken,
                    format!("Namespace {namespace} has no settings"),
                );
            }
        }

        let statuses: Vec<(GroupId, GroupStatus)> = members
            .iter()
            .map(|id| {
                (
                    *id,
                    self.groups.get(id).map(|g| g.status()).unwrap_or_default(),
                )
            })
            .collect();

        if statuses.iter().all(|(_, s)| *s == GroupStatus::Coupled) {
            if config.forbidden_unmatched_group_total_space {
                let first_total = self.group_total_space(first);
                for &(other, _) in &statuses[1..] {
                    if self.group_total_space(other) != first_total {
                        return CoupleStatusOutcome::plain(
                            CoupleStatus::Broken,
                            format!(
                                "Couple {key} has unequal total space in groups {first} and {other}."
                            ),
                        );
                    }
                }
            }
            if members.iter().any(|id| self.group_full(*id)) {
                return CoupleStatusOutcome::plain(CoupleStatus::Full, format!("Couple {key} is full."));
            }
            return CoupleStatusOutcome::plain(CoupleStatus::Ok, format!("Couple {key} is OK."));
        }

        let outcome = if let Some((id, _)) =
            statuses.iter().find(|(_, s)| *s == GroupStatus::Init)
        {
            CoupleStatusOutcome::plain(
                CoupleStatus::Init,
                format!("Couple {key} has uninitialized group {id}."),
            )
        } else if let Some((id, _)) = statuses.iter().find(|(_, s)| *s == GroupStatus::Broken) {
            CoupleStatusOutcome::plain(
                CoupleStatus::Broken,
                format!("Couple {key} has broken group {id}."),
            )
        } else if let Some((id, _)) = statuses.iter().find(|(_, s)| *s == GroupStatus::Bad) {
            CoupleStatusOutcome::bad(format!("Couple {key} has bad group {id}."))
        } else if let Some((id, _)) = statuses
            .iter()
            .find(|(_, s)| matches!(s, GroupStatus::Ro | GroupStatus::Migrating))
        {
            CoupleStatusOutcome::bad(format!("Couple {key} has read-only group {id}."))
        } else {
            CoupleStatusOutcome::bad(format!("Couple {key} is bad for unknown reason."))
        };

        self.account_job_in_status(members, outcome)
    }

    /// A BAD couple with an active MOVE or RESTORE_GROUP job is in service.
    fn account_job_in_status(
        &self,
        members: &[GroupId],
        outcome: CoupleStatusOutcome,
    ) -> CoupleStatusOutcome {
        if outcome.status != CoupleStatus::Bad {
            return outcome;
        }

        for group_id in members {
            let Some(job) = self.jobs.get(group_id) else {
                continue;
            };

            if !job.type_.is_service() {
                return outcome;
            }

            let modified_time = self.groups.get(group_id).map(|g| g.update_time());
            if job.status.is_active() {
                return CoupleStatusOutcome {
                    status: CoupleStatus::ServiceActive,
                    text: format!("Couple has active job {}", job.id),
                    modified_time,
                };
            }
            return CoupleStatusOutcome {
                status: CoupleStatus::ServiceStalled,
                text: format!("Couple has stalled job {}", job.id),
                modified_time,
            };
        }

        outcome
    }

    /// With DC sharing forbidden, two groups of a couple must not touch the
    /// same data center, and every node's DC must be resolvable.
    fn check_dc_sharing(&self, members: &[GroupId]) -> Option<CoupleStatusOutcome> {
        let mut all_dcs: Vec<String> = Vec::new();

        for group_id in members {
            let Some(group) = self.groups.get(group_id) else {
                continue;
            };

            let mut group_dcs: BTreeSet<String> = BTreeSet::new();
            for backend_ref in group.backends() {
                let Some(node) = self.nodes.get(&backend_ref.node) else {
                    continue;
                };
                let dc = self
                    .hosts
                    .get(node.host_addr())
                    .map(|h| h.dc().to_string())
                    .unwrap_or_default();

                if dc.is_empty() {
                    return Some(CoupleStatusOutcome::bad(format!(
                        "Group {group_id}: Failed to resolve DC for node {}",
                        node.key()
                    )));
                }
                group_dcs.insert(dc);
            }
            all_dcs.extend(group_dcs);
        }

        let unique: BTreeSet<&String> = all_dcs.iter().collect();
        if unique.len() != all_dcs.len() {
            return Some(CoupleStatusOutcome::plain(
                CoupleStatus::Broken,
                "Couple has nodes sharing the same DC".to_string(),
            ));
        }

        None
    }

    /// Namespace → couple keys, derived from couples' first groups.
    pub fn namespaces_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for couple in self.couples.values() {
            let Some(first) = couple.groups().first() else {
                continue;
            };
            let Some(group) = self.groups.get(first) else {
                continue;
            };
            if !group.metadata_parsed() || group.metadata().namespace.is_empty() {
                continue;
            }
            map.entry(group.metadata().namespace.clone())
                .or_default()
                .insert(couple.key().to_string());
        }
        map
    }

    /// Fold another snapshot into this one, entity by entity, keeping the
    /// newer side. `have_newer` reports that this snapshot holds data the
    /// other one lacks, so a CAS retry is worthwhile.
    pub fn merge(&mut self, other: &Storage, have_newer: &mut bool) {
        for (addr, other_host) in &other.hosts {
            match self.hosts.get_mut(addr) {
                Some(mine) => mine.merge(other_host),
                None => {
                    self.hosts.insert(addr.clone(), other_host.clone());
                }
            }
        }
        if self.hosts.keys().any(|addr| !other.hosts.contains_key(addr)) {
            *have_newer = true;
        }

        for (key, other_node) in &other.nodes {
            match self.nodes.get_mut(key) {
                Some(mine) => mine.merge(other_node, have_newer),
                None => {
                    self.nodes.insert(key.clone(), other_node.clone());
                }
            }
        }
        if self.nodes.keys().any(|key| !other.nodes.contains_key(key)) {
            *have_newer = true;
        }

        for (group_id, other_group) in &other.groups {
            match self.groups.get_mut(group_id) {
                Some(mine) => mine.merge(other_group, have_newer),
                None => {
                    self.groups.insert(*group_id, other_group.clone());
                }
            }
        }
        if self.groups.keys().any(|id| !other.groups.contains_key(id)) {
            *have_newer = true;
        }

        for (key, other_couple) in &other.couples {
            match self.couples.get_mut(key) {
                Some(mine) => mine.merge(other_couple, have_newer),
                None => {
                    self.couples.insert(key.clone(), other_couple.clone());
                }
            }
        }
        if self.couples.keys().any(|key| !other.couples.contains_key(key)) {
            *have_newer = true;
        }

        if self.jobs_ts < other.jobs_ts {
            self.jobs = other.jobs.clone();
            self.jobs_ts = other.jobs_ts;
        } else if self.jobs_ts > other.jobs_ts {
            *have_newer = true;
        }

        for (group_id, entry) in &other.group_history {
            match self.group_history.get_mut(group_id) {
                Some(mine) => {
                    if mine.timestamp() < entry.timestamp() {
                        *mine = entry.clone();
                    }
                }
                None => {
                    self.group_history.insert(*group_id, entry.clone());
                }
            }
        }
        if self.group_history_ts > other.group_history_ts {
            *have_newer = true;
        }
        self.group_history_ts = self.group_history_ts.max(other.group_history_ts);

        for (namespace, settings) in &other.namespace_settings {
            self.namespace_settings
                .entry(namespace.clone())
                .or_insert_with(|| settings.clone());
        }
    }

    fn contains<T: Ord>(list: &[T], value: &T) -> bool {
        list.binary_search(value).is_ok()
    }

    /// Group-side constraints (group/couple/namespace lists) for entities
    /// reached through a group.
    fn group_matches_gcn(&self, group_id: GroupId, filter: &Filter) -> bool {
        let Some(group) = self.groups.get(&group_id) else {
            return filter.groups.is_empty()
                && filter.couples.is_empty()
                && filter.namespaces.is_empty();
        };

        if !filter.groups.is_empty() && !Self::contains(&filter.groups, &group_id) {
            return false;
        }
        if !filter.couples.is_empty() {
            match group.couple_key() {
                Some(key) => {
                    if !Self::contains(&filter.couples, &key.to_string()) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if !filter.namespaces.is_empty()
            && !Self::contains(&filter.namespaces, &group.metadata().namespace)
        {
            return false;
        }
        true
    }

    fn group_matches(&self, group_id: GroupId, filter: &Filter) -> bool {
        if !self.group_matches_gcn(group_id, filter) {
            return false;
        }
        let Some(group) = self.groups.get(&group_id) else {
            return false;
        };

        if !filter.nodes.is_empty()
            && !group
                .backends()
                .iter()
                .any(|r| Self::contains(&filter.nodes, &r.node))
        {
            return false;
        }
        if !filter.backends.is_empty()
            && !group
                .backends()
                .iter()
                .any(|r| Self::contains(&filter.backends, &r.key()))
        {
            return false;
        }
        if !filter.filesystems.is_empty() {
            let matched = group.backends().iter().any(|r| {
                self.backend_by_ref(r)
                    .map(|b| {
                        let fs_key = format!("{}/{}", r.node, b.stat().fsid);
                        Self::contains(&filter.filesystems, &fs_key)
                    })
                    .unwrap_or(false)
            });
            if !matched {
                return false;
            }
        }
        true
    }

    fn couple_matches(&self, key: &str, filter: &Filter) -> bool {
        if !filter.couples.is_empty() && !Self::contains(&filter.couples, &key.to_string()) {
            return false;
        }
        let Some(couple) = self.couples.get(key) else {
            return false;
        };
        if filter.is_empty() {
            return true;
        }
        couple.groups().iter().any(|id| self.group_matches(*id, filter))
    }

    fn node_matches(&self, key: &str, filter: &Filter) -> bool {
        if !filter.nodes.is_empty() && !Self::contains(&filter.nodes, &key.to_string()) {
            return false;
        }
        let Some(node) = self.nodes.get(key) else {
            return false;
        };

        if !filter.backends.is_empty()
            && !node
                .backends()
                .values()
                .any(|b| Self::contains(&filter.backends, &b.key().to_string()))
        {
            return false;
        }
        if !filter.filesystems.is_empty()
            && !node
                .filesystems()
                .values()
                .any(|fs| Self::contains(&filter.filesystems, &fs.key().to_string()))
        {
            return false;
        }
        if !filter.groups.is_empty() || !filter.couples.is_empty() || !filter.namespaces.is_empty() {
            let matched = node
                .backends()
                .values()
                .filter_map(|b| b.group())
                .any(|group_id| self.group_matches_gcn(group_id, filter));
            if !matched {
                return false;
            }
        }
        true
    }

    fn backend_matches(&self, node_key: &str, backend: &backend::Backend, filter: &Filter) -> bool {
        if !filter.backends.is_empty()
            && !Self::contains(&filter.backends, &backend.key().to_string())
        {
            return false;
        }
        if !filter.nodes.is_empty() && !Self::contains(&filter.nodes, &node_key.to_string()) {
            return false;
        }
        if !filter.filesystems.is_empty() {
            let fs_key = format!("{}/{}", node_key, backend.stat().fsid);
            if !Self::contains(&filter.filesystems, &fs_key) {
                return false;
            }
        }
        if !filter.groups.is_empty() || !filter.couples.is_empty() || !filter.namespaces.is_empty() {
            match backend.group() {
                Some(group_id) => {
                    if !self.group_matches_gcn(group_id, filter) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    fn fs_matches(&self, node_key: &str, fs: &filesystem::Filesystem, filter: &Filter) -> bool {
        if !filter.filesystems.is_empty()
            && !Self::contains(&filter.filesystems, &fs.key().to_string())
        {
            return false;
        }
        if !filter.nodes.is_empty() && !Self::contains(&filter.nodes, &node_key.to_string()) {
            return false;
        }

        let node = self.nodes.get(node_key);
        if !filter.backends.is_empty() {
            let matched = node
                .map(|n| {
                    fs.backends().iter().any(|id| {
                        n.backend(*id)
                            .map(|b| Self::contains(&filter.backends, &b.key().to_string()))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !filter.groups.is_empty() || !filter.couples.is_empty() || !filter.namespaces.is_empty() {
            let matched = node
                .map(|n| {
                    fs.backends()
                        .iter()
                        .filter_map(|id| n.backend(*id))
                        .filter_map(|b| b.group())
                        .any(|group_id| self.group_matches_gcn(group_id, filter))
                })
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        true
    }

    fn namespace_matches(&self, namespace: &str, couple_keys: &BTreeSet<String>, filter: &Filter) -> bool {
        if !filter.namespaces.is_empty()
            && !Self::contains(&filter.namespaces, &namespace.to_string())
        {
            return false;
        }
        if filter.is_empty() {
            return true;
        }
        couple_keys.iter().any(|key| self.couple_matches(key, filter))
    }

    /// Pick out every entity matching the filter. Constraints always
    /// apply; `item_types` only scopes what is rendered.
    pub fn select(&self, filter: &Filter) -> SelectedEntries {
        let mut filter = filter.clone();
        filter.sort();

        let mut entries = SelectedEntries::default();

        for group_id in self.groups.keys() {
            if self.group_matches(*group_id, &filter) {
                entries.groups.insert(*group_id);
            }
        }

        for key in self.couples.keys() {
            if self.couple_matches(key, &filter) {
                entries.couples.insert(key.clone());
            }
        }

        for (namespace, couple_keys) in self.namespaces_map() {
            if self.namespace_matches(&namespace, &couple_keys, &filter) {
                entries.namespaces.insert(namespace);
            }
        }

        for (key, node) in &self.nodes {
            if self.node_matches(key, &filter) {
                entries.nodes.insert(key.clone());
                entries.hosts.insert(node.host_addr().to_string());
            }
            for backend in node.backends().values() {
                if self.backend_matches(key, backend, &filter) {
                    entries.backends.insert(backend.key().to_string());
                }
            }
            for fs in node.filesystems().values() {
                if self.fs_matches(key, fs, &filter) {
                    entries.filesystems.insert(fs.key().to_string());
                }
            }
        }

        for job in self.jobs.values() {
            let matched = if self.groups.contains_key(&job.group) {
                self.group_matches(job.group, &filter)
            } else {
                filter.is_empty()
            };
            if matched {
                entries.jobs.insert(job.id.clone());
            }
        }

        entries
    }

    /// Render the snapshot (or the filtered subset) as one JSON document
    /// with an array per entity kind.
    pub fn print_json(&self, filter: &Filter) -> String {
        let mask = filter.effective_item_types();
        let selected = if filter.is_empty() {
            None
        } else {
            Some(self.select(filter))
        };
        let show_internals = filter.show_internals;

        let mut doc = serde_json::Map::new();

        if mask & item_types::HOST != 0 {
            let hosts: Vec<Value> = self
                .hosts
                .values()
                .filter(|h| {
                    selected
                        .as_ref()
                        .map(|s| s.hosts.contains(h.addr()))
                        .unwrap_or(true)
                })
                .map(|h| h.print_json())
                .collect();
            doc.insert("hosts".to_string(), Value::Array(hosts));
        }

        if mask & item_types::NODE != 0 {
            let nodes: Vec<Value> = self
                .nodes
                .values()
                .filter(|n| {
                    selected
                        .as_ref()
                        .map(|s| s.nodes.contains(n.key()))
                        .unwrap_or(true)
                })
                .map(|n| n.print_json(show_internals))
                .collect();
            doc.insert("nodes".to_string(), Value::Array(nodes));
        }

        if mask & item_types::FS != 0 {
            let mut filesystems = Vec::new();
            for node in self.nodes.values() {
                for fs in node.filesystems().values() {
                    let included = selected
                        .as_ref()
                        .map(|s| s.filesystems.contains(fs.key()))
                        .unwrap_or(true);
                    if included {
                        filesystems.push(fs.print_json(node.host_addr()));
                    }
                }
            }
            doc.insert("filesystems".to_string(), Value::Array(filesystems));
        }

        if mask & item_types::BACKEND != 0 {
            let mut backends = Vec::new();
            for node in self.nodes.values() {
                for backend in node.backends().values() {
                    let included = selected
                        .as_ref()
                        .map(|s| s.backends.contains(backend.key()))
                        .unwrap_or(true);
                    if included {
                        backends.push(backend.print_json(show_internals));
                    }
                }
            }
            doc.insert("backends".to_string(), Value::Array(backends));
        }

        if mask & item_types::GROUP != 0 {
            let groups: Vec<Value> = self
                .groups
                .values()
                .filter(|g| {
                    selected
                        .as_ref()
                        .map(|s| s.groups.contains(&g.id()))
                        .unwrap_or(true)
                })
                .map(|g| g.print_json(show_internals))
                .collect();
            doc.insert("groups".to_string(), Value::Array(groups));
        }

        if mask & item_types::COUPLE != 0 {
            let couples: Vec<Value> = self
                .couples
                .values()
                .filter(|c| {
                    selected
                        .as_ref()
                        .map(|s| s.couples.contains(c.key()))
                        .unwrap_or(true)
                })
                .map(|c| c.print_json(show_internals))
                .collect();
            doc.insert("couples".to_string(), Value::Array(couples));
        }

        if mask & item_types::NAMESPACE != 0 {
            let namespaces: Vec<Value> = self
                .namespaces_map()
                .into_iter()
                .filter(|(name, _)| {
                    selected
                        .as_ref()
                        .map(|s| s.namespaces.contains(name))
                        .unwrap_or(true)
                })
                .map(|(name, couple_keys)| {
                    json!({
                        "id": name,
                        "couples": couple_keys.into_iter().collect::<Vec<_>>(),
                    })
                })
                .collect();
            doc.insert("namespaces".to_string(), Value::Array(namespaces));
        }

        if mask & item_types::JOB != 0 {
            let jobs: Vec<Value> = self
                .jobs
                .values()
                .filter(|j| {
                    selected
                        .as_ref()
                        .map(|s| s.jobs.contains(&j.id))
                        .unwrap_or(true)
                })
                .map(|j| j.print_json())
                .collect();
            doc.insert("jobs".to_string(), Value::Array(jobs));
        }

        Value::Object(doc).to_string()
    }
}

/// Result of a couple status evaluation.
struct CoupleStatusOutcome {
    status: CoupleStatus,
    text: String,
    modified_time: Option<u64>,
}

impl CoupleStatusOutcome {
    fn plain(status: CoupleStatus, text: String) -> Self {
        Self {
            status,
            text,
            modified_time: None,
        }
    }

    fn bad(text: String) -> Self {
        Self::plain(CoupleStatus::Bad, text)
    }
}
