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

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::storage::GroupId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupStatus {
    #[default]
    Init,
    Coupled,
    Bad,
    Broken,
    Ro,
    Migrating,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Init => "INIT",
            GroupStatus::Coupled => "COUPLED",
            GroupStatus::Bad => "BAD",
            GroupStatus::Broken => "BROKEN",
            GroupStatus::Ro => "RO",
            GroupStatus::Migrating => "MIGRATING",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupType {
    #[default]
    Data,
    Cache,
    Unmarked,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Data => "DATA",
            GroupType::Cache => "CACHE",
            GroupType::Unmarked => "UNMARKED",
        }
    }
}

/// Reference to a backend by its owning node key and id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackendRef {
    pub node: String,
    pub backend_id: u64,
}

impl BackendRef {
    pub fn new(node: impl Into<String>, backend_id: u64) -> Self {
        Self {
            node: node.into(),
            backend_id,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.node, self.backend_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupServiceMetadata {
    pub migrating: bool,
    pub job_id: String,
}

/// Metadata stored under the group's `symmetric_groups` key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMetadata {
    pub version: u64,
    pub frozen: bool,
    pub couple: Vec<GroupId>,
    pub namespace: String,
    pub type_label: String,
    pub service: GroupServiceMetadata,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawServiceMetadata {
    status: String,
    job_id: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMetadataMap {
    version: u64,
    frozen: bool,
    couple: Vec<GroupId>,
    namespace: String,
    #[serde(rename = "type")]
    type_label: String,
    service: RawServiceMetadata,
}

/// Version 1 metadata is a bare array of couple group ids; version 2 is a
/// map.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawMetadata {
    V1(Vec<GroupId>),
    V2(RawMetadataMap),
}

/// A replication group: a set of backends plus its stored metadata.
#[derive(Debug, Clone, Default)]
pub struct Group {
    id: GroupId,
    backends: BTreeSet<BackendRef>,
    metadata: GroupMetadata,
    metadata_parsed: bool,
    metadata_file: Option<Vec<u8>>,
    metadata_parse_pending: bool,
    metadata_download_error: Option<String>,
    metadata_parse_duration: u64,
    /// Time of the most recent metadata download, nanoseconds.
    update_time: u64,
    couple_key: Option<String>,
    active_job: Option<String>,
    /// Timestamp of the last applied history entry, seconds.
    history_applied_ts: f64,
    status: GroupStatus,
    status_text: String,
    type_: GroupType,
}

impl Group {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn backends(&self) -> &BTreeSet<BackendRef> {
        &self.backends
    }

    pub fn add_backend(&mut self, backend: BackendRef) {
        self.backends.insert(backend);
    }

    pub fn remove_backend(&mut self, backend: &BackendRef) {
        self.backends.remove(backend);
    }

    pub fn metadata(&self) -> &GroupMetadata {
        &self.metadata
    }

    pub fn metadata_parsed(&self) -> bool {
        self.metadata_parsed
    }

    pub fn metadata_parse_pending(&self) -> bool {
        self.metadata_parse_pending
    }

    pub fn metadata_parse_duration(&self) -> u64 {
        self.metadata_parse_duration
    }

    pub fn set_metadata_parse_duration(&mut self, nsec: u64) {
        self.metadata_parse_duration = nsec;
    }

    pub fn update_time(&self) -> u64 {
        self.update_time
    }

    pub fn couple_key(&self) -> Option<&str> {
        self.couple_key.as_deref()
    }

    pub fn set_couple_key(&mut self, key: String) {
        self.couple_key = Some(key);
    }

    pub fn active_job(&self) -> Option<&str> {
        self.active_job.as_deref()
    }

    pub fn set_active_job(&mut self, job_id: Option<String>) {
        self.active_job = job_id;
    }

    pub fn history_applied_ts(&self) -> f64 {
        self.history_applied_ts
    }

    pub fn set_history_applied_ts(&mut self, ts: f64) {
        self.history_applied_ts = ts;
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn set_status(&mut self, status: GroupStatus, text: String) {
        self.status = status;
        self.status_text = text;
    }

    pub fn type_(&self) -> GroupType {
        self.type_
    }

    pub fn frozen(&self) -> bool {
        self.metadata_parsed && self.metadata.frozen
    }

    /// Store a freshly downloaded metadata blob; parsing is deferred to the
    /// update pass.
    pub fn save_metadata(&mut self, data: &[u8], timestamp_ns: u64) {
        self.metadata_download_error = None;
        self.update_time = timestamp_ns;
        if self.metadata_file.as_deref() == Some(data) && self.metadata_parsed {
            return;
        }
        self.metadata_file = Some(data.to_vec());
        self.metadata_parse_pending = true;
    }

    pub fn handle_metadata_download_failed(&mut self, message: impl Into<String>) {
        self.metadata_download_error = Some(message.into());
    }

    pub fn metadata_download_error(&self) -> Option<&str> {
        self.metadata_download_error.as_deref()
    }

    /// Decode the stored metadata blob. Version 1 documents expand into
    /// `{version: 1, couple, namespace: "default"}`.
    pub fn parse_metadata(&mut self) -> Result<()> {
        self.metadata_parse_pending = false;

        let Some(data) = self.metadata_file.as_deref() else {
            return Ok(());
        };

        let raw: RawMetadata = rmp_serde::from_slice(data)?;
        self.metadata = match raw {
            RawMetadata::V1(couple) => GroupMetadata {
                version: 1,
                couple,
                namespace: "default".to_string(),
                ..Default::default()
            },
            RawMetadata::V2(map) => GroupMetadata {
                version: map.version,
                frozen: map.frozen,
                couple: map.couple,
                namespace: map.namespace,
                type_label: map.type_label,
                service: GroupServiceMetadata {
                    migrating: map.service.status == "MIGRATING",
                    job_id: map.service.job_id,
                },
            },
        };
        self.metadata_parsed = true;
        self.calculate_type();
        Ok(())
    }

    pub fn calculate_type(&mut self) {
        self.type_ = match self.metadata.type_label.as_str() {
            "cache" => GroupType::Cache,
            "" => GroupType::Data,
            _ => GroupType::Unmarked,
        };
    }

    /// Metadata disagreement that makes two groups unfit to form a couple.
    /// Freezing is a legitimate per-group state and service state is
    /// transient; neither is compared.
    pub fn has_metadata_conflict(&self, other: &Group) -> bool {
        if self.metadata_parsed != other.metadata_parsed {
            return true;
        }
        if !self.metadata_parsed {
            return false;
        }
        self.metadata.couple != other.metadata.couple
            || self.metadata.namespace != other.metadata.namespace
            || self.metadata.type_label != other.metadata.type_label
    }

    /// Keep the side with the newer metadata; report if this one is fresher.
    pub fn merge(&mut self, other: &Group, have_newer: &mut bool) {
        if self.update_time > other.update_time {
            *have_newer = true;
            return;
        }
        if self.update_time == other.update_time {
            // Same metadata generation; keep the union of backend refs.
            for backend in &other.backends {
                self.backends.insert(backend.clone());
            }
            return;
        }

        self.backends = other.backends.clone();
        self.metadata = other.metadata.clone();
        self.metadata_parsed = other.metadata_parsed;
        self.metadata_file = other.metadata_file.clone();
        self.metadata_parse_pending = other.metadata_parse_pending;
        self.metadata_download_error = other.metadata_download_error.clone();
        self.update_time = other.update_time;
        self.couple_key = other.couple_key.clone();
        self.active_job = other.active_job.clone();
        self.history_applied_ts = other.history_applied_ts;
        self.status = other.status;
        self.status_text = other.status_text.clone();
        self.type_ = other.type_;
    }

    pub fn print_json(&self, show_internals: bool) -> Value {
        let backends: Vec<String> = self.backends.iter().map(|b| b.key()).collect();

        let mut value = json!({
            "id": self.id,
            "backends": backends,
            "couple": self.couple_key.clone().unwrap_or_default(),
            "namespace": self.metadata.namespace,
            "type": self.type_.as_str(),
            "status": self.status.as_str(),
            "status_text": self.status_text,
            "frozen": self.frozen(),
        });

        if let Some(job_id) = &self.active_job {
            value["active_job_id"] = Value::from(job_id.clone());
        }

        if show_internals {
            value["update_time"] = Value::from(self.update_time);
            value["metadata_parse_duration"] = Value::from(self.metadata_parse_duration);
            value["service"] = json!({
                "migrating": self.metadata.service.migrating,
                "job_id": self.metadata.service.job_id,
            });
            if let Some(error) = &self.metadata_download_error {
                value["metadata_download_error"] = Value::from(error.clone());
            }
        }

        value
    }
}
