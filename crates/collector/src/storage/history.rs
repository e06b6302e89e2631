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

use bson::{Bson, Document};
use serde_json::{json, Value};

use crate::error::{CollectorError, Result};
use crate::storage::GroupId;

/// One backend of a historical group configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupHistoryBackend {
    pub hostname: String,
    pub port: u16,
    pub family: i32,
    pub backend_id: u64,
}

/// The most recent manually-recorded backend set of one group.
///
/// A history document carries a list of `nodes` entries; only the newest
/// entry whose type is not `"automatic"` contributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupHistoryEntry {
    group_id: GroupId,
    timestamp: f64,
    backends: BTreeSet<GroupHistoryBackend>,
    empty: bool,
}

fn bson_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

impl GroupHistoryEntry {
    /// Build an entry from one history-collection document. A document
    /// without a group id is malformed; an empty or all-automatic `nodes`
    /// list yields an entry with `is_empty() == true`.
    pub fn from_bson(doc: &Document) -> Result<Self> {
        let group_id = doc
            .get("group_id")
            .and_then(bson_number)
            .ok_or_else(|| CollectorError::malformed("history record has no 'group_id'"))?
            as GroupId;

        let mut entry = GroupHistoryEntry {
            group_id,
            timestamp: 0.0,
            backends: BTreeSet::new(),
            empty: true,
        };

        if let Ok(nodes) = doc.get_array("nodes") {
            for node in nodes {
                if let Bson::Document(node_doc) = node {
                    entry.parse_node_entry(node_doc)?;
                }
            }
        }

        Ok(entry)
    }

    fn parse_node_entry(&mut self, doc: &Document) -> Result<()> {
        let Some(timestamp) = doc.get("timestamp").and_then(bson_number) else {
            return Ok(());
        };
        // Keep the most recent entry only.
        if timestamp < self.timestamp {
            return Ok(());
        }

        // Automatic entries reflect what the collector itself observed and
        // must not override monitor data.
        if doc.get_str("type").unwrap_or_default() == "automatic" {
            return Ok(());
        }

        let mut backends = BTreeSet::new();
        if let Ok(set) = doc.get_array("set") {
            for item in set {
                let Bson::Document(backend_doc) = item else {
                    continue;
                };

                let backend_id = backend_doc
                    .get("backend_id")
                    .and_then(bson_number)
                    .ok_or_else(|| CollectorError::malformed("history backend has no 'backend_id'"))?
                    as u64;
                let hostname = backend_doc
                    .get_str("hostname")
                    .map_err(|_| CollectorError::malformed("history backend has no 'hostname'"))?
                    .to_string();
                let port = backend_doc
                    .get("port")
                    .and_then(bson_number)
                    .ok_or_else(|| CollectorError::malformed("history backend has no 'port'"))?
                    as u16;
                let family = backend_doc
                    .get("family")
                    .and_then(bson_number)
                    .ok_or_else(|| CollectorError::malformed("history backend has no 'family'"))?
                    as i32;

                backends.insert(GroupHistoryBackend {
                    hostname,
                    port,
                    family,
                    backend_id,
                });
            }
        }

        self.backends = backends;
        self.timestamp = timestamp;
        self.empty = false;
        Ok(())
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn backends(&self) -> &BTreeSet<GroupHistoryBackend> {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn print_json(&self) -> Value {
        let backends: Vec<Value> = self
            .backends
            .iter()
            .map(|b| {
                json!({
                    "hostname": b.hostname,
                    "port": b.port,
                    "family": b.family,
                    "id": b.backend_id,
                })
            })
            .collect();

        json!({
            "timestamp": self.timestamp,
            "group_id": self.group_id,
            "backends": backends,
        })
    }
}
