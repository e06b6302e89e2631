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

//! Declarative cluster harness for integration tests.
//!
//! A [`ClusterSnapshot`] describes hosts, backends, filesystems, groups,
//! jobs and history entries as one JSON document. Applying it to a
//! [`Storage`] synthesizes real monitor-stats documents, feeds them through
//! the production parser, encodes group metadata as msgpack and runs the
//! same processing steps a collection round runs. Tests then assert on the
//! resulting entity graph.

#![allow(dead_code)]

use bson::Document;
use serde::Serialize;
use serde_json::{json, Map, Value};

use mastermind_common::clock_get_real;
use mastermind_collector::stats::parse_stats;
use mastermind_collector::storage::history::GroupHistoryEntry;
use mastermind_collector::storage::job::Job;
use mastermind_collector::storage::Storage;
use mastermind_config::Config;

const DEFAULT_VFS_BLOCKS: u64 = 100_000_000_000;
const DEFAULT_VFS_BAVAIL: u64 = 90_000_000_000;
const DEFAULT_VFS_BSIZE: u64 = 4096;
const DEFAULT_LA: u64 = 50;

/// Declarative cluster description; `update` deep-merges another document
/// into it (`null` removes a key).
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    doc: Value,
}

impl ClusterSnapshot {
    pub fn new(json: &str) -> Self {
        let mut snapshot = Self {
            doc: Value::Object(Map::new()),
        };
        snapshot.update(json);
        snapshot
    }

    pub fn update(&mut self, json: &str) {
        let patch: Value = serde_json::from_str(json).expect("harness document must be valid JSON");
        merge_value(&mut self.doc, &patch);
    }

    /// Fill in entities that exist only by reference: backends listed under
    /// groups, and filesystems referenced by backends.
    pub fn complete(&mut self) {
        // Backends referenced from group descriptions.
        let mut referenced: Vec<(String, u64)> = Vec::new();
        if let Some(groups) = self.doc.get("groups").and_then(Value::as_object) {
            for (group_id, desc) in groups {
                let group_id: u64 = group_id.parse().expect("numeric group key");
                if let Some(backends) = desc.get("backends").and_then(Value::as_array) {
                    for key in backends.iter().filter_map(Value::as_str) {
                        referenced.push((key.to_string(), group_id));
                    }
                }
            }
        }

        let backends = self
            .doc
            .as_object_mut()
            .expect("top-level object")
            .entry("backends")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .expect("backends object");

        for (key, group_id) in referenced {
            let (_, backend_id) = split_backend_key(&key);
            backends.entry(key).or_insert_with(|| {
                json!({
                    "group": group_id,
                    "state": 1,
                    "read_only": false,
                    // A backend needs a non-zero fsid; derive a unique one.
                    "fsid": backend_id + 1_000_000,
                })
            });
        }
    }

    fn timestamp(&self) -> (u64, u64) {
        match self.doc.get("timestamp") {
            Some(ts) => (
                ts.get("tv_sec").and_then(Value::as_u64).unwrap_or(0),
                ts.get("tv_usec").and_then(Value::as_u64).unwrap_or(0),
            ),
            None => {
                let now = clock_get_real();
                (now / 1_000_000_000, (now / 1_000) % 1_000_000)
            }
        }
    }

    fn hosts(&self) -> Vec<(String, Value)> {
        object_entries(self.doc.get("hosts"))
    }

    fn backends(&self) -> Vec<(String, Value)> {
        object_entries(self.doc.get("backends"))
    }

    fn filesystems(&self) -> Vec<(String, Value)> {
        object_entries(self.doc.get("filesystems"))
    }

    fn groups(&self) -> Vec<(String, Value)> {
        object_entries(self.doc.get("groups"))
    }

    fn entries_of(&self, section: &str) -> Vec<Value> {
        self.doc
            .get(section)
            .and_then(|s| s.get("entries"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

fn object_entries(value: Option<&Value>) -> Vec<(String, Value)> {
    value
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn merge_value(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                if value.is_null() {
                    dst_map.remove(key);
                } else {
                    merge_value(dst_map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (dst_slot, other) => *dst_slot = other.clone(),
    }
}

/// `"addr:port:family/backend_id"` → `("addr:port:family", backend_id)`.
fn split_backend_key(key: &str) -> (String, u64) {
    let (node, id) = key.rsplit_once('/').expect("backend key has node/id form");
    (node.to_string(), id.parse().expect("numeric backend id"))
}

/// `"addr:port:family"` → `(addr, port, family)`.
fn split_node_key(key: &str) -> (String, u16, i32) {
    let mut parts = key.rsplitn(3, ':');
    let family: i32 = parts.next().and_then(|p| p.parse().ok()).expect("family");
    let port: u16 = parts.next().and_then(|p| p.parse().ok()).expect("port");
    let addr = parts.next().expect("address").to_string();
    (addr, port, family)
}

#[derive(Serialize)]
struct MetadataServiceDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    job_id: String,
}

#[derive(Serialize)]
struct MetadataV2Doc {
    version: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    frozen: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    couple: Vec<u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    namespace: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    type_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<MetadataServiceDoc>,
}

/// Encode a group metadata description as the msgpack the storage serves.
fn encode_metadata(desc: &Value) -> Vec<u8> {
    let version = desc.get("version").and_then(Value::as_u64).unwrap_or(2);
    let couple: Vec<u64> = desc
        .get("couple")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();

    if version == 1 {
        return rmp_serde::to_vec(&couple).expect("metadata v1 encodes");
    }

    let service = desc.get("service").map(|service| MetadataServiceDoc {
        status: service
            .get("migrating")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            .then(|| "MIGRATING".to_string()),
        job_id: service
            .get("job_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    });

    let doc = MetadataV2Doc {
        version,
        frozen: desc.get("frozen").and_then(Value::as_bool).unwrap_or(false),
        couple,
        namespace: desc
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        type_label: desc
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        service,
    };

    rmp_serde::to_vec_named(&doc).expect("metadata v2 encodes")
}

/// Synthesize one monitor-stats document for a node.
fn monitor_stats_json(snapshot: &ClusterSnapshot, node_key: &str) -> Vec<u8> {
    let (ts_sec, ts_usec) = snapshot.timestamp();

    let filesystems: Map<String, Value> = snapshot.filesystems().into_iter().collect();

    let mut backends = Map::new();
    for (key, desc) in snapshot.backends() {
        let (node, backend_id) = split_backend_key(&key);
        if node != node_key {
            continue;
        }

        let fsid = desc.get("fsid").and_then(Value::as_u64).unwrap_or(0);
        let fs_desc = filesystems.get(&format!("{node_key}/{fsid}"));
        let vfs = fs_desc.and_then(|fs| fs.get("vfs"));
        let vfs_field =
            |name: &str, default: u64| vfs.and_then(|v| v.get(name)).and_then(Value::as_u64).unwrap_or(default);
        // An unspecified bavail means an empty filesystem.
        let vfs_blocks = vfs_field("blocks", DEFAULT_VFS_BLOCKS);
        let vfs_bavail = vfs_field("bavail", vfs_blocks);

        let field = |name: &str, default: u64| desc.get(name).and_then(Value::as_u64).unwrap_or(default);

        backends.insert(
            backend_id.to_string(),
            json!({
                "backend_id": backend_id,
                "status": {
                    "state": field("state", 1),
                    "read_only": desc.get("read_only").and_then(Value::as_bool).unwrap_or(false),
                    "defrag_state": field("defrag_state", 0),
                    "last_start": {
                        "tv_sec": field("last_start_ts_sec", 0),
                        "tv_usec": field("last_start_ts_usec", 0),
                    },
                },
                "backend": {
                    "summary_stats": {
                        "base_size": field("base_size", 0),
                        "records_total": field("records_total", 0),
                        "records_removed": field("records_removed", 0),
                        "records_removed_size": field("records_removed_size", 0),
                    },
                    "config": {
                        "group": field("group", 0),
                        "data": desc.get("data_path").and_then(Value::as_str).unwrap_or(""),
                        "blob_size_limit": field("blob_size_limit", 0),
                    },
                    "vfs": {
                        "fsid": fsid,
                        "blocks": vfs_blocks,
                        "bavail": vfs_bavail,
                        "bsize": vfs_field("bsize", DEFAULT_VFS_BSIZE),
                    },
                    "dstat": {
                        "read_ios": field("read_ios", 0),
                        "write_ios": field("write_ios", 0),
                    },
                },
            }),
        );
    }

    json!({
        "timestamp": { "tv_sec": ts_sec, "tv_usec": ts_usec },
        "procfs": {
            "vm": { "la": [DEFAULT_LA, DEFAULT_LA, DEFAULT_LA] },
            "net": {
                "net_interfaces": {
                    "eth0": {
                        "receive": { "bytes": 0 },
                        "transmit": { "bytes": 0 },
                    },
                },
            },
        },
        "backends": Value::Object(backends),
    })
    .to_string()
    .into_bytes()
}

/// Apply the snapshot description to a storage, the way a round would.
pub fn apply_snapshot(storage: &mut Storage, snapshot: &ClusterSnapshot, config: &Config) {
    // Hosts.
    for (addr, desc) in snapshot.hosts() {
        let host = storage.get_host(&addr);
        if let Some(name) = desc.get("name").and_then(Value::as_str) {
            host.set_name(name);
        }
        if let Some(dc) = desc.get("dc").and_then(Value::as_str) {
            host.set_dc(dc);
        }
    }

    // Nodes, derived from backend keys.
    let mut node_keys: Vec<String> = snapshot
        .backends()
        .iter()
        .map(|(key, _)| split_backend_key(key).0)
        .collect();
    node_keys.sort();
    node_keys.dedup();

    for node_key in &node_keys {
        let (addr, port, family) = split_node_key(node_key);
        if !storage.has_node(&addr, port, family) {
            storage.add_node(&addr, port, family);
        }
    }

    // Monitor stats through the production parser.
    for node_key in &node_keys {
        let body = monitor_stats_json(snapshot, node_key);
        let parsed = parse_stats(&body).expect("harness-generated stats parse");
        let node = storage
            .nodes_mut()
            .get_mut(node_key)
            .expect("node registered above");
        node.apply_stats(parsed, config.reserved_space);
    }

    // History entries.
    let history: Vec<GroupHistoryEntry> = snapshot
        .entries_of("history")
        .iter()
        .map(|entry| {
            let doc: Document = bson::to_document(entry).expect("history entry converts to BSON");
            GroupHistoryEntry::from_bson(&doc).expect("harness history entry parses")
        })
        .collect();
    if !history.is_empty() {
        storage.save_group_history(history, clock_get_real());
    }

    storage.process_node_backends();

    // Jobs.
    let job_entries = snapshot.entries_of("jobs");
    if !job_entries.is_empty() {
        let jobs: Vec<Job> = job_entries
            .iter()
            .map(|entry| {
                let doc: Document = bson::to_document(entry).expect("job entry converts to BSON");
                Job::from_bson(&doc).expect("harness job parses")
            })
            .collect();
        storage.save_new_jobs(jobs, clock_get_real());
    }
    storage.process_new_jobs();

    // Group metadata, msgpack-encoded as the storage would serve it.
    for (group_id, desc) in snapshot.groups() {
        let group_id: u64 = group_id.parse().expect("numeric group key");
        let Some(metadata) = desc.get("metadata") else {
            continue;
        };
        if let Some(group) = storage.get_group_mut(group_id) {
            group.save_metadata(&encode_metadata(metadata), clock_get_real());
        }
    }

    storage.update(config);
}

/// Build a storage from a snapshot description with default configuration.
pub fn create_storage(json: &str) -> Storage {
    create_storage_with_config(json, &Config::default())
}

pub fn create_storage_with_config(json: &str, config: &Config) -> Storage {
    let mut snapshot = ClusterSnapshot::new(json);
    snapshot.complete();

    let mut storage = Storage::new();
    apply_snapshot(&mut storage, &snapshot, config);
    storage
}

/// Snapshot + storage pair for multi-step scenarios.
pub struct StorageUpdater {
    pub snapshot: ClusterSnapshot,
    pub storage: Storage,
    pub config: Config,
}

impl StorageUpdater {
    pub fn new(json: &str) -> Self {
        Self::with_config(json, Config::default())
    }

    pub fn with_config(json: &str, config: Config) -> Self {
        let mut snapshot = ClusterSnapshot::new(json);
        snapshot.complete();
        Self {
            snapshot,
            storage: Storage::new(),
            config,
        }
    }

    /// Merge a patch into the snapshot description. Backends referenced by
    /// newly added groups need an explicit [`Self::complete`] afterwards;
    /// an automatic one would resurrect deliberately removed backends.
    pub fn update(&mut self, json: &str) {
        self.snapshot.update(json);
    }

    pub fn complete(&mut self) {
        self.snapshot.complete();
    }

    pub fn update_all(&mut self) {
        apply_snapshot(&mut self.storage, &self.snapshot, &self.config);
    }
}
