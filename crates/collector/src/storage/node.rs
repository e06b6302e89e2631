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

use std::collections::BTreeMap;

use mastermind_common::{timeval_user_friendly, Stopwatch};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::stats::{NodeStatSample, ParsedStats};
use crate::storage::backend::{Backend, BackendStat, CommandStat};
use crate::storage::filesystem::Filesystem;

/// Node-level statistics with derived rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStat {
    pub ts_sec: u64,
    pub ts_usec: u64,
    pub la1: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub load_average: f64,
    pub tx_rate: f64,
    pub rx_rate: f64,
}

impl NodeStat {
    pub fn timestamp_us(&self) -> u64 {
        self.ts_sec * 1_000_000 + self.ts_usec
    }
}

/// Per-node stage durations, sampled into summary distributions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeClockStat {
    pub stats_parse: u64,
    pub update_fs: u64,
}

/// A storage process endpoint, identified by `"addr:port:family"`.
///
/// Owns the backends and filesystems observed on it.
#[derive(Debug, Clone)]
pub struct Node {
    key: String,
    host_addr: String,
    port: u16,
    family: i32,
    stat: NodeStat,
    backends: BTreeMap<u64, Backend>,
    filesystems: BTreeMap<u64, Filesystem>,
    command_stat: CommandStat,
    clock: NodeClockStat,
}

impl Node {
    pub fn key_for(host_addr: &str, port: u16, family: i32) -> String {
        format!("{host_addr}:{port}:{family}")
    }

    pub fn new(host_addr: &str, port: u16, family: i32) -> Self {
        Self {
            key: Self::key_for(host_addr, port, family),
            host_addr: host_addr.to_string(),
            port,
            family,
            stat: NodeStat::default(),
            backends: BTreeMap::new(),
            filesystems: BTreeMap::new(),
            command_stat: CommandStat::default(),
            clock: NodeClockStat::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host_addr(&self) -> &str {
        &self.host_addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> i32 {
        self.family
    }

    pub fn stat(&self) -> &NodeStat {
        &self.stat
    }

    pub fn clock(&self) -> &NodeClockStat {
        &self.clock
    }

    pub fn set_stats_parse_duration(&mut self, nsec: u64) {
        self.clock.stats_parse = nsec;
    }

    pub fn backends(&self) -> &BTreeMap<u64, Backend> {
        &self.backends
    }

    pub fn backend(&self, backend_id: u64) -> Option<&Backend> {
        self.backends.get(&backend_id)
    }

    pub fn backend_mut(&mut self, backend_id: u64) -> Option<&mut Backend> {
        self.backends.get_mut(&backend_id)
    }

    pub fn filesystems(&self) -> &BTreeMap<u64, Filesystem> {
        &self.filesystems
    }

    /// Apply one parsed monitor-stats document.
    pub fn apply_stats(&mut self, parsed: ParsedStats, reserved_space: u64) {
        self.update(parsed.node);

        self.command_stat.clear();

        for mut stat in parsed.backends {
            // Backend blocks in the document carry no timestamps of their
            // own; they inherit the node timestamp.
            stat.ts_sec = parsed.node.ts_sec;
            stat.ts_usec = parsed.node.ts_usec;

            if let Some(&errors) = parsed.rofs_errors.get(&stat.backend_id) {
                stat.stat_commit_rofs_errors = errors;
            }

            self.handle_backend(stat, reserved_space);
        }
    }

    fn update(&mut self, sample: NodeStatSample) {
        let d_ts = (sample.ts_sec as f64 + sample.ts_usec as f64 / 1_000_000.0)
            - (self.stat.ts_sec as f64 + self.stat.ts_usec as f64 / 1_000_000.0);

        if d_ts > 1.0 {
            if self.stat.tx_bytes < sample.tx_bytes {
                self.stat.tx_rate = (sample.tx_bytes - self.stat.tx_bytes) as f64 / d_ts;
            }
            if self.stat.rx_bytes < sample.rx_bytes {
                self.stat.rx_rate = (sample.rx_bytes - self.stat.rx_bytes) as f64 / d_ts;
            }
        }

        self.stat.load_average = sample.la1 as f64 / 100.0;
        self.stat.ts_sec = sample.ts_sec;
        self.stat.ts_usec = sample.ts_usec;
        self.stat.la1 = sample.la1;
        self.stat.tx_bytes = sample.tx_bytes;
        self.stat.rx_bytes = sample.rx_bytes;
    }

    fn get_fs(&mut self, fsid: u64) -> &mut Filesystem {
        let key = &self.key;
        self.filesystems
            .entry(fsid)
            .or_insert_with(|| Filesystem::new(key, fsid))
    }

    fn handle_backend(&mut self, stat: BackendStat, reserved_space: u64) {
        if stat.group == 0 {
            debug!("Skipping backend {}/{} with zero group id", self.key, stat.backend_id);
            return;
        }

        if stat.fsid == 0 {
            error!("Skipping backend {}/{} with zero fsid", self.key, stat.backend_id);
            return;
        }

        let backend_id = stat.backend_id;
        let found = self.backends.contains_key(&backend_id);
        if !found && stat.state == 0 {
            debug!("Skipping new backend {}/{} in state zero", self.key, backend_id);
            return;
        }

        let load_average = self.stat.load_average;
        let new_fsid = stat.fsid;
        let mut old_fsid = 0;

        if found {
            let backend = self.backends.get_mut(&backend_id).expect("checked above");
            old_fsid = backend.stat().fsid;
            backend.update(stat, load_average);
        } else {
            let backend = Backend::new(&self.key, stat);
            self.backends.insert(backend_id, backend);
        }

        if new_fsid != old_fsid {
            if found {
                info!(
                    "Updating backend {}/{}: FS changed from {} to {}",
                    self.key, backend_id, old_fsid, new_fsid
                );
            }
            if old_fsid != 0 {
                self.get_fs(old_fsid).remove_backend(backend_id);
            }
            self.get_fs(new_fsid).add_backend(backend_id);
        }

        let backend = self.backends.get_mut(&backend_id).expect("just inserted");
        backend.recalculate(reserved_space);

        let (ts_sec, ts_usec, vfs_total) = {
            let stat = backend.stat();
            (stat.ts_sec, stat.ts_usec, backend.calculated().vfs_total_space)
        };
        let command_stat = backend.stat().command_stat;

        self.get_fs(new_fsid).update(ts_sec, ts_usec, vfs_total);
        self.command_stat += &command_stat;
    }

    /// Re-derive stalled flags and statuses for every backend.
    pub fn update_backend_status(&mut self, stall_timeout_sec: u64) {
        let ids: Vec<u64> = self.backends.keys().copied().collect();
        for backend_id in ids {
            let fs_status = {
                let backend = &self.backends[&backend_id];
                self.filesystems.get(&backend.stat().fsid).map(|fs| fs.status())
            };
            let backend = self.backends.get_mut(&backend_id).expect("iterating own keys");
            backend.check_stalled(stall_timeout_sec);
            backend.update_status(fs_status);
        }
    }

    /// Recompute filesystem statuses; a change re-statuses the backends of
    /// the affected filesystem.
    pub fn update_filesystems(&mut self, stall_timeout_sec: u64) {
        let mut elapsed = 0;
        {
            let _watch = Stopwatch::new(&mut elapsed);

            let fsids: Vec<u64> = self.filesystems.keys().copied().collect();
            for fsid in fsids {
                let total: u64 = self.filesystems[&fsid]
                    .backends()
                    .iter()
                    .filter_map(|id| self.backends.get(id))
                    .filter(|b| {
                        use crate::storage::backend::BackendStatus;
                        matches!(b.status(), BackendStatus::Ok | BackendStatus::Broken)
                    })
                    .map(|b| b.declared_total_space())
                    .sum();

                let changed = self
                    .filesystems
                    .get_mut(&fsid)
                    .expect("iterating own keys")
                    .update_status(total);

                if changed {
                    let fs_status = self.filesystems[&fsid].status();
                    let ids: Vec<u64> = self.filesystems[&fsid].backends().iter().copied().collect();
                    for backend_id in ids {
                        if let Some(backend) = self.backends.get_mut(&backend_id) {
                            backend.check_stalled(stall_timeout_sec);
                            backend.update_status(Some(fs_status));
                        }
                    }
                }
            }
        }
        self.clock.update_fs = elapsed;
    }

    /// Fold another observation of the same node into this one.
    pub fn merge(&mut self, other: &Node, have_newer: &mut bool) {
        let my_ts = self.stat.timestamp_us();
        let other_ts = other.stat.timestamp_us();
        if my_ts < other_ts {
            self.stat = other.stat;
            self.clock = other.clock;
            self.command_stat = other.command_stat;
        } else if my_ts > other_ts {
            *have_newer = true;
        }

        self.merge_backends(other, have_newer);

        for (fsid, other_fs) in &other.filesystems {
            match self.filesystems.get_mut(fsid) {
                Some(mine) => mine.merge(other_fs),
                None => {
                    self.filesystems.insert(*fsid, other_fs.clone());
                }
            }
        }
        if self.filesystems.keys().any(|fsid| !other.filesystems.contains_key(fsid)) {
            *have_newer = true;
        }
    }

    fn merge_backends(&mut self, other: &Node, have_newer: &mut bool) {
        for (backend_id, other_backend) in &other.backends {
            match self.backends.get(backend_id) {
                Some(mine) => {
                    // A newer observation may have moved the backend to a
                    // different filesystem.
                    let old_fsid = mine.stat().fsid;
                    let new_fsid = other_backend.stat().fsid;
                    let other_is_newer =
                        mine.stat().timestamp_us() < other_backend.stat().timestamp_us();

                    if other_is_newer && old_fsid != new_fsid {
                        info!(
                            "Merging backend {}: FS changed from {} to {}",
                            mine.key(),
                            old_fsid,
                            new_fsid
                        );
                        if old_fsid != 0 {
                            self.get_fs(old_fsid).remove_backend(*backend_id);
                        }
                        self.get_fs(new_fsid).add_backend(*backend_id);
                    }

                    self.backends
                        .get_mut(backend_id)
                        .expect("present above")
                        .merge(other_backend, have_newer);
                }
                None => {
                    let fsid = other_backend.stat().fsid;
                    self.backends.insert(*backend_id, other_backend.clone());
                    self.get_fs(fsid).add_backend(*backend_id);
                }
            }
        }

        if self.backends.len() > other.backends.len() {
            *have_newer = true;
        }
    }

    pub fn print_json(&self, show_internals: bool) -> Value {
        let mut timestamp = json!({
            "tv_sec": self.stat.ts_sec,
            "tv_usec": self.stat.ts_usec,
        });
        if show_internals {
            timestamp["user_friendly"] =
                Value::from(timeval_user_friendly(self.stat.ts_sec, self.stat.ts_usec));
        }

        let mut value = json!({
            "id": self.key,
            "timestamp": timestamp,
            "host_id": self.host_addr,
            "port": self.port,
            "family": self.family,
            "tx_bytes": self.stat.tx_bytes,
            "rx_bytes": self.stat.rx_bytes,
            "load_average": self.stat.load_average,
            "tx_rate": self.stat.tx_rate,
            "rx_rate": self.stat.rx_rate,
            "commands_stat": self.command_stat.print_json(),
        });

        if show_internals {
            value["la"] = Value::from(self.stat.la1);
            value["clock_stat"] = json!({
                "stats_parse": self.clock.stats_parse,
                "update_fs": self.clock.update_fs,
            });
        }

        value
    }
}
