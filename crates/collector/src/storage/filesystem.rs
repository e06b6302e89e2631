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

use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FsStatus {
    #[default]
    Ok,
    Broken,
}

impl FsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsStatus::Ok => "OK",
            FsStatus::Broken => "BROKEN",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsStat {
    pub ts_sec: u64,
    pub ts_usec: u64,
    /// Total size of the underlying OS filesystem.
    pub total_space: u64,
}

impl FsStat {
    fn timestamp_us(&self) -> u64 {
        self.ts_sec * 1_000_000 + self.ts_usec
    }
}

/// An OS filesystem hosting one or more backends of a node.
#[derive(Debug, Clone)]
pub struct Filesystem {
    key: String,
    fsid: u64,
    stat: FsStat,
    status: FsStatus,
    backends: BTreeSet<u64>,
}

impl Filesystem {
    pub fn new(node_key: &str, fsid: u64) -> Self {
        Self {
            key: format!("{node_key}/{fsid}"),
            fsid,
            stat: FsStat::default(),
            status: FsStatus::Ok,
            backends: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fsid(&self) -> u64 {
        self.fsid
    }

    pub fn status(&self) -> FsStatus {
        self.status
    }

    pub fn backends(&self) -> &BTreeSet<u64> {
        &self.backends
    }

    pub fn add_backend(&mut self, backend_id: u64) {
        self.backends.insert(backend_id);
    }

    pub fn remove_backend(&mut self, backend_id: u64) {
        self.backends.remove(&backend_id);
    }

    /// Refresh the filesystem stat from one of its backends' vfs block.
    pub fn update(&mut self, ts_sec: u64, ts_usec: u64, vfs_total_space: u64) {
        self.stat.ts_sec = ts_sec;
        self.stat.ts_usec = ts_usec;
        self.stat.total_space = vfs_total_space;
    }

    /// Set status from the summed declared capacity of the live backends on
    /// this filesystem. Returns true when the status changed.
    pub fn update_status(&mut self, backends_total_space: u64) -> bool {
        let prev = self.status;

        self.status = if backends_total_space <= self.stat.total_space {
            FsStatus::Ok
        } else {
            FsStatus::Broken
        };

        if self.status != prev {
            info!(
                "FS {} status change {} -> {}",
                self.key,
                prev.as_str(),
                self.status.as_str()
            );
            return true;
        }

        false
    }

    pub fn merge(&mut self, other: &Filesystem) {
        if self.stat.timestamp_us() < other.stat.timestamp_us() {
            self.stat = other.stat;
            self.status = other.status;
        }
    }

    pub fn print_json(&self, host_addr: &str) -> Value {
        json!({
            "id": self.key,
            "timestamp": {
                "tv_sec": self.stat.ts_sec,
                "tv_usec": self.stat.ts_usec,
            },
            "host": host_addr,
            "fsid": self.fsid,
            "total_space": self.stat.total_space,
            "status": self.status.as_str(),
        })
    }
}
