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

use std::ops::AddAssign;

use mastermind_common::{clock_get_real, timeval_user_friendly};
use serde_json::{json, Value};

use crate::storage::filesystem::FsStatus;
use crate::storage::GroupId;

/// Backend state reported by the node; everything else counts as disabled.
pub const BACKEND_STATE_ENABLED: u64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendStatus {
    #[default]
    Init,
    Ok,
    Ro,
    Stalled,
    Broken,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Init => "INIT",
            BackendStatus::Ok => "OK",
            BackendStatus::Ro => "RO",
            BackendStatus::Stalled => "STALLED",
            BackendStatus::Broken => "BROKEN",
        }
    }
}

/// Per-command size/time sums; LOOKUP totals count towards reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStat {
    pub ell_cache_write_size: u64,
    pub ell_cache_write_time: u64,
    pub ell_disk_write_size: u64,
    pub ell_disk_write_time: u64,
    pub ell_cache_read_size: u64,
    pub ell_cache_read_time: u64,
    pub ell_disk_read_size: u64,
    pub ell_disk_read_time: u64,
}

impl CommandStat {
    pub fn clear(&mut self) {
        *self = CommandStat::default();
    }

    pub fn print_json(&self) -> Value {
        json!({
            "ell_cache_write_size": self.ell_cache_write_size,
            "ell_cache_write_time": self.ell_cache_write_time,
            "ell_disk_write_size": self.ell_disk_write_size,
            "ell_disk_write_time": self.ell_disk_write_time,
            "ell_cache_read_size": self.ell_cache_read_size,
            "ell_cache_read_time": self.ell_cache_read_time,
            "ell_disk_read_size": self.ell_disk_read_size,
            "ell_disk_read_time": self.ell_disk_read_time,
        })
    }
}

impl AddAssign<&CommandStat> for CommandStat {
    fn add_assign(&mut self, other: &CommandStat) {
        self.ell_cache_write_size += other.ell_cache_write_size;
        self.ell_cache_write_time += other.ell_cache_write_time;
        self.ell_disk_write_size += other.ell_disk_write_size;
        self.ell_disk_write_time += other.ell_disk_write_time;
        self.ell_cache_read_size += other.ell_cache_read_size;
        self.ell_cache_read_time += other.ell_cache_read_time;
        self.ell_disk_read_size += other.ell_disk_read_size;
        self.ell_disk_read_time += other.ell_disk_read_time;
    }
}

/// Raw backend statistics as last observed from monitor stats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendStat {
    pub ts_sec: u64,
    pub ts_usec: u64,
    pub backend_id: u64,
    pub state: u64,
    pub vfs_blocks: u64,
    pub vfs_bavail: u64,
    pub vfs_bsize: u64,
    pub vfs_error: u64,
    pub records_total: u64,
    pub records_removed: u64,
    pub records_removed_size: u64,
    pub base_size: u64,
    pub fsid: u64,
    pub defrag_state: u64,
    pub want_defrag: u64,
    pub read_ios: u64,
    pub write_ios: u64,
    pub read_ticks: u64,
    pub write_ticks: u64,
    pub io_ticks: u64,
    pub read_sectors: u64,
    pub dstat_error: u64,
    pub blob_size_limit: u64,
    pub max_blob_base_size: u64,
    pub blob_size: u64,
    pub group: GroupId,
    pub data_path: String,
    pub file_path: String,
    pub read_only: bool,
    pub last_start_ts_sec: u64,
    pub last_start_ts_usec: u64,
    pub stat_commit_rofs_errors: u64,
    pub io_blocking_size: u64,
    pub io_nonblocking_size: u64,
    pub command_stat: CommandStat,
}

impl BackendStat {
    pub fn timestamp_us(&self) -> u64 {
        self.ts_sec * 1_000_000 + self.ts_usec
    }

    fn last_start_us(&self) -> u64 {
        self.last_start_ts_sec * 1_000_000 + self.last_start_ts_usec
    }
}

/// Fields computed from the raw stat by the update pass.
#[derive(Debug, Clone, Default)]
pub struct BackendCalculated {
    pub vfs_total_space: u64,
    pub vfs_free_space: u64,
    pub vfs_used_space: u64,
    pub records: u64,
    pub fragmentation: f64,
    pub total_space: u64,
    pub used_space: u64,
    pub free_space: u64,
    pub effective_space: u64,
    pub effective_free_space: u64,
    pub read_rps: u64,
    pub write_rps: u64,
    pub max_read_rps: u64,
    pub max_write_rps: u64,
    pub stat_commit_rofs_errors_diff: u64,
    pub stalled: bool,
    pub status: BackendStatus,
    pub base_path: String,
}

/// A single blob-store unit within a node, bound to one group.
#[derive(Debug, Clone)]
pub struct Backend {
    key: String,
    node_key: String,
    stat: BackendStat,
    calculated: BackendCalculated,
    group: Option<GroupId>,
}

impl Backend {
    pub fn new(node_key: &str, stat: BackendStat) -> Self {
        let mut backend = Self {
            key: format!("{}/{}", node_key, stat.backend_id),
            node_key: node_key.to_string(),
            stat: BackendStat::default(),
            calculated: BackendCalculated::default(),
            group: None,
        };
        backend.calculate_base_path(&stat);
        backend.stat = stat;
        backend
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    pub fn stat(&self) -> &BackendStat {
        &self.stat
    }

    pub fn calculated(&self) -> &BackendCalculated {
        &self.calculated
    }

    pub fn status(&self) -> BackendStatus {
        self.calculated.status
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn set_group(&mut self, group: Option<GroupId>) {
        self.group = group;
    }

    /// Apply a fresh stat observation on top of the previous one.
    ///
    /// Rates are derived only over intervals longer than a second so that a
    /// forced round shortly after a regular one does not produce noise.
    pub fn update(&mut self, stat: BackendStat, node_load_average: f64) {
        let d_ts = (stat.timestamp_us() as f64 - self.stat.timestamp_us() as f64) / 1_000_000.0;

        if d_ts > 1.0 && stat.dstat_error == 0 {
            let read_delta = stat.read_ios.saturating_sub(self.stat.read_ios);
            let write_delta = stat.write_ios.saturating_sub(self.stat.write_ios);
            self.calculated.read_rps = (read_delta as f64 / d_ts) as u64;
            self.calculated.write_rps = (write_delta as f64 / d_ts) as u64;

            let load = node_load_average.max(0.01);
            self.calculated.max_read_rps = (self.calculated.read_rps as f64 / load).max(100.0) as u64;
            self.calculated.max_write_rps = (self.calculated.write_rps as f64 / load).max(100.0) as u64;
        }

        // The error counter is cumulative; it restarts together with the
        // backend, so a last_start advance or a counter drop resets the
        // accumulated difference.
        if self.stat.last_start_us() < stat.last_start_us()
            || self.stat.stat_commit_rofs_errors > stat.stat_commit_rofs_errors
        {
            self.calculated.stat_commit_rofs_errors_diff = 0;
        } else {
            self.calculated.stat_commit_rofs_errors_diff +=
                stat.stat_commit_rofs_errors - self.stat.stat_commit_rofs_errors;
        }

        self.calculate_base_path(&stat);
        self.stat = stat;
    }

    fn calculate_base_path(&mut self, stat: &BackendStat) {
        if !stat.data_path.is_empty() {
            self.calculated.base_path = stat.data_path.clone();
        } else if !stat.file_path.is_empty() {
            self.calculated.base_path = stat.file_path.clone();
        }
    }

    /// Recompute all derived space and record fields.
    pub fn recalculate(&mut self, reserved_space: u64) {
        let calc = &mut self.calculated;
        let stat = &self.stat;

        calc.vfs_total_space = stat.vfs_blocks * stat.vfs_bsize;
        calc.vfs_free_space = stat.vfs_bavail * stat.vfs_bsize;
        calc.vfs_used_space = calc.vfs_total_space.saturating_sub(calc.vfs_free_space);

        calc.records = stat.records_total.saturating_sub(stat.records_removed);
        calc.fragmentation = stat.records_removed as f64 / stat.records_total.max(1) as f64;

        if stat.blob_size_limit > 0 {
            // vfs_total_space can be less than blob_size_limit in case of
            // misconfiguration.
            calc.total_space = stat.blob_size_limit.min(calc.vfs_total_space);
            calc.used_space = stat.base_size;
            calc.free_space = calc.vfs_free_space.min(calc.total_space.saturating_sub(calc.used_space));
        } else {
            calc.total_space = calc.vfs_total_space;
            calc.free_space = calc.vfs_free_space;
            calc.used_space = calc.vfs_used_space;
        }

        let share = if calc.vfs_total_space > 0 {
            calc.total_space as f64 / calc.vfs_total_space as f64
        } else {
            0.0
        };
        let free_space_req_share = (reserved_space as f64 * share).ceil() as u64;
        calc.effective_space = calc.total_space.saturating_sub(free_space_req_share);

        calc.effective_free_space = calc
            .free_space
            .saturating_sub(calc.total_space - calc.effective_space);
    }

    /// Capacity this backend declares on its filesystem: the configured
    /// blob size limit when set, the vfs size otherwise. The filesystem
    /// overcommit check sums this, not the clamped `total_space`.
    pub fn declared_total_space(&self) -> u64 {
        if self.stat.blob_size_limit > 0 {
            self.stat.blob_size_limit
        } else {
            self.calculated.vfs_total_space
        }
    }

    pub fn full(&self) -> bool {
        self.calculated.used_space >= self.calculated.effective_space
            || self.calculated.effective_free_space == 0
    }

    pub fn check_stalled(&mut self, stall_timeout_sec: u64) {
        let now_sec = clock_get_real() / 1_000_000_000;

        if now_sec <= self.stat.ts_sec {
            self.calculated.stalled = false;
            return;
        }

        self.calculated.stalled = (now_sec - self.stat.ts_sec) > stall_timeout_sec;
    }

    pub fn update_status(&mut self, fs_status: Option<FsStatus>) {
        self.calculated.status = if self.calculated.stalled
            || self.stat.state != BACKEND_STATE_ENABLED
            || fs_status.is_none()
        {
            BackendStatus::Stalled
        } else if fs_status == Some(FsStatus::Broken) {
            BackendStatus::Broken
        } else if self.stat.read_only || self.calculated.stat_commit_rofs_errors_diff > 0 {
            BackendStatus::Ro
        } else {
            BackendStatus::Ok
        };
    }

    /// Keep the side with the newer stat; report if this one is fresher.
    pub fn merge(&mut self, other: &Backend, have_newer: &mut bool) {
        let my_ts = self.stat.timestamp_us();
        let other_ts = other.stat.timestamp_us();
        if my_ts < other_ts {
            self.stat = other.stat.clone();
            self.calculated = other.calculated.clone();
        } else if my_ts > other_ts {
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
            "timestamp": timestamp,
            "node": self.node_key,
            "backend_id": self.stat.backend_id,
            "addr": self.key,
            "state": self.stat.state,
            "vfs_blocks": self.stat.vfs_blocks,
            "vfs_bavail": self.stat.vfs_bavail,
            "vfs_bsize": self.stat.vfs_bsize,
            "records_total": self.stat.records_total,
            "records_removed": self.stat.records_removed,
            "records_removed_size": self.stat.records_removed_size,
            "base_size": self.stat.base_size,
            "fsid": self.stat.fsid,
            "defrag_state": self.stat.defrag_state,
            "want_defrag": self.stat.want_defrag,
            "read_ios": self.stat.read_ios,
            "write_ios": self.stat.write_ios,
            "dstat_error": self.stat.dstat_error,
            "blob_size_limit": self.stat.blob_size_limit,
            "max_blob_base_size": self.stat.max_blob_base_size,
            "blob_size": self.stat.blob_size,
            "group": self.stat.group,
            "vfs_free_space": self.calculated.vfs_free_space,
            "vfs_total_space": self.calculated.vfs_total_space,
            "vfs_used_space": self.calculated.vfs_used_space,
            "records": self.calculated.records,
            "free_space": self.calculated.free_space,
            "total_space": self.calculated.total_space,
            "used_space": self.calculated.used_space,
            "effective_space": self.calculated.effective_space,
            "effective_free_space": self.calculated.effective_free_space,
            "fragmentation": self.calculated.fragmentation,
            "read_rps": self.calculated.read_rps,
            "write_rps": self.calculated.write_rps,
            "max_read_rps": self.calculated.max_read_rps,
            "max_write_rps": self.calculated.max_write_rps,
            "status": self.calculated.status.as_str(),
            "last_start": {
                "ts_sec": self.stat.last_start_ts_sec,
                "ts_usec": self.stat.last_start_ts_usec,
            },
            "read_only": self.stat.read_only,
            "stat_commit_rofs_errors_diff": self.calculated.stat_commit_rofs_errors_diff,
            "base_path": self.calculated.base_path,
        });

        if show_internals {
            value["stat_commit_rofs_errors"] = Value::from(self.stat.stat_commit_rofs_errors);
            value["stalled"] = Value::from(self.calculated.stalled);
            value["data_path"] = Value::from(self.stat.data_path.clone());
            value["file_path"] = Value::from(self.stat.file_path.clone());
        }

        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_stat(backend_id: u64) -> BackendStat {
        BackendStat {
            backend_id,
            state: BACKEND_STATE_ENABLED,
            group: 1,
            fsid: 1,
            vfs_blocks: 480682466,
            vfs_bavail: 477906313,
            vfs_bsize: 4096,
            ts_sec: 1449495977,
            ts_usec: 514751,
            ..Default::default()
        }
    }

    #[test]
    fn test_recalculate_without_limit() {
        let mut backend = Backend::new("::1:1025:10", enabled_stat(1));
        backend.recalculate(0);

        let calc = backend.calculated();
        assert_eq!(calc.vfs_total_space, 480682466 * 4096);
        assert_eq!(calc.vfs_free_space, 477906313 * 4096);
        assert_eq!(calc.total_space, calc.vfs_total_space);
        assert_eq!(calc.free_space, calc.vfs_free_space);
        assert_eq!(calc.used_space, calc.vfs_used_space);
        assert_eq!(calc.effective_space, calc.total_space);
    }

    #[test]
    fn test_recalculate_with_limit() {
        let mut stat = enabled_stat(1);
        stat.blob_size_limit = 135211301;
        stat.base_size = 1024;

        let mut backend = Backend::new("::1:1025:10", stat);
        backend.recalculate(0);

        assert_eq!(backend.calculated().total_space, 135211301);
        assert_eq!(backend.calculated().used_space, 1024);
    }

    #[test]
    fn test_effective_space_reservation() {
        // One-backend filesystem: share is total/vfs_total, the reserved
        // space is charged proportionally.
        let mut stat = enabled_stat(1);
        stat.vfs_blocks = 1000;
        stat.vfs_bavail = 1000;
        stat.vfs_bsize = 4096;

        let mut backend = Backend::new("::1:1025:10", stat);
        backend.recalculate(409600);

        // share == 1.0, so the full reservation applies.
        assert_eq!(backend.calculated().effective_space, 4096000 - 409600);
    }

    #[test]
    fn test_rofs_errors_diff_accumulates_and_resets() {
        let mut stat = enabled_stat(1);
        stat.stat_commit_rofs_errors = 100;
        let mut backend = Backend::new("::1:1025:10", stat.clone());

        // Counter grows: difference accumulates.
        stat.ts_sec += 60;
        stat.stat_commit_rofs_errors = 103;
        backend.update(stat.clone(), 0.5);
        assert_eq!(backend.calculated().stat_commit_rofs_errors_diff, 3);

        stat.ts_sec += 60;
        stat.stat_commit_rofs_errors = 105;
        backend.update(stat.clone(), 0.5);
        assert_eq!(backend.calculated().stat_commit_rofs_errors_diff, 5);

        // Restart detected via last_start advance: diff resets.
        stat.ts_sec += 60;
        stat.last_start_ts_sec += 1000;
        stat.stat_commit_rofs_errors = 107;
        backend.update(stat.clone(), 0.5);
        assert_eq!(backend.calculated().stat_commit_rofs_errors_diff, 0);

        // Counter dropped: also a restart.
        stat.ts_sec += 60;
        stat.stat_commit_rofs_errors = 1;
        backend.update(stat, 0.5);
        assert_eq!(backend.calculated().stat_commit_rofs_errors_diff, 0);
    }

    #[test]
    fn test_rps_derivation() {
        let mut stat = enabled_stat(1);
        stat.read_ios = 1000;
        stat.write_ios = 500;
        let mut backend = Backend::new("::1:1025:10", stat.clone());

        stat.ts_sec += 10;
        stat.read_ios = 2000;
        stat.write_ios = 700;
        backend.update(stat.clone(), 0.5);

        assert_eq!(backend.calculated().read_rps, 100);
        assert_eq!(backend.calculated().write_rps, 20);
        assert_eq!(backend.calculated().max_read_rps, 200);
        assert_eq!(backend.calculated().max_write_rps, 100); // formula floor

        // Sub-second interval: rates keep their previous values.
        stat.ts_usec += 1000;
        stat.read_ios = 5000;
        backend.update(stat, 0.5);
        assert_eq!(backend.calculated().read_rps, 100);
    }

    #[test]
    fn test_merge_prefers_newer() {
        let mut old_stat = enabled_stat(1);
        old_stat.ts_sec = 100;
        let mut newer_stat = enabled_stat(1);
        newer_stat.ts_sec = 200;
        newer_stat.read_only = true;

        let mut mine = Backend::new("::1:1025:10", old_stat);
        let other = Backend::new("::1:1025:10", newer_stat);

        let mut have_newer = false;
        mine.merge(&other, &mut have_newer);
        assert!(!have_newer);
        assert!(mine.stat().read_only);

        // The reverse direction reports that this side is fresher.
        let mut oldest_stat = enabled_stat(1);
        oldest_stat.ts_sec = 50;
        let older = Backend::new("::1:1025:10", oldest_stat);

        let mut have_newer = false;
        mine.merge(&older, &mut have_newer);
        assert!(have_newer);
    }
}
