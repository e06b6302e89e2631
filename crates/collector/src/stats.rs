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

//! Parser for per-node monitor-stats documents.
//!
//! One document describes a whole node: a timestamp, procfs counters, a map
//! of backend blocks and a flat `stats` counter map. Individual fields may
//! be missing or reordered; extraction is best-effort per field, and only a
//! failure to parse the document as a whole skips the node for the round.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::error::Result;
use crate::storage::backend::{BackendStat, CommandStat};

/// EROFS errno; `stat_commit` errors with this code indicate a read-only
/// filesystem underneath the blob store.
const EROFS_CODE: &str = "30";

/// Node-level sample extracted from one monitor-stats document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStatSample {
    pub ts_sec: u64,
    pub ts_usec: u64,
    /// 1-minute load average in integer hundredths.
    pub la1: u64,
    /// Transmitted bytes summed over all non-loopback interfaces.
    pub tx_bytes: u64,
    /// Received bytes summed over all non-loopback interfaces.
    pub rx_bytes: u64,
}

/// Everything extracted from one node's monitor-stats document.
#[derive(Debug, Clone, Default)]
pub struct ParsedStats {
    pub node: NodeStatSample,
    /// Backend stats ordered by backend id. Timestamps are inherited from
    /// the node sample since backend blocks carry none of their own.
    pub backends: Vec<BackendStat>,
    /// backend id → raw `stat_commit` EROFS error counter.
    pub rofs_errors: HashMap<u64, u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDocument {
    timestamp: RawTimeval,
    procfs: RawProcfs,
    backends: HashMap<String, RawBackendEntry>,
    stats: HashMap<String, RawCounter>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawTimeval {
    tv_sec: u64,
    tv_usec: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawProcfs {
    vm: RawVm,
    net: RawNet,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawVm {
    la: Vec<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawNet {
    net_interfaces: HashMap<String, RawInterface>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawInterface {
    receive: RawByteCounter,
    transmit: RawByteCounter,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawByteCounter {
    bytes: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBackendEntry {
    backend_id: u64,
    backend: RawBackendInner,
    commands: HashMap<String, RawCommand>,
    io: RawIo,
    status: RawBackendStatus,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBackendInner {
    base_stats: HashMap<String, RawBaseStat>,
    config: RawBackendConfig,
    dstat: RawDstat,
    summary_stats: RawSummaryStats,
    vfs: RawVfs,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBaseStat {
    base_size: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBackendConfig {
    blob_size: u64,
    blob_size_limit: u64,
    data: String,
    file: String,
    group: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDstat {
    error: u64,
    io_ticks: u64,
    read_ios: u64,
    read_sectors: u64,
    read_ticks: u64,
    write_ios: u64,
    write_ticks: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawSummaryStats {
    base_size: u64,
    records_removed: u64,
    records_removed_size: u64,
    records_total: u64,
    want_defrag: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawVfs {
    bavail: u64,
    blocks: u64,
    bsize: u64,
    error: u64,
    fsid: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCommand {
    cache: RawCommandSide,
    disk: RawCommandSide,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCommandSide {
    internal: RawSizeTime,
    outside: RawSizeTime,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawSizeTime {
    size: u64,
    time: u64,
}

impl RawCommandSide {
    fn size(&self) -> u64 {
        self.internal.size + self.outside.size
    }

    fn time(&self) -> u64 {
        self.internal.time + self.outside.time
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawIo {
    blocking: RawIoQueue,
    nonblocking: RawIoQueue,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawIoQueue {
    current_size: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBackendStatus {
    defrag_state: u64,
    last_start: RawTimeval,
    read_only: bool,
    state: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCounter {
    count: u64,
}

/// Parse one monitor-stats document.
pub fn parse_stats(data: &[u8]) -> Result<ParsedStats> {
    let raw: RawDocument = serde_json::from_slice(data)?;

    let mut node = NodeStatSample {
        ts_sec: raw.timestamp.tv_sec,
        ts_usec: raw.timestamp.tv_usec,
        la1: raw.procfs.vm.la.first().copied().unwrap_or(0),
        ..Default::default()
    };

    for (name, iface) in &raw.procfs.net.net_interfaces {
        if name == "lo" {
            continue;
        }
        node.rx_bytes += iface.receive.bytes;
        node.tx_bytes += iface.transmit.bytes;
    }

    // BTreeMap gives a stable backend order independent of JSON key order.
    let mut backends = BTreeMap::new();
    for entry in raw.backends.values() {
        backends.insert(entry.backend_id, convert_backend(entry));
    }

    Ok(ParsedStats {
        node,
        backends: backends.into_values().collect(),
        rofs_errors: extract_rofs_errors(&raw.stats),
    })
}

fn convert_backend(entry: &RawBackendEntry) -> BackendStat {
    let inner = &entry.backend;

    let mut commands = CommandStat::default();
    for (name, command) in &entry.commands {
        match name.as_str() {
            // Lookups count towards reads.
            "LOOKUP" | "READ" => {
                commands.ell_cache_read_size += command.cache.size();
                commands.ell_cache_read_time += command.cache.time();
                commands.ell_disk_read_size += command.disk.size();
                commands.ell_disk_read_time += command.disk.time();
            }
            "WRITE" => {
                commands.ell_cache_write_size += command.cache.size();
                commands.ell_cache_write_time += command.cache.time();
                commands.ell_disk_write_size += command.disk.size();
                commands.ell_disk_write_time += command.disk.time();
            }
            _ => {}
        }
    }

    BackendStat {
        backend_id: entry.backend_id,
        state: entry.status.state,
        vfs_blocks: inner.vfs.blocks,
        vfs_bavail: inner.vfs.bavail,
        vfs_bsize: inner.vfs.bsize,
        vfs_error: inner.vfs.error,
        fsid: inner.vfs.fsid,
        records_total: inner.summary_stats.records_total,
        records_removed: inner.summary_stats.records_removed,
        records_removed_size: inner.summary_stats.records_removed_size,
        base_size: inner.summary_stats.base_size,
        want_defrag: inner.summary_stats.want_defrag,
        defrag_state: entry.status.defrag_state,
        read_ios: inner.dstat.read_ios,
        write_ios: inner.dstat.write_ios,
        read_ticks: inner.dstat.read_ticks,
        write_ticks: inner.dstat.write_ticks,
        io_ticks: inner.dstat.io_ticks,
        read_sectors: inner.dstat.read_sectors,
        dstat_error: inner.dstat.error,
        blob_size_limit: inner.config.blob_size_limit,
        blob_size: inner.config.blob_size,
        group: inner.config.group,
        data_path: inner.config.data.clone(),
        file_path: inner.config.file.clone(),
        max_blob_base_size: inner.base_stats.values().map(|b| b.base_size).max().unwrap_or(0),
        read_only: entry.status.read_only,
        last_start_ts_sec: entry.status.last_start.tv_sec,
        last_start_ts_usec: entry.status.last_start.tv_usec,
        io_blocking_size: entry.io.blocking.current_size,
        io_nonblocking_size: entry.io.nonblocking.current_size,
        command_stat: commands,
        // Inherited from the node sample by the caller.
        ts_sec: 0,
        ts_usec: 0,
        stat_commit_rofs_errors: 0,
    }
}

/// Pick `eblob.<id>.disk.stat_commit.errors.30` counters out of the flat
/// stats map.
fn extract_rofs_errors(stats: &HashMap<String, RawCounter>) -> HashMap<u64, u64> {
    let mut errors = HashMap::new();
    for (key, counter) in stats {
        let mut parts = key.split('.');
        if parts.next() != Some("eblob") {
            continue;
        }
        let Some(id) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        let tail: Vec<&str> = parts.collect();
        if tail == ["disk", "stat_commit", "errors", EROFS_CODE] {
            errors.insert(id, counter.count);
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_interfaces() {
        // Loopback counters must be ignored.
        let json = r#"
        {
             "procfs": {
                 "net": {
                     "net_interfaces": {
                         "eth0": {
                             "receive": { "bytes": 710009597 },
                             "transmit": { "bytes": 38043292 }
                         },
                         "eth1": {
                             "receive": { "bytes": 15335807301 },
                             "transmit": { "bytes": 10702349567 }
                         },
                         "lo": {
                             "receive": { "bytes": 5980567201 },
                             "transmit": { "bytes": 5980567201 }
                         }
                     }
                 }
             }
        }
        "#;

        let parsed = parse_stats(json.as_bytes()).unwrap();
        assert_eq!(parsed.node.rx_bytes, 16045816898);
        assert_eq!(parsed.node.tx_bytes, 10740392859);
    }

    #[test]
    fn test_max_blob_base_size() {
        // max_blob_base_size is the maximum over base_stats entries.
        let json = r#"
        {
            "backends": {
                "7949": {
                    "backend_id": 7949,
                    "backend": {
                        "base_stats": {
                            "data-0.0": { "base_size": 2503 },
                            "data-1.0": { "base_size": 7011 },
                            "data-2.0": { "base_size": 5101 }
                        }
                    }
                }
            }
        }
        "#;

        let parsed = parse_stats(json.as_bytes()).unwrap();
        assert_eq!(parsed.backends.len(), 1);
        assert_eq!(parsed.backends[0].backend_id, 7949);
        assert_eq!(parsed.backends[0].max_blob_base_size, 7011);
    }

    #[test]
    fn test_commands() {
        // Cache reads sum LOOKUP and READ cache totals over both internal
        // and outside queues; disk reads likewise; writes come from WRITE.
        let json = r#"
        {
            "backends": {
                "13687": {
                    "backend_id": 13687,
                    "commands": {
                        "LOOKUP": {
                            "cache": {
                                "internal": { "size": 23569810725173, "time": 984787292977 },
                                "outside": { "size": 28971867612377, "time": 101891706627377 }
                            },
                            "disk": {
                                "internal": { "size": 312502641817337, "time": 2090731958971 },
                                "outside": { "size": 1144666813351, "time": 251893066721771 }
                            }
                        },
                        "READ": {
                            "cache": {
                                "internal": { "size": 15521512425161, "time": 22543623921839 },
                                "outside": { "size": 140743022331809, "time": 293701205228491 }
                            },
                            "disk": {
                                "internal": { "size": 296541659217403, "time": 87071764919387 },
                                "outside": { "size": 16480592113031, "time": 19792174930169 }
                            }
                        },
                        "WRITE": {
                            "cache": {
                                "internal": { "size": 307251808920601, "time": 30006316647227 },
                                "outside": { "size": 314502224221261, "time": 23647697221787 }
                            },
                            "disk": {
                                "internal": { "size": 6127806619027, "time": 169951005011401 },
                                "outside": { "size": 6416988325967, "time": 9534169012801 }
                            }
                        }
                    }
                }
            }
        }
        "#;

        let parsed = parse_stats(json.as_bytes()).unwrap();
        assert_eq!(parsed.backends.len(), 1);

        let stat = &parsed.backends[0];
        assert_eq!(stat.backend_id, 13687);
        assert_eq!(stat.command_stat.ell_cache_write_size, 621754033141862);
        assert_eq!(stat.command_stat.ell_cache_write_time, 53654013869014);
        assert_eq!(stat.command_stat.ell_disk_write_size, 12544794944994);
        assert_eq!(stat.command_stat.ell_disk_write_time, 179485174024202);
        assert_eq!(stat.command_stat.ell_cache_read_size, 208806213094520);
        assert_eq!(stat.command_stat.ell_cache_read_time, 419121323070684);
        assert_eq!(stat.command_stat.ell_disk_read_size, 626669559961122);
        assert_eq!(stat.command_stat.ell_disk_read_time, 360847738530298);
    }

    #[test]
    fn test_rofs_errors_side_map() {
        // Only the EROFS (30) stat_commit counters are picked up.
        let json = r#"
        {
            "stats": {
                "eblob.111.disk.stat_commit.errors.9": { "count": 27011 },
                "eblob.111.disk.stat_commit.errors.30": { "count": 3119 },
                "eblob.112.disk.stat_commit.errors.30": { "count": 4673 },
                "eblob.bogus.disk.stat_commit.errors.30": { "count": 1 }
            }
        }
        "#;

        let parsed = parse_stats(json.as_bytes()).unwrap();
        assert_eq!(parsed.rofs_errors.len(), 2);
        assert_eq!(parsed.rofs_errors.get(&111), Some(&3119));
        assert_eq!(parsed.rofs_errors.get(&112), Some(&4673));
    }

    #[test]
    fn test_parse_full_backend_fields() {
        // Every known field set non-zero; zero means "was not fetched".
        let json = r#"
        {
            "timestamp": { "tv_sec": 1449495977, "tv_usec": 514751 },
            "procfs": {
                "vm": { "la": [ 11, 33, 44 ] },
                "net": {
                    "net_interfaces": {
                        "eth0": {
                            "receive": { "bytes": 997 },
                            "transmit": { "bytes": 991 }
                        }
                    }
                }
            },
            "backends": {
                "11": {
                    "backend_id": 11,
                    "backend": {
                        "base_stats": {
                            "data-0.0": { "base_size": 2333049988 }
                        },
                        "config": {
                            "blob_size": 53687091262,
                            "blob_size_limit": 5368709142,
                            "data": "/data/path/311",
                            "file": "/file/path/511",
                            "group": 582
                        },
                        "dstat": {
                            "error": 14,
                            "io_ticks": 779584,
                            "read_ios": 11058,
                            "read_sectors": 1508520,
                            "read_ticks": 28230,
                            "write_ios": 153730,
                            "write_ticks": 756474
                        },
                        "summary_stats": {
                            "base_size": 2333049988,
                            "records_removed": 2532,
                            "records_removed_size": 258561190,
                            "records_total": 29644,
                            "want_defrag": 13
                        },
                        "vfs": {
                            "bavail": 477906348,
                            "blocks": 480682480,
                            "bsize": 4110,
                            "error": 16,
                            "fsid": 8323278684798404794
                        }
                    },
                    "io": {
                        "blocking": { "current_size": 510 },
                        "nonblocking": { "current_size": 754 }
                    },
                    "status": {
                        "defrag_state": 348,
                        "last_start": {
                            "tv_sec": 1449503140,
                            "tv_usec": 424972
                        },
                        "read_only": true,
                        "state": 13
                    }
                }
            },
            "stats": {
                "eblob.11.disk.stat_commit.errors.30": { "count": 24760 }
            }
        }
        "#;

        let parsed = parse_stats(json.as_bytes()).unwrap();

        assert_eq!(parsed.node.ts_sec, 1449495977);
        assert_eq!(parsed.node.ts_usec, 514751);
        assert_eq!(parsed.node.la1, 11);
        assert_eq!(parsed.node.tx_bytes, 991);
        assert_eq!(parsed.node.rx_bytes, 997);

        assert_eq!(parsed.backends.len(), 1);
        let stat = &parsed.backends[0];
        assert_eq!(stat.backend_id, 11);
        assert_eq!(stat.read_ios, 11058);
        assert_eq!(stat.write_ios, 153730);
        assert_eq!(stat.read_ticks, 28230);
        assert_eq!(stat.write_ticks, 756474);
        assert_eq!(stat.io_ticks, 779584);
        assert_eq!(stat.read_sectors, 1508520);
        assert_eq!(stat.dstat_error, 14);
        assert_eq!(stat.fsid, 8323278684798404794);
        assert_eq!(stat.vfs_blocks, 480682480);
        assert_eq!(stat.vfs_bavail, 477906348);
        assert_eq!(stat.vfs_bsize, 4110);
        assert_eq!(stat.vfs_error, 16);
        assert_eq!(stat.base_size, 2333049988);
        assert_eq!(stat.records_total, 29644);
        assert_eq!(stat.records_removed, 2532);
        assert_eq!(stat.records_removed_size, 258561190);
        assert_eq!(stat.want_defrag, 13);
        assert_eq!(stat.blob_size_limit, 5368709142);
        assert_eq!(stat.blob_size, 53687091262);
        assert_eq!(stat.group, 582);
        assert_eq!(stat.data_path, "/data/path/311");
        assert_eq!(stat.file_path, "/file/path/511");
        assert_eq!(stat.max_blob_base_size, 2333049988);
        assert_eq!(stat.state, 13);
        assert_eq!(stat.defrag_state, 348);
        assert!(stat.read_only);
        assert_eq!(stat.last_start_ts_sec, 1449503140);
        assert_eq!(stat.last_start_ts_usec, 424972);
        assert_eq!(stat.io_blocking_size, 510);
        assert_eq!(stat.io_nonblocking_size, 754);

        assert_eq!(parsed.rofs_errors.get(&11), Some(&24760));
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_stats(b"{ not json").is_err());
    }

    #[test]
    fn test_missing_fields_tolerated() {
        let parsed = parse_stats(b"{}").unwrap();
        assert_eq!(parsed.node, NodeStatSample::default());
        assert!(parsed.backends.is_empty());
        assert!(parsed.rofs_errors.is_empty());
    }
}
