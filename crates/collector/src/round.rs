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

//! One collection round.
//!
//! A round owns a private clone of the current snapshot and the version it
//! was cloned from. It runs two legs concurrently (the metadata-database
//! fetch and the per-node HTTP stats fan-out), joins them, reconciles
//! groups and jobs, fans out per-group metadata reads, runs the
//! derive-and-status pass and hands itself to the collector for the CAS
//! install.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use mastermind_common::{clock_get_real, Stopwatch};
use mastermind_config::Config;
use tracing::{debug, error, info};

use crate::error::{CollectorError, Result};
use crate::filter::Filter;
use crate::jobs_db;
use crate::stats::{parse_stats, ParsedStats};
use crate::storage::{GroupId, Storage};

/// Monitor categories requested from every node.
pub mod monitor_categories {
    pub const CACHE: u32 = 1 << 0;
    pub const IO: u32 = 1 << 1;
    pub const COMMANDS: u32 = 1 << 2;
    pub const IO_HISTOGRAMS: u32 = 1 << 3;
    pub const CALL_TREE: u32 = 1 << 4;
    pub const BACKEND: u32 = 1 << 5;
    pub const STATS: u32 = 1 << 6;
    pub const PROCFS: u32 = 1 << 7;

    /// Everything the collector consumes.
    pub const REQUESTED: u32 = PROCFS | BACKEND | STATS | COMMANDS | IO;
}

/// Concurrent in-flight stat downloads.
const DOWNLOAD_CONCURRENCY: usize = 64;

/// Concurrent in-flight metadata reads.
const METADATA_READ_CONCURRENCY: usize = 128;

/// A group metadata blob with its storage timestamp.
#[derive(Debug, Clone)]
pub struct MetadataPayload {
    pub data: Bytes,
    pub timestamp_ns: u64,
}

/// Key-value read of one group's `symmetric_groups` key in the
/// `metabalancer` namespace, routed to the group. The storage client
/// implementing this is an external collaborator.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn read(&self, group_id: GroupId) -> Result<MetadataPayload>;
}

/// Metadata source used when no storage client is wired in; every group
/// records a download failure.
pub struct NullMetadataSource;

#[async_trait]
impl MetadataSource for NullMetadataSource {
    async fn read(&self, _group_id: GroupId) -> Result<MetadataPayload> {
        Err(CollectorError::NotConfigured("metadata source"))
    }
}

/// Everything a round needs besides its snapshot.
pub struct RoundContext {
    pub config: Config,
    pub http: reqwest::Client,
    pub metadata_source: Arc<dyn MetadataSource>,
}

impl RoundContext {
    pub fn new(config: Config, metadata_source: Arc<dyn MetadataSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .deflate(true)
            .gzip(true)
            .build()?;
        Ok(Self {
            config,
            http,
            metadata_source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundType {
    Regular,
    ForcedFull,
    ForcedPartial,
}

impl RoundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundType::Regular => "regular",
            RoundType::ForcedFull => "forced full",
            RoundType::ForcedPartial => "forced partial",
        }
    }
}

/// Per-stage durations of one round, nanoseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundClockStat {
    pub total: u64,
    pub mongo: u64,
    pub perform_download: u64,
    pub finish_monitor_stats_and_jobs: u64,
    pub metadata_download: u64,
    pub storage_update: u64,
    pub merge_time: u64,
}

pub struct Round {
    pub storage: Storage,
    pub old_version: u64,
    pub round_type: RoundType,
    pub filter: Option<Filter>,
    pub clock: RoundClockStat,
    pub started: Instant,
}

impl Round {
    pub fn new(storage: Storage, old_version: u64, round_type: RoundType, filter: Option<Filter>) -> Self {
        Self {
            storage,
            old_version,
            round_type,
            filter,
            clock: RoundClockStat::default(),
            started: Instant::now(),
        }
    }

    /// Run the pipeline through the update pass. CAS install is the
    /// collector's business.
    pub async fn run(mut self, ctx: &RoundContext) -> Self {
        // Scope selection for partial rounds happens against the round's
        // own snapshot before any I/O.
        let selected = self
            .filter
            .as_ref()
            .map(|filter| self.storage.select(filter));

        let node_targets: Vec<(String, String)> = self
            .storage
            .nodes()
            .values()
            .filter(|node| {
                selected
                    .as_ref()
                    .map(|s| s.nodes.contains(node.key()))
                    .unwrap_or(true)
            })
            .map(|node| (node.key().to_string(), node.host_addr().to_string()))
            .collect();

        info!(
            "Starting {} round with {} nodes",
            self.round_type.as_str(),
            node_targets.len()
        );

        // The approximate time collection started; used to filter history
        // entries on the first round.
        let start_ts = clock_get_real();

        let db_future = async {
            let begin = Instant::now();
            let fetched = jobs_db::fetch_jobs_and_history(
                &ctx.config,
                self.storage.group_history_ts(),
                start_ts,
            )
            .await;
            (fetched, begin.elapsed().as_nanos() as u64)
        };

        let download_future = async {
            let begin = Instant::now();
            let parsed = download_and_parse(ctx, &node_targets).await;
            (parsed, begin.elapsed().as_nanos() as u64)
        };

        let ((db_result, mongo_ns), (parsed_nodes, download_ns)) =
            tokio::join!(db_future, download_future);
        self.clock.mongo = mongo_ns;
        self.clock.perform_download = download_ns;

        {
            let mut elapsed = 0;
            {
                let _watch = Stopwatch::new(&mut elapsed);

                if let Some((jobs, ts)) = db_result.jobs {
                    self.storage.save_new_jobs(jobs, ts);
                }
                self.storage
                    .save_group_history(db_result.history, db_result.history_fetch_ts);

                let reserved_space = ctx.config.reserved_space;
                for (node_key, parsed, parse_ns) in parsed_nodes {
                    if let Some(node) = self.storage.nodes_mut().get_mut(&node_key) {
                        node.apply_stats(parsed, reserved_space);
                        node.set_stats_parse_duration(parse_ns);
                    }
                }

                self.storage.process_node_backends();
                self.storage.process_new_jobs();
            }
            self.clock.finish_monitor_stats_and_jobs = elapsed;
        }

        // Metadata reads go to every known group, or to the selected ones
        // on a partial round.
        let group_ids: Vec<GroupId> = match &selected {
            Some(entries) => entries.groups.iter().copied().collect(),
            None => self.storage.groups().keys().copied().collect(),
        };

        if group_ids.is_empty() {
            info!("No groups to download metadata");
        } else {
            info!("Scheduling metadata download for {} groups", group_ids.len());

            let mut elapsed = 0;
            {
                let _watch = Stopwatch::new(&mut elapsed);

                let source = ctx.metadata_source.clone();
                let results: Vec<(GroupId, Result<MetadataPayload>)> = stream::iter(group_ids)
                    .map(|group_id| {
                        let source = source.clone();
                        async move {
                            debug!("Scheduling metadata download for group {}", group_id);
                            (group_id, source.read(group_id).await)
                        }
                    })
                    .buffer_unordered(METADATA_READ_CONCURRENCY)
                    .collect()
                    .await;

                for (group_id, result) in results {
                    let Some(group) = self.storage.get_group_mut(group_id) else {
                        continue;
                    };
                    match result {
                        Ok(payload) => group.save_metadata(&payload.data, payload.timestamp_ns),
                        Err(e) => group.handle_metadata_download_failed(e.to_string()),
                    }
                }
            }
            self.clock.metadata_download = elapsed;
            info!("Group metadata download completed");
        }

        {
            let mut elapsed = 0;
            {
                let _watch = Stopwatch::new(&mut elapsed);
                self.storage.update(&ctx.config);
            }
            self.clock.storage_update = elapsed;
        }

        self
    }
}

/// Download monitor stats from every target and parse each response.
/// Failures are logged and dropped; the round proceeds with the rest.
async fn download_and_parse(
    ctx: &RoundContext,
    targets: &[(String, String)],
) -> Vec<(String, ParsedStats, u64)> {
    let monitor_port = ctx.config.monitor_port;
    let wait_timeout = Duration::from_secs(ctx.config.wait_timeout);

    stream::iter(targets.iter().cloned())
        .map(|(node_key, host_addr)| {
            let http = ctx.http.clone();
            async move {
                debug!("Scheduling stat download for node {}", node_key);

                // Literal IPv6 addresses need brackets in a URL authority.
                let url_host = if host_addr.contains(':') && !host_addr.starts_with('[') {
                    format!("[{host_addr}]")
                } else {
                    host_addr
                };
                let url = format!(
                    "http://{}:{}/?categories={}",
                    url_host,
                    monitor_port,
                    monitor_categories::REQUESTED
                );

                let body = match download_node(&http, &url, wait_timeout).await {
                    Ok(body) => body,
                    Err(e) => {
                        error!("Node {} stats download failed, result: {}", node_key, e);
                        return None;
                    }
                };
                info!("Node {} stat download completed", node_key);

                let mut parse_ns = 0;
                let parsed = {
                    let _watch = Stopwatch::new(&mut parse_ns);
                    parse_stats(&body)
                };
                match parsed {
                    Ok(parsed) => Some((node_key, parsed, parse_ns)),
                    Err(e) => {
                        error!("Error parsing stats for node {}: {}", node_key, e);
                        None
                    }
                }
            }
        })
        .buffer_unordered(DOWNLOAD_CONCURRENCY)
        .filter_map(|item| async move { item })
        .collect()
        .await
}

async fn download_node(http: &reqwest::Client, url: &str, timeout: Duration) -> Result<Bytes> {
    let response = http.get(url).timeout(timeout).send().await?;
    Ok(response.error_for_status()?.bytes().await?)
}
