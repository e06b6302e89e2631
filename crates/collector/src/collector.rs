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

//! The collector: owner of the installed snapshot.
//!
//! All reads and writes of the `(snapshot, version)` pair happen on one
//! event-loop task draining a command channel, so readers always observe a
//! consistent pair. Rounds run on their own tasks against their own
//! snapshot clones and come back through the channel for a sequenced CAS
//! install.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mastermind_common::{Distribution, Stopwatch};
use mastermind_config::Config;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::discovery::{Discovery, Inventory, RouteTable};
use crate::error::{CollectorError, Result};
use crate::filter::Filter;
use crate::round::{MetadataSource, Round, RoundClockStat, RoundContext, RoundType};
use crate::storage::Storage;

/// Period between regular rounds.
const ROUND_PERIOD: Duration = Duration::from_secs(60);

/// The `(snapshot, version)` pair with its compare-and-swap discipline.
///
/// A round installs atomically iff the version it started from is still
/// current; otherwise it merges the installed snapshot into its own and
/// retries, or is discarded when the merge found nothing the installed
/// snapshot lacks.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    storage: Storage,
    version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Discarded,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self {
            storage: Storage::new(),
            version: 1,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn install(&mut self, round: &mut Round) -> InstallOutcome {
        loop {
            if self.version == round.old_version {
                info!("Swapping storage");
                self.storage = std::mem::take(&mut round.storage);
                self.version += 1;
                return InstallOutcome::Installed;
            }

            info!(
                "Collector's storage has newer version {} (round's one has {})",
                self.version, round.old_version
            );

            let mut have_newer = false;
            let mut elapsed = 0;
            {
                let _watch = Stopwatch::new(&mut elapsed);
                round.storage.merge(&self.storage, &mut have_newer);
            }
            round.clock.merge_time += elapsed;
            round.old_version = self.version;

            if !have_newer {
                info!("Existing storage is up-to-date, not performing swap");
                return InstallOutcome::Discarded;
            }

            info!("Storage updated, retrying compare-and-swap");
        }
    }
}

enum Command {
    StartRegularRound,
    ForceUpdate {
        reply: oneshot::Sender<String>,
    },
    Refresh {
        filter: Filter,
        reply: oneshot::Sender<String>,
    },
    GetSnapshot {
        filter: Filter,
        reply: oneshot::Sender<String>,
    },
    Summary {
        reply: oneshot::Sender<String>,
    },
    RoundComplete {
        round: Box<Round>,
        reply: Option<oneshot::Sender<String>>,
    },
}

/// Handle to the collector event loop.
#[derive(Clone)]
pub struct Collector {
    tx: mpsc::Sender<Command>,
}

impl Collector {
    /// Start the collector: initial inventory fetch, then the first round,
    /// then a regular round every minute.
    pub fn spawn(
        config: Config,
        route_table: Arc<dyn RouteTable>,
        inventory: Arc<dyn Inventory>,
        metadata_source: Arc<dyn MetadataSource>,
    ) -> Result<Self> {
        let lookup_timeout = Duration::from_secs(config.wait_timeout);
        let ctx = Arc::new(RoundContext::new(config, metadata_source)?);
        let (tx, rx) = mpsc::channel(128);

        let service = CollectorService {
            cell: SnapshotCell::new(),
            ctx,
            discovery: Discovery::new(route_table, inventory, lookup_timeout),
            round_clock: RoundClockStat::default(),
            tx: tx.clone(),
        };
        tokio::spawn(service.run(rx));

        Ok(Self { tx })
    }

    async fn request<F>(&self, build: F) -> Result<String>
    where
        F: FnOnce(oneshot::Sender<String>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| CollectorError::Stopped)?;
        reply_rx.await.map_err(|_| CollectorError::Stopped)
    }

    pub async fn force_update(&self) -> Result<String> {
        self.request(|reply| Command::ForceUpdate { reply }).await
    }

    pub async fn refresh(&self, filter: Filter) -> Result<String> {
        self.request(|reply| Command::Refresh { filter, reply }).await
    }

    pub async fn get_snapshot(&self, filter: Filter) -> Result<String> {
        self.request(|reply| Command::GetSnapshot { filter, reply }).await
    }

    pub async fn summary(&self) -> Result<String> {
        self.request(|reply| Command::Summary { reply }).await
    }
}

struct CollectorService {
    cell: SnapshotCell,
    ctx: Arc<RoundContext>,
    discovery: Discovery,
    round_clock: RoundClockStat,
    tx: mpsc::Sender<Command>,
}

impl CollectorService {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("Collector: starting inventory (initial download)");
        self.discovery.inventory().download_initial();

        info!("Collector: starting the first round");
        self.start_round(RoundType::Regular, None, None).await;

        while let Some(command) = rx.recv().await {
            match command {
                Command::StartRegularRound => {
                    self.start_round(RoundType::Regular, None, None).await;
                }
                Command::ForceUpdate { reply } => {
                    self.start_round(RoundType::ForcedFull, None, Some(reply)).await;
                }
                Command::Refresh { filter, reply } => {
                    self.start_round(RoundType::ForcedPartial, Some(filter), Some(reply))
                        .await;
                }
                Command::GetSnapshot { filter, reply } => {
                    let _ = reply.send(self.cell.storage().print_json(&filter));
                }
                Command::Summary { reply } => {
                    let _ = reply.send(self.render_summary());
                }
                Command::RoundComplete { round, reply } => {
                    self.finalize_round(*round, reply);
                }
            }
        }
    }

    async fn start_round(
        &mut self,
        round_type: RoundType,
        filter: Option<Filter>,
        reply: Option<oneshot::Sender<String>>,
    ) {
        let mut round = Round::new(
            self.cell.storage().clone(),
            self.cell.version(),
            round_type,
            filter,
        );

        // Partial rounds work against the already-discovered node set.
        if round_type != RoundType::ForcedPartial {
            self.discovery.resolve_nodes(&mut round.storage).await;
        }

        let ctx = self.ctx.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let round = round.run(&ctx).await;
            let _ = tx
                .send(Command::RoundComplete {
                    round: Box::new(round),
                    reply,
                })
                .await;
        });
    }

    fn finalize_round(&mut self, mut round: Round, reply: Option<oneshot::Sender<String>>) {
        let outcome = self.cell.install(&mut round);
        round.clock.total = round.started.elapsed().as_nanos() as u64;
        let total_ms = round.clock.total / 1_000_000;

        match outcome {
            InstallOutcome::Installed => match round.round_type {
                RoundType::Regular => {
                    self.round_clock = round.clock;
                    self.schedule_next_round();
                }
                RoundType::ForcedFull => {
                    self.round_clock = round.clock;
                    if let Some(reply) = reply {
                        let _ = reply.send(format!("Update completed in {total_ms} ms"));
                    }
                }
                RoundType::ForcedPartial => {
                    if let Some(reply) = reply {
                        let _ = reply.send(format!("Refresh completed in {total_ms} ms"));
                    }
                }
            },
            InstallOutcome::Discarded => match round.round_type {
                RoundType::Regular => self.schedule_next_round(),
                _ => {
                    if let Some(reply) = reply {
                        let _ = reply.send("Round completed, but nothing to update yet".to_string());
                    }
                }
            },
        }
    }

    fn schedule_next_round(&self) {
        info!("Scheduling next round");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ROUND_PERIOD).await;
            let _ = tx.send(Command::StartRegularRound).await;
        });
    }

    fn render_summary(&self) -> String {
        let storage = self.cell.storage();

        let mut backend_status: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut fs_status: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut group_status: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut group_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut couple_status: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut job_status: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut nr_backends = 0;
        let mut nr_filesystems = 0;

        for node in storage.nodes().values() {
            nr_backends += node.backends().len();
            for backend in node.backends().values() {
                *backend_status.entry(backend.status().as_str()).or_default() += 1;
            }
            nr_filesystems += node.filesystems().len();
            for fs in node.filesystems().values() {
                *fs_status.entry(fs.status().as_str()).or_default() += 1;
            }
        }

        for group in storage.groups().values() {
            *group_status.entry(group.status().as_str()).or_default() += 1;
            *group_type.entry(group.type_().as_str()).or_default() += 1;
        }

        for couple in storage.couples().values() {
            *couple_status.entry(couple.status().as_str()).or_default() += 1;
        }

        for job in storage.jobs().values() {
            *job_status.entry(job.status.as_str()).or_default() += 1;
        }

        let render_counts = |counts: &BTreeMap<&'static str, usize>| {
            let mut out = String::from("  ( ");
            for (status, count) in counts {
                out.push_str(&format!("{count} {status} "));
            }
            out.push_str(")\n");
            out
        };

        let msec = |nsec: u64| nsec / 1_000_000;

        let mut out = String::new();
        out.push_str(&format!("Storage contains:\n{} nodes\n", storage.nodes().len()));
        out.push_str(&format!("{nr_filesystems} filesystems\n"));
        out.push_str(&render_counts(&fs_status));
        out.push_str(&format!("{nr_backends} backends\n"));
        out.push_str(&render_counts(&backend_status));
        out.push_str(&format!("{} groups\n", storage.groups().len()));
        out.push_str(&render_counts(&group_status));
        out.push_str(&render_counts(&group_type));
        out.push_str(&format!("{} couples\n", storage.couples().len()));
        out.push_str(&render_counts(&couple_status));
        out.push_str(&format!("{} namespaces\n", storage.namespaces_map().len()));
        out.push_str(&format!("{} jobs\n", storage.jobs().len()));
        out.push_str(&render_counts(&job_status));

        out.push_str(&format!(
            "Round metrics:\n\
             \x20 Total time: {} ms\n\
             \x20 Resolve nodes: {} ms\n\
             \x20 Jobs & history databases: {} ms\n\
             \x20 HTTP download time: {} ms\n\
             \x20 Remaining JSON parsing and jobs processing after HTTP download completed: {} ms\n\
             \x20 Metadata download: {} ms\n\
             \x20 Storage update: {} ms\n\
             \x20 Storage merge: {} ms\n",
            msec(self.round_clock.total),
            msec(self.discovery.resolve_nodes_duration()),
            msec(self.round_clock.mongo),
            msec(self.round_clock.perform_download),
            msec(self.round_clock.finish_monitor_stats_and_jobs),
            msec(self.round_clock.metadata_download),
            msec(self.round_clock.storage_update),
            msec(self.round_clock.merge_time),
        ));

        let mut distrib_stats_parse = Distribution::new();
        let mut distrib_update_fs = Distribution::new();
        for node in storage.nodes().values() {
            distrib_stats_parse.add_sample(node.clock().stats_parse);
            distrib_update_fs.add_sample(node.clock().update_fs);
        }
        out.push_str(&format!(
            "\nDistribution for node stats parsing:\n{}\nDistribution for node fs update:\n{}\n",
            distrib_stats_parse.str(),
            distrib_update_fs.str()
        ));

        let mut distrib_metadata = Distribution::new();
        for group in storage.groups().values() {
            distrib_metadata.add_sample(group.metadata_parse_duration());
        }
        out.push_str(&format!(
            "Distribution for group metadata processing:\n{}\n",
            distrib_metadata.str()
        ));

        let mut distrib_couple = Distribution::new();
        for couple in storage.couples().values() {
            distrib_couple.add_sample(couple.update_status_duration());
        }
        out.push_str(&format!(
            "Distribution for couple update_status:\n{}",
            distrib_couple.str()
        ));

        out
    }
}
