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

//! Jobs and group-history fetch from the metadata database.
//!
//! Reads use primary-preferred preference: reads keep working while the
//! replica set is electing, writes elsewhere in the system need the
//! primary anyway. A malformed document is logged and skipped; only the
//! inability to connect skips the whole leg for the round.

use std::time::Duration;

use bson::{doc, Document};
use futures::TryStreamExt;
use mastermind_common::clock_get_real;
use mastermind_config::Config;
use mongodb::options::{ClientOptions, ReadPreference, SelectionCriteria};
use mongodb::Client;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::storage::history::GroupHistoryEntry;
use crate::storage::job::Job;

/// Result of the metadata-database leg of a round.
#[derive(Debug, Default)]
pub struct JobsAndHistory {
    /// `None` when the database is not configured or unreachable; the
    /// previous job set is then kept.
    pub jobs: Option<(Vec<Job>, u64)>,
    pub history: Vec<GroupHistoryEntry>,
    /// Fetch time to remember as the new history watermark.
    pub history_fetch_ts: u64,
}

/// Fetch active jobs and fresh group-history entries.
///
/// `previous_history_ts_ns` is the last applied history watermark; zero
/// means this is the first round and `start_ts_ns` is used instead.
pub async fn fetch_jobs_and_history(
    config: &Config,
    previous_history_ts_ns: u64,
    start_ts_ns: u64,
) -> JobsAndHistory {
    let mut result = JobsAndHistory {
        history_fetch_ts: start_ts_ns,
        ..Default::default()
    };

    if config.metadata.url.is_empty() || config.metadata.jobs.db.is_empty() {
        warn!("Not connecting to jobs database because it was not configured");
        return result;
    }

    let client = match connect(config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Connection to metadata database failed: {e}");
            return result;
        }
    };

    match fetch_jobs(&client, config).await {
        Ok(jobs) => result.jobs = Some((jobs, clock_get_real())),
        Err(e) => error!("Failed to fetch jobs: {e}"),
    }

    if !config.metadata.history.db.is_empty() {
        let watermark_ns = if previous_history_ts_ns > 0 {
            previous_history_ts_ns
        } else {
            start_ts_ns
        };
        match fetch_history(&client, config, watermark_ns).await {
            Ok(history) => result.history = history,
            Err(e) => error!("Failed to fetch group history: {e}"),
        }
    }

    result
}

async fn connect(config: &Config) -> Result<Client> {
    let mut options = ClientOptions::parse(&config.metadata.url).await?;
    let timeout_ms = config.metadata.options.connect_timeout_ms;
    if timeout_ms > 0 {
        options.connect_timeout = Some(Duration::from_millis(timeout_ms));
        options.server_selection_timeout = Some(Duration::from_millis(timeout_ms));
    }
    Ok(Client::with_options(options)?)
}

fn primary_preferred() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
        options: Default::default(),
    })
}

async fn fetch_jobs(client: &Client, config: &Config) -> Result<Vec<Job>> {
    let collection = client
        .database(&config.metadata.jobs.db)
        .collection::<Document>("jobs");

    let mut cursor = collection
        .find(doc! { "status": { "$nin": ["completed", "cancelled"] } })
        .projection(doc! { "id": 1, "status": 1, "group": 1, "type": 1 })
        .selection_criteria(primary_preferred())
        .await?;

    let mut jobs = Vec::new();
    let mut total = 0usize;
    while let Some(document) = cursor.try_next().await? {
        total += 1;
        match Job::from_bson(&document) {
            Ok(job) => jobs.push(job),
            Err(e) => error!("Failed to parse database record: {e}\nBSON object: {document}"),
        }
    }

    info!("Successfully processed {} of {} active jobs", jobs.len(), total);
    Ok(jobs)
}

async fn fetch_history(
    client: &Client,
    config: &Config,
    watermark_ns: u64,
) -> Result<Vec<GroupHistoryEntry>> {
    let collection = client
        .database(&config.metadata.history.db)
        .collection::<Document>("history");

    let watermark_sec = watermark_ns as f64 / 1_000_000_000.0;
    let mut cursor = collection
        .find(doc! { "nodes.timestamp": { "$gt": watermark_sec } })
        .selection_criteria(primary_preferred())
        .await?;

    let mut entries = Vec::new();
    while let Some(document) = cursor.try_next().await? {
        match GroupHistoryEntry::from_bson(&document) {
            Ok(entry) => {
                if !entry.is_empty() {
                    info!("Loaded group history entry:\n{}", entry.print_json());
                    entries.push(entry);
                }
            }
            Err(e) => {
                error!("Failed to parse history database record: {e}\nBSON object: {document}")
            }
        }
    }

    info!("Loaded {} group history entries", entries.len());
    Ok(entries)
}
