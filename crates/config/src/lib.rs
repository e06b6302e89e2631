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

//! Configuration for the mastermind collector.
//!
//! All options are optional in the file; missing keys fall back to the
//! defaults below. Numeric flags accept both `0`/`1` and `false`/`true`
//! since older deployments carry integer flags.

use std::path::Path;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Default location of the collector configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/elliptics/mastermind.conf";

/// Reserved space default, roughly 105 GiB.
const DEFAULT_RESERVED_SPACE: u64 = 112_742_891_519;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Seed peer used to bootstrap node discovery.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_family")]
    pub family: i32,
}

fn default_family() -> i32 {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetadataOptions {
    #[serde(rename = "connectTimeoutMS")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetadataDatabase {
    pub db: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub url: String,
    pub options: MetadataOptions,
    pub history: MetadataDatabase,
    pub inventory: MetadataDatabase,
    pub jobs: MetadataDatabase,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor_port: u16,
    /// Per-request timeout for stat downloads and storage reads, seconds.
    pub wait_timeout: u64,
    /// Space subtracted from every backend before effective space, bytes.
    pub reserved_space: u64,
    /// Backend statistics older than this are considered stalled, seconds.
    pub node_backend_stat_stale_timeout: u64,
    #[serde(deserialize_with = "flag")]
    pub forbidden_dht_groups: bool,
    #[serde(deserialize_with = "flag")]
    pub forbidden_unmatched_group_total_space: bool,
    #[serde(deserialize_with = "flag")]
    pub forbidden_ns_without_settings: bool,
    #[serde(deserialize_with = "flag")]
    pub forbidden_dc_sharing_among_groups: bool,
    pub net_thread_num: u64,
    pub io_thread_num: u64,
    pub nonblocking_io_thread_num: u64,
    pub infrastructure_dc_cache_update_period: u64,
    pub infrastructure_dc_cache_valid_time: u64,
    pub inventory_worker_timeout: u64,
    pub nodes: Vec<NodeInfo>,
    pub metadata: MetadataConfig,
    pub app_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_port: 10025,
            wait_timeout: 10,
            reserved_space: DEFAULT_RESERVED_SPACE,
            node_backend_stat_stale_timeout: 120,
            forbidden_dht_groups: false,
            forbidden_unmatched_group_total_space: false,
            forbidden_ns_without_settings: false,
            forbidden_dc_sharing_among_groups: false,
            net_thread_num: 3,
            io_thread_num: 3,
            nonblocking_io_thread_num: 3,
            infrastructure_dc_cache_update_period: 150,
            infrastructure_dc_cache_valid_time: 604800,
            inventory_worker_timeout: 5,
            nodes: Vec::new(),
            metadata: MetadataConfig::default(),
            app_name: "mastermind".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reserved_space == 0 {
            return Err(ConfigError::Invalid("reserved_space must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Accept `0`/`1` as well as booleans for policy flags.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(u64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
    })
}
