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

//! Node discovery.
//!
//! Resolves the node set from a routing table, enriches new hosts with a
//! reverse-resolved hostname and the data center reported by the
//! inventory, and registers the nodes in the target snapshot. Nodes are
//! created even when host resolution fails; such hosts keep empty name and
//! DC, which DC-sharing checks treat as unresolvable.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use mastermind_common::Stopwatch;
use mastermind_config::{Config, NodeInfo};
use tracing::{error, warn};

use crate::storage::Storage;

/// One `(address, port, family)` endpoint known to the routing table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RouteEntry {
    pub addr: String,
    pub port: u16,
    pub family: i32,
}

/// The routing-table primitive the storage client exposes.
pub trait RouteTable: Send + Sync {
    fn routes(&self) -> Vec<RouteEntry>;
}

/// A fixed route set, e.g. the seed peers from the configuration.
pub struct StaticRouteTable {
    entries: Vec<RouteEntry>,
}

impl StaticRouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self { entries }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            entries: config
                .nodes
                .iter()
                .map(|NodeInfo { host, port, family }| RouteEntry {
                    addr: host.clone(),
                    port: *port,
                    family: *family,
                })
                .collect(),
        }
    }
}

impl RouteTable for StaticRouteTable {
    fn routes(&self) -> Vec<RouteEntry> {
        self.entries.clone()
    }
}

/// The host → data center inventory.
pub trait Inventory: Send + Sync {
    /// Bulk fetch performed once at collector start.
    fn download_initial(&self) {}

    fn dc_by_host(&self, hostname: &str) -> Option<String>;
}

/// Inventory that resolves nothing; every DC stays empty.
pub struct NullInventory;

impl Inventory for NullInventory {
    fn dc_by_host(&self, _hostname: &str) -> Option<String> {
        None
    }
}

pub struct Discovery {
    route_table: Arc<dyn RouteTable>,
    inventory: Arc<dyn Inventory>,
    /// Per-host cap on blocking hostname resolution.
    lookup_timeout: Duration,
    resolve_nodes_duration: u64,
}

impl Discovery {
    pub fn new(
        route_table: Arc<dyn RouteTable>,
        inventory: Arc<dyn Inventory>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            route_table,
            inventory,
            lookup_timeout,
            resolve_nodes_duration: 0,
        }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inventory
    }

    pub fn resolve_nodes_duration(&self) -> u64 {
        self.resolve_nodes_duration
    }

    /// Resolve the current node set into `storage`.
    pub async fn resolve_nodes(&mut self, storage: &mut Storage) {
        let mut elapsed = 0;
        {
            let _watch = Stopwatch::new(&mut elapsed);

            let addresses: BTreeSet<RouteEntry> = self.route_table.routes().into_iter().collect();

            for entry in addresses {
                if storage.get_host(&entry.addr).name().is_empty() {
                    match resolve_hostname(&entry.addr, self.lookup_timeout).await {
                        Ok(name) => storage.get_host(&entry.addr).set_name(name),
                        Err(e) => {
                            error!(
                                "Failed to resolve hostname for node {}:{}:{}: {}",
                                entry.addr, entry.port, entry.family, e
                            );
                        }
                    }
                }

                let name = storage.get_host(&entry.addr).name().to_string();
                if !name.is_empty() {
                    if let Some(dc) = self.inventory.dc_by_host(&name) {
                        storage.get_host(&entry.addr).set_dc(dc);
                    }
                }

                if !storage.has_node(&entry.addr, entry.port, entry.family) {
                    storage.add_node(&entry.addr, entry.port, entry.family);
                }
            }
        }
        self.resolve_nodes_duration = elapsed;
    }
}

/// Reverse-resolve an address. A route entry that is not a literal address
/// is taken as a hostname already.
async fn resolve_hostname(addr: &str, timeout: Duration) -> std::io::Result<String> {
    match addr.parse::<IpAddr>() {
        Ok(ip) => {
            let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
            match tokio::time::timeout(timeout, lookup).await {
                Ok(joined) => joined.map_err(|e| {
                    warn!("hostname resolver task failed: {e}");
                    std::io::Error::other(e)
                })?,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "hostname resolution timed out",
                )),
            }
        }
        Err(_) => Ok(addr.to_string()),
    }
}
