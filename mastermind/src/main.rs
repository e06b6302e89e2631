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

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mastermind_collector::discovery::{NullInventory, StaticRouteTable};
use mastermind_collector::round::NullMetadataSource;
use mastermind_collector::Collector;
use mastermind_config::{Config, DEFAULT_CONFIG_FILE};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = Config::load(&config_path)?;

    info!("Starting {} collector, config '{}'", config.app_name, config_path);

    let route_table = Arc::new(StaticRouteTable::from_config(&config));
    let _collector = Collector::spawn(
        config,
        route_table,
        Arc::new(NullInventory),
        Arc::new(NullMetadataSource),
    )?;

    // The worker framing that feeds RPC calls into rpc::dispatch lives
    // outside this binary; keep the collector running until shutdown.
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
