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

//! RPC surface of the collector.
//!
//! Each method receives one JSON payload and produces one string reply.
//! The worker framing that carries these calls is outside this crate; the
//! dispatcher here is what it invokes.

use crate::collector::Collector;
use crate::error::{CollectorError, Result};
use crate::filter::Filter;

pub const METHOD_SUMMARY: &str = "summary";
pub const METHOD_FORCE_UPDATE: &str = "force_update";
pub const METHOD_GET_SNAPSHOT: &str = "get_snapshot";
pub const METHOD_REFRESH: &str = "refresh";

/// Dispatch one RPC call against the collector.
pub async fn dispatch(collector: &Collector, method: &str, payload: &str) -> Result<String> {
    match method {
        METHOD_SUMMARY => collector.summary().await,
        METHOD_FORCE_UPDATE => collector.force_update().await,
        METHOD_GET_SNAPSHOT => {
            let filter = Filter::from_json(payload)?;
            collector.get_snapshot(filter).await
        }
        METHOD_REFRESH => {
            let filter = Filter::from_json(payload)?;
            collector.refresh(filter).await
        }
        other => Err(CollectorError::UnknownMethod(other.to_string())),
    }
}
