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

//! # Mastermind collector core
//!
//! The collector periodically queries a fleet of storage nodes, parses
//! per-node statistics and per-backend metadata, reconciles the results with
//! the jobs and group-history databases, and maintains a coherent read-only
//! snapshot of cluster state served over a small RPC surface.
//!
//! The heart of the crate is the collection round ([`round::Round`]): a
//! concurrent pipeline that fans out I/O to every known node, folds the
//! telemetry into the typed object graph owned by [`storage::Storage`]
//! (nodes → backends → filesystems → groups → couples → namespaces),
//! computes derived fields and per-entity status bottom-up, and installs the
//! new snapshot with a compare-and-swap against the [`collector::Collector`]
//! version, merging forward when a concurrent round won the race.

pub mod collector;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod jobs_db;
pub mod round;
pub mod rpc;
pub mod stats;
pub mod storage;

pub use crate::collector::Collector;
pub use crate::error::{CollectorError, Result};
pub use crate::filter::Filter;
pub use crate::storage::{GroupId, Storage};
