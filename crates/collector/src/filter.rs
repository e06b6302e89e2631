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

//! Structured queries over a snapshot.
//!
//! A filter names, per entity kind, the keys to include, and carries a
//! bitmask of the kinds to return. An empty filter matches everything of
//! the requested kinds.

use serde::Deserialize;

use crate::error::{CollectorError, Result};
use crate::storage::GroupId;

/// Entity-kind bits for [`Filter::item_types`].
pub mod item_types {
    pub const GROUP: u32 = 1 << 0;
    pub const COUPLE: u32 = 1 << 1;
    pub const NAMESPACE: u32 = 1 << 2;
    pub const NODE: u32 = 1 << 3;
    pub const BACKEND: u32 = 1 << 4;
    pub const FS: u32 = 1 << 5;
    pub const JOB: u32 = 1 << 6;
    pub const HOST: u32 = 1 << 7;

    pub const ALL: u32 = GROUP | COUPLE | NAMESPACE | NODE | BACKEND | FS | JOB | HOST;

    pub fn from_label(label: &str) -> Option<u32> {
        match label {
            "group" => Some(GROUP),
            "couple" => Some(COUPLE),
            "namespace" => Some(NAMESPACE),
            "node" => Some(NODE),
            "backend" => Some(BACKEND),
            "fs" => Some(FS),
            "job" => Some(JOB),
            "host" => Some(HOST),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Entity kinds to return; zero means every kind.
    pub item_types: u32,
    pub show_internals: bool,
    pub groups: Vec<GroupId>,
    pub couples: Vec<String>,
    pub namespaces: Vec<String>,
    pub nodes: Vec<String>,
    pub backends: Vec<String>,
    pub filesystems: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FilterRequest {
    item_types: Vec<String>,
    options: FilterOptions,
    filter: FilterLists,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FilterOptions {
    show_internals: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FilterLists {
    groups: Vec<GroupId>,
    couples: Vec<String>,
    namespaces: Vec<String>,
    nodes: Vec<String>,
    backends: Vec<String>,
    filesystems: Vec<String>,
}

impl Filter {
    /// Parse a filter request document. An empty payload is an empty
    /// filter; an unknown item type is an error.
    pub fn from_json(payload: &str) -> Result<Self> {
        if payload.trim().is_empty() {
            return Ok(Filter::default());
        }

        let request: FilterRequest = serde_json::from_str(payload)?;

        let mut item_mask = 0;
        for label in &request.item_types {
            let bit = item_types::from_label(label)
                .ok_or_else(|| CollectorError::invalid_filter(format!("unknown item type '{label}'")))?;
            item_mask |= bit;
        }

        Ok(Filter {
            item_types: item_mask,
            show_internals: request.options.show_internals != 0,
            groups: request.filter.groups,
            couples: request.filter.couples,
            namespaces: request.filter.namespaces,
            nodes: request.filter.nodes,
            backends: request.filter.backends,
            filesystems: request.filter.filesystems,
        })
    }

    /// No key constraints at all (item type selection does not count).
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.couples.is_empty()
            && self.namespaces.is_empty()
            && self.nodes.is_empty()
            && self.backends.is_empty()
            && self.filesystems.is_empty()
    }

    /// Sort all key lists and drop duplicates; selection uses binary
    /// search.
    pub fn sort(&mut self) {
        self.groups.sort_unstable();
        self.groups.dedup();
        for list in [
            &mut self.couples,
            &mut self.namespaces,
            &mut self.nodes,
            &mut self.backends,
            &mut self.filesystems,
        ] {
            list.sort_unstable();
            list.dedup();
        }
    }

    /// Kinds to render: an explicit mask, or every kind when unset.
    pub fn effective_item_types(&self) -> u32 {
        if self.item_types == 0 {
            item_types::ALL
        } else {
            self.item_types
        }
    }
}
