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

use serde_json::{json, Value};

use crate::storage::GroupId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoupleStatus {
    #[default]
    Init,
    Ok,
    Full,
    Bad,
    Broken,
    Ro,
    Frozen,
    Migrating,
    ServiceActive,
    ServiceStalled,
}

impl CoupleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoupleStatus::Init => "INIT",
            CoupleStatus::Ok => "OK",
            CoupleStatus::Full => "FULL",
            CoupleStatus::Bad => "BAD",
            CoupleStatus::Broken => "BROKEN",
            CoupleStatus::Ro => "RO",
            CoupleStatus::Frozen => "FROZEN",
            CoupleStatus::Migrating => "MIGRATING",
            CoupleStatus::ServiceActive => "SERVICE_ACTIVE",
            CoupleStatus::ServiceStalled => "SERVICE_STALLED",
        }
    }
}

/// An ordered set of groups declared (via their metadata) to replicate one
/// another. Keyed by the `:`-joined group ids in declared order.
#[derive(Debug, Clone)]
pub struct Couple {
    key: String,
    groups: Vec<GroupId>,
    status: CoupleStatus,
    status_text: String,
    modified_time: u64,
    update_status_duration: u64,
}

impl Couple {
    pub fn key_for(groups: &[GroupId]) -> String {
        groups
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn new(groups: Vec<GroupId>) -> Self {
        Self {
            key: Self::key_for(&groups),
            groups,
            status: CoupleStatus::Init,
            status_text: String::new(),
            modified_time: 0,
            update_status_duration: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn groups(&self) -> &[GroupId] {
        &self.groups
    }

    pub fn status(&self) -> CoupleStatus {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn set_status(&mut self, status: CoupleStatus, text: String) {
        self.status = status;
        self.status_text = text;
    }

    pub fn modified_time(&self) -> u64 {
        self.modified_time
    }

    pub fn touch_modified_time(&mut self, time: u64) {
        if self.modified_time < time {
            self.modified_time = time;
        }
    }

    pub fn update_status_duration(&self) -> u64 {
        self.update_status_duration
    }

    pub fn set_update_status_duration(&mut self, nsec: u64) {
        self.update_status_duration = nsec;
    }

    /// Does the declared id list match this couple's groups, in order?
    pub fn check_groups(&self, group_ids: &[GroupId]) -> bool {
        self.groups == group_ids
    }

    /// Keep the side with the newer modification time; report if this one
    /// is fresher.
    pub fn merge(&mut self, other: &Couple, have_newer: &mut bool) {
        if self.modified_time > other.modified_time {
            *have_newer = true;
            return;
        }

        self.status = other.status;
        self.status_text = other.status_text.clone();
        self.modified_time = other.modified_time;
        self.update_status_duration = other.update_status_duration;
    }

    pub fn print_json(&self, show_internals: bool) -> Value {
        let mut value = json!({
            "id": self.key,
            "groups": self.groups,
            "status": self.status.as_str(),
            "status_text": self.status_text,
        });

        if show_internals {
            value["update_status_duration"] = Value::from(self.update_status_duration);
            value["modified_time"] = Value::from(self.modified_time);
        }

        value
    }
}
