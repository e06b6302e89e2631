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

use bson::{Bson, Document};
use serde_json::{json, Value};

use crate::error::{CollectorError, Result};
use crate::storage::GroupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobType {
    Move,
    RestoreGroup,
    RecoverDc,
    CoupleDefrag,
}

impl JobType {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "move_job" => Some(JobType::Move),
            "restore_group_job" => Some(JobType::RestoreGroup),
            "recover_dc_job" => Some(JobType::RecoverDc),
            "couple_defrag_job" => Some(JobType::CoupleDefrag),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Move => "MOVE",
            JobType::RestoreGroup => "RESTORE_GROUP",
            JobType::RecoverDc => "RECOVER_DC",
            JobType::CoupleDefrag => "COUPLE_DEFRAG",
        }
    }

    /// MOVE and RESTORE_GROUP jobs mask certain BAD couple states into
    /// SERVICE_* states.
    pub fn is_service(&self) -> bool {
        matches!(self, JobType::Move | JobType::RestoreGroup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobStatus {
    New,
    NotApproved,
    Pending,
    Executing,
    Broken,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "new" => Some(JobStatus::New),
            "not_approved" => Some(JobStatus::NotApproved),
            "pending" => Some(JobStatus::Pending),
            "executing" => Some(JobStatus::Executing),
            "broken" => Some(JobStatus::Broken),
            "completed" => Some(JobStatus::Completed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::NotApproved => "NOT_APPROVED",
            JobStatus::Pending => "PENDING",
            JobStatus::Executing => "EXECUTING",
            JobStatus::Broken => "BROKEN",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::New | JobStatus::Executing)
    }
}

/// An observed repair/move job affecting one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub group: GroupId,
    pub status: JobStatus,
    pub type_: JobType,
}

fn bson_group_id(value: &Bson) -> Option<GroupId> {
    match value {
        Bson::Int32(n) if *n >= 0 => Some(*n as GroupId),
        Bson::Int64(n) if *n >= 0 => Some(*n as GroupId),
        Bson::Double(n) if *n >= 0.0 => Some(*n as GroupId),
        _ => None,
    }
}

impl Job {
    /// Build a job from one jobs-collection document.
    pub fn from_bson(doc: &Document) -> Result<Self> {
        let id = doc
            .get_str("id")
            .map_err(|_| CollectorError::malformed("job record has no 'id'"))?
            .to_string();

        let group = doc
            .get("group")
            .and_then(bson_group_id)
            .ok_or_else(|| CollectorError::malformed(format!("job '{id}' has no valid 'group'")))?;

        let status_label = doc
            .get_str("status")
            .map_err(|_| CollectorError::malformed(format!("job '{id}' has no 'status'")))?;
        let status = JobStatus::from_label(status_label).ok_or_else(|| {
            CollectorError::malformed(format!("job '{id}' has unknown status '{status_label}'"))
        })?;

        let type_label = doc
            .get_str("type")
            .map_err(|_| CollectorError::malformed(format!("job '{id}' has no 'type'")))?;
        let type_ = JobType::from_label(type_label).ok_or_else(|| {
            CollectorError::malformed(format!("job '{id}' has unknown type '{type_label}'"))
        })?;

        Ok(Job {
            id,
            group,
            status,
            type_,
        })
    }

    pub fn print_json(&self) -> Value {
        json!({
            "id": self.id,
            "group": self.group,
            "status": self.status.as_str(),
            "type": self.type_.as_str(),
        })
    }
}
