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

use thiserror::Error;

/// Collector error types
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Stats or filter document failed to parse
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Group metadata failed to decode
    #[error("metadata decode error: {0}")]
    Metadata(#[from] rmp_serde::decode::Error),

    /// Stats download failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Jobs/history database failure
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    /// A BSON document misses a required field or carries a wrong type
    #[error("malformed database record: {0}")]
    MalformedRecord(String),

    /// Filter request is not understood
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// RPC method is not served by the collector
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A collaborator seam has no production implementation wired in
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// The collector event loop is gone
    #[error("collector is not running")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectorError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord(message.into())
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter(message.into())
    }
}

/// Collector operation Result type
pub type Result<T> = std::result::Result<T, CollectorError>;
