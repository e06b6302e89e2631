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

/// A physical machine, identified by its address string. Name and DC are
/// filled by discovery; an unresolved host keeps them empty.
#[derive(Debug, Clone, Default)]
pub struct Host {
    addr: String,
    name: String,
    dc: String,
}

impl Host {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            name: String::new(),
            dc: String::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn dc(&self) -> &str {
        &self.dc
    }

    pub fn set_dc(&mut self, dc: impl Into<String>) {
        self.dc = dc.into();
    }

    /// Fill in whatever the other side resolved that this one did not.
    pub fn merge(&mut self, other: &Host) {
        if self.name.is_empty() && !other.name.is_empty() {
            self.name = other.name.clone();
        }
        if self.dc.is_empty() && !other.dc.is_empty() {
            self.dc = other.dc.clone();
        }
    }

    pub fn print_json(&self) -> Value {
        json!({
            "addr": self.addr,
            "name": self.name,
            "dc": self.dc,
        })
    }
}
