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

//! Clock and metrics primitives shared across the collector.
//!
//! Everything that reads a clock lives here: the overridable wall-clock
//! reader, the scoped stopwatch that records elapsed nanoseconds into a
//! caller-provided slot, and the log-scaled latency distribution used for
//! round-stage reports.

pub mod clock;
pub mod metrics;

pub use clock::{clock_get_real, set_test_clock, timeval_user_friendly};
pub use metrics::{Distribution, Stopwatch};
