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

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;

/// Non-zero value replaces the wall clock. Tests only.
static TEST_CLOCK_NS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock time in nanoseconds since the epoch.
///
/// This is the only wall-clock reader in the workspace. Stall detection and
/// history-entry filtering go through it, so tests can move time with
/// [`set_test_clock`].
pub fn clock_get_real() -> u64 {
    let test = TEST_CLOCK_NS.load(Ordering::Relaxed);
    if test != 0 {
        return test;
    }

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Override the wall clock for tests. `(0, 0)` restores the real clock.
pub fn set_test_clock(sec: u64, usec: u64) {
    TEST_CLOCK_NS.store(sec * 1_000_000_000 + usec * 1_000, Ordering::Relaxed);
}

/// Render a `(sec, usec)` timestamp as `"2015-10-26 16:43:15.468262"`.
pub fn timeval_user_friendly(sec: u64, usec: u64) -> String {
    match DateTime::from_timestamp(sec as i64, (usec * 1_000) as u32) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        None => format!("{sec}.{usec:06}"),
    }
}
