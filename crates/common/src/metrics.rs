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

use std::time::Instant;

/// Bucket boundaries in nanoseconds, one decade apart.
const BUCKET_LIMITS: [u64; 9] = [
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
];

const BUCKET_LABELS: [&str; 10] = [
    "  1 us: ",
    " 10 us: ",
    "100 us: ",
    "  1 ms: ",
    " 10 ms: ",
    "100 ms: ",
    "  1  s: ",
    " 10  s: ",
    "100  s: ",
    "   inf: ",
];

/// Log-scaled latency distribution with ten decade buckets.
///
/// Zero samples are dropped; `str()` renders only non-empty buckets, one
/// per line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Distribution {
    counts: [u64; 10],
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one sample of `nsec` nanoseconds. Zero samples are dropped.
    pub fn add_sample(&mut self, nsec: u64) {
        if nsec == 0 {
            return;
        }
        let idx = BUCKET_LIMITS.iter().position(|&limit| nsec < limit).unwrap_or(9);
        self.counts[idx] += 1;
    }

    pub fn merge(&mut self, other: &Distribution) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }

    /// Render non-empty buckets, one `"<label><count>\n"` line each.
    pub fn str(&self) -> String {
        let mut out = String::new();
        for (idx, &count) in self.counts.iter().enumerate() {
            if count != 0 {
                out.push_str(BUCKET_LABELS[idx]);
                out.push_str(&count.to_string());
                out.push('\n');
            }
        }
        out
    }
}

/// Scoped stopwatch: records elapsed monotonic nanoseconds into the
/// caller-provided slot when stopped or dropped.
pub struct Stopwatch<'a> {
    record: &'a mut u64,
    start: Instant,
    stopped: bool,
}

impl<'a> Stopwatch<'a> {
    pub fn new(record: &'a mut u64) -> Self {
        Self {
            record,
            start: Instant::now(),
            stopped: false,
        }
    }

    pub fn stop(&mut self) {
        if !self.stopped {
            *self.record = self.start.elapsed().as_nanos() as u64;
            self.stopped = true;
        }
    }
}

impl Drop for Stopwatch<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}
