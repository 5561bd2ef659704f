//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};
use anyhow::{Context, Result};
use serde::Serialize;

pub fn create_dir_all(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

/// Monotonically-increasing counter, one per statistic. Mirrors the four counters
/// `vmnetfs` keeps per image: bytes read, bytes written, chunk fetches, chunk dirties.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Stats {
    pub bytes_read: Counter,
    pub bytes_written: Counter,
    pub chunk_fetches: Counter,
    pub chunk_dirties: Counter,
}

#[derive(Serialize)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunk_fetches: u64,
    pub chunk_dirties: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.get(),
            bytes_written: self.bytes_written.get(),
            chunk_fetches: self.chunk_fetches.get(),
            chunk_dirties: self.chunk_dirties.get(),
        }
    }
}
