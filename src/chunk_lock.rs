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
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use crate::cancel::CancelToken;
use crate::error::EngineError;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ChunkLockEntry {
    busy: bool,
    waiters: u32,
    cond: Arc<Condvar>,
}

struct Inner {
    locks: HashMap<u64, ChunkLockEntry>,
    image_size: u64,
}

/// Chunk-state table: the mutex M of the spec, guarding both the per-chunk busy/waiter
/// records and `image_size`. An entry exists iff `busy` or `waiters > 0`; the last
/// releaser removes it (see `unlock`).
pub struct ChunkLockTable {
    inner: Mutex<Inner>,
}

impl ChunkLockTable {
    pub fn new(initial_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                locks: HashMap::new(),
                image_size: initial_size,
            }),
        }
    }

    pub fn image_size(&self) -> u64 {
        self.inner.lock().unwrap().image_size
    }

    /// Acquires the lock for `chunk`, blocking until it is free or `cancel` fires.
    /// Returns the `image_size` snapshotted at the moment of acquisition.
    pub fn trylock(&self, chunk: u64, cancel: &CancelToken) -> Result<u64, EngineError> {
        let mut guard = self.inner.lock().unwrap();

        let entry = guard.locks.entry(chunk).or_insert_with(|| ChunkLockEntry {
            busy: false,
            waiters: 0,
            cond: Arc::new(Condvar::new()),
        });

        if !entry.busy {
            entry.busy = true;
            return Ok(guard.image_size);
        }

        let cond = entry.cond.clone();
        entry.waiters += 1;

        loop {
            if !guard.locks.get(&chunk).unwrap().busy {
                let entry = guard.locks.get_mut(&chunk).unwrap();
                entry.busy = true;
                entry.waiters -= 1;
                return Ok(guard.image_size);
            }
            if cancel.is_cancelled() {
                let entry = guard.locks.get_mut(&chunk).unwrap();
                entry.waiters -= 1;
                return Err(EngineError::Interrupted);
            }
            let (g, _timeout) = cond.wait_timeout(guard, WAIT_POLL_INTERVAL).unwrap();
            guard = g;
        }
    }

    /// Releases the lock for `chunk`. Wakes exactly one waiter if any are queued,
    /// otherwise removes the entry entirely.
    pub fn unlock(&self, chunk: u64) {
        let mut guard = self.inner.lock().unwrap();
        let (has_waiters, cond) = {
            let entry = guard
                .locks
                .get_mut(&chunk)
                .expect("unlock() called on a chunk with no entry");
            if entry.waiters > 0 {
                entry.busy = false;
                (true, Some(entry.cond.clone()))
            } else {
                (false, None)
            }
        };
        if has_waiters {
            cond.unwrap().notify_one();
        } else {
            guard.locks.remove(&chunk);
        }
    }

    /// True iff any chunk in `[from, to)` has a live entry in the table, i.e. is
    /// currently locked or has waiters queued for it.
    pub fn any_busy_in_range(&self, from: u64, to: u64) -> Option<u64> {
        let guard = self.inner.lock().unwrap();
        (from..to).rev().find(|c| guard.locks.contains_key(c))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().locks.is_empty()
    }

    /// Grows the image. `resize_fn(current, new)` is called while M is held, per
    /// the spec's own wording for the grow case; it should be cheap (a single
    /// `ftruncate`-equivalent call), never a network fetch or chunked I/O.
    pub fn grow(
        &self,
        new: u64,
        resize_fn: impl FnOnce(u64, u64) -> std::io::Result<()>,
    ) -> Result<(), EngineError> {
        let mut guard = self.inner.lock().unwrap();
        let current = guard.image_size;
        resize_fn(current, new)?;
        guard.image_size = new;
        Ok(())
    }

    /// One step of the truncation protocol (§4.5.5 case b): walks chunks downward
    /// from `(current-1)/chunk_size` to `new/chunk_size`. If none are busy, shrinks
    /// straight to `new`. If one is busy, shrinks only as far as that chunk's upper
    /// boundary (if that's progress) and reports which chunk the caller should wait
    /// on before retrying the whole `set_image_size` call.
    pub fn shrink_step(
        &self,
        new: u64,
        chunk_size: u64,
        resize_fn: impl FnOnce(u64, u64) -> std::io::Result<()>,
    ) -> Result<ShrinkOutcome, EngineError> {
        let mut guard = self.inner.lock().unwrap();
        let current = guard.image_size;
        if new >= current {
            return Ok(ShrinkOutcome::Done);
        }

        let first_chunk = new / chunk_size;
        let last_chunk = (current - 1) / chunk_size;

        let mut busy_chunk = None;
        let mut chunk = last_chunk;
        loop {
            if guard.locks.contains_key(&chunk) {
                busy_chunk = Some(chunk);
                break;
            }
            if chunk == first_chunk {
                break;
            }
            chunk -= 1;
        }

        match busy_chunk {
            Some(c) => {
                let boundary = (c + 1) * chunk_size;
                if boundary < current {
                    resize_fn(current, boundary)?;
                    guard.image_size = boundary;
                }
                Ok(ShrinkOutcome::RetryAfterChunk(c))
            }
            None => {
                resize_fn(current, new)?;
                guard.image_size = new;
                Ok(ShrinkOutcome::Done)
            }
        }
    }
}

impl Drop for ChunkLockTable {
    fn drop(&mut self) {
        let guard = self.inner.lock().unwrap();
        assert!(
            guard.locks.is_empty(),
            "chunk lock table destroyed with live entries: {:?}",
            guard.locks.keys().collect::<Vec<_>>()
        );
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ShrinkOutcome {
    Done,
    RetryAfterChunk(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn uncontended_lock_removes_entry_on_unlock() {
        let t = ChunkLockTable::new(4096);
        let cancel = CancelToken::never();
        let size = t.trylock(3, &cancel).unwrap();
        assert_eq!(size, 4096);
        t.unlock(3);
        assert!(t.is_empty());
    }

    #[test]
    fn second_locker_waits_then_acquires() {
        let t = StdArc::new(ChunkLockTable::new(4096));
        let cancel = CancelToken::never();
        t.trylock(0, &cancel).unwrap();

        let t2 = t.clone();
        let handle = thread::spawn(move || {
            let cancel = CancelToken::never();
            t2.trylock(0, &cancel).unwrap();
            t2.unlock(0);
        });

        thread::sleep(Duration::from_millis(60));
        t.unlock(0);
        handle.join().unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn cancelled_waiter_is_interrupted_without_freeing_entry() {
        let t = StdArc::new(ChunkLockTable::new(4096));
        let holder_cancel = CancelToken::never();
        t.trylock(0, &holder_cancel).unwrap();

        let waiter_cancel = CancelToken::new();
        let t2 = t.clone();
        let wc2 = waiter_cancel.clone();
        let handle = thread::spawn(move || t2.trylock(0, &wc2));

        thread::sleep(Duration::from_millis(20));
        waiter_cancel.cancel();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(EngineError::Interrupted)));

        // The entry is still held by the original locker; not removed by the interrupt.
        assert!(!t.is_empty());
        t.unlock(0);
        assert!(t.is_empty());
    }

    #[test]
    fn busy_range_lookup() {
        let t = ChunkLockTable::new(4096);
        let cancel = CancelToken::never();
        t.trylock(2, &cancel).unwrap();
        assert_eq!(t.any_busy_in_range(0, 4), Some(2));
        assert_eq!(t.any_busy_in_range(3, 4), None);
        t.unlock(2);
        assert_eq!(t.any_busy_in_range(0, 4), None);
    }
}
