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

use std::sync::{atomic::{AtomicU64, Ordering}, mpsc};

use crate::stream::StreamGroup;

const WORD_BITS: u64 = 64;

/// Per-chunk boolean state (present / modified / accessed), sized to cover the
/// largest number of chunks the image might ever have. Each bitmap owns its own
/// notification stream: `subscribe()` returns a receiver of that bitmap's 0->1
/// transitions only, never another bitmap's. 1->0 never happens, so subscribers
/// never need to consider spurious clear events.
pub struct Bitmap {
    words: Vec<AtomicU64>,
    max_chunks: u64,
    stream: StreamGroup,
}

impl Bitmap {
    pub fn new(max_chunks: u64) -> Self {
        let word_count = max_chunks.div_ceil(WORD_BITS) as usize;
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, AtomicU64::default);
        Self { words, max_chunks, stream: StreamGroup::new() }
    }

    pub fn max_chunks(&self) -> u64 {
        self.max_chunks
    }

    pub fn test(&self, chunk: u64) -> bool {
        let (word, bit) = Self::locate(chunk);
        self.words[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Idempotent; publishes on this bitmap's own stream only on the genuine
    /// 0->1 transition.
    pub fn set(&self, chunk: u64) {
        let (word, bit) = Self::locate(chunk);
        let mask = 1u64 << bit;
        let prev = self.words[word].fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.stream.publish(chunk);
        }
    }

    /// Subscribes to this bitmap's own transitions, per spec's per-bitmap
    /// `subscribe() -> stream of i` contract. Late subscribers miss history.
    pub fn subscribe(&self) -> mpsc::Receiver<u64> {
        self.stream.subscribe()
    }

    pub fn close_stream(&self) {
        self.stream.close();
    }

    fn locate(chunk: u64) -> (usize, u32) {
        ((chunk / WORD_BITS) as usize, (chunk % WORD_BITS) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bitmap_is_clear() {
        let b = Bitmap::new(200);
        assert!(!b.test(0));
        assert!(!b.test(130));
    }

    #[test]
    fn set_is_idempotent_and_notifies_once() {
        let b = Bitmap::new(200);
        let rx = b.subscribe();
        b.set(5);
        b.set(5);
        assert!(b.test(5));
        assert_eq!(rx.recv().unwrap(), 5);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn bits_are_independent_across_words() {
        let b = Bitmap::new(200);
        b.set(63);
        b.set(64);
        assert!(b.test(63));
        assert!(b.test(64));
        assert!(!b.test(65));
    }

    #[test]
    fn each_bitmap_has_its_own_stream() {
        let present = Bitmap::new(200);
        let modified = Bitmap::new(200);
        let rx_present = present.subscribe();
        let rx_modified = modified.subscribe();
        modified.set(9);
        assert_eq!(rx_modified.recv().unwrap(), 9);
        assert!(rx_present.try_recv().is_err());
    }
}
