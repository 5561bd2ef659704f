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

use std::{cmp::min, path::PathBuf};

use crate::{
    bitmap::Bitmap,
    cancel::CancelToken,
    chunk_lock::{ChunkLockTable, ShrinkOutcome},
    error::EngineError,
    modified_store::ModifiedStore,
    pristine_store::PristineStore,
    transport::{segment_for_offset, Transport},
    util::Stats,
};

/// Construction parameters for one image, positional on the wire protocol
/// (`url cache_path size segment_size chunk_size`), exactly as `vmnetfs` parses them.
pub struct ImageParams {
    pub url: String,
    pub cache_path: PathBuf,
    pub initial_size: u64,
    pub segment_size: u64,
    pub chunk_size: u32,
}

const MAX_CHUNKS_GROWTH_FACTOR: u64 = 64;

/// The unit of operation: bitmaps, stores, transport and chunk-state table for one
/// image. Lower layers (C1-C4) know nothing of this struct; it is the C5 composition
/// root.
pub struct Image {
    params: ImageParams,
    lock_table: ChunkLockTable,
    present: Bitmap,
    modified: Bitmap,
    accessed: Bitmap,
    pristine: PristineStore,
    modified_store: ModifiedStore,
    transport: Box<dyn Transport>,
    pub stats: Stats,
}

impl Image {
    pub fn new(params: ImageParams, transport: Box<dyn Transport>) -> Result<Self, EngineError> {
        let pristine = PristineStore::open(params.cache_path.clone())?;
        let modified_store = ModifiedStore::new(params.initial_size)?;

        // Bitmaps must be sized for the largest number of chunks the image can ever
        // reach; there is no re-sizing concept for them, so we pad generously and
        // let resize() stay within the guess. A real deployment would pass an
        // explicit max size; here we derive one from the initial size.
        let max_chunks = (params.initial_size / params.chunk_size as u64 + 1)
            .saturating_mul(MAX_CHUNKS_GROWTH_FACTOR);

        let present = Bitmap::new(max_chunks);
        let modified = Bitmap::new(max_chunks);
        let accessed = Bitmap::new(max_chunks);

        // The present bitmap is never persisted; rebuild it from what's already on
        // disk in the pristine cache directory.
        for chunk in pristine.existing_chunks()? {
            present.set(chunk);
        }

        let lock_table = ChunkLockTable::new(params.initial_size);

        Ok(Self {
            params,
            lock_table,
            present,
            modified,
            accessed,
            pristine,
            modified_store,
            transport,
            stats: Stats::default(),
        })
    }

    /// Stops accepting new notifications on all three streams. Blocking waiters
    /// already in flight are unaffected; the FUSE adapter is responsible for
    /// draining in-flight requests before calling this (see §6's process-level
    /// contract).
    pub fn close(&self) {
        self.present.close_stream();
        self.modified.close_stream();
        self.accessed.close_stream();
    }

    pub fn get_image_size(&self) -> u64 {
        self.lock_table.image_size()
    }

    pub fn present_stream(&self) -> std::sync::mpsc::Receiver<u64> {
        self.present.subscribe()
    }

    pub fn modified_stream(&self) -> std::sync::mpsc::Receiver<u64> {
        self.modified.subscribe()
    }

    pub fn accessed_stream(&self) -> std::sync::mpsc::Receiver<u64> {
        self.accessed.subscribe()
    }

    pub fn chunk_size(&self) -> u32 {
        self.params.chunk_size
    }

    pub fn read_chunk(
        &self,
        dst: &mut [u8],
        chunk: u64,
        offset: u32,
        cancel: &CancelToken,
    ) -> Result<usize, EngineError> {
        debug_assert!(offset as u64 + dst.len() as u64 <= self.params.chunk_size as u64);
        let image_size = self.lock_table.trylock(chunk, cancel)?;
        let result = self.read_chunk_unlocked(dst, chunk, offset, image_size);
        self.lock_table.unlock(chunk);
        result
    }

    pub fn write_chunk(
        &self,
        src: &[u8],
        chunk: u64,
        offset: u32,
        cancel: &CancelToken,
    ) -> Result<usize, EngineError> {
        debug_assert!(offset as u64 + src.len() as u64 <= self.params.chunk_size as u64);
        let image_size = self.lock_table.trylock(chunk, cancel)?;
        let result = self.write_chunk_unlocked(src, chunk, offset, image_size);
        self.lock_table.unlock(chunk);
        result
    }

    /// Unlocked inner routine: the caller already holds the chunk lock and has
    /// snapshotted `image_size`. The write path calls this directly for its COW
    /// copy-in step rather than re-entering `trylock`.
    fn read_chunk_unlocked(
        &self,
        dst: &mut [u8],
        chunk: u64,
        offset: u32,
        image_size: u64,
    ) -> Result<usize, EngineError> {
        let len = constrain_io(image_size, chunk, self.params.chunk_size, offset, dst.len())?;
        self.accessed.set(chunk);

        if self.modified.test(chunk) {
            self.modified_store
                .read_chunk(chunk * self.params.chunk_size as u64, offset, &mut dst[..len])?;
        } else {
            self.ensure_present(chunk, image_size)?;
            self.pristine.read_chunk(chunk, offset, &mut dst[..len])?;
        }

        self.stats.bytes_read.add(len as u64);
        Ok(len)
    }

    fn write_chunk_unlocked(
        &self,
        src: &[u8],
        chunk: u64,
        offset: u32,
        image_size: u64,
    ) -> Result<usize, EngineError> {
        let len = constrain_io(image_size, chunk, self.params.chunk_size, offset, src.len())?;
        self.accessed.set(chunk);

        if !self.modified.test(chunk) {
            self.copy_to_modified(chunk, image_size)?;
            self.stats.chunk_dirties.add(1);
        }

        self.modified_store
            .write_chunk(chunk * self.params.chunk_size as u64, offset, &src[..len])?;
        self.modified.set(chunk);

        self.stats.bytes_written.add(len as u64);
        Ok(len)
    }

    /// Copies the full contents of `chunk` (pristine, fetching if needed, or
    /// already-modified) into the modified store so subsequent writes land there.
    /// Called with the chunk lock already held.
    fn copy_to_modified(&self, chunk: u64, image_size: u64) -> Result<(), EngineError> {
        let count = min(
            self.params.chunk_size as u64,
            image_size - chunk * self.params.chunk_size as u64,
        ) as usize;
        let mut buf = vec![0u8; count];
        let n = self.read_chunk_unlocked(&mut buf, chunk, 0, image_size)?;
        if n < count {
            return Err(EngineError::PrematureEof);
        }
        self.modified_store
            .write_chunk(chunk * self.params.chunk_size as u64, 0, &buf)?;
        Ok(())
    }

    fn ensure_present(&self, chunk: u64, image_size: u64) -> Result<(), EngineError> {
        if self.present.test(chunk) {
            return Ok(());
        }
        let count = min(
            self.params.chunk_size as u64,
            image_size - chunk * self.params.chunk_size as u64,
        ) as usize;
        let mut buf = vec![0u8; count];
        self.stats.chunk_fetches.add(1);
        self.fetch_data(&mut buf, chunk * self.params.chunk_size as u64)?;
        self.pristine.write_chunk(chunk, &buf)?;
        self.present.set(chunk);
        Ok(())
    }

    /// Issues one or more transport fetches to fill `buf`, starting at logical
    /// image offset `image_offset`. Splits across segment boundaries per §4.4.
    fn fetch_data(&self, buf: &mut [u8], mut image_offset: u64) -> Result<(), EngineError> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let (url, seg_offset) =
                segment_for_offset(&self.params.url, self.params.segment_size, image_offset);
            let seg_remaining = if self.params.segment_size == 0 {
                (buf.len() - pos) as u64
            } else {
                self.params.segment_size - seg_offset
            };
            let n = min((buf.len() - pos) as u64, seg_remaining) as usize;
            self.transport.fetch(&url, seg_offset, &mut buf[pos..pos + n])?;
            pos += n;
            image_offset += n as u64;
        }
        Ok(())
    }

    /// Grows, shrinks, or leaves `image_size` unchanged. Implements §4.5.5 as a
    /// loop rather than the recursive restart the spec describes, per the design
    /// note that a loop is preferred where retry depth is unbounded.
    pub fn set_image_size(&self, new: u64) -> Result<(), EngineError> {
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            assert!(iterations < 1_000_000, "set_image_size failed to converge");

            let current = self.lock_table.image_size();
            if new > current {
                let max_chunks = self.present.max_chunks();
                let needed_chunks = new.div_ceil(self.params.chunk_size as u64);
                if needed_chunks > max_chunks {
                    return Err(EngineError::SizeExceedsCapacity { requested: new, max_chunks });
                }
                self.lock_table
                    .grow(new, |_cur, target| self.modified_store.set_size(target))?;
                return Ok(());
            }
            if new == current {
                return Ok(());
            }

            if self.needs_tail_preservation(new)? {
                continue;
            }

            match self
                .lock_table
                .shrink_step(new, self.params.chunk_size as u64, |_cur, target| {
                    self.modified_store.set_size(target)
                })? {
                ShrinkOutcome::Done => return Ok(()),
                ShrinkOutcome::RetryAfterChunk(busy_chunk) => {
                    let cancel = CancelToken::never();
                    self.lock_table.trylock(busy_chunk, &cancel)?;
                    self.lock_table.unlock(busy_chunk);
                    continue;
                }
            }
        }
    }

    /// Case (a) of truncation: if the new size lands inside a partial chunk that
    /// the pristine cache might still cover, copy that chunk into the modified
    /// store before the shrink proceeds, so regrowth never re-exposes pristine
    /// bytes past the truncation point. Returns true if it acted (caller restarts
    /// `set_image_size` from scratch, since the size may have changed meanwhile).
    fn needs_tail_preservation(&self, new: u64) -> Result<bool, EngineError> {
        let chunk_size = self.params.chunk_size as u64;
        if new % chunk_size == 0 {
            return Ok(false);
        }
        let last = (new - 1) / chunk_size;
        if new > self.params.initial_size || self.modified.test(last) {
            return Ok(false);
        }

        let cancel = CancelToken::never();
        let image_size2 = self.lock_table.trylock(last, &cancel)?;
        if last * chunk_size < image_size2 && !self.modified.test(last) {
            self.copy_to_modified(last, image_size2)?;
        }
        self.lock_table.unlock(last);
        Ok(true)
    }
}

fn constrain_io(
    image_size: u64,
    chunk: u64,
    chunk_size: u32,
    offset: u32,
    len: usize,
) -> Result<usize, EngineError> {
    let chunk_base = chunk * chunk_size as u64;
    let start = chunk_base + offset as u64;
    if start >= image_size {
        return Err(EngineError::Eof);
    }
    let avail = image_size - start;
    Ok(min(len as u64, avail) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };
    use tempfile::tempdir;

    /// Serves fixed content where byte `k` equals `k mod 256`, and counts fetches.
    struct StubTransport {
        fetches: AtomicU32,
        data: Mutex<Vec<u8>>,
    }

    impl StubTransport {
        fn new(size: usize) -> Self {
            Self {
                fetches: AtomicU32::new(0),
                data: Mutex::new((0..size).map(|k| (k % 256) as u8).collect()),
            }
        }
    }

    impl Transport for StubTransport {
        fn fetch(&self, _url: &str, offset: u64, dst: &mut [u8]) -> Result<(), crate::error::TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let data = self.data.lock().unwrap();
            let start = offset as usize;
            dst.copy_from_slice(&data[start..start + dst.len()]);
            Ok(())
        }
    }

    fn test_image(initial_size: u64, transport: StubTransport) -> Image {
        let dir = tempdir().unwrap();
        let params = ImageParams {
            url: "http://origin/disk.img".to_string(),
            cache_path: dir.into_path(),
            initial_size,
            segment_size: 0,
            chunk_size: 1024,
        };
        Image::new(params, Box::new(transport)).unwrap()
    }

    #[test]
    fn scenario_1_cold_read_fetches_once() {
        let image = test_image(4096, StubTransport::new(4096));
        let mut buf = [0u8; 1024];
        let cancel = CancelToken::never();
        let n = image.read_chunk(&mut buf, 0, 0, &cancel).unwrap();
        assert_eq!(n, 1024);
        let expected: Vec<u8> = (0..1024).map(|k| (k % 256) as u8).collect();
        assert_eq!(&buf[..], &expected[..]);
        assert!(image.present.test(0));
        assert_eq!(image.stats.chunk_fetches.get(), 1);
    }

    #[test]
    fn scenario_2_repeat_read_does_not_refetch() {
        let image = test_image(4096, StubTransport::new(4096));
        let mut buf = [0u8; 1024];
        let cancel = CancelToken::never();
        image.read_chunk(&mut buf, 0, 0, &cancel).unwrap();
        image.read_chunk(&mut buf, 0, 0, &cancel).unwrap();
        assert_eq!(image.stats.chunk_fetches.get(), 1);
    }

    #[test]
    fn scenario_3_write_then_read_overlaps_modified_bytes() {
        let image = test_image(4096, StubTransport::new(4096));
        let cancel = CancelToken::never();
        image
            .write_chunk(&[0xAA, 0xBB, 0xCC], 1, 100, &cancel)
            .unwrap();

        let mut buf = [0u8; 5];
        let n = image.read_chunk(&mut buf, 1, 99, &cancel).unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf, [99, 0xAA, 0xBB, 0xCC, 103]);
        assert!(image.modified.test(1));
        assert_eq!(image.stats.chunk_dirties.get(), 1);
    }

    #[test]
    fn scenario_4_resize_then_boundary_reads() {
        let image = test_image(4096, StubTransport::new(4096));
        image.set_image_size(3000).unwrap();

        let cancel = CancelToken::never();
        let mut buf = [0u8; 100];
        let err = image.read_chunk(&mut buf, 3, 0, &cancel).unwrap_err();
        assert!(matches!(err, EngineError::Eof));

        let mut buf2 = [0u8; 200];
        let n = image.read_chunk(&mut buf2, 2, 900, &cancel).unwrap();
        assert_eq!(n, 124);
    }

    #[test]
    fn scenario_5_concurrent_cold_readers_fetch_once() {
        use std::sync::Arc;
        use std::thread;

        let image = Arc::new(test_image(4096, StubTransport::new(4096)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let image = image.clone();
            handles.push(thread::spawn(move || {
                let mut buf = [0u8; 1024];
                let cancel = CancelToken::never();
                let n = image.read_chunk(&mut buf, 0, 0, &cancel).unwrap();
                (n, buf)
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let expected: Vec<u8> = (0..1024).map(|k| (k % 256) as u8).collect();
        for (n, buf) in results {
            assert_eq!(n, 1024);
            assert_eq!(&buf[..], &expected[..]);
        }
        assert_eq!(image.stats.chunk_fetches.get(), 1);
    }

    #[test]
    fn truncate_into_partial_chunk_then_regrow_reads_zero() {
        let image = test_image(4096, StubTransport::new(4096));
        let cancel = CancelToken::never();
        // Warm the pristine cache for chunk 2 first.
        let mut buf = [0u8; 1024];
        image.read_chunk(&mut buf, 2, 0, &cancel).unwrap();

        image.set_image_size(2500).unwrap();
        image.set_image_size(4096).unwrap();

        let mut tail = [0xFFu8; 100];
        let n = image.read_chunk(&mut tail, 2, 400, &cancel).unwrap();
        assert_eq!(n, 100);
        assert_eq!(tail, [0u8; 100]);
    }

    #[test]
    fn set_image_size_is_idempotent() {
        let image = test_image(4096, StubTransport::new(4096));
        image.set_image_size(4096).unwrap();
        assert_eq!(image.get_image_size(), 4096);
    }

    #[test]
    fn growth_past_bitmap_capacity_is_rejected_not_panicking() {
        let image = test_image(4096, StubTransport::new(4096));
        let max_chunks = image.present.max_chunks();
        let past_capacity = (max_chunks + 1) * image.chunk_size() as u64;
        let err = image.set_image_size(past_capacity).unwrap_err();
        assert!(matches!(err, EngineError::SizeExceedsCapacity { .. }));
        assert_eq!(image.get_image_size(), 4096);
    }
}
