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

use std::{os::unix::fs::FileExt, sync::Mutex};

use tempfile::NamedTempFile;

/// Ephemeral copy-on-write overlay. One unnamed-but-on-disk file, sized to the
/// current logical image size, that is never persisted across process restarts
/// (`Non-goals` in the spec: no persistence of the modified overlay).
pub struct ModifiedStore {
    file: Mutex<NamedTempFile>,
}

impl ModifiedStore {
    pub fn new(initial_size: u64) -> std::io::Result<Self> {
        let file = NamedTempFile::new()?;
        file.as_file().set_len(initial_size)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn read_chunk(&self, chunk_offset: u64, offset: u32, dst: &mut [u8]) -> std::io::Result<()> {
        let file = self.file.lock().unwrap();
        file.as_file().read_exact_at(dst, chunk_offset + offset as u64)
    }

    pub fn write_chunk(&self, chunk_offset: u64, offset: u32, src: &[u8]) -> std::io::Result<()> {
        let file = self.file.lock().unwrap();
        file.as_file().write_all_at(src, chunk_offset + offset as u64)
    }

    /// Grows or shrinks the backing file. Growing extends with zeros (the kernel
    /// guarantees this for a sparse `set_len` past EOF); shrinking discards bytes
    /// past `new`.
    pub fn set_size(&self, new: u64) -> std::io::Result<()> {
        let file = self.file.lock().unwrap();
        file.as_file().set_len(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let store = ModifiedStore::new(4096).unwrap();
        store.write_chunk(1024, 100, &[0xAA, 0xBB, 0xCC]).unwrap();
        let mut out = [0u8; 3];
        store.read_chunk(1024, 100, &mut out).unwrap();
        assert_eq!(out, [0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn grow_then_read_is_zero_filled() {
        let store = ModifiedStore::new(0).unwrap();
        store.set_size(4096).unwrap();
        let mut out = [0xFFu8; 16];
        store.read_chunk(1024, 0, &mut out).unwrap();
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn shrink_then_grow_reads_zero_not_stale_bytes() {
        let store = ModifiedStore::new(4096).unwrap();
        store.write_chunk(0, 0, &[0x42; 16]).unwrap();
        store.set_size(8).unwrap();
        store.set_size(4096).unwrap();
        let mut out = [0xFFu8; 16];
        store.read_chunk(0, 0, &mut out).unwrap();
        assert_eq!(out, [0u8; 16]);
    }
}
