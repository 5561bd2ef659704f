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
    fs::{self, File},
    io::Write,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    process,
};

use crate::util::create_dir_all;

/// Durable, content-addressed-by-chunk-number cache of chunks as fetched from the
/// origin. One file per chunk under `dir`, named by chunk number. Chunks are
/// write-once: once a chunk file exists, it is never rewritten.
pub struct PristineStore {
    dir: PathBuf,
}

impl PristineStore {
    pub fn open(dir: PathBuf) -> std::io::Result<Self> {
        create_dir_all_or_io(&dir)?;
        Ok(Self { dir })
    }

    fn chunk_path(&self, chunk: u64) -> PathBuf {
        self.dir.join(chunk.to_string())
    }

    pub fn has_chunk(&self, chunk: u64) -> bool {
        self.chunk_path(chunk).is_file()
    }

    /// Publishes `buf` as the full, immutable contents of `chunk`. Writes to a
    /// sibling temp file and renames into place so a reader never observes a
    /// partially-written chunk file; on failure the chunk directory is left as if
    /// the call never happened.
    pub fn write_chunk(&self, chunk: u64, buf: &[u8]) -> std::io::Result<()> {
        let tmp_path = self.dir.join(format!(".{}.{}.tmp", chunk, process::id()));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, self.chunk_path(chunk))
    }

    /// Reads `dst.len()` bytes starting at `offset` within `chunk`. Callers must
    /// only call this once `has_chunk(chunk)` (or the engine's present bit) is true.
    pub fn read_chunk(&self, chunk: u64, offset: u32, dst: &mut [u8]) -> std::io::Result<()> {
        let f = File::open(self.chunk_path(chunk))?;
        f.read_exact_at(dst, offset as u64)
    }

    /// Chunk numbers already present on disk, for rebuilding the present bitmap
    /// at startup (the present bitmap itself is never persisted).
    pub fn existing_chunks(&self) -> std::io::Result<Vec<u64>> {
        let mut chunks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(chunk) = name.parse::<u64>() {
                    chunks.push(chunk);
                }
            }
        }
        Ok(chunks)
    }
}

fn create_dir_all_or_io(dir: &Path) -> std::io::Result<()> {
    create_dir_all(dir).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = PristineStore::open(dir.path().to_path_buf()).unwrap();
        let data = vec![7u8; 1024];
        store.write_chunk(3, &data).unwrap();
        assert!(store.has_chunk(3));

        let mut out = vec![0u8; 10];
        store.read_chunk(3, 5, &mut out).unwrap();
        assert_eq!(out, vec![7u8; 10]);
    }

    #[test]
    fn missing_chunk_is_reported_absent() {
        let dir = tempdir().unwrap();
        let store = PristineStore::open(dir.path().to_path_buf()).unwrap();
        assert!(!store.has_chunk(0));
    }

    #[test]
    fn existing_chunks_enumerates_written_ones() {
        let dir = tempdir().unwrap();
        let store = PristineStore::open(dir.path().to_path_buf()).unwrap();
        store.write_chunk(0, &[0u8; 16]).unwrap();
        store.write_chunk(5, &[0u8; 16]).unwrap();
        let mut chunks = store.existing_chunks().unwrap();
        chunks.sort();
        assert_eq!(chunks, vec![0, 5]);
    }
}
