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

//! Translates kernel VFS calls into chunk-range engine operations. This is the
//! "mechanical glue" layer the core engine is agnostic to: one read or write is
//! split into one engine call per chunk touched, bounded by `chunk_size`, and each
//! image (disk, memory) is exposed as one regular file at the mount root.

use std::{
    ffi::OsStr,
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyWrite, Request,
};
use libc::ENOENT;

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::image::Image;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;
const FIRST_FILE_INO: u64 = 2;

struct NamedImage {
    name: &'static str,
    image: Arc<Image>,
}

/// Exposes a fixed set of named images as regular files at the mount root. The
/// process-level contract (§6) only ever mounts two: "disk" and "memory".
pub struct ImageFs {
    images: Vec<NamedImage>,
}

impl ImageFs {
    pub fn new(named_images: Vec<(&'static str, Arc<Image>)>) -> Self {
        let images = named_images
            .into_iter()
            .map(|(name, image)| NamedImage { name, image })
            .collect();
        Self { images }
    }

    fn ino_for_index(index: usize) -> u64 {
        FIRST_FILE_INO + index as u64
    }

    fn index_for_ino(ino: u64) -> Option<usize> {
        ino.checked_sub(FIRST_FILE_INO).map(|i| i as usize)
    }

    fn image_for_ino(&self, ino: u64) -> Option<&Image> {
        Self::index_for_ino(ino).and_then(|i| self.images.get(i)).map(|e| &e.image)
    }

    fn file_attr(ino: u64, image: &Image) -> FileAttr {
        FileAttr {
            ino,
            size: image.get_image_size(),
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o600,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    fn root_attr() -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o700,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    /// Splits `[offset, offset+len)` into per-chunk calls to `op`, which performs
    /// one engine read or write against `(chunk, offset_in_chunk, len_in_chunk)`
    /// and returns the number of bytes it actually moved.
    fn for_each_chunk(
        image: &Image,
        offset: u64,
        len: usize,
        mut op: impl FnMut(u64, u32, usize) -> Result<usize, EngineError>,
    ) -> Result<usize, EngineError> {
        let chunk_size = image.chunk_size() as u64;
        let mut moved = 0;
        let mut pos = offset;
        let end = offset + len as u64;

        while pos < end {
            let chunk = pos / chunk_size;
            let offset_in_chunk = (pos % chunk_size) as u32;
            let remaining_in_chunk = chunk_size - offset_in_chunk as u64;
            let want = std::cmp::min(end - pos, remaining_in_chunk) as usize;

            match op(chunk, offset_in_chunk, want) {
                Ok(n) => {
                    moved += n;
                    pos += n as u64;
                    if n < want {
                        break; // short read/write: EOF reached partway through.
                    }
                }
                Err(EngineError::Eof) if moved > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(moved)
    }
}

impl Filesystem for ImageFs {
    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &Self::root_attr());
        } else if let Some(image) = self.image_for_ino(ino) {
            reply.attr(&TTL, &Self::file_attr(ino, image));
        } else {
            reply.error(ENOENT);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        match self
            .images
            .iter()
            .position(|e| Some(e.name) == name.to_str())
        {
            Some(index) => {
                let ino = Self::ino_for_index(index);
                reply.entry(&TTL, &Self::file_attr(ino, &self.images[index].image), 0);
            }
            None => reply.error(ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        if ino != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        let mut entries = vec![
            (ROOT_INO, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
        ];
        for (i, entry) in self.images.iter().enumerate() {
            entries.push((Self::ino_for_index(i), FileType::RegularFile, entry.name.to_string()));
        }
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(image) = self.image_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let cancel = CancelToken::never();
        let result = Self::for_each_chunk(image, offset as u64, size as usize, |chunk, off, want| {
            let start = (chunk * image.chunk_size() as u64 + off as u64 - offset as u64) as usize;
            image.read_chunk(&mut buf[start..start + want], chunk, off, &cancel)
        });
        match result {
            Ok(n) => reply.data(&buf[..n]),
            Err(EngineError::Eof) => reply.data(&[]),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(image) = self.image_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let cancel = CancelToken::never();
        let result = Self::for_each_chunk(image, offset as u64, data.len(), |chunk, off, want| {
            let start = (chunk * image.chunk_size() as u64 + off as u64 - offset as u64) as usize;
            image.write_chunk(&data[start..start + want], chunk, off, &cancel)
        });
        match result {
            Ok(n) => reply.written(n as u32),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(image) = self.image_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        if let Some(new_size) = size {
            if image.set_image_size(new_size).is_err() {
                reply.error(libc::EIO);
                return;
            }
        }
        reply.attr(&TTL, &Self::file_attr(ino, image));
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}
