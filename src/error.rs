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

use thiserror::Error;

/// Errors surfaced by the chunk I/O engine. Callers match on kind; `main.rs` and other
/// process glue wrap these with `anyhow::Context` instead of matching on them.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The requested range starts at or past the current image size.
    #[error("read/write start at or past end of image")]
    Eof,

    /// A lower layer returned fewer bytes than the engine required of it.
    #[error("premature EOF from a lower layer")]
    PrematureEof,

    /// The external request was cancelled while waiting for a chunk lock.
    #[error("operation interrupted while waiting for chunk lock")]
    Interrupted,

    /// Requested image size would need more chunks than the bitmaps were
    /// provisioned for at construction time.
    #[error("requested image size {requested} exceeds provisioned capacity ({max_chunks} chunks)")]
    SizeExceedsCapacity { requested: u64, max_chunks: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("origin returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("origin returned {got} bytes, expected {expected}")]
    ShortRead { got: usize, expected: usize },

    #[error("I/O error reading response body: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be non-empty")]
    Empty { field: &'static str },

    #[error("chunk_size must be a positive power of two, got {0}")]
    InvalidChunkSize(u32),

    #[error("invalid integer argument for {field}: {source}")]
    InvalidInteger {
        field: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
}
