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

use std::io::Read;

use reqwest::header::{CONTENT_RANGE, RANGE};

use crate::error::TransportError;

/// A pool of reusable HTTP connections executing byte-range GETs. `fetch` blocks
/// until `dst` is fully populated or the request fails; the engine never retries
/// on its own behalf (§7: "the engine does not retry transport failures").
pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str, offset: u64, dst: &mut [u8]) -> Result<(), TransportError>;
}

/// Production transport: one blocking `reqwest::Client`, which owns its own
/// connection pool and is safely shared across threads.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, offset: u64, dst: &mut [u8]) -> Result<(), TransportError> {
        let last = offset + dst.len() as u64 - 1;
        let range = format!("bytes={}-{}", offset, last);

        let mut resp = self
            .client
            .get(url)
            .header(RANGE, range)
            .send()?
            .error_for_status()?;

        if !matches!(
            resp.status(),
            reqwest::StatusCode::PARTIAL_CONTENT | reqwest::StatusCode::OK
        ) {
            return Err(TransportError::Status(resp.status()));
        }
        let _ = resp.headers().get(CONTENT_RANGE);

        let mut read = 0;
        while read < dst.len() {
            let n = resp.read(&mut dst[read..])?;
            if n == 0 {
                return Err(TransportError::ShortRead {
                    got: read,
                    expected: dst.len(),
                });
            }
            read += n;
        }
        Ok(())
    }
}

/// Resolves a logical byte offset into the image to a segment URL and
/// segment-relative offset, per §4.4: `segment_size == 0` means a single URL
/// serves the whole image.
pub fn segment_for_offset(base_url: &str, segment_size: u64, offset: u64) -> (String, u64) {
    if segment_size == 0 {
        (base_url.to_string(), offset)
    } else {
        let index = offset / segment_size;
        let rel_offset = offset % segment_size;
        (format!("{}.{}", base_url, index), rel_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsegmented_offset_maps_to_base_url() {
        let (url, off) = segment_for_offset("http://origin/disk.img", 0, 12345);
        assert_eq!(url, "http://origin/disk.img");
        assert_eq!(off, 12345);
    }

    #[test]
    fn segmented_offset_maps_to_segment_and_relative_offset() {
        let (url, off) = segment_for_offset("http://origin/disk.img", 1000, 2500);
        assert_eq!(url, "http://origin/disk.img.2");
        assert_eq!(off, 500);
    }
}
