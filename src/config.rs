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

use std::path::PathBuf;

use structopt::clap::AppSettings;
use structopt::StructOpt;

use crate::error::ConfigError;
use crate::image::ImageParams;

/// One image's construction parameters, positional on the command line:
/// `url cache_path size segment_size chunk_size`, matching the original
/// `vmnetfs` wire format exactly so existing launchers need no changes.
#[derive(StructOpt, Debug)]
pub struct ImageArgs {
    pub url: String,
    pub cache_path: PathBuf,
    pub size: u64,
    pub segment_size: u64,
    pub chunk_size: u32,
}

impl ImageArgs {
    pub fn into_params(self) -> Result<ImageParams, ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Empty { field: "url" });
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty { field: "cache_path" });
        }
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }
        Ok(ImageParams {
            url: self.url,
            cache_path: self.cache_path,
            initial_size: self.size,
            segment_size: self.segment_size,
            chunk_size: self.chunk_size,
        })
    }
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "vmnet-chunkfs",
    settings = &[
        AppSettings::DeriveDisplayOrder,
        AppSettings::DisableHelpSubcommand,
        AppSettings::VersionlessSubcommands,
    ],
)]
pub struct Opts {
    /// Disk image parameters: url cache_path size segment_size chunk_size
    #[structopt(flatten)]
    pub disk: ImageArgs,

    /// Memory image parameters: url cache_path size segment_size chunk_size
    #[structopt(flatten)]
    pub memory: ImageArgs,
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn parses_two_image_argument_groups() {
        let opts = Opts::from_iter(&[
            "vmnet-chunkfs",
            "http://origin/disk.img",
            "/var/cache/disk",
            "4096",
            "0",
            "1024",
            "http://origin/mem.img",
            "/var/cache/mem",
            "2048",
            "0",
            "1024",
        ]);
        assert_eq!(opts.disk.size, 4096);
        assert_eq!(opts.memory.size, 2048);
        assert_eq!(opts.disk.chunk_size, 1024);
    }
}
