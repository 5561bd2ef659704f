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

//! Executable entry point. Imports lib.rs via the vmnet_chunkfs crate.

// Unless we are in release mode, allow dead code, unused imports and variables,
// it makes development more enjoyable.
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

use anyhow::Result;
use structopt::StructOpt;
use vmnet_chunkfs::config::Opts;
use vmnet_chunkfs::handshake;

fn main() -> Result<()> {
    env_logger::init();

    // SIGINT is ignored in the parent: the child's stdin-closed watcher is the
    // intended shutdown path, matching the original tool's launcher contract.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }

    let opts = Opts::from_args();
    handshake::run(opts.disk, opts.memory)
}
