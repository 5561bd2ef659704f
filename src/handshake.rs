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

//! Process-level lifecycle: a parent forks a child that builds the disk and
//! memory images, mounts them over FUSE, and reports the mountpoint back over
//! a pipe. The parent distinguishes three failure shapes (an explicit error
//! line, the child dying on a signal, the child exiting non-zero) from the
//! success line, exactly as the original tool's launcher contract does, so
//! existing callers that scrape stdout need no changes.

use std::{
    fs::File,
    io::{BufRead, BufReader, Read, Write},
    os::unix::io::FromRawFd,
    path::PathBuf,
    sync::{mpsc, Arc},
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult};

use crate::config::ImageArgs;
use crate::fuse_adapter::ImageFs;
use crate::image::Image;
use crate::transport::HttpTransport;

/// Forks into parent/child per the process-level contract and never returns in
/// the parent: it exits the whole process with the launcher's exit code. The
/// mountpoint is a fresh temporary directory created by the child, not chosen
/// by the caller, matching the original tool's behavior of reporting back
/// wherever it decided to mount.
pub fn run(disk: ImageArgs, memory: ImageArgs) -> Result<()> {
    let (read_fd, write_fd) = pipe().context("failed to create handoff pipe")?;

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            drop(unsafe { File::from_raw_fd(write_fd) });
            let read_end = unsafe { File::from_raw_fd(read_fd) };
            run_parent(child, read_end)
        }
        ForkResult::Child => {
            drop(unsafe { File::from_raw_fd(read_fd) });
            let write_end = unsafe { File::from_raw_fd(write_fd) };
            run_child(disk, memory, write_end);
            std::process::exit(0);
        }
    }
}

fn run_parent(child: nix::unistd::Pid, read_end: File) -> Result<()> {
    let mut reader = BufReader::new(read_end);

    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .context("error reading status line from child")?;

    if !status_line.is_empty() && status_line != "\n" {
        bail!("{}", status_line.trim_end());
    }

    match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) | Err(_) => {}
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            bail!("vmnet-chunkfs died on signal {}", signal);
        }
        Ok(WaitStatus::Exited(_, code)) => {
            bail!("vmnet-chunkfs died with exit status {}", code);
        }
        Ok(_) => {}
    }

    let mut mountpoint_line = String::new();
    reader
        .read_line(&mut mountpoint_line)
        .context("error reading mountpoint from child")?;
    print!("{}", mountpoint_line);
    Ok(())
}

fn run_child(disk: ImageArgs, memory: ImageArgs, mut pipe: File) {
    redirect_stdio_to_devnull();

    match mount(disk, memory) {
        Ok((mountpoint, session, images)) => {
            let _ = writeln!(pipe, "\n{}", mountpoint.display());
            drop(pipe);
            wait_for_unmount(mountpoint, session, images);
        }
        Err(e) => {
            let _ = writeln!(pipe, "{}", e);
        }
    }
}

fn redirect_stdio_to_devnull() {
    if let Ok(devnull) = std::fs::OpenOptions::new().write(true).open("/dev/null") {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::dup2(devnull.as_raw_fd(), 1);
            libc::dup2(devnull.as_raw_fd(), 2);
        }
    }
}

type Mounted = (PathBuf, fuser::BackgroundSession, Vec<Arc<Image>>);

fn mount(disk: ImageArgs, memory: ImageArgs) -> Result<Mounted> {
    let mountpoint = tempfile::Builder::new()
        .prefix("vmnet-chunkfs.")
        .tempdir()
        .context("failed to create mountpoint directory")?
        .into_path();

    let disk_params = disk.into_params().map_err(|e| anyhow!(e))?;
    let memory_params = memory.into_params().map_err(|e| anyhow!(e))?;

    let disk_image = Arc::new(
        Image::new(disk_params, Box::new(HttpTransport::new()))
            .map_err(|e| anyhow!("failed to initialize disk image: {}", e))?,
    );
    let memory_image = Arc::new(
        Image::new(memory_params, Box::new(HttpTransport::new()))
            .map_err(|e| anyhow!("failed to initialize memory image: {}", e))?,
    );

    let images = vec![disk_image.clone(), memory_image.clone()];
    let fs = ImageFs::new(vec![("disk", disk_image), ("memory", memory_image)]);

    let session = fuser::spawn_mount2(fs, &mountpoint, &[])
        .with_context(|| format!("failed to mount at {}", mountpoint.display()))?;

    Ok((mountpoint, session, images))
}

/// Started successfully: watch stdin for closure and block until the mount is
/// torn down, then return so the child process can exit.
fn wait_for_unmount(mountpoint: PathBuf, session: fuser::BackgroundSession, images: Vec<Arc<Image>>) {
    let (tx, rx) = mpsc::channel::<()>();
    spawn_stdin_watcher(mountpoint, images, tx);
    let _ = rx.recv();
    drop(session);
}

/// Watches stdin for closure/EOF/error and, on detection, stops allowing
/// blocking reads on the images' streams and signals the caller to lazily
/// unmount the filesystem, so the mount never blocks shutdown of whatever
/// spawned this process. Mirrors the original tool's `read_stdin` watch, but
/// as a polling thread rather than a non-blocking I/O callback.
fn spawn_stdin_watcher(mountpoint: PathBuf, images: Vec<Arc<Image>>, done: mpsc::Sender<()>) {
    thread::spawn(move || {
        let mut buf = [0u8; 16];
        let mut stdin = std::io::stdin();
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        for image in &images {
            image.close();
        }
        let _ = nix::mount::umount2(mountpoint.as_path(), nix::mount::MntFlags::MNT_DETACH);
        let _ = done.send(());
    });
}
