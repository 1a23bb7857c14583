// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A cross-process "only one daemon per host" lock built on `flock(2)`.
//!
//! `flock` locks belong to the open file description, so two handles on the same path exclude
//! each other even inside one process.  The lock goes away with the file descriptor, so a crashed
//! daemon never leaves a stale lock behind.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

#[derive(Debug)]
pub enum Error {
    /// The lock is held through another file description.
    Busy(PathBuf),
    CreateDir(PathBuf, io::Error),
    Open(PathBuf, io::Error),
    Lock(PathBuf, Errno),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Busy(path) => write!(f, "{} is locked by another process", path.display()),
            CreateDir(path, err) => write!(f, "Failed to create {}: {}", path.display(), err),
            Open(path, err) => write!(f, "Failed to open {}: {}", path.display(), err),
            Lock(path, err) => write!(f, "Failed to lock {}: {}", path.display(), err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Fail with `Error::Busy` if somebody else holds the lock.
    NoWait,
    /// Block until the lock can be taken.
    Wait,
    /// Only find out whether the lock is free.  Ownership is not kept.
    TestOnly,
}

/// Take an exclusive `flock` on `file`, retrying when interrupted by a signal.
pub(crate) fn lock_file(file: &File, path: &Path, mode: LockMode) -> Result<()> {
    let arg = match mode {
        LockMode::Wait => FlockArg::LockExclusive,
        LockMode::NoWait | LockMode::TestOnly => FlockArg::LockExclusiveNonblock,
    };
    loop {
        match flock(file.as_raw_fd(), arg) {
            Ok(()) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EWOULDBLOCK) => return Err(Error::Busy(path.to_path_buf())),
            Err(e) => return Err(Error::Lock(path.to_path_buf(), e)),
        }
    }
}

pub(crate) fn unlock_file(file: &File, path: &Path) -> Result<()> {
    flock(file.as_raw_fd(), FlockArg::Unlock).map_err(|e| Error::Lock(path.to_path_buf(), e))
}

/// Open `path` for locking, creating it and its directory if needed.
pub(crate) fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::CreateDir(dir.to_path_buf(), e))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o644)
        .open(path)
        .map_err(|e| Error::Open(path.to_path_buf(), e))
}

/// The daemon's singleton lock.  Either unlocked or holding the lock exclusively.  The lock is
/// released when the value is dropped.
pub struct SingletonLock {
    path: PathBuf,
    // Some while the lock is held.
    file: Option<File>,
}

impl SingletonLock {
    /// A lock handle for `path`, initially unlocked.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SingletonLock {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Take the lock.  With `LockMode::TestOnly` succeeds if nobody else holds the lock, without
    /// taking it.  Acquiring a lock this handle already holds does nothing.
    pub fn acquire(&mut self, mode: LockMode) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        let file = open_lock_file(&self.path)?;
        lock_file(&file, &self.path, mode)?;
        if mode == LockMode::TestOnly {
            // Closing the file releases the probe lock.
            debug!("{} is free", self.path.display());
            return Ok(());
        }

        info!("Acquired {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    /// Give up the lock.  Does nothing if the lock isn't held.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // Closing the descriptor drops the lock even if the explicit unlock fails.
            if let Err(e) = unlock_file(&file, &self.path) {
                debug!("{}", e);
            }
            info!("Released {}", self.path.display());
        }
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        self.release();
    }
}
