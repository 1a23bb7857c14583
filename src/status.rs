// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-device status file read by `ippusbd status`.
//!
//! The running daemon rewrites the whole file after every device transition.  Readers and the
//! writer serialize on an exclusive `flock` of the file itself.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::device_info::{DeviceDescriptor, UsbAddr};
use crate::lock::{self, LockMode};
use crate::pnp::DeviceState;

#[derive(Debug)]
pub enum Error {
    Lock(lock::Error),
    Read(PathBuf, io::Error),
    Write(PathBuf, io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Lock(err) => write!(f, "{}", err),
            Read(path, err) => write!(f, "Failed to read {}: {}", path.display(), err),
            Write(path, err) => write!(f, "Failed to write {}: {}", path.display(), err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One line of the status file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatus {
    pub addr: UsbAddr,
    pub vendor_id: u16,
    pub product_id: u16,
    pub port: Option<u16>,
    pub state: DeviceState,
    pub model: String,
}

impl DeviceStatus {
    pub fn new(desc: &DeviceDescriptor, port: Option<u16>, state: DeviceState) -> Self {
        DeviceStatus {
            addr: desc.addr,
            vendor_id: desc.vendor_id,
            product_id: desc.product_id,
            port,
            state,
            model: desc.model(),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let port = match self.port {
            Some(port) => format!("{:5}", port),
            None => "    -".to_owned(),
        };
        write!(
            f,
            "{:03}:{:03}  {:04x}:{:04x}  port {}  {}  {:?}",
            self.addr.bus,
            self.addr.address,
            self.vendor_id,
            self.product_id,
            port,
            self.state,
            self.model
        )
    }
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        StatusFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the contents of the file with one line per device.
    pub fn write(&self, devices: &[DeviceStatus]) -> Result<()> {
        let mut file = lock::open_lock_file(&self.path).map_err(Error::Lock)?;
        lock::lock_file(&file, &self.path, LockMode::Wait).map_err(Error::Lock)?;

        let mut text = String::new();
        for device in devices {
            text.push_str(&device.to_string());
            text.push('\n');
        }
        let write_err = |e| Error::Write(self.path.clone(), e);
        file.set_len(0).map_err(write_err)?;
        file.seek(SeekFrom::Start(0)).map_err(write_err)?;
        file.write_all(text.as_bytes()).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        // Closing the file drops the lock.
        Ok(())
    }

    /// Read the lines written by the daemon.  A missing file reads as empty.
    pub fn read(&self) -> Result<Vec<String>> {
        let mut file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Read(self.path.clone(), e)),
        };
        lock::lock_file(&file, &self.path, LockMode::Wait).map_err(Error::Lock)?;

        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|e| Error::Read(self.path.clone(), e))?;
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect())
    }
}

/// The status report printed by `ippusbd status`.
pub fn format_report(lines: &[String]) -> String {
    if lines.is_empty() {
        return "per-device status: empty".to_owned();
    }
    let mut report = "per-device status:".to_owned();
    for line in lines {
        report.push('\n');
        report.push_str(line);
    }
    report
}
