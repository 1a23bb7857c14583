// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ippusbd/ippusbd.toml";
const DEFAULT_LOCK_FILE: &str = "/var/lock/ippusbd/ippusbd.lock";
const DEFAULT_STATUS_FILE: &str = "/var/lock/ippusbd/ippusbd.status";

// Rescan interval used when there is no hotplug support and none is configured.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Error {
    Read(PathBuf, io::Error),
    Parse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Read(path, err) => write!(f, "Reading config file '{}': {}", path.display(), err),
            Parse(path, err) => write!(f, "Parsing config file '{}': {}", path.display(), err),
            Invalid(why) => write!(f, "Invalid configuration: {}", why),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct RawNetwork {
    listen_address: IpAddr,
    http_min_port: u16,
    http_max_port: u16,
    idle_timeout_ms: u64,
}

impl Default for RawNetwork {
    fn default() -> Self {
        RawNetwork {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_min_port: 60000,
            http_max_port: 65535,
            idle_timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct RawUsb {
    max_channels: usize,
    lease_timeout_ms: u64,
    transfer_timeout_ms: u64,
    drain_grace_ms: u64,
    poll_interval_ms: u64,
}

impl Default for RawUsb {
    fn default() -> Self {
        RawUsb {
            max_channels: 0,
            lease_timeout_ms: 10_000,
            transfer_timeout_ms: 60_000,
            drain_grace_ms: 2_000,
            poll_interval_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct RawLogging {
    main_log: String,
    console_log: String,
}

impl Default for RawLogging {
    fn default() -> Self {
        RawLogging {
            main_log: "info".to_owned(),
            console_log: "debug".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct RawPaths {
    lock_file: PathBuf,
    status_file: PathBuf,
}

impl Default for RawPaths {
    fn default() -> Self {
        RawPaths {
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            status_file: PathBuf::from(DEFAULT_STATUS_FILE),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawDevice {
    max_channels: usize,
}

/// The config file as written.
///
/// # Example config
/// ```toml
/// [network]
/// http-min-port = 60000
///
/// [devices."04a9:27e8"]
/// max-channels = 1
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    network: RawNetwork,
    usb: RawUsb,
    logging: RawLogging,
    paths: RawPaths,
    devices: HashMap<String, RawDevice>,
}

/// Settings for one vendor:product pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub max_channels: usize,
}

/// Resolved daemon configuration.  Built once at startup and shared read-only.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub listen_address: IpAddr,
    /// Ports handed out to devices.  A range starting at 0 uses ports chosen by the OS.
    pub http_ports: RangeInclusive<u16>,
    /// How long a client connection may sit between requests before it is closed and its
    /// channel returned.
    pub idle_timeout: Duration,
    /// Upper bound of channels claimed per device.  0 claims every IPP-USB interface.
    pub max_channels: usize,
    pub lease_timeout: Duration,
    pub transfer_timeout: Duration,
    pub drain_grace: Duration,
    /// Interval of periodic rescans.  `None` relies on hotplug events alone.
    pub poll_interval: Option<Duration>,
    pub main_log: LevelFilter,
    pub console_log: LevelFilter,
    pub lock_file: PathBuf,
    pub status_file: PathBuf,
    pub devices: HashMap<(u16, u16), DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let network = RawNetwork::default();
        let usb = RawUsb::default();
        let paths = RawPaths::default();
        Config {
            listen_address: network.listen_address,
            http_ports: network.http_min_port..=network.http_max_port,
            idle_timeout: Duration::from_millis(network.idle_timeout_ms),
            max_channels: usb.max_channels,
            lease_timeout: Duration::from_millis(usb.lease_timeout_ms),
            transfer_timeout: Duration::from_millis(usb.transfer_timeout_ms),
            drain_grace: Duration::from_millis(usb.drain_grace_ms),
            poll_interval: None,
            main_log: LevelFilter::Info,
            console_log: LevelFilter::Debug,
            lock_file: paths.lock_file,
            status_file: paths.status_file,
            devices: HashMap::new(),
        }
    }
}

fn parse_level(name: &str, value: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(value.trim())
        .map_err(|_| Error::Invalid(format!("{} has unknown level '{}'", name, value)))
}

fn parse_device_key(key: &str) -> Result<(u16, u16)> {
    let invalid = || Error::Invalid(format!("device key '{}' is not vvvv:pppp", key));
    let (vendor, product) = key.split_once(':').ok_or_else(invalid)?;
    if vendor.len() != 4 || product.len() != 4 {
        return Err(invalid());
    }
    let vendor = u16::from_str_radix(vendor, 16).map_err(|_| invalid())?;
    let product = u16::from_str_radix(product, 16).map_err(|_| invalid())?;
    Ok((vendor, product))
}

fn positive_ms(name: &str, ms: u64) -> Result<Duration> {
    if ms == 0 {
        return Err(Error::Invalid(format!("{} must not be 0", name)));
    }
    Ok(Duration::from_millis(ms))
}

impl RawConfig {
    fn resolve(self) -> Result<Config> {
        let network = self.network;
        if network.http_min_port > network.http_max_port {
            return Err(Error::Invalid(format!(
                "http-min-port {} is above http-max-port {}",
                network.http_min_port, network.http_max_port
            )));
        }

        let mut devices = HashMap::new();
        for (key, device) in self.devices {
            devices.insert(
                parse_device_key(&key)?,
                DeviceConfig {
                    max_channels: device.max_channels,
                },
            );
        }

        Ok(Config {
            listen_address: network.listen_address,
            http_ports: network.http_min_port..=network.http_max_port,
            idle_timeout: positive_ms("idle-timeout-ms", network.idle_timeout_ms)?,
            max_channels: self.usb.max_channels,
            lease_timeout: positive_ms("lease-timeout-ms", self.usb.lease_timeout_ms)?,
            transfer_timeout: positive_ms("transfer-timeout-ms", self.usb.transfer_timeout_ms)?,
            drain_grace: Duration::from_millis(self.usb.drain_grace_ms),
            poll_interval: match self.usb.poll_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            main_log: parse_level("main-log", &self.logging.main_log)?,
            console_log: parse_level("console-log", &self.logging.console_log)?,
            lock_file: self.paths.lock_file,
            status_file: self.paths.status_file,
            devices,
        })
    }
}

impl Config {
    pub fn from_toml(text: &str, origin: &Path) -> Result<Config> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| Error::Parse(origin.to_path_buf(), e))?;
        raw.resolve()
    }

    /// Load the configuration from `path`, or from `DEFAULT_CONFIG_PATH` if `path` is None.
    /// A missing default file means the built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        log::trace!("Reading config file {}", path.display());
        match fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text, &path),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !explicit => {
                log::debug!("{} not found, using defaults", path.display());
                Ok(Config::default())
            }
            Err(e) => Err(Error::Read(path, e)),
        }
    }

    /// Channel limit for a device: the per-device setting if there is one, else the global one.
    pub fn max_channels_for(&self, vendor_id: u16, product_id: u16) -> usize {
        self.devices
            .get(&(vendor_id, product_id))
            .map(|d| d.max_channels)
            .unwrap_or(self.max_channels)
    }

    /// Interval of periodic rescans given whether hotplug events are available.
    pub fn rescan_interval(&self, has_hotplug: bool) -> Option<Duration> {
        match self.poll_interval {
            Some(interval) => Some(interval),
            None if has_hotplug => None,
            None => Some(FALLBACK_POLL_INTERVAL),
        }
    }

    /// Log every head line and USB transfer when either sink wants trace output.
    pub fn verbose_log(&self) -> bool {
        self.main_log.max(self.console_log) >= LevelFilter::Trace
    }
}
