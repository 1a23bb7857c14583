// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A daemon that serves every plugged IPP-over-USB device as a local HTTP server.
//!
//! ## Introduction
//!
//! IPP-over-USB (or IPP-USB) devices expose two or more USB printer class interfaces that each
//! carry one HTTP/1.1 connection.  `ippusbd` claims those interfaces, pools them per device, and
//! listens on a local TCP port for every device.  Each accepted TCP connection leases one
//! interface for its whole lifetime and the HTTP exchanges on it are relayed byte for byte.
//! Every HTTP message ends at a USB short packet, so no partial message is ever left in the
//! device's buffers.
//!
//! ## Layout
//!
//! - [`usb`] and [`device_info`] find IPP-USB devices and wrap `rusb`.
//! - [`pool`] claims the interfaces of one device and leases them out.
//! - [`connection`] frames one leased interface as a stream of messages.
//! - [`proxy`] accepts TCP connections and relays them through the pool.
//! - [`pnp`] attaches and detaches devices as they come and go.
//! - [`lock`] keeps a second daemon from starting, and [`status`] reports what is attached.

pub mod config;
pub mod connection;
pub mod device_info;
mod error;
pub mod hotplug;
mod http;
mod io_adapters;
pub mod lock;
pub mod pnp;
pub mod pool;
pub mod proxy;
pub mod status;
pub mod usb;

#[cfg(test)]
mod sim;

pub use crate::config::Config;
pub use crate::device_info::{DeviceDescriptor, UsbAddr};
pub use crate::error::{Error, Result};
pub use crate::pnp::{PnpEvent, PnpExit, PnpManager, PnpMode};
pub use crate::usb::{RusbBackend, UsbBackend};
