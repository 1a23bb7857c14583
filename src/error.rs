// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io;

use crate::device_info::UsbAddr;

/// Errors returned while discovering, claiming and leasing IPP-USB devices.
#[derive(Debug)]
pub enum Error {
    /// Failed to claim an IPP-USB interface.  The value contains the interface number and
    /// underlying `rusb` error.
    ClaimInterface(u8, rusb::Error),

    /// Failed to release an IPP-USB interface.  The value contains the interface number and
    /// underlying `rusb` error.
    ReleaseInterface(u8, rusb::Error),

    /// Failed to detach a kernel driver from an interface.  The value contains the interface
    /// number and underlying `rusb` error.
    DetachDrivers(u8, rusb::Error),

    /// Failed to create the libusb context.
    CreateContext(rusb::Error),

    /// Failed to list the devices on the bus.
    DeviceList(rusb::Error),

    /// Failed to open a device.
    OpenDevice(rusb::Error),

    /// Failed to read the device config descriptor.  The value contains the underlying `rusb`
    /// error.
    ReadConfigDescriptor(rusb::Error),

    /// Failed to read the device descriptor.  The value contains the underlying `rusb` error.
    ReadDeviceDescriptor(rusb::Error),

    /// Failed to register the hotplug callback.
    RegisterCallback(rusb::Error),

    /// Failed to set the active device config.  The value contains the underlying `rusb` error.
    SetActiveConfig(rusb::Error),

    /// Failed to set an interface to the alternate needed for IPP-USB.  The value contains the
    /// interface number and underlying `rusb` error.
    SetAlternateSetting(u8, rusb::Error),

    /// Failed to start a helper thread.
    SpawnThread(io::Error),

    /// No device is plugged at the given address.
    NotFound(UsbAddr),

    /// The specified device does not support IPP-USB.
    NotIppUsb,

    /// Not a single IPP-USB interface of the device could be claimed.
    NoChannels(UsbAddr),

    /// Every channel stayed leased for the whole lease timeout.
    PoolExhausted,

    /// The channel pool is shutting down.
    PoolClosed,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            ClaimInterface(i, err) => write!(f, "Failed to claim interface {}: {}", i, err),
            ReleaseInterface(i, err) => write!(f, "Failed to release interface {}: {}", i, err),
            DetachDrivers(i, err) => write!(
                f,
                "Failed to detach kernel driver for interface {}: {}",
                i, err
            ),
            CreateContext(err) => write!(f, "Failed to create UsbContext: {}", err),
            DeviceList(err) => write!(f, "Failed to read device list: {}", err),
            OpenDevice(err) => write!(f, "Failed to open device: {}", err),
            ReadConfigDescriptor(err) => write!(f, "Failed to read config descriptor: {}", err),
            ReadDeviceDescriptor(err) => write!(f, "Failed to read device descriptor: {}", err),
            RegisterCallback(err) => write!(f, "Failed to register for hotplug callback: {}", err),
            SetActiveConfig(err) => write!(f, "Failed to set active config: {}", err),
            SetAlternateSetting(i, err) => write!(
                f,
                "Failed to set interface {} alternate setting: {}",
                i, err
            ),
            SpawnThread(err) => write!(f, "Failed to start thread: {}", err),
            NotFound(addr) => write!(f, "No USB device at {}", addr),
            NotIppUsb => write!(f, "The specified device is not an IPP USB device."),
            NoChannels(addr) => write!(f, "{}: no IPP USB interface could be claimed", addr),
            PoolExhausted => write!(f, "All IPP USB interfaces are busy."),
            PoolClosed => write!(f, "The IPP USB interface pool is closed."),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
