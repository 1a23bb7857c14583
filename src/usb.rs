// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The capabilities the daemon needs from the platform USB stack, and their `rusb` binding.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use rusb::{Context, UsbContext};

use crate::device_info::{
    is_ippusb_interface, read_device_descriptor, DeviceDescriptor, DeviceInfo, IppusbDescriptor,
    UsbAddr,
};
use crate::error::Error;
use crate::error::Result;

/// Discovery and opening of IPP-USB devices.
pub trait UsbBackend: Send + Sync {
    /// List every IPP-USB device currently plugged in, sorted by address.  Never claims
    /// interfaces.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Look up the vendor, product and model name of the device at `addr`.
    fn describe(&self, addr: UsbAddr) -> Result<DeviceInfo>;

    /// Open the device described by `descriptor` for I/O.
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn UsbDevice>>;
}

/// An opened USB device.  All methods may be called from several threads at once; the
/// channel pool guarantees that a given interface and its endpoints are only used by one
/// thread at a time.
pub trait UsbDevice: Send + Sync {
    fn addr(&self) -> UsbAddr;

    /// Switch the device to `config` if it isn't already active.
    fn select_config(&self, config: u8) -> Result<()>;

    fn claim_interface(&self, interface_number: u8) -> Result<()>;

    /// Switch a claimed interface to its IPP-USB alternate setting.
    fn set_alternate_setting(&self, interface: &IppusbDescriptor) -> Result<()>;

    fn release_interface(&self, interface_number: u8) -> Result<()>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
}

fn interface_contains_ippusb(interface: &rusb::Interface) -> bool {
    interface.descriptors().any(|d| is_ippusb_interface(&d))
}

fn set_device_config<T: UsbContext>(handle: &rusb::DeviceHandle<T>, new_config: u8) -> Result<()> {
    let cur_config = handle
        .device()
        .active_config_descriptor()
        .map_err(Error::ReadConfigDescriptor)?;
    if cur_config.number() == new_config {
        return Ok(());
    }

    // While detaching any outstanding kernel drivers for the current config, keep
    // track of non-printer drivers so we can restore them after setting the config.
    let mut restore_interfaces = Vec::new();
    for interface in cur_config.interfaces() {
        if !interface_contains_ippusb(&interface) {
            match handle.kernel_driver_active(interface.number()) {
                Ok(false) => continue, // No active driver.
                Err(e) => return Err(Error::DetachDrivers(interface.number(), e)),
                _ => {}
            }

            info!(
                "Temporarily detaching kernel driver for non-printer interface {}",
                interface.number()
            );
            restore_interfaces.push(interface.number());
        }

        match handle.detach_kernel_driver(interface.number()) {
            Err(e) if e != rusb::Error::NotFound => {
                return Err(Error::DetachDrivers(interface.number(), e))
            }
            _ => {}
        }
    }

    info!(
        "Switching from configuration {} to {}",
        cur_config.number(),
        new_config
    );
    handle
        .set_active_configuration(new_config)
        .map_err(Error::SetActiveConfig)?;

    // A driver that can't be put back doesn't keep us from claiming the IPP-USB interfaces.
    for inum in restore_interfaces {
        handle
            .attach_kernel_driver(inum)
            .unwrap_or_else(|e| error!("Failed to reattach driver for interface {}: {}", inum, e));
    }

    Ok(())
}

/// `UsbBackend` on top of libusb.
#[derive(Clone)]
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(Error::CreateContext)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn find(&self, addr: UsbAddr) -> Result<rusb::Device<Context>> {
        let devices = self.context.devices().map_err(Error::DeviceList)?;
        devices
            .iter()
            .find(|d| UsbAddr::of(d) == addr)
            .ok_or(Error::NotFound(addr))
    }
}

impl UsbBackend for RusbBackend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.context.devices().map_err(Error::DeviceList)?;
        let mut found = Vec::new();
        for device in devices.iter() {
            match read_device_descriptor(&device) {
                Ok(desc) => found.push(desc),
                Err(Error::NotIppUsb) => {}
                Err(e) => info!("{}: skipped: {}", UsbAddr::of(&device), e),
            }
        }
        found.sort_by_key(|d| d.addr);
        Ok(found)
    }

    fn describe(&self, addr: UsbAddr) -> Result<DeviceInfo> {
        let device = self.find(addr)?;
        let desc = read_device_descriptor(&device)?;
        Ok(DeviceInfo::from(&desc))
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn UsbDevice>> {
        let device = self.find(descriptor.addr)?;
        let desc = device
            .device_descriptor()
            .map_err(Error::ReadDeviceDescriptor)?;
        // The address may have been handed to another device after a quick re-plug.
        if desc.vendor_id() != descriptor.vendor_id || desc.product_id() != descriptor.product_id
        {
            return Err(Error::NotFound(descriptor.addr));
        }

        let handle = device.open().map_err(Error::OpenDevice)?;
        handle
            .set_auto_detach_kernel_driver(true)
            .map_err(|e| Error::DetachDrivers(u8::MAX, e))?; // Use MAX to mean "no interface".
        debug!("{}: opened", descriptor.addr);

        Ok(Arc::new(RusbDevice {
            addr: descriptor.addr,
            handle,
        }))
    }
}

struct RusbDevice {
    addr: UsbAddr,
    handle: rusb::DeviceHandle<Context>,
}

impl UsbDevice for RusbDevice {
    fn addr(&self) -> UsbAddr {
        self.addr
    }

    fn select_config(&self, config: u8) -> Result<()> {
        set_device_config(&self.handle, config)
    }

    fn claim_interface(&self, interface_number: u8) -> Result<()> {
        self.handle
            .claim_interface(interface_number)
            .map_err(|e| Error::ClaimInterface(interface_number, e))
    }

    fn set_alternate_setting(&self, interface: &IppusbDescriptor) -> Result<()> {
        self.handle
            .set_alternate_setting(interface.interface_number, interface.alternate_setting)
            .map_err(|e| Error::SetAlternateSetting(interface.interface_number, e))
    }

    fn release_interface(&self, interface_number: u8) -> Result<()> {
        self.handle
            .release_interface(interface_number)
            .map_err(|e| Error::ReleaseInterface(interface_number, e))
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, buf, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }
}
