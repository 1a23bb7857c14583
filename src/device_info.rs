// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use log::{debug, info};
use rusb::{Direction, TransferType, UsbContext};

use crate::error::Error;
use crate::error::Result;

pub(crate) fn is_ippusb_interface(descriptor: &rusb::InterfaceDescriptor) -> bool {
    descriptor.class_code() == 0x07
        && descriptor.sub_class_code() == 0x01
        && descriptor.protocol_code() == 0x04
}

/// Location of a device on the USB bus.
///
/// Addresses are compared bus first, then device number, which gives the same order as
/// `lsusb`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsbAddr {
    pub bus: u8,
    pub address: u8,
}

impl UsbAddr {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }

    pub fn of<T: UsbContext>(device: &rusb::Device<T>) -> Self {
        Self::new(device.bus_number(), device.address())
    }
}

impl fmt::Display for UsbAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Bus {:03} Device {:03}", self.bus, self.address)
    }
}

/// The information for an interface descriptor that supports IPP-USB.
///
/// Bulk transfers can be read/written to the in/out endpoints, respectively.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IppusbDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub in_endpoint: u8,
    pub out_endpoint: u8,
    pub in_packet_size: u16,
    pub out_packet_size: u16,
}

/// Identity of one IPP-USB device as seen during enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub addr: UsbAddr,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    /// The configuration value that exposes the IPP-USB interfaces.
    pub config: u8,
    pub interfaces: Vec<IppusbDescriptor>,
}

impl DeviceDescriptor {
    /// Manufacturer and product joined the way printers usually present their model name.
    pub fn model(&self) -> String {
        match (self.manufacturer.is_empty(), self.product.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.manufacturer.clone(),
            (true, false) => self.product.clone(),
            // Many products already start with the vendor name.
            (false, false) if self.product.starts_with(&self.manufacturer) => self.product.clone(),
            (false, false) => format!("{} {}", self.manufacturer, self.product),
        }
    }

    /// Key used to give a device the same port again after it is re-plugged.  The bus
    /// address changes on every plug, so it can't be used here.
    pub fn identity(&self) -> String {
        format!(
            "{:04x}:{:04x}:{}",
            self.vendor_id, self.product_id, self.serial
        )
    }

    /// True if `other` was read from the same plugged device as `self`.  String descriptors
    /// are left out: reading them can fail on a busy device, and a failed read must not look
    /// like a different device.
    pub fn same_device(&self, other: &DeviceDescriptor) -> bool {
        self.addr == other.addr
            && self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
    }
}

/// Human-readable information about a device, used for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: u16,
    pub product: u16,
    pub mfg_and_product: String,
}

impl From<&DeviceDescriptor> for DeviceInfo {
    fn from(desc: &DeviceDescriptor) -> Self {
        Self {
            vendor: desc.vendor_id,
            product: desc.product_id,
            mfg_and_product: desc.model(),
        }
    }
}

/// The configuration and interfaces that support IPP-USB for a USB device.
///
///  A valid IPP-USB device will have at least two interfaces.
pub(crate) struct IppusbDeviceInfo {
    pub config: u8,
    pub interfaces: Vec<IppusbDescriptor>,
}

impl IppusbDeviceInfo {
    /// Given a rusb Device, search through the device's configurations to see if there is a
    /// particular configuration that supports IPP-over-USB (aka IPP-USB).  If such a configuration
    /// is found, return an `IppusbDeviceInfo`, which specifies the configuration as well as the
    /// IPP-USB interfaces within that configuration.
    ///
    /// An interface is considered an IPP-USB interface if all of the following are true:
    ///
    /// *  The USB class is Printer (7).
    /// *  The USB subclass is Printer (1).
    /// *  The USB protocol is IPP-USB (4).
    /// *  The interface contains a bulk-in and a bulk-out endpoint.
    ///
    /// If the given device does not support IPP-USB return `Error::NotIppUsb`.  The device's
    /// configuration is not changed by this function.
    pub(crate) fn new<T: UsbContext>(device: &rusb::Device<T>) -> Result<Self> {
        let desc = device
            .device_descriptor()
            .map_err(Error::ReadDeviceDescriptor)?;
        for i in 0..desc.num_configurations() {
            let config = device
                .config_descriptor(i)
                .map_err(Error::ReadConfigDescriptor)?;

            let mut interfaces = Vec::new();
            for interface in config.interfaces() {
                'alternates: for alternate in interface.descriptors() {
                    if !is_ippusb_interface(&alternate) {
                        continue;
                    }
                    debug!(
                        "{} - IPP-USB interface: config {}, interface {}, alternate {}",
                        UsbAddr::of(device),
                        config.number(),
                        interface.number(),
                        alternate.setting_number()
                    );

                    let mut in_endpoint: Option<(u8, u16)> = None;
                    let mut out_endpoint: Option<(u8, u16)> = None;
                    for endpoint in alternate.endpoint_descriptors() {
                        let found = (endpoint.address(), endpoint.max_packet_size());
                        match (endpoint.direction(), endpoint.transfer_type()) {
                            (Direction::In, TransferType::Bulk) => {
                                in_endpoint.get_or_insert(found);
                            }
                            (Direction::Out, TransferType::Bulk) => {
                                out_endpoint.get_or_insert(found);
                            }
                            _ => {}
                        };

                        if in_endpoint.is_some() && out_endpoint.is_some() {
                            break;
                        }
                    }

                    if let (Some((in_ep, in_size)), Some((out_ep, out_size))) =
                        (in_endpoint, out_endpoint)
                    {
                        interfaces.push(IppusbDescriptor {
                            interface_number: interface.number(),
                            alternate_setting: alternate.setting_number(),
                            in_endpoint: in_ep,
                            out_endpoint: out_ep,
                            in_packet_size: in_size,
                            out_packet_size: out_size,
                        });
                        // Only one alternate setting per interface may be used.
                        break 'alternates;
                    }
                }
            }

            if interfaces.len() >= 2 {
                return Ok(Self {
                    config: config.number(),
                    interfaces,
                });
            }
        }

        Err(Error::NotIppUsb)
    }
}

/// Build the full descriptor of an IPP-USB device.  String descriptors are best effort: a
/// device that refuses to be opened still gets served, it just has no model name.
pub(crate) fn read_device_descriptor<T: UsbContext>(
    device: &rusb::Device<T>,
) -> Result<DeviceDescriptor> {
    let info = IppusbDeviceInfo::new(device)?;
    let desc = device
        .device_descriptor()
        .map_err(Error::ReadDeviceDescriptor)?;
    let addr = UsbAddr::of(device);

    let (manufacturer, product, serial) = match device.open() {
        Ok(handle) => (
            handle
                .read_manufacturer_string_ascii(&desc)
                .unwrap_or_default(),
            handle.read_product_string_ascii(&desc).unwrap_or_default(),
            handle
                .read_serial_number_string_ascii(&desc)
                .unwrap_or_default(),
        ),
        Err(e) => {
            info!("{}: can't read string descriptors: {}", addr, e);
            (String::new(), String::new(), String::new())
        }
    };

    Ok(DeviceDescriptor {
        addr,
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        manufacturer: manufacturer.trim().to_owned(),
        product: product.trim().to_owned(),
        serial: serial.trim().to_owned(),
        config: info.config,
        interfaces: info.interfaces,
    })
}
