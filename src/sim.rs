// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-memory USB bus for tests.
//!
//! Every simulated interface has a bulk OUT endpoint `0x01 + n` and a bulk IN endpoint
//! `0x81 + n`.  OUT transfers are split into packets of the endpoint's max packet size and
//! recorded; IN transfers are assembled from queued packets and end at the first short
//! packet, like a real host controller.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::device_info::{DeviceDescriptor, DeviceInfo, IppusbDescriptor, UsbAddr};
use crate::error::{Error, Result};
use crate::usb::{UsbBackend, UsbDevice};

pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

type ScanHook = Box<dyn FnOnce() + Send>;

/// What the device does with a complete OUT message.
#[derive(Clone)]
pub enum Behavior {
    /// Queue the OUT packets unchanged on the IN endpoint.
    Loopback,
    /// Answer each OUT message with the bytes returned by the responder.
    Http(Responder),
    /// Swallow OUT data and never answer.
    Silent,
}

pub fn descriptor(bus: u8, address: u8, channels: u8, packet_size: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        addr: UsbAddr::new(bus, address),
        vendor_id: 0x18d1,
        product_id: 0x505e,
        manufacturer: "Sim".to_owned(),
        product: format!("Printer {}", address),
        serial: format!("SIM{:03}{:03}", bus, address),
        config: 1,
        interfaces: (0..channels)
            .map(|n| IppusbDescriptor {
                interface_number: n,
                alternate_setting: 0,
                in_endpoint: 0x81 + n,
                out_endpoint: 0x01 + n,
                in_packet_size: packet_size,
                out_packet_size: packet_size,
            })
            .collect(),
    }
}

/// Answer every request with `200 OK` and a body naming the request line.
pub fn http_responder() -> Responder {
    Arc::new(|request: &[u8]| {
        let line = request
            .split(|&b| b == b'\r')
            .next()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .unwrap_or_default();
        let body = format!("served {}", line);
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    })
}

#[derive(Default)]
struct SimInterface {
    claimed: bool,
    out_packets: Vec<Vec<u8>>,
    pending: Vec<u8>,
    in_packets: VecDeque<Vec<u8>>,
}

struct SimDeviceState {
    unplugged: bool,
    refuse_claim: BTreeSet<u8>,
    refuse_alternate: BTreeSet<u8>,
    stalled: bool,
    interfaces: HashMap<u8, SimInterface>,
}

pub struct SimDevice {
    descriptor: DeviceDescriptor,
    behavior: Behavior,
    state: Mutex<SimDeviceState>,
    changed: Condvar,
}

impl SimDevice {
    pub fn new(descriptor: DeviceDescriptor, behavior: Behavior) -> Arc<Self> {
        let interfaces = descriptor
            .interfaces
            .iter()
            .map(|i| (i.interface_number, SimInterface::default()))
            .collect();
        Arc::new(Self {
            descriptor,
            behavior,
            state: Mutex::new(SimDeviceState {
                unplugged: false,
                refuse_claim: BTreeSet::new(),
                refuse_alternate: BTreeSet::new(),
                stalled: false,
                interfaces,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Make claims of `interface_number` fail, as if another driver owned it.
    pub fn refuse_claim(&self, interface_number: u8) {
        self.state
            .lock()
            .unwrap()
            .refuse_claim
            .insert(interface_number);
    }

    /// Make selecting the alternate setting of `interface_number` fail after it was claimed.
    pub fn refuse_alternate_setting(&self, interface_number: u8) {
        self.state
            .lock()
            .unwrap()
            .refuse_alternate
            .insert(interface_number);
    }

    /// Fail every following transfer with a stall.
    pub fn stall(&self) {
        self.state.lock().unwrap().stalled = true;
        self.changed.notify_all();
    }

    pub fn unplug(&self) {
        self.state.lock().unwrap().unplugged = true;
        self.changed.notify_all();
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let mut claimed: Vec<u8> = state
            .interfaces
            .iter()
            .filter(|(_, i)| i.claimed)
            .map(|(n, _)| *n)
            .collect();
        claimed.sort_unstable();
        claimed
    }

    /// Every OUT packet sent to `interface_number`, in order.
    pub fn out_packets(&self, interface_number: u8) -> Vec<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .interfaces
            .get(&interface_number)
            .map(|i| i.out_packets.clone())
            .unwrap_or_default()
    }

    fn packet_size(&self, interface_number: u8) -> usize {
        self.descriptor
            .interfaces
            .iter()
            .find(|i| i.interface_number == interface_number)
            .map(|i| i.out_packet_size as usize)
            .unwrap_or(512)
    }

    fn split_packets(data: &[u8], packet_size: usize) -> Vec<Vec<u8>> {
        let mut packets: Vec<Vec<u8>> = data.chunks(packet_size).map(|c| c.to_vec()).collect();
        if packets.is_empty() {
            packets.push(Vec::new());
        }
        packets
    }
}

fn interface_for(endpoint: u8) -> u8 {
    (endpoint & 0x7f) - 1
}

impl UsbDevice for SimDevice {
    fn addr(&self) -> UsbAddr {
        self.descriptor.addr
    }

    fn select_config(&self, _config: u8) -> Result<()> {
        if self.state.lock().unwrap().unplugged {
            return Err(Error::SetActiveConfig(rusb::Error::NoDevice));
        }
        Ok(())
    }

    fn claim_interface(&self, number: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.unplugged {
            return Err(Error::ClaimInterface(number, rusb::Error::NoDevice));
        }
        if state.refuse_claim.contains(&number) {
            return Err(Error::ClaimInterface(number, rusb::Error::Busy));
        }
        match state.interfaces.get_mut(&number) {
            Some(i) => {
                i.claimed = true;
                Ok(())
            }
            None => Err(Error::ClaimInterface(number, rusb::Error::NotFound)),
        }
    }

    fn set_alternate_setting(&self, interface: &IppusbDescriptor) -> Result<()> {
        let number = interface.interface_number;
        let state = self.state.lock().unwrap();
        if state.unplugged {
            return Err(Error::SetAlternateSetting(number, rusb::Error::NoDevice));
        }
        let claimed = state.interfaces.get(&number).map_or(false, |i| i.claimed);
        if !claimed || state.refuse_alternate.contains(&number) {
            return Err(Error::SetAlternateSetting(number, rusb::Error::Io));
        }
        Ok(())
    }

    fn release_interface(&self, interface_number: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let unplugged = state.unplugged;
        match state.interfaces.get_mut(&interface_number) {
            Some(i) => {
                i.claimed = false;
                if unplugged {
                    Err(Error::ReleaseInterface(
                        interface_number,
                        rusb::Error::NoDevice,
                    ))
                } else {
                    Ok(())
                }
            }
            None => Err(Error::ReleaseInterface(
                interface_number,
                rusb::Error::NotFound,
            )),
        }
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let number = interface_for(endpoint);
        let packet_size = self.packet_size(number);
        let mut state = self.state.lock().unwrap();
        if state.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        if state.stalled {
            return Err(rusb::Error::Pipe);
        }
        let interface = state
            .interfaces
            .get_mut(&number)
            .ok_or(rusb::Error::NotFound)?;
        if !interface.claimed {
            return Err(rusb::Error::Access);
        }

        for packet in Self::split_packets(buf, packet_size) {
            let short = packet.len() < packet_size;
            interface.out_packets.push(packet.clone());
            match &self.behavior {
                Behavior::Loopback => interface.in_packets.push_back(packet),
                Behavior::Http(responder) => {
                    interface.pending.extend_from_slice(&packet);
                    if short {
                        let request = std::mem::take(&mut interface.pending);
                        let response = responder(&request);
                        interface
                            .in_packets
                            .extend(Self::split_packets(&response, packet_size));
                        if !response.is_empty() && response.len() % packet_size == 0 {
                            interface.in_packets.push_back(Vec::new());
                        }
                    }
                }
                Behavior::Silent => {}
            }
        }
        self.changed.notify_all();
        Ok(buf.len())
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        let number = interface_for(endpoint);
        let packet_size = self.packet_size(number);
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.unplugged {
                return Err(rusb::Error::NoDevice);
            }
            if state.stalled {
                return Err(rusb::Error::Pipe);
            }
            let interface = state
                .interfaces
                .get_mut(&number)
                .ok_or(rusb::Error::NotFound)?;
            if !interface.in_packets.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(rusb::Error::Timeout);
            }
            state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
        }

        let interface = state
            .interfaces
            .get_mut(&number)
            .ok_or(rusb::Error::NotFound)?;
        let mut filled = 0;
        while let Some(packet) = interface.in_packets.front() {
            if buf.len() - filled < packet.len() {
                if filled == 0 {
                    return Err(rusb::Error::Overflow);
                }
                break;
            }
            let packet = interface.in_packets.pop_front().unwrap_or_default();
            buf[filled..filled + packet.len()].copy_from_slice(&packet);
            filled += packet.len();
            if packet.len() < packet_size || filled == buf.len() {
                break;
            }
        }
        Ok(filled)
    }
}

struct SimBusState {
    devices: BTreeMap<UsbAddr, Arc<SimDevice>>,
    scan_hooks: VecDeque<ScanHook>,
    scans: usize,
    // Devices whose string descriptors can't be read.
    no_strings: BTreeSet<UsbAddr>,
}

/// A USB bus whose devices are plugged and unplugged by the test.
pub struct SimBackend {
    state: Mutex<SimBusState>,
}

impl SimBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimBusState {
                devices: BTreeMap::new(),
                scan_hooks: VecDeque::new(),
                scans: 0,
                no_strings: BTreeSet::new(),
            }),
        })
    }

    pub fn plug(&self, device: Arc<SimDevice>) {
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(device.descriptor.addr, device);
    }

    pub fn unplug(&self, addr: UsbAddr) {
        if let Some(device) = self.state.lock().unwrap().devices.remove(&addr) {
            device.unplug();
        }
    }

    /// Queue `hook` to run right after the next scan that doesn't already have a hook has
    /// collected its result, so whatever the hook changes is only seen by later scans.
    pub fn after_scan(&self, hook: impl FnOnce() + Send + 'static) {
        self.state
            .lock()
            .unwrap()
            .scan_hooks
            .push_back(Box::new(hook));
    }

    /// Report `addr` without manufacturer, product and serial strings from now on, like a
    /// device too busy to answer string descriptor requests.
    pub fn fail_string_reads(&self, addr: UsbAddr) {
        self.state.lock().unwrap().no_strings.insert(addr);
    }

    pub fn scans(&self) -> usize {
        self.state.lock().unwrap().scans
    }
}

impl UsbBackend for SimBackend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let (found, hook) = {
            let mut state = self.state.lock().unwrap();
            state.scans += 1;
            let found = state
                .devices
                .values()
                .map(|d| {
                    let mut desc = d.descriptor.clone();
                    if state.no_strings.contains(&desc.addr) {
                        desc.manufacturer.clear();
                        desc.product.clear();
                        desc.serial.clear();
                    }
                    desc
                })
                .collect::<Vec<_>>();
            (found, state.scan_hooks.pop_front())
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(found)
    }

    fn describe(&self, addr: UsbAddr) -> Result<DeviceInfo> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&addr)
            .map(|d| DeviceInfo::from(&d.descriptor))
            .ok_or(Error::NotFound(addr))
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn UsbDevice>> {
        let state = self.state.lock().unwrap();
        match state.devices.get(&descriptor.addr) {
            Some(device) => Ok(device.clone()),
            None => Err(Error::OpenDevice(rusb::Error::NoDevice)),
        }
    }
}
