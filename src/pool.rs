// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::device_info::{DeviceDescriptor, IppusbDescriptor, UsbAddr};
use crate::error::Error;
use crate::error::Result;
use crate::usb::UsbDevice;

// Claim `interface` and select its IPP-USB alternate setting.  An interface stuck in the wrong
// alternate setting is released again.
fn claim(device: &dyn UsbDevice, interface: &IppusbDescriptor) -> Result<()> {
    let number = interface.interface_number;
    device.claim_interface(number)?;
    if let Err(e) = device.set_alternate_setting(interface) {
        if let Err(release) = device.release_interface(number) {
            debug!("{}: {}", device.addr(), release);
        }
        return Err(e);
    }
    Ok(())
}

/// A claimed interface together with its position in the device's interface list.
#[derive(Copy, Clone, Debug)]
struct ClaimedInterface {
    index: usize,
    descriptor: IppusbDescriptor,
}

/// PoolState contains the mutable part of ChannelPool.  It is shared by every clone of the
/// pool and by every leased Channel and is protected by a mutex.
struct PoolState {
    free: VecDeque<ClaimedInterface>,
    leased: usize,
    closed: bool,
}

struct PoolInner {
    addr: UsbAddr,
    device: Arc<dyn UsbDevice>,
    capacity: usize,
    state: Mutex<PoolState>,
    channel_available: Condvar,
}

impl PoolInner {
    fn release_interface(&self, interface: &ClaimedInterface) {
        let number = interface.descriptor.interface_number;
        match self.device.release_interface(number) {
            Ok(()) => {}
            // The device is gone, there is nothing left to release.
            Err(Error::ReleaseInterface(_, rusb::Error::NoDevice)) => {}
            Err(e) => error!("{}: {}", self.addr, e),
        }
    }

    /// Return a leased interface.  Once the pool is closed the interface goes straight back to
    /// the OS instead of the free list.
    fn free_interface(&self, interface: ClaimedInterface) {
        debug!(
            "{}: * Returning interface {}",
            self.addr, interface.descriptor.interface_number
        );
        let mut state = self.state.lock().unwrap();
        state.leased -= 1;
        if state.closed {
            self.release_interface(&interface);
            return;
        }
        state.free.push_back(interface);
        self.channel_available.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        debug!(
            "{}: closing channel pool, {} channels still leased",
            self.addr, state.leased
        );
        for interface in state.free.drain(..) {
            self.release_interface(&interface);
        }
        self.channel_available.notify_all();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// ChannelPool owns the claimed IPP-USB interfaces of one device and hands them out as
/// `Channel`s.
///
/// At most `capacity()` channels are leased at any time.  Requesting a channel while all of
/// them are leased blocks until one is returned, the lease timeout elapses, or the pool is
/// closed.  A `Channel` returns itself to the pool when dropped, so a lease can't leak no matter
/// how the connection using it ends.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    /// Put `device` into its IPP-USB configuration and claim up to `limit` of its IPP-USB
    /// interfaces.  A `limit` of 0 claims all of them.
    ///
    /// Interfaces that can't be claimed are skipped and the pool runs with fewer channels.
    /// Returns `Error::NoChannels` if no interface at all could be claimed.
    pub fn open(
        device: Arc<dyn UsbDevice>,
        descriptor: &DeviceDescriptor,
        limit: usize,
    ) -> Result<Self> {
        let addr = descriptor.addr;
        let wanted = match limit {
            0 => descriptor.interfaces.len(),
            n => n.min(descriptor.interfaces.len()),
        };

        device.select_config(descriptor.config)?;

        let mut free = VecDeque::with_capacity(wanted);
        for (index, interface) in descriptor.interfaces.iter().enumerate() {
            if free.len() == wanted {
                break;
            }
            match claim(&*device, interface) {
                Ok(()) => free.push_back(ClaimedInterface {
                    index,
                    descriptor: *interface,
                }),
                Err(e) => warn!("{}: {}", addr, e),
            }
        }

        if free.is_empty() {
            return Err(Error::NoChannels(addr));
        }
        if free.len() < wanted {
            warn!(
                "{}: only {} of {} channels claimed, running with reduced concurrency",
                addr,
                free.len(),
                wanted
            );
        } else {
            info!("{}: {} channels claimed", addr, free.len());
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                addr,
                capacity: free.len(),
                device,
                state: Mutex::new(PoolState {
                    free,
                    leased: 0,
                    closed: false,
                }),
                channel_available: Condvar::new(),
            }),
        })
    }

    pub fn addr(&self) -> UsbAddr {
        self.inner.addr
    }

    /// Number of channels this pool was able to claim.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn leased(&self) -> usize {
        self.inner.state.lock().unwrap().leased
    }

    pub fn free(&self) -> usize {
        self.inner.state.lock().unwrap().free.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Get a channel from the pool, waiting up to `timeout` for one to be returned if all of
    /// them are leased.
    pub fn lease(&self, timeout: Duration) -> Result<Channel> {
        let state = self.inner.state.lock().unwrap();
        let (mut state, _) = self
            .inner
            .channel_available
            .wait_timeout_while(state, timeout, |s| !s.closed && s.free.is_empty())
            .unwrap();

        if state.closed {
            return Err(Error::PoolClosed);
        }
        match state.free.pop_front() {
            Some(interface) => {
                state.leased += 1;
                debug!(
                    "{}: * Using interface {}",
                    self.inner.addr, interface.descriptor.interface_number
                );
                Ok(Channel {
                    pool: self.inner.clone(),
                    interface: Some(interface),
                })
            }
            None => {
                warn!(
                    "{}: all {} channels busy for {}ms",
                    self.inner.addr,
                    self.inner.capacity,
                    timeout.as_millis()
                );
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Close the pool.  Free interfaces are released right away, leased ones as soon as they
    /// are returned.  Every waiting and future `lease()` fails with `Error::PoolClosed`.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// One leased IPP-USB interface.  Returned to its pool on drop.
pub struct Channel {
    pool: Arc<PoolInner>,
    // Never None until the Channel is dropped.
    interface: Option<ClaimedInterface>,
}

impl Channel {
    pub fn addr(&self) -> UsbAddr {
        self.pool.addr
    }

    /// Position of the interface in the device's list of IPP-USB interfaces.
    pub fn index(&self) -> usize {
        // Unwrap because interface only becomes None at drop.
        self.interface.as_ref().unwrap().index
    }

    pub fn descriptor(&self) -> &IppusbDescriptor {
        // Unwrap because interface only becomes None at drop.
        &self.interface.as_ref().unwrap().descriptor
    }

    pub fn device(&self) -> &Arc<dyn UsbDevice> {
        &self.pool.device
    }

    /// True once the owning pool started shutting down.
    pub fn pool_closed(&self) -> bool {
        self.pool.state.lock().unwrap().closed
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(interface) = self.interface.take() {
            self.pool.free_interface(interface);
        }
    }
}
