// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use rusb::{Context, Registration, UsbContext};
use tokio::sync::mpsc;

use crate::device_info::UsbAddr;
use crate::error::Error;
use crate::error::Result;
use crate::pnp::PnpEvent;

// The event thread checks whether it should exit at least this often.
const EVENT_WAIT: Duration = Duration::from_secs(1);

/// Turns libusb arrival and removal notifications into `PnpEvent::Changed`.
///
/// The manager rescans the whole bus on every event, so the callback doesn't need to
/// filter devices.
pub struct HotplugWatcher {
    event_thread_run: Arc<AtomicBool>,
    // These are always Some until the destructor runs.
    registration: Option<Registration<Context>>,
    event_thread: Option<thread::JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Returns `Ok(None)` if libusb has no hotplug support on this platform.  The manager
    /// then falls back to polling.
    pub fn new(context: &Context, events: mpsc::UnboundedSender<PnpEvent>) -> Result<Option<Self>> {
        if !rusb::has_hotplug() {
            info!("libusb has no hotplug support");
            return Ok(None);
        }

        let registration = rusb::HotplugBuilder::new()
            .enumerate(false)
            .register(context, Box::new(CallbackHandler { events }))
            .map_err(Error::RegisterCallback)?;

        let run = Arc::new(AtomicBool::new(true));
        let thread_run = run.clone();
        let context = context.clone();
        let event_thread = thread::Builder::new()
            .name("usb-events".to_owned())
            .spawn(move || {
                while thread_run.load(Ordering::Relaxed) {
                    if let Err(e) = context.handle_events(Some(EVENT_WAIT)) {
                        error!("Failed to handle libusb events: {}", e);
                    }
                }
                debug!("libusb event thread exiting");
            })
            .map_err(Error::SpawnThread)?;

        Ok(Some(Self {
            event_thread_run: run,
            registration: Some(registration),
            event_thread: Some(event_thread),
        }))
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.event_thread_run.store(false, Ordering::Relaxed);

        // The callback is unregistered when the registration is dropped.
        drop(self.registration.take());

        if let Some(t) = self.event_thread.take() {
            t.join()
                .unwrap_or_else(|e| error!("Failed to join event thread: {:?}", e));
        }
    }
}

struct CallbackHandler {
    events: mpsc::UnboundedSender<PnpEvent>,
}

impl CallbackHandler {
    fn notify(&self, what: &str, device: &rusb::Device<Context>) {
        debug!("{}: {}", UsbAddr::of(device), what);
        // Sending only fails once the manager is gone, and then nobody cares.
        let _ = self.events.send(PnpEvent::Changed);
    }
}

impl rusb::Hotplug<Context> for CallbackHandler {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        self.notify("arrived", &device);
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        self.notify("left", &device);
    }
}
