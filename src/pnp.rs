// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Attaching and detaching devices as they come and go.
//!
//! The manager owns one `ProxyInstance` per attached device.  Every event leads to a full
//! rescan of the bus; the difference between the scan and the attached set decides what to
//! attach and what to detach.  In transient mode the manager exits once the last device is
//! gone, handing the singleton lock over to a possibly starting new instance without losing
//! a device that shows up in between.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::Handle as AsyncHandle;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::Config;
use crate::device_info::{DeviceDescriptor, UsbAddr};
use crate::error;
use crate::lock::{self, LockMode, SingletonLock};
use crate::pool::ChannelPool;
use crate::proxy::{bind_listener, ProxyInstance, ProxyOptions, ShutdownReason};
use crate::status::{DeviceStatus, StatusFile};
use crate::usb::UsbBackend;

/// Something the manager has to react to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PnpEvent {
    /// A device arrived or left, or it's time for a periodic rescan.
    Changed,
    /// A transfer to the device at this address failed.
    TransportLost(UsbAddr),
    /// Detach everything and stop.
    Shutdown,
}

/// Lifecycle of one device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Absent,
    Attaching,
    Active,
    Detaching,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use DeviceState::*;
        let name = match self {
            Absent => "absent",
            Attaching => "attaching",
            Active => "active",
            Detaching => "detaching",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ManagerState {
    Starting,
    /// At least one device is attached.
    Running,
    /// No device is attached.
    Idle,
    Stopped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PnpMode {
    /// Keep running without devices.
    Persistent,
    /// Exit once no device is left.  Used when started on demand by udev.
    Transient,
}

/// Why `PnpManager::run` returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PnpExit {
    /// A shutdown was requested.
    Shutdown,
    /// Transient mode ran out of devices, or another instance took over.
    Idle,
}

#[derive(Debug)]
enum AttachError {
    Usb(error::Error),
    Bind(io::Error),
    Start(io::Error),
    Task(tokio::task::JoinError),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use AttachError::*;
        match self {
            Usb(err) => write!(f, "{}", err),
            Bind(err) => write!(f, "Failed to bind listener: {}", err),
            Start(err) => write!(f, "Failed to start proxy: {}", err),
            Task(err) => write!(f, "Attach task failed: {}", err),
        }
    }
}

struct Attached {
    descriptor: DeviceDescriptor,
    proxy: ProxyInstance,
}

pub struct PnpManager {
    config: Arc<Config>,
    backend: Arc<dyn UsbBackend>,
    lock: SingletonLock,
    mode: PnpMode,
    poll_interval: Option<Duration>,
    status_file: StatusFile,
    events_tx: mpsc::UnboundedSender<PnpEvent>,
    events_rx: mpsc::UnboundedReceiver<PnpEvent>,
    state: watch::Sender<ManagerState>,
    devices_status: watch::Sender<Vec<DeviceStatus>>,
    devices: BTreeMap<UsbAddr, Attached>,
    // Devices that failed to attach.  They are left alone until they are unplugged.
    failed: BTreeMap<UsbAddr, DeviceDescriptor>,
    // Last port of every device seen by this process, keyed on `DeviceDescriptor::identity`.
    ports: HashMap<String, u16>,
}

impl PnpManager {
    /// `lock` is the singleton lock already acquired by the caller.  The manager gives it up
    /// when it goes idle in transient mode.
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn UsbBackend>,
        lock: SingletonLock,
        mode: PnpMode,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ManagerState::Starting);
        let (devices_status, _) = watch::channel(Vec::new());
        Self {
            poll_interval: config.poll_interval,
            status_file: StatusFile::new(&config.status_file),
            config,
            backend,
            lock,
            mode,
            events_tx,
            events_rx,
            state,
            devices_status,
            devices: BTreeMap::new(),
            failed: BTreeMap::new(),
            ports: HashMap::new(),
        }
    }

    /// Rescan the bus every `interval` in addition to reacting to events.
    pub fn set_poll_interval(&mut self, interval: Option<Duration>) {
        self.poll_interval = interval;
    }

    /// Sender for hotplug notifications, signal handlers and proxies.
    pub fn events(&self) -> mpsc::UnboundedSender<PnpEvent> {
        self.events_tx.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// The per-device lines of the status file, updated on every device transition.
    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DeviceStatus>> {
        self.devices_status.subscribe()
    }

    /// Serve devices until shutdown or, in transient mode, until no device is left.
    pub async fn run(mut self) -> PnpExit {
        self.set_state(ManagerState::Starting);
        self.rescan().await;
        self.set_state(match self.devices.is_empty() {
            true => ManagerState::Idle,
            false => ManagerState::Running,
        });

        let mut poll = self.poll_interval.map(|period| {
            let mut poll = interval_at(Instant::now() + period, period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll
        });

        loop {
            let idle = self.devices.is_empty() && self.mode == PnpMode::Transient;
            if idle && !self.recheck_idle().await {
                self.set_state(ManagerState::Stopped);
                return PnpExit::Idle;
            }

            let event = match poll.as_mut() {
                Some(poll) => tokio::select! {
                    event = self.events_rx.recv() => event,
                    _ = poll.tick() => Some(PnpEvent::Changed),
                },
                None => self.events_rx.recv().await,
            };
            if let Some(exit) = self.handle_event(event).await {
                return exit;
            }
        }
    }

    async fn handle_event(&mut self, event: Option<PnpEvent>) -> Option<PnpExit> {
        match event {
            Some(PnpEvent::Changed) => self.rescan().await,
            Some(PnpEvent::TransportLost(addr)) => {
                if self.devices.contains_key(&addr) {
                    warn!("{}: transport lost, detaching", addr);
                    self.detach(addr, ShutdownReason::TransportLost).await;
                }
                // Attaches the device again if it's still there.
                self.rescan().await;
            }
            Some(PnpEvent::Shutdown) | None => {
                info!("Shutting down");
                let attached: Vec<UsbAddr> = self.devices.keys().copied().collect();
                for addr in attached {
                    self.detach(addr, ShutdownReason::Signal).await;
                }
                self.set_state(ManagerState::Stopped);
                return Some(PnpExit::Shutdown);
            }
        }
        None
    }

    // The idle-exit handoff.  Returns true if the manager keeps running.
    //
    // A new instance started for a device that appears now fails to get the lock while we
    // hold it, and exits.  So release the lock first, then look for devices: a device that
    // arrives after the release is served by the new instance, and one found by our scan is
    // served by us if we can get the lock back.
    async fn recheck_idle(&mut self) -> bool {
        self.set_state(ManagerState::Idle);
        self.lock.release();

        let present = match self.scan().await {
            Some(found) => found.iter().filter(|d| !self.is_failed(d)).count(),
            None => 0,
        };
        if present == 0 {
            info!("No IPP-USB device left, exiting");
            return false;
        }

        match self.lock.acquire(LockMode::NoWait) {
            Ok(()) => {
                info!("{} device(s) appeared while going idle, staying up", present);
                self.rescan().await;
                true
            }
            Err(lock::Error::Busy(_)) => {
                info!("Another instance took over, exiting");
                false
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    async fn scan(&self) -> Option<Vec<DeviceDescriptor>> {
        let backend = self.backend.clone();
        match tokio::task::spawn_blocking(move || backend.enumerate()).await {
            Ok(Ok(found)) => Some(found),
            Ok(Err(e)) => {
                error!("Failed to scan for IPP-USB devices: {}", e);
                None
            }
            Err(e) => {
                error!("Scan task failed: {}", e);
                None
            }
        }
    }

    fn is_failed(&self, desc: &DeviceDescriptor) -> bool {
        self.failed
            .get(&desc.addr)
            .map_or(false, |failed| failed.same_device(desc))
    }

    async fn rescan(&mut self) {
        let found = match self.scan().await {
            Some(found) => found,
            None => return,
        };
        let still_here = |desc: &DeviceDescriptor| found.iter().any(|d| d.same_device(desc));

        self.failed.retain(|_, desc| still_here(desc));

        let gone: Vec<UsbAddr> = self
            .devices
            .values()
            .filter(|attached| !still_here(&attached.descriptor))
            .map(|attached| attached.descriptor.addr)
            .collect();
        for addr in gone {
            self.detach(addr, ShutdownReason::Unplugged).await;
        }

        for desc in found {
            if self.devices.contains_key(&desc.addr) || self.is_failed(&desc) {
                continue;
            }
            self.attach(desc).await;
        }
        self.publish(None);
    }

    async fn attach(&mut self, desc: DeviceDescriptor) {
        let addr = desc.addr;
        self.publish(Some(DeviceStatus::new(&desc, None, DeviceState::Attaching)));

        match self.start_proxy(&desc).await {
            Ok(proxy) => {
                info!(
                    "{}: attached {:04x}:{:04x} {:?} on port {}",
                    addr,
                    desc.vendor_id,
                    desc.product_id,
                    desc.model(),
                    proxy.port()
                );
                self.ports.insert(desc.identity(), proxy.port());
                self.devices.insert(
                    addr,
                    Attached {
                        descriptor: desc,
                        proxy,
                    },
                );
            }
            Err(e) => {
                error!("{}: failed to attach, ignored until unplugged: {}", addr, e);
                self.failed.insert(addr, desc);
            }
        }
        self.publish(None);
    }

    async fn start_proxy(&self, desc: &DeviceDescriptor) -> Result<ProxyInstance, AttachError> {
        let limit = self
            .config
            .max_channels_for(desc.vendor_id, desc.product_id);
        let preferred = self.ports.get(&desc.identity()).copied();
        let listen_address = self.config.listen_address;
        let ports = self.config.http_ports.clone();
        let backend = self.backend.clone();
        let descriptor = desc.clone();

        // Claiming interfaces and switching configurations block on the device.
        let opened = tokio::task::spawn_blocking(
            move || -> Result<(ChannelPool, StdTcpListener), AttachError> {
                let device = backend.open(&descriptor).map_err(AttachError::Usb)?;
                let pool =
                    ChannelPool::open(device, &descriptor, limit).map_err(AttachError::Usb)?;
                let listener = match bind_listener(listen_address, ports, preferred) {
                    Ok(listener) => listener,
                    Err(e) => {
                        pool.close();
                        return Err(AttachError::Bind(e));
                    }
                };
                Ok((pool, listener))
            },
        )
        .await
        .map_err(AttachError::Task)?;
        let (pool, listener) = opened?;

        let options = ProxyOptions {
            verbose_log: self.config.verbose_log(),
            lease_timeout: self.config.lease_timeout,
            transfer_timeout: self.config.transfer_timeout,
            idle_timeout: self.config.idle_timeout,
        };
        ProxyInstance::start(
            listener,
            pool.clone(),
            options,
            self.events_tx.clone(),
            &AsyncHandle::current(),
        )
        .map_err(|e| {
            pool.close();
            AttachError::Start(e)
        })
    }

    async fn detach(&mut self, addr: UsbAddr, reason: ShutdownReason) {
        let attached = match self.devices.remove(&addr) {
            Some(attached) => attached,
            None => return,
        };
        let port = attached.proxy.port();
        self.publish(Some(DeviceStatus::new(
            &attached.descriptor,
            Some(port),
            DeviceState::Detaching,
        )));

        attached
            .proxy
            .stop(reason, self.config.drain_grace)
            .await;
        info!("{}: detached ({:?}), port {} closed", addr, reason, port);
        self.publish(None);
    }

    // Report every attached device, plus one in transition.
    fn publish(&self, transition: Option<DeviceStatus>) {
        let mut lines: Vec<DeviceStatus> = self
            .devices
            .values()
            .map(|attached| {
                DeviceStatus::new(
                    &attached.descriptor,
                    Some(attached.proxy.port()),
                    DeviceState::Active,
                )
            })
            .chain(transition)
            .collect();
        lines.sort_by_key(|status| status.addr);

        // Observers of the device list must never see a state older than the list.
        if *self.state.borrow() != ManagerState::Starting {
            let state = match self.devices.is_empty() {
                true => ManagerState::Idle,
                false => ManagerState::Running,
            };
            self.set_state(state);
        }

        if let Err(e) = self.status_file.write(&lines) {
            warn!("{}", e);
        }
        self.devices_status.send_replace(lines);
    }

    fn set_state(&self, state: ManagerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Manager state {:?} -> {:?}", previous, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::sync::Mutex;

    use tempfile::TempDir;

    use crate::sim::{self, Behavior, SimBackend, SimDevice};

    struct Fixture {
        _dir: TempDir,
        backend: Arc<SimBackend>,
        config: Arc<Config>,
    }

    impl Fixture {
        fn new(ports: std::ops::RangeInclusive<u16>) -> Self {
            let dir = TempDir::new().unwrap();
            let config = Config {
                listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                http_ports: ports,
                lease_timeout: Duration::from_millis(500),
                transfer_timeout: Duration::from_secs(2),
                drain_grace: Duration::from_millis(100),
                lock_file: dir.path().join("ippusbd.lock"),
                status_file: dir.path().join("ippusbd.status"),
                ..Default::default()
            };
            Self {
                _dir: dir,
                backend: SimBackend::new(),
                config: Arc::new(config),
            }
        }

        fn plug(&self, address: u8) -> Arc<SimDevice> {
            let device = SimDevice::new(
                sim::descriptor(1, address, 2, 512),
                Behavior::Http(sim::http_responder()),
            );
            self.backend.plug(device.clone());
            device
        }

        fn lock(&self) -> SingletonLock {
            SingletonLock::new(&self.config.lock_file)
        }

        fn manager(&self, mode: PnpMode) -> PnpManager {
            let mut lock = self.lock();
            lock.acquire(LockMode::NoWait).unwrap();
            PnpManager::new(self.config.clone(), self.backend.clone(), lock, mode)
        }
    }

    fn port_of(manager: &PnpManager, address: u8) -> u16 {
        manager.devices[&UsbAddr::new(1, address)].proxy.port()
    }

    async fn wait_for_devices(
        devices: &mut watch::Receiver<Vec<DeviceStatus>>,
        condition: impl Fn(&[DeviceStatus]) -> bool,
    ) -> Vec<DeviceStatus> {
        let wait = async {
            loop {
                {
                    let current = devices.borrow_and_update();
                    if condition(&current) {
                        return current.clone();
                    }
                }
                devices.changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("device condition not reached")
    }

    async fn wait_for_state(state: &mut watch::Receiver<ManagerState>, wanted: ManagerState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while *state.borrow_and_update() != wanted {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("manager state not reached");
    }

    fn active(address: u8) -> impl Fn(&[DeviceStatus]) -> bool {
        move |devices| {
            devices.iter().any(|d| {
                d.addr == UsbAddr::new(1, address) && d.state == DeviceState::Active
            })
        }
    }

    fn get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        write!(
            stream,
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attach_serve_and_detach() {
        let fixture = Fixture::new(0..=0);
        let device = fixture.plug(4);
        let mut manager = fixture.manager(PnpMode::Persistent);

        manager.rescan().await;
        assert_eq!(*manager.subscribe_state().borrow(), ManagerState::Starting);
        let port = port_of(&manager, 4);
        assert_eq!(device.claimed_interfaces(), vec![0, 1]);

        let response = tokio::task::spawn_blocking(move || get(port, "/ipp/print"))
            .await
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("served GET /ipp/print HTTP/1.1"));

        let status = StatusFile::new(&fixture.config.status_file).read().unwrap();
        assert_eq!(status.len(), 1);
        assert!(status[0].contains("active"));

        fixture.backend.unplug(UsbAddr::new(1, 4));
        manager.handle_event(Some(PnpEvent::Changed)).await;
        assert!(manager.devices.is_empty());
        assert!(device.claimed_interfaces().is_empty());
        assert!(StatusFile::new(&fixture.config.status_file)
            .read()
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn max_channels_from_config() {
        let mut fixture = Fixture::new(0..=0);
        let mut config = (*fixture.config).clone();
        config.devices.insert(
            (0x18d1, 0x505e),
            crate::config::DeviceConfig { max_channels: 1 },
        );
        fixture.config = Arc::new(config);
        let device = fixture.plug(4);
        let mut manager = fixture.manager(PnpMode::Persistent);

        manager.rescan().await;
        assert_eq!(manager.devices[&UsbAddr::new(1, 4)].proxy.pool().capacity(), 1);
        assert_eq!(device.claimed_interfaces(), vec![0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_device_skipped_until_unplugged() {
        let fixture = Fixture::new(0..=0);
        let broken = SimDevice::new(
            sim::descriptor(1, 4, 2, 512),
            Behavior::Http(sim::http_responder()),
        );
        broken.refuse_claim(0);
        broken.refuse_claim(1);
        fixture.backend.plug(broken);
        let mut manager = fixture.manager(PnpMode::Persistent);

        manager.rescan().await;
        assert!(manager.devices.is_empty());
        assert!(manager.failed.contains_key(&UsbAddr::new(1, 4)));

        let scans = fixture.backend.scans();
        manager.rescan().await;
        assert_eq!(fixture.backend.scans(), scans + 1);
        assert!(manager.devices.is_empty());

        fixture.backend.unplug(UsbAddr::new(1, 4));
        manager.rescan().await;
        assert!(manager.failed.is_empty());

        fixture.plug(4);
        manager.rescan().await;
        assert!(manager.devices.contains_key(&UsbAddr::new(1, 4)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transport_loss_reattaches_on_same_port() {
        let fixture = Fixture::new(47100..=47199);
        fixture.plug(4);
        let mut manager = fixture.manager(PnpMode::Persistent);

        manager.rescan().await;
        let port = port_of(&manager, 4);

        let exit = manager
            .handle_event(Some(PnpEvent::TransportLost(UsbAddr::new(1, 4))))
            .await;
        assert_eq!(exit, None);
        assert_eq!(port_of(&manager, 4), port);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_strings_keep_device_attached() {
        let fixture = Fixture::new(0..=0);
        let device = fixture.plug(4);
        let mut manager = fixture.manager(PnpMode::Persistent);
        manager.rescan().await;
        let port = port_of(&manager, 4);

        fixture.backend.fail_string_reads(UsbAddr::new(1, 4));
        manager.handle_event(Some(PnpEvent::Changed)).await;
        assert_eq!(port_of(&manager, 4), port);
        assert_eq!(device.claimed_interfaces(), vec![0, 1]);
        assert_eq!(manager.devices[&UsbAddr::new(1, 4)].descriptor.serial, "SIM001004");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_is_current_when_devices_change() {
        let fixture = Fixture::new(0..=0);
        let manager = fixture.manager(PnpMode::Persistent);
        let events = manager.events();
        let mut state = manager.subscribe_state();
        let mut devices = manager.subscribe_devices();
        let run = tokio::spawn(manager.run());
        wait_for_state(&mut state, ManagerState::Idle).await;

        for _ in 0..3 {
            fixture.plug(4);
            events.send(PnpEvent::Changed).unwrap();
            wait_for_devices(&mut devices, active(4)).await;
            assert_eq!(*state.borrow(), ManagerState::Running);

            fixture.backend.unplug(UsbAddr::new(1, 4));
            events.send(PnpEvent::Changed).unwrap();
            wait_for_devices(&mut devices, |d| d.is_empty()).await;
            assert_eq!(*state.borrow(), ManagerState::Idle);
        }

        events.send(PnpEvent::Shutdown).unwrap();
        assert_eq!(run.await.unwrap(), PnpExit::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_detaches_everything() {
        let fixture = Fixture::new(0..=0);
        let first = fixture.plug(4);
        let second = fixture.plug(5);
        let mut manager = fixture.manager(PnpMode::Persistent);
        manager.rescan().await;
        assert_eq!(manager.devices.len(), 2);

        let exit = manager.handle_event(Some(PnpEvent::Shutdown)).await;
        assert_eq!(exit, Some(PnpExit::Shutdown));
        assert!(manager.devices.is_empty());
        assert!(first.claimed_interfaces().is_empty());
        assert!(second.claimed_interfaces().is_empty());
        assert_eq!(*manager.subscribe_state().borrow(), ManagerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persistent_mode_waits_without_devices() {
        let fixture = Fixture::new(0..=0);
        let manager = fixture.manager(PnpMode::Persistent);
        let events = manager.events();
        let mut state = manager.subscribe_state();
        let mut devices = manager.subscribe_devices();
        let run = tokio::spawn(manager.run());
        wait_for_state(&mut state, ManagerState::Idle).await;

        fixture.plug(7);
        events.send(PnpEvent::Changed).unwrap();
        wait_for_devices(&mut devices, active(7)).await;
        assert_eq!(*state.borrow(), ManagerState::Running);

        events.send(PnpEvent::Shutdown).unwrap();
        assert_eq!(run.await.unwrap(), PnpExit::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_mode_without_devices_exits() {
        let fixture = Fixture::new(0..=0);
        let manager = fixture.manager(PnpMode::Transient);
        let state = manager.subscribe_state();

        let exit = tokio::time::timeout(Duration::from_secs(10), manager.run())
            .await
            .unwrap();
        assert_eq!(exit, PnpExit::Idle);
        assert_eq!(*state.borrow(), ManagerState::Stopped);

        // The lock is free for the next instance.
        fixture.lock().acquire(LockMode::NoWait).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_arriving_while_going_idle_is_served() {
        let fixture = Fixture::new(0..=0);
        fixture.plug(4);
        let manager = fixture.manager(PnpMode::Transient);
        let events = manager.events();
        let state = manager.subscribe_state();
        let mut devices = manager.subscribe_devices();
        let run = tokio::spawn(manager.run());
        wait_for_devices(&mut devices, active(4)).await;

        // The rescan that notices the unplug sees no device, then the new one arrives.
        fixture.backend.unplug(UsbAddr::new(1, 4));
        let backend = fixture.backend.clone();
        fixture.backend.after_scan(move || {
            backend.plug(SimDevice::new(
                sim::descriptor(1, 5, 2, 512),
                Behavior::Http(sim::http_responder()),
            ));
        });
        events.send(PnpEvent::Changed).unwrap();

        let current = wait_for_devices(&mut devices, active(5)).await;
        assert_eq!(current.len(), 1);
        assert_eq!(*state.borrow(), ManagerState::Running);
        // The manager holds the lock again.
        assert!(matches!(
            fixture.lock().acquire(LockMode::NoWait),
            Err(lock::Error::Busy(_))
        ));

        events.send(PnpEvent::Shutdown).unwrap();
        assert_eq!(run.await.unwrap(), PnpExit::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn competing_instance_wins_idle_race() {
        let fixture = Fixture::new(0..=0);
        fixture.plug(4);
        let manager = fixture.manager(PnpMode::Transient);
        let events = manager.events();
        let state = manager.subscribe_state();
        let mut devices = manager.subscribe_devices();
        let run = tokio::spawn(manager.run());
        wait_for_devices(&mut devices, active(4)).await;

        fixture.backend.unplug(UsbAddr::new(1, 4));
        let backend = fixture.backend.clone();
        fixture.backend.after_scan(move || {
            backend.plug(SimDevice::new(
                sim::descriptor(1, 5, 2, 512),
                Behavior::Http(sim::http_responder()),
            ));
        });
        // A new instance takes the lock right after the idle manager released it.
        let competitor = Arc::new(Mutex::new(None));
        let taken = competitor.clone();
        let lock_file = fixture.config.lock_file.clone();
        fixture.backend.after_scan(move || {
            let mut lock = SingletonLock::new(lock_file);
            lock.acquire(LockMode::NoWait).unwrap();
            *taken.lock().unwrap() = Some(lock);
        });
        events.send(PnpEvent::Changed).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, PnpExit::Idle);
        assert_eq!(*state.borrow(), ManagerState::Stopped);
        assert!(competitor.lock().unwrap().is_some());
        assert!(!devices.borrow().iter().any(|d| d.addr == UsbAddr::new(1, 5)));
    }

    #[test]
    fn device_state_names() {
        assert_eq!(DeviceState::Absent.to_string(), "absent");
        assert_eq!(DeviceState::Detaching.to_string(), "detaching");
    }
}
