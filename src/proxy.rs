// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::io;
use std::net::{
    IpAddr, Shutdown, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream,
};
use std::ops::RangeInclusive;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::sys::socket::{setsockopt, sockopt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle as AsyncHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::UsbConnection;
use crate::device_info::UsbAddr;
use crate::http;
use crate::pnp::PnpEvent;
use crate::pool::ChannelPool;

// Connections blocked on the device notice a closed pool within this long, unless they are in
// the middle of an OUT transfer.
const RELEASE_WAIT: Duration = Duration::from_secs(2);

/// Reason for shutting down a proxy.  Only used for logging.
#[derive(Copy, Clone, Debug)]
pub enum ShutdownReason {
    /// The main process received a shutdown signal.
    Signal,

    /// The device is no longer on the bus.
    Unplugged,

    /// A transfer on one of the device's channels failed.
    TransportLost,
}

/// Per-connection settings.
#[derive(Copy, Clone, Debug)]
pub struct ProxyOptions {
    /// Log every relayed head line and USB transfer.
    pub verbose_log: bool,
    /// How long an accepted connection waits for a free channel before it is reset.
    pub lease_timeout: Duration,
    pub transfer_timeout: Duration,
    /// How long a client may stay silent between requests.
    pub idle_timeout: Duration,
}

/// Bind a listener on `address`, trying `preferred` first and then every port of `ports` in
/// order.  A range starting at port 0 lets the OS pick the port.
pub fn bind_listener(
    address: IpAddr,
    ports: RangeInclusive<u16>,
    preferred: Option<u16>,
) -> io::Result<StdTcpListener> {
    if *ports.start() == 0 {
        return StdTcpListener::bind((address, 0));
    }

    let candidates = preferred
        .filter(|port| ports.contains(port))
        .into_iter()
        .chain(ports);
    for port in candidates {
        match StdTcpListener::bind((address, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free port in the configured range",
    ))
}

// Client sockets of all live connections, so that they can be closed from outside the relay.
#[derive(Default)]
struct Clients {
    next_id: u64,
    streams: HashMap<u64, StdTcpStream>,
}

impl Clients {
    fn register(&mut self, stream: StdTcpStream) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.streams.insert(id, stream);
        id
    }

    fn shutdown_all(&mut self) {
        for (_, stream) in self.streams.drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Abort a connection with a TCP reset instead of an orderly close.
fn reset_connection(stream: &StdTcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    if let Err(e) = setsockopt(stream.as_raw_fd(), sockopt::Linger, &linger) {
        debug!("Failed to set SO_LINGER: {}", e);
    }
}

// Everything a blocking connection task needs.
struct ConnectionTask {
    client_num: usize,
    id: u64,
    options: ProxyOptions,
    pool: ChannelPool,
    clients: Arc<Mutex<Clients>>,
    events: mpsc::UnboundedSender<PnpEvent>,
}

impl ConnectionTask {
    fn run(self, stream: StdTcpStream) {
        let addr = self.pool.addr();
        let channel = match self.pool.lease(self.options.lease_timeout) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    "{}: resetting connection {}: {}",
                    addr, self.client_num, err
                );
                reset_connection(&stream);
                self.unregister();
                return;
            }
        };
        debug!(
            "{}: connection {} relaying over interface {}",
            addr,
            self.client_num,
            channel.descriptor().interface_number
        );

        if let Err(err) = stream.set_read_timeout(Some(self.options.idle_timeout)) {
            debug!("{}: failed to set idle timeout: {}", addr, err);
        }
        let mut usb = UsbConnection::new(
            self.options.verbose_log,
            self.options.transfer_timeout,
            channel,
        );
        match http::relay(self.options.verbose_log, &stream, &stream, &mut usb) {
            Ok(relayed) => debug!(
                "{}: connection {} closed after {} exchanges{}",
                addr,
                self.client_num,
                relayed.exchanges,
                if relayed.idle { ", idle" } else { "" }
            ),
            Err(err) if err.is_transport_lost() && self.pool.is_closed() => {
                debug!("{}: connection {} cancelled: {}", addr, self.client_num, err)
            }
            Err(err) if err.is_transport_lost() => {
                error!("{}: connection {}: {}", addr, self.client_num, err);
                // Nothing to do if the manager is already gone.
                let _ = self.events.send(PnpEvent::TransportLost(addr));
            }
            Err(err) => info!("{}: connection {}: {}", addr, self.client_num, err),
        }

        drop(usb);
        self.unregister();
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn unregister(&self) {
        self.clients.lock().unwrap().streams.remove(&self.id);
    }
}

/// The accept loop of one proxy.
///
/// Each accepted connection gets its own blocking task that leases a channel for the whole
/// lifetime of the TCP connection and relays HTTP exchanges over it.  rusb doesn't support async
/// I/O, so both the lease and the relay run on tokio's blocking thread pool.
struct Bridge {
    options: ProxyOptions,
    num_clients: Arc<AtomicUsize>,

    shutdown: mpsc::Receiver<ShutdownReason>,
    listener: TcpListener,
    pool: ChannelPool,
    clients: Arc<Mutex<Clients>>,
    events: mpsc::UnboundedSender<PnpEvent>,
    handle: AsyncHandle,
}

impl Bridge {
    async fn run(&mut self) {
        'poll: loop {
            tokio::select! {
                shutdown_type = self.shutdown.recv() => {
                    info!(
                        "{}: shutdown event received: {:?}",
                        self.pool.addr(),
                        shutdown_type.unwrap_or(ShutdownReason::Signal));
                    break 'poll;
                }

                c = self.listener.accept() => {
                    match c {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(err) => error!("Failed to accept connection: {}", err),
                    }
                }
            }
        }
    }

    fn handle_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let client_num = self.num_clients.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "{}: connection {} opened from {}",
            self.pool.addr(),
            client_num,
            peer
        );

        let stream = match stream
            .into_std()
            .and_then(|s| s.set_nonblocking(false).map(|_| s))
        {
            Ok(stream) => stream,
            Err(err) => {
                error!("Failed to set up connection {}: {}", client_num, err);
                return;
            }
        };
        let registered = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                error!("Failed to set up connection {}: {}", client_num, err);
                return;
            }
        };
        let id = self.clients.lock().unwrap().register(registered);

        let task = ConnectionTask {
            client_num,
            id,
            options: self.options,
            pool: self.pool.clone(),
            clients: self.clients.clone(),
            events: self.events.clone(),
        };
        self.handle.spawn_blocking(move || task.run(stream));
    }
}

/// A running HTTP proxy for one attached device.
pub struct ProxyInstance {
    addr: UsbAddr,
    port: u16,
    pool: ChannelPool,
    shutdown: mpsc::Sender<ShutdownReason>,
    task: JoinHandle<()>,
    clients: Arc<Mutex<Clients>>,
    num_clients: Arc<AtomicUsize>,
}

impl ProxyInstance {
    /// Start accepting connections on `listener` and relaying them to `pool`.  Transport losses
    /// are reported on `events`.
    pub fn start(
        listener: StdTcpListener,
        pool: ChannelPool,
        options: ProxyOptions,
        events: mpsc::UnboundedSender<PnpEvent>,
        handle: &AsyncHandle,
    ) -> io::Result<Self> {
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(listener)?
        };

        let addr = pool.addr();
        let clients = Arc::new(Mutex::new(Clients::default()));
        let num_clients = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let mut bridge = Bridge {
            options,
            num_clients: num_clients.clone(),
            shutdown: shutdown_rx,
            listener,
            pool: pool.clone(),
            clients: clients.clone(),
            events,
            handle: handle.clone(),
        };
        let task = handle.spawn(async move { bridge.run().await });
        info!("{}: listening on port {}", addr, port);

        Ok(Self {
            addr,
            port,
            pool,
            shutdown: shutdown_tx,
            task,
            clients,
            num_clients,
        })
    }

    pub fn addr(&self) -> UsbAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Connections that are waiting for a channel or being relayed.
    pub fn active_connections(&self) -> usize {
        self.clients.lock().unwrap().streams.len()
    }

    /// Connections accepted since the proxy started.
    pub fn connections_accepted(&self) -> usize {
        self.num_clients.load(Ordering::Relaxed)
    }

    /// Stop the proxy.  The listener is closed right away.  Open connections get `grace` to
    /// finish, then their sockets are shut down.  Finally the pool is closed, which cancels any
    /// transfer still waiting on the device, and the interfaces are released.
    pub async fn stop(mut self, reason: ShutdownReason, grace: Duration) {
        // The bridge may already have exited if its runtime is shutting down.
        let _ = self.shutdown.send(reason).await;
        if let Err(err) = (&mut self.task).await {
            error!("{}: proxy task failed: {}", self.addr, err);
        }

        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.active_connections();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "{}: closing {} connections still open after {}ms",
                    self.addr,
                    remaining,
                    grace.as_millis()
                );
                self.clients.lock().unwrap().shutdown_all();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.pool.close();
        let deadline = Instant::now() + RELEASE_WAIT;
        loop {
            let leased = self.pool.leased();
            if leased == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "{}: {} channels still in use after stopping",
                    self.addr, leased
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!("{}: proxy on port {} stopped", self.addr, self.port);
    }
}
