// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod arguments;
mod logging;

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use ippusbd::hotplug::HotplugWatcher;
use ippusbd::lock::{self, LockMode, SingletonLock};
use ippusbd::status::{format_report, StatusFile};
use ippusbd::{
    Config, DeviceDescriptor, PnpEvent, PnpExit, PnpManager, PnpMode, RusbBackend, UsbBackend,
};
use log::{debug, error, info, LevelFilter};
use nix::unistd;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::signal::unix::{self, SignalKind};

use crate::arguments::{Args, Mode};

#[derive(Debug)]
pub enum Error {
    ParseArgs(arguments::Error),
    Config(ippusbd::config::Error),
    Logging(logging::Error),
    NotRoot,
    Lock(lock::Error),
    Daemonize(nix::Error),
    DevNull(io::Error),
    Status(ippusbd::status::Error),
    Usb(ippusbd::Error),
    TokioRuntime(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            ParseArgs(err) => write!(f, "Failed to parse arguments: {}", err),
            Config(err) => write!(f, "{}", err),
            Logging(err) => write!(f, "{}", err),
            NotRoot => write!(f, "This mode must be run as root"),
            Lock(err) => write!(f, "{}", err),
            Daemonize(err) => write!(f, "Failed to move to the background: {}", err),
            DevNull(err) => write!(f, "Failed to redirect standard streams: {}", err),
            Status(err) => write!(f, "{}", err),
            Usb(err) => write!(f, "{}", err),
            TokioRuntime(err) => write!(f, "Error setting up tokio runtime: {}", err),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// The table printed by `ippusbd check`.
fn format_device_list(devices: &[DeviceDescriptor]) -> String {
    if devices.is_empty() {
        return "No IPP over USB devices found".to_owned();
    }
    let mut text = " Num  Device              Vndr:Prod  Model".to_owned();
    for (num, device) in devices.iter().enumerate() {
        text.push_str(&format!(
            "\n {:3}  {:<20}{:04x}:{:04x}  {:?}",
            num + 1,
            device.addr.to_string(),
            device.vendor_id,
            device.product_id,
            device.model()
        ));
    }
    text
}

fn run_check(config: &Config) -> Result<()> {
    println!("Configuration OK");
    debug!("{:?}", config);

    let backend = RusbBackend::new().map_err(Error::Usb)?;
    let devices = backend.enumerate().map_err(Error::Usb)?;
    println!("{}", format_device_list(&devices));
    Ok(())
}

/// The text printed by `ippusbd status`.  A status file left behind by a daemon that is no
/// longer running is stale and not shown.
fn format_status(running: bool, lines: &[String]) -> String {
    match running {
        true => format!("ippusbd is running\n{}", format_report(lines)),
        false => "ippusbd is not running".to_owned(),
    }
}

fn run_status(config: &Config) -> Result<()> {
    let mut probe = SingletonLock::new(&config.lock_file);
    let running = match probe.acquire(LockMode::TestOnly) {
        Ok(()) => false,
        Err(lock::Error::Busy(_)) => true,
        Err(e) => return Err(Error::Lock(e)),
    };

    let lines = match running {
        true => StatusFile::new(&config.status_file)
            .read()
            .map_err(Error::Status)?,
        false => Vec::new(),
    };
    println!("{}", format_status(running, &lines));
    Ok(())
}

// Point stdin, stdout and stderr at /dev/null.
fn detach_stdio() -> Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(Error::DevNull)?;
    for fd in 0..=2 {
        unistd::dup2(null.as_raw_fd(), fd).map_err(|e| Error::DevNull(e.into()))?;
    }
    Ok(())
}

fn run_daemon(args: &Args, config: Config) -> Result<()> {
    let mut lock = SingletonLock::new(&config.lock_file);
    match lock.acquire(LockMode::NoWait) {
        Ok(()) => {}
        // udev starts us for every device that shows up.  The running daemon picks it up.
        Err(lock::Error::Busy(_)) if args.mode == Mode::Udev => {
            debug!("Already running");
            return Ok(());
        }
        Err(e) => return Err(Error::Lock(e)),
    }

    // The forked child inherits the locked file description.
    if args.background {
        unistd::daemon(false, false).map_err(Error::Daemonize)?;
    } else if args.mode != Mode::Debug {
        detach_stdio()?;
    }

    let mode = match args.mode {
        Mode::Udev => PnpMode::Transient,
        _ => PnpMode::Persistent,
    };
    let config = Arc::new(config);
    let backend = RusbBackend::new().map_err(Error::Usb)?;
    let mut manager = PnpManager::new(config.clone(), Arc::new(backend.clone()), lock, mode);
    let events = manager.events();

    let hotplug = HotplugWatcher::new(backend.context(), events.clone()).map_err(Error::Usb)?;
    manager.set_poll_interval(config.rescan_interval(hotplug.is_some()));

    // Respond to both SIGINT and SIGTERM by doing a clean shutdown.  Deliberately
    // use unwrap in these functions because if something goes wrong with signal handling
    // then we need the process to exit anyway.
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::TokioRuntime)?;
    let signal_tx = events.clone();
    runtime.spawn(async move {
        signal::ctrl_c().await.unwrap();
        let _ = signal_tx.send(PnpEvent::Shutdown);
    });
    let signal_tx = events;
    runtime.spawn(async move {
        unix::signal(SignalKind::terminate())
            .unwrap()
            .recv()
            .await
            .unwrap();
        let _ = signal_tx.send(PnpEvent::Shutdown);
    });

    info!("Started in {:?} mode", args.mode);
    match runtime.block_on(manager.run()) {
        PnpExit::Shutdown => info!("Shutting down."),
        PnpExit::Idle => info!("No devices left, exiting."),
    }
    drop(hotplug);
    runtime.shutdown_timeout(Duration::from_millis(500));
    Ok(())
}

fn run() -> Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = match Args::parse(&argv).map_err(Error::ParseArgs)? {
        None => return Ok(()),
        Some(args) => args,
    };
    let config = Config::load(args.config.as_deref()).map_err(Error::Config)?;

    let console = match args.mode.uses_console() {
        true => Some(config.console_log),
        false => None,
    };
    // check and status are interactive; keep syslog out of their way.
    let main_log = match args.mode {
        Mode::Check | Mode::Status => LevelFilter::Warn.min(config.main_log),
        _ => config.main_log,
    };
    logging::init(main_log, console).map_err(Error::Logging)?;

    if args.mode != Mode::Check && !unistd::geteuid().is_root() {
        return Err(Error::NotRoot);
    }

    // Safe because the syscall doesn't touch any memory and always succeeds.
    unsafe { libc::umask(0o022) };

    match args.mode {
        Mode::Check => run_check(&config),
        Mode::Status => run_status(&config),
        Mode::Standalone | Mode::Udev | Mode::Debug => run_daemon(&args, config),
    }
}

fn main() {
    // Use run() instead of returning a Result from main() so that we can print
    // errors using Display instead of Debug.
    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("ippusbd: {}", e);
        std::process::exit(1);
    }
}
