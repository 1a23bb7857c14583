// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use log::{LevelFilter, Log, Metadata, Record};
use syslog::{BasicLogger, Facility, Formatter3164};

const LOG_PREFIX: &str = "ippusbd";

#[derive(Debug)]
pub enum Error {
    NoSink(syslog::Error),
    SetLogger(log::SetLoggerError),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            NoSink(err) => write!(f, "Failed to initialize syslog: {}", err),
            SetLogger(err) => write!(f, "Failed to install logger: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sends every record to each sink whose level lets it through.
struct DaemonLogger {
    sinks: Vec<(Box<dyn Log>, LevelFilter)>,
}

impl DaemonLogger {
    fn max_level(&self) -> LevelFilter {
        self.sinks
            .iter()
            .map(|(_, level)| *level)
            .max()
            .unwrap_or(LevelFilter::Off)
    }
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        for (sink, level) in &self.sinks {
            if record.level() <= *level {
                sink.log(record);
            }
        }
    }

    fn flush(&self) {
        for (sink, _) in &self.sinks {
            sink.flush();
        }
    }
}

fn create_syslogger() -> std::result::Result<BasicLogger, syslog::Error> {
    let formatter = Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: LOG_PREFIX.into(),
        pid: std::process::id(),
    };
    syslog::unix(formatter).map(BasicLogger::new)
}

// stderrlog counts verbosity up from errors only.
fn verbosity(level: LevelFilter) -> usize {
    match level {
        LevelFilter::Off | LevelFilter::Error => 0,
        LevelFilter::Warn => 1,
        LevelFilter::Info => 2,
        LevelFilter::Debug => 3,
        LevelFilter::Trace => 4,
    }
}

fn create_console_logger(level: LevelFilter) -> stderrlog::StdErrLog {
    let mut console = stderrlog::new();
    console
        .verbosity(verbosity(level))
        .quiet(level == LevelFilter::Off)
        .timestamp(stderrlog::Timestamp::Millisecond);
    console
}

/// Install the process logger: syslog at `main`, plus stderr at `console` if given.
///
/// A missing syslog daemon is only fatal when there is no console to log to instead.
pub fn init(main: LevelFilter, console: Option<LevelFilter>) -> Result<()> {
    let mut sinks: Vec<(Box<dyn Log>, LevelFilter)> = Vec::new();
    match create_syslogger() {
        Ok(syslogger) => sinks.push((Box::new(syslogger), main)),
        Err(e) if console.is_some() => eprintln!("{}: syslog unavailable: {}", LOG_PREFIX, e),
        Err(e) => return Err(Error::NoSink(e)),
    }
    if let Some(level) = console {
        sinks.push((Box::new(create_console_logger(level)), level));
    }

    let logger = DaemonLogger { sinks };
    let max_level = logger.max_level();
    log::set_boxed_logger(Box::new(logger)).map_err(Error::SetLogger)?;
    log::set_max_level(max_level);
    Ok(())
}
