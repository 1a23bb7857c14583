// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::path::PathBuf;

use getopts::Options;

#[derive(Debug)]
pub enum Error {
    Parse(getopts::Fail),
    UnknownMode(String),
    ConflictingModes(String, String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Parse(err) => write!(f, "{}", err),
            UnknownMode(mode) => write!(f, "Unknown mode '{}'", mode),
            ConflictingModes(a, b) => write!(f, "Conflicting modes '{}' and '{}'", a, b),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Serve devices until killed.
    Standalone,
    /// Serve devices until the last one is unplugged.
    Udev,
    /// Standalone in the foreground with logs on stderr.
    Debug,
    /// Validate the configuration, list devices and exit.
    Check,
    /// Report whether a daemon is running and what it serves.
    Status,
}

impl Mode {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "standalone" => Some(Mode::Standalone),
            "udev" => Some(Mode::Udev),
            "debug" => Some(Mode::Debug),
            "check" => Some(Mode::Check),
            "status" => Some(Mode::Status),
            _ => None,
        }
    }

    /// Whether log output also goes to stderr.
    pub fn uses_console(self) -> bool {
        matches!(self, Mode::Debug | Mode::Check | Mode::Status)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Args {
    pub mode: Mode,
    pub background: bool,
    pub config: Option<PathBuf>,
}

fn usage(program: &str, opts: &Options) -> String {
    let brief = format!(
        "Usage: {} [standalone|udev|debug|check|status] [options]\n\
         Serve IPP-over-USB devices as local HTTP servers.  The default mode is debug.",
        program
    );
    opts.usage(&brief)
}

impl Args {
    /// Parse the command line.  Returns `None` if help was printed.
    pub fn parse(argv: &[String]) -> Result<Option<Self>> {
        let program = argv.first().map(String::as_str).unwrap_or("ippusbd");

        let mut opts = Options::new();
        opts.long_only(true);
        opts.optflag("", "bg", "Run in the background");
        opts.optopt("c", "config", "Configuration file", "PATH");
        opts.optflag("h", "help", "Print this help text");

        let matches = opts.parse(argv.iter().skip(1)).map_err(Error::Parse)?;
        if matches.opt_present("h") {
            println!("{}", usage(program, &opts));
            return Ok(None);
        }

        let mut mode: Option<(Mode, &str)> = None;
        for name in &matches.free {
            let parsed = Mode::from_name(name).ok_or_else(|| Error::UnknownMode(name.clone()))?;
            if let Some((_, previous)) = mode {
                return Err(Error::ConflictingModes(previous.to_owned(), name.clone()));
            }
            mode = Some((parsed, name));
        }
        let mode = mode.map(|(mode, _)| mode).unwrap_or(Mode::Debug);

        Ok(Some(Args {
            mode,
            // There is nothing to detach from when debugging.
            background: matches.opt_present("bg") && mode != Mode::Debug,
            config: matches.opt_str("c").map(PathBuf::from),
        }))
    }
}
