//! Plugin logger handed to every component.
//!
//! Each component receives a reference to a [`Logger`] built by the plugin
//! instead of reaching for process-wide state. By default lines are forwarded
//! to the `log` facade; hosts can route them to their own output window.

use std::cell::Cell;
use std::fmt;

use log::{Level, LevelFilter};

/// `log` target used when forwarding to the facade
pub const LOG_TARGET: &str = "unpacme_search";

type Sink = Box<dyn Fn(Level, &str)>;

/// `env_logger` setup for binaries.
///
/// Other targets follow `RUST_LOG` (default `info`). [`LOG_TARGET`] is
/// opened fully so a [`Logger`]'s own level decides what is written.
pub fn env_logger_builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_module(LOG_TARGET, LevelFilter::Trace);
    builder
}

/// A named logger with an adjustable level.
pub struct Logger {
    name: String,
    level: Cell<LevelFilter>,
    sink: Sink,
}

impl Logger {
    /// Logger at INFO that forwards to the `log` facade.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_sink(name, |level, line| {
            log::log!(target: LOG_TARGET, level, "{}", line);
        })
    }

    /// Logger at INFO that writes every enabled line to `sink`.
    pub fn with_sink(name: impl Into<String>, sink: impl Fn(Level, &str) + 'static) -> Self {
        Self {
            name: name.into(),
            level: Cell::new(LevelFilter::Info),
            sink: Box::new(sink),
        }
    }

    /// Name used as the line prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current level
    pub fn level(&self) -> LevelFilter {
        self.level.get()
    }

    /// Change the level; takes effect for the next line.
    pub fn set_level(&self, level: LevelFilter) {
        self.level.set(level);
    }

    /// Returns true if a line at `level` would be written
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level.get()
    }

    /// Write one line as `<name>:<LEVEL>:<message>`.
    pub fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let line = format!("{}:{}:{}", self.name, level_name(level), args);
        (self.sink)(level, &line);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("level", &self.level.get())
            .finish()
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {
        $logger.emit(::log::Level::Debug, format_args!($($arg)+))
    };
}

macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => {
        $logger.emit(::log::Level::Info, format_args!($($arg)+))
    };
}

macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => {
        $logger.emit(::log::Level::Warn, format_args!($($arg)+))
    };
}

macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $logger.emit(::log::Level::Error, format_args!($($arg)+))
    };
}

pub(crate) use {log_debug, log_error, log_info, log_warn};
