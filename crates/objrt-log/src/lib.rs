//! A minimal, zero-dependency logging crate for the `objrt` runtime.
//!
//! The runtime reports registry changes, dispatch-table rebuilds, forwarding
//! and contract violations through these macros. Output is colored and goes
//! to stderr unless a sink has been installed with [`set_sink`].
//!
//! # Configuration
//!
//! The threshold defaults to [`LevelFilter::Warn`]. It can be changed with
//! [`set_level`], or read from the `OBJRT_LOG` environment variable with
//! [`init_from_env`].
//!
//! # Example
//!
//! ```
//! use objrt_log::{LevelFilter, debug, error, info, warn};
//!
//! objrt_log::set_level(LevelFilter::Debug);
//!
//! let class = "Counter";
//! info!("registered class {}", class);
//! debug!("dispatch table: {:?}", vec!["increment", "value"]);
//! warn!("autorelease without a pool");
//! error!("over-release of {}", class);
//! ```

use std::fmt::Arguments;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

/// Name of the environment variable read by [`init_from_env`].
pub const ENV_VAR: &str = "OBJRT_LOG";

/// Severity of a log message, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

/// Logging threshold. Messages more verbose than the filter are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LevelFilter {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LevelFilter {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

impl FromStr for LevelFilter {
    type Err = String;

    /// Parses a case-insensitive level name.
    ///
    /// ```
    /// use objrt_log::LevelFilter;
    ///
    /// assert_eq!("debug".parse(), Ok(LevelFilter::Debug));
    /// assert_eq!("OFF".parse(), Ok(LevelFilter::Off));
    /// assert!("loud".parse::<LevelFilter>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(LevelFilter::Off),
            "ERROR" => Ok(LevelFilter::Error),
            "WARN" => Ok(LevelFilter::Warn),
            "INFO" => Ok(LevelFilter::Info),
            "DEBUG" => Ok(LevelFilter::Debug),
            "TRACE" => Ok(LevelFilter::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

/// The global logger. Holds only the threshold; output goes through
/// [`__log_with_target`].
pub struct Logger {
    level: AtomicU8,
}

impl Logger {
    const fn new(level: LevelFilter) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
        }
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    #[must_use]
    pub fn level(&self) -> LevelFilter {
        LevelFilter::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Checks if a message at the given level would be logged.
    #[inline]
    #[must_use]
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }
}

static LOGGER: Logger = Logger::new(LevelFilter::Warn);

type Sink = Box<dyn Write + Send>;

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Returns the global logger.
#[inline]
#[must_use]
pub fn get_logger() -> &'static Logger {
    &LOGGER
}

/// Sets the threshold of the global logger.
pub fn set_level(level: LevelFilter) {
    LOGGER.set_level(level);
}

/// Sets the threshold from a level name.
///
/// # Errors
///
/// Returns a description of the problem if `s` is not a level name.
pub fn set_level_from_str(s: &str) -> Result<(), String> {
    set_level(s.parse()?);
    Ok(())
}

/// Applies the threshold named by `OBJRT_LOG`, if set.
///
/// An unparsable value is reported at warn level and leaves the threshold
/// unchanged. Returns the threshold in effect afterwards.
pub fn init_from_env() -> LevelFilter {
    if let Ok(value) = std::env::var(ENV_VAR) {
        if let Err(e) = set_level_from_str(&value) {
            crate::warn!("ignoring {}: {}", ENV_VAR, e);
        }
    }
    LOGGER.level()
}

/// Redirects all output to `sink`, replacing any previous sink.
///
/// Lines written to a sink carry no color codes.
pub fn set_sink(sink: Box<dyn Write + Send>) {
    *SINK.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
}

/// Restores the default stderr output, returning the removed sink.
pub fn take_sink() -> Option<Box<dyn Write + Send>> {
    SINK.lock().unwrap_or_else(PoisonError::into_inner).take()
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    const RESET: &str = "\x1b[0m";

    if !LOGGER.enabled(level) {
        return;
    }

    let level_str = level.as_str();
    let mut sink = SINK.lock().unwrap_or_else(PoisonError::into_inner);

    // Logging never fails the caller; a broken sink drops the line
    let _ = match sink.as_mut() {
        Some(out) => writeln!(out, "[{level_str}] {target}: {args}"),
        None => {
            let color = level.color_code();
            writeln!(
                std::io::stderr().lock(),
                "{color}[{level_str}]{RESET} {target}: {args}"
            )
        }
    };
}

/// Logs a message at an explicit level, tagged with the calling module.
///
/// ```
/// use objrt_log::{Level, log};
///
/// log!(level: Level::Info, "cache rebuilt for {} selectors", 12);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            let level = $level;
            if $crate::get_logger().enabled(level) {
                $crate::__log_with_target(
                    level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
