//! Structured logging for poolshift.
//!
//! Log levels:
//! - ERROR: Failures that abort a command
//! - WARN: Recoverable conditions (step-3 flag failures, skipped pods, retries)
//! - INFO: Protocol milestones (swap steps, commits, pushes, applies)
//! - DEBUG: Per-poll and per-probe traces
//! - TRACE: Raw kubectl/git payloads
//!
//! There is no global logger. A [`Logger`] handle is created once per
//! invocation and travels inside [`crate::Context`]; the `plog*` macros take
//! it as their first argument. Debug mode can be enabled with `--debug` or
//! `POOLSHIFT_DEBUG=1`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

#[derive(Debug)]
enum Sink {
    File(PathBuf),
    Memory(Mutex<Vec<String>>),
    Discard,
}

#[derive(Debug)]
struct Inner {
    level: AtomicU8,
    sink: Sink,
    echo_stderr: bool,
}

/// Cheaply cloneable logging handle.
#[derive(Debug, Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    fn with_sink(sink: Sink, level: LogLevel, echo_stderr: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                level: AtomicU8::new(level as u8),
                sink,
                echo_stderr,
            }),
        }
    }

    /// Log to ~/.poolshift/poolshift.log, echoing warnings and errors to stderr.
    pub fn init(debug: bool) -> Self {
        let env_debug = std::env::var("POOLSHIFT_DEBUG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let level = if debug || env_debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };

        let sink = match dirs::home_dir().map(|h| h.join(".poolshift")) {
            Some(dir) => {
                let _ = std::fs::create_dir_all(&dir);
                Sink::File(dir.join("poolshift.log"))
            }
            None => Sink::Discard,
        };
        Self::with_sink(sink, level, true)
    }

    /// Log to an explicit file path.
    pub fn to_file(path: impl Into<PathBuf>, level: LogLevel) -> Self {
        Self::with_sink(Sink::File(path.into()), level, false)
    }

    /// Keep every line in memory. Used by tests to assert on log output.
    pub fn memory(level: LogLevel) -> Self {
        Self::with_sink(Sink::Memory(Mutex::new(Vec::new())), level, false)
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level as u8, Ordering::SeqCst);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    pub fn is_debug(&self) -> bool {
        self.level() >= LogLevel::Debug
    }

    /// Lines captured by a memory logger, empty for other sinks.
    pub fn lines(&self) -> Vec<String> {
        match &self.inner.sink {
            Sink::Memory(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn log_at(&self, level: LogLevel, msg: &str) {
        if level > self.level() {
            return;
        }

        if self.inner.echo_stderr && level <= LogLevel::Warn {
            eprintln!("{}: {}", level.as_str().to_lowercase(), msg);
        }

        match &self.inner.sink {
            Sink::File(path) => {
                if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
                }
            }
            Sink::Memory(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push(format!("[{}] {}", level.as_str(), msg));
                }
            }
            Sink::Discard => {}
        }
    }

    pub fn error(&self, msg: &str) {
        self.log_at(LogLevel::Error, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log_at(LogLevel::Warn, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log_at(LogLevel::Info, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.log_at(LogLevel::Debug, msg);
    }

    pub fn trace(&self, msg: &str) {
        self.log_at(LogLevel::Trace, msg);
    }
}

/// Log at INFO level.
#[macro_export]
macro_rules! plog {
    ($log:expr, $($arg:tt)*) => {
        $log.info(&format!($($arg)*))
    };
}

/// Log at ERROR level.
#[macro_export]
macro_rules! plog_error {
    ($log:expr, $($arg:tt)*) => {
        $log.error(&format!($($arg)*))
    };
}

/// Log at WARN level.
#[macro_export]
macro_rules! plog_warn {
    ($log:expr, $($arg:tt)*) => {
        $log.warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level.
#[macro_export]
macro_rules! plog_debug {
    ($log:expr, $($arg:tt)*) => {
        $log.debug(&format!($($arg)*))
    };
}

/// Log at TRACE level.
#[macro_export]
macro_rules! plog_trace {
    ($log:expr, $($arg:tt)*) => {
        $log.trace(&format!($($arg)*))
    };
}
