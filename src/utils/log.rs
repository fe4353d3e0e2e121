//! Simple logging module.

use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Log level for filtering messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static START: OnceLock<Instant> = OnceLock::new();

/// Initialize the logger with the given level.
pub fn init(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    START.get_or_init(Instant::now);
}

/// Returns true if the given level should be logged.
#[inline]
fn enabled(level: Level) -> bool {
    level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Internal logging function with optional identifier prefix.
///
/// Timestamps are seconds since the logger was initialized; a VM runner cares
/// about relative timing, not wall-clock dates.
fn log_with_id(level: Level, id: Option<&str>, message: &str) {
    if enabled(level) {
        let elapsed = START.get_or_init(Instant::now).elapsed();
        let stamp = format!("{:8.3}s", elapsed.as_secs_f64());
        match id {
            Some(id) => eprintln!("[{stamp}] [{level:5}] [{id}] {message}"),
            None => eprintln!("[{stamp}] [{level:5}] {message}"),
        }
    }
}

/// Logger instance with an identifier prefix.
///
/// Each logger carries an ID that is prepended to all log messages, allowing
/// differentiation between multiple components (e.g., several VM instances).
#[derive(Clone)]
pub struct Logger {
    pub id: Arc<str>,
}

impl Logger {
    /// Creates a new logger with the given identifier.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self { id: id.into() }
    }

    /// Logs an info-level message.
    pub fn info(&self, message: &str) {
        log_with_id(Level::Info, Some(&self.id), message);
    }

    /// Logs a warning-level message.
    pub fn warn(&self, message: &str) {
        log_with_id(Level::Warn, Some(&self.id), message);
    }

    /// Logs an error-level message.
    pub fn error(&self, message: &str) {
        log_with_id(Level::Error, Some(&self.id), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn level_display() {
        assert_eq!(format!("{}", Level::Info), "INFO");
        assert_eq!(format!("{}", Level::Warn), "WARN");
        assert_eq!(format!("{}", Level::Error), "ERROR");
    }

    #[test]
    fn logger_clone_shares_id() {
        let logger = Logger::new("vm");
        let clone = logger.clone();
        assert_eq!(&*logger.id, &*clone.id);
    }

    #[test]
    fn init_sets_log_level() {
        init(Level::Error);
        assert!(!enabled(Level::Info));
        assert!(!enabled(Level::Warn));
        assert!(enabled(Level::Error));

        init(Level::Info);
        assert!(enabled(Level::Info));
    }
}
