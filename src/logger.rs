//! Event logging and the hub log backlog.
//!
//! [`EventLogger`] is a listener that writes each canonical event to the `log`
//! facade at `debug` level.
//!
//! [`BacklogLogger`] wraps the process logger (normally `env_logger`) and keeps
//! the most recent hub log lines in a bounded [`LogBacklog`]. The hub drains the
//! backlog into the Experiment device as LOG events once a session exists, so
//! startup messages end up in the session's event stream too.

use crate::error::ListenerError;
use crate::event::EventRecord;
use crate::eventbus::EventListener;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum number of log lines held before a session exists.
pub const LOG_BACKLOG_CAPACITY: usize = 128;

/// A listener that logs all canonical events.
pub struct EventLogger;

impl EventLogger {
    pub fn new() -> Self {
        EventLogger
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListener for EventLogger {
    fn name(&self) -> &str {
        "event-logger"
    }

    fn handle(&self, event: &EventRecord) -> Result<(), ListenerError> {
        log::debug!(
            "[event] id={} type={} device={} time={:.6} {:?}",
            event.event_id,
            event.event_type,
            event.device_id,
            event.hub_time,
            event.values
        );
        Ok(())
    }
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub time: f64,
    pub level: log::Level,
    pub text: String,
}

/// Bounded FIFO of log lines; the oldest line is dropped on overflow.
pub struct LogBacklog {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogBacklog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: LogLine) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Take every held line, oldest first.
    pub fn drain(&self) -> Vec<LogLine> {
        match self.lines.lock() {
            Ok(mut lines) => lines.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide backlog fed by [`BacklogLogger`].
pub static BACKLOG: Lazy<LogBacklog> = Lazy::new(|| LogBacklog::new(LOG_BACKLOG_CAPACITY));

/// `log::Log` wrapper that forwards to `inner` and copies hub records
/// (`info` and more severe, target `iohub*`) into [`BACKLOG`].
pub struct BacklogLogger<L> {
    inner: L,
}

impl<L: log::Log> BacklogLogger<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    /// Install as the global logger.
    pub fn install(self, max_level: log::LevelFilter) -> Result<(), log::SetLoggerError>
    where
        L: 'static,
    {
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl<L: log::Log> log::Log for BacklogLogger<L> {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if record.level() <= log::Level::Info && record.target().starts_with("iohub") {
            BACKLOG.push(LogLine {
                time: crate::clock::now(),
                level: record.level(),
                text: record.args().to_string(),
            });
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}
