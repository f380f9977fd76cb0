use std::{
    io::{self, Write},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use colored::Colorize;

use crate::level::Level;

/// A failure inside the pipeline that must not reach the caller of `submit`.
#[derive(Debug, thiserror::Error)]
pub enum Diagnostic {
    #[error("sink {sink:?} failed: {error}")]
    SinkFailure { sink: String, error: io::Error },

    #[error("sink {sink:?} panicked: {message}")]
    SinkPanicked { sink: String, message: String },

    #[error("dispatch listener panicked: {0}")]
    ListenerPanicked(String),

    #[error("logging worker did not stop within {0:?}, pending events may be lost")]
    ShutdownTimeout(Duration),

    #[error("{level} event rejected while the pipeline is {state}: {message}")]
    EventRejected {
        level: Level,
        message: String,
        state: &'static str,
    },
}

impl Diagnostic {
    pub fn level(&self) -> Level {
        match self {
            Diagnostic::SinkFailure { .. }
            | Diagnostic::SinkPanicked { .. }
            | Diagnostic::ListenerPanicked(_) => Level::Error,
            Diagnostic::ShutdownTimeout(_) | Diagnostic::EventRejected { .. } => Level::Warn,
        }
    }
}

pub type DiagnosticHandler = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

fn format_diagnostic(diagnostic: &Diagnostic) -> String {
    let time = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f");
    let level = match diagnostic.level() {
        Level::Fatal => "FATAL".purple(),
        Level::Error => "ERROR".red(),
        Level::Warn => "WARN".yellow(),
        Level::Info => "INFO".green(),
        Level::Debug => "DEBUG".blue(),
    };
    format!("[{time} fanlog {level}] {diagnostic}")
}

/// Writes one line per diagnostic to standard error.
pub fn stderr_handler() -> DiagnosticHandler {
    Arc::new(|diagnostic| {
        let _ = writeln!(io::stderr().lock(), "{}", format_diagnostic(diagnostic));
    })
}

/// Counters of a pipeline's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Events discarded by a lossy overflow policy.
    pub dropped: u64,
    /// Events refused because intake was closed (drain or shutdown).
    pub rejected: u64,
    pub sink_failures: u64,
    pub dispatched: u64,
}

/// Diagnostic channel and counters shared by the pipeline and its worker.
pub struct Diagnostics {
    handler: RwLock<DiagnosticHandler>,
    dropped: AtomicU64,
    rejected: AtomicU64,
    sink_failures: AtomicU64,
    dispatched: AtomicU64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(stderr_handler())
    }
}

impl Diagnostics {
    pub fn new(handler: DiagnosticHandler) -> Self {
        Self {
            handler: RwLock::new(handler),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn set_handler(&self, handler: DiagnosticHandler) {
        *self
            .handler
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = handler;
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        if matches!(
            diagnostic,
            Diagnostic::SinkFailure { .. } | Diagnostic::SinkPanicked { .. }
        ) {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
        }
        let handler = self
            .handler
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        handler(&diagnostic);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
        }
    }

    /// Diagnostics that collect rendered messages instead of printing them.
    #[cfg(test)]
    pub(crate) fn capture() -> (Self, Arc<std::sync::Mutex<Vec<String>>>) {
        let (handler, seen) = capture_handler();
        (Self::new(handler), seen)
    }
}

#[cfg(test)]
pub(crate) fn capture_handler() -> (DiagnosticHandler, Arc<std::sync::Mutex<Vec<String>>>) {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: DiagnosticHandler = Arc::new(move |diagnostic: &Diagnostic| {
        sink.lock().unwrap().push(diagnostic.to_string());
    });
    (handler, seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_sink_failures() {
        let (diagnostics, seen) = Diagnostics::capture();
        diagnostics.report(Diagnostic::SinkFailure {
            sink: "file".into(),
            error: io::Error::other("no space left"),
        });
        diagnostics.report(Diagnostic::ShutdownTimeout(Duration::from_millis(10)));
        diagnostics.record_dropped();
        assert_eq!(
            diagnostics.stats(),
            PipelineStats {
                dropped: 1,
                sink_failures: 1,
                ..Default::default()
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "sink \"file\" failed: no space left");
        assert!(seen[1].starts_with("logging worker did not stop within 10ms"));
    }

    #[test]
    fn test_format_diagnostic() {
        colored::control::set_override(false);
        let line = format_diagnostic(&Diagnostic::EventRejected {
            level: Level::Info,
            message: "late".into(),
            state: "shut down",
        });
        assert!(line.starts_with('['));
        assert!(line.ends_with("fanlog WARN] INFO event rejected while the pipeline is shut down: late"));
    }

    #[test]
    fn test_replace_handler() {
        let (diagnostics, first) = Diagnostics::capture();
        let (handler, second) = capture_handler();
        diagnostics.set_handler(handler);
        diagnostics.report(Diagnostic::ListenerPanicked("boom".into()));
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }
}
