//! # fanlog
//! Structured logger that fans every record out to several sinks, each with its
//! own pattern and level, optionally through a background worker.
//!
//! ## Usage
//! ```toml
//! // Cargo.toml
//! ...
//! [dependencies]
//! fanlog = "0.1.0"
//! ```
//!
//! ```rust
//! use fanlog::logger_config;
//!
//! let _guard = logger_config()
//!     .init_global()
//!     .expect("a logger is already installed");
//! log::info!("Hello, world!");
//! // guard flushes and closes every sink when dropped
//! ```
//!
//! ## Logging to files
//! The plain file target appends to an existing file. Rotating targets roll the
//! file over by size or age and keep the newest `max_files`.
//!
//! ```rust
//! use fanlog::{LevelFilter, RotationConfig, logger_config};
//!
//! let dir = std::env::temp_dir().join("fanlog-doc-files");
//! let _ = std::fs::remove_dir_all(&dir);
//! let guard = logger_config()
//!     .no_stdout()
//!     .with_log_file(dir.join("app.log"), "{level} {message}")
//!     .with_rotation(
//!         RotationConfig::new(dir.join("rolling"), "app")
//!             .with_max_bytes(10 * 1024 * 1024)
//!             .with_max_files(5),
//!         fanlog::DETAILED_PATTERN,
//!     )
//!     .with_level(LevelFilter::Info)
//!     .init_global()
//!     .unwrap();
//!
//! log::debug!("filtered out");
//! log::info!("Hello, world!");
//! drop(guard);
//! assert_eq!(std::fs::read_to_string(dir.join("app.log")).unwrap(), "INFO Hello, world!\n");
//! ```
//!
//! ## Direct access
//! The installed pipeline is reachable for structured submissions and for reading
//! back the retained history.
//!
//! ```rust
//! use fanlog::{Level, caller, logger_config};
//!
//! let _guard = logger_config().no_stdout().sync().init_global().unwrap();
//! let pipeline = fanlog::global().unwrap();
//! pipeline.submit(Level::Warn, "cache miss", Some(caller!()), ["cache"]);
//! assert_eq!(pipeline.get_last().unwrap().message(), "cache miss");
//! ```

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use fanlog_core::current_thread_name;
use log::Log;

pub use fanlog_core::{
    CallerContext, DEFAULT_PATTERN, DETAILED_PATTERN, Diagnostic, DiagnosticHandler,
    DispatchMode, Error, FANLOG_CONFIG, LIGHT_PATTERN, Level, LevelFilter, LogEvent,
    MINIMAL_PATTERN, NO_TAGS, OverflowPolicy, PatternMap, Pipeline, PipelineConfig,
    PipelineStats, Result, RotationConfig, Sink, SinkConfig, Target, caller,
};

/// The pipeline behind the `log` facade, with the bridge's own threshold.
struct Installed {
    pipeline: Arc<Pipeline>,
    level: LevelFilter,
}

static GLOBAL: ArcSwapOption<Installed> = ArcSwapOption::const_empty();

/// Serializes installs; `true` once the bridge is registered with `log`.
static BRIDGE: Mutex<bool> = Mutex::new(false);

/// Forwards `log` records to the installed pipeline.
struct FanLogger;

fn caller_context(record: &log::Record) -> CallerContext {
    CallerContext {
        class: record.module_path().map(String::from),
        file: record.file().map(String::from),
        line: record.line(),
        thread: current_thread_name(),
        ..CallerContext::default()
    }
}

impl Log for FanLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        GLOBAL
            .load()
            .as_ref()
            .is_some_and(|installed| installed.level.accepts(metadata.level().into()))
    }

    fn log(&self, record: &log::Record) {
        let Some(installed) = GLOBAL.load_full() else {
            return;
        };
        let level = Level::from(record.level());
        if !installed.level.accepts(level) {
            return;
        }
        // an explicit `target:` becomes a tag
        let tag = (record.module_path() != Some(record.target())).then(|| record.target());
        installed.pipeline.submit(
            level,
            record.args().to_string(),
            Some(caller_context(record)),
            tag,
        );
    }

    fn flush(&self) {
        if let Some(installed) = GLOBAL.load_full() {
            installed.pipeline.flush();
        }
    }
}

fn log_filter(level: LevelFilter) -> log::LevelFilter {
    match level {
        LevelFilter::None => log::LevelFilter::Off,
        LevelFilter::Debug => log::LevelFilter::Trace,
        LevelFilter::Info => log::LevelFilter::Info,
        LevelFilter::Warn => log::LevelFilter::Warn,
        LevelFilter::Error | LevelFilter::Fatal => log::LevelFilter::Error,
    }
}

/// Guard that shuts the global pipeline down when dropped.
/// Hold this guard for the lifetime of your logging session.
pub struct LoggerGuard {
    pipeline: Arc<Pipeline>,
    timeout: Duration,
}

impl LoggerGuard {
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Uninstalls the pipeline and shuts it down, waiting at most `timeout`.
    pub fn shutdown(self, timeout: Duration) -> Result<()> {
        uninstall(&self.pipeline);
        self.pipeline.shutdown(timeout, true)
    }
}

impl Drop for LoggerGuard {
    fn drop(&mut self) {
        uninstall(&self.pipeline);
        let _ = self.pipeline.shutdown(self.timeout, true);
    }
}

fn uninstall(pipeline: &Arc<Pipeline>) {
    GLOBAL.rcu(|current| match current {
        Some(installed) if Arc::ptr_eq(&installed.pipeline, pipeline) => None,
        other => other.clone(),
    });
}

/// The pipeline installed by [`ConfigBuilder::init_global`], if any.
pub fn global() -> Option<Arc<Pipeline>> {
    GLOBAL.load().as_ref().map(|installed| installed.pipeline.clone())
}

/// Uninstalls and shuts down the global pipeline. Does nothing when none is
/// installed.
pub fn shutdown(timeout: Duration) -> Result<()> {
    match GLOBAL.swap(None) {
        Some(installed) => installed.pipeline.shutdown(timeout, true),
        None => Ok(()),
    }
}

/// Builder for configuring and initializing the logger.
pub struct ConfigBuilder {
    mode: DispatchMode,
    max_retained: Option<usize>,
    sinks: Vec<SinkConfig>,
    no_stdout: bool,
    stdout_pattern: String,
    log_level: LevelFilter,
    diagnostic_handler: Option<DiagnosticHandler>,
    shutdown_timeout: Duration,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            max_retained: None,
            sinks: Vec::new(),
            no_stdout: false,
            stdout_pattern: format!("{{colored}}{LIGHT_PATTERN}"),
            log_level: LevelFilter::Info,
            diagnostic_handler: None,
            shutdown_timeout: FANLOG_CONFIG.shutdown_timeout(),
        }
    }
}

impl ConfigBuilder {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut sinks = Vec::with_capacity(self.sinks.len() + 1);
        if !self.no_stdout {
            sinks.push(
                SinkConfig::new("stdout", Target::Terminal).with_pattern(&self.stdout_pattern),
            );
        }
        sinks.extend(self.sinks.iter().cloned());
        PipelineConfig {
            mode: self.mode,
            max_retained: self.max_retained,
            sinks,
        }
    }

    /// Builds a standalone pipeline without installing it.
    pub fn build(self) -> Result<Pipeline> {
        let pipeline = Pipeline::from_config(&self.pipeline_config())?;
        if let Some(handler) = self.diagnostic_handler {
            pipeline.set_diagnostic_handler(handler);
        }
        Ok(pipeline)
    }

    /// Dispatch on the calling thread.
    pub fn sync(self) -> Self {
        Self {
            mode: DispatchMode::Sync,
            ..self
        }
    }

    pub fn with_mode(self, mode: DispatchMode) -> Self {
        Self { mode, ..self }
    }

    /// Async dispatch with the given overflow policy.
    pub fn with_overflow(self, overflow: OverflowPolicy) -> Self {
        Self {
            mode: DispatchMode::async_with(overflow),
            ..self
        }
    }

    pub fn with_max_retained(self, max_retained: usize) -> Self {
        Self {
            max_retained: Some(max_retained),
            ..self
        }
    }

    /// Adds an append-mode log file. The file is opened when the logger is built.
    pub fn with_log_file<P: Into<PathBuf>>(self, path: P, pattern: &str) -> Self {
        let name = format!("file-{}", self.sinks.len());
        self.with_sink(
            SinkConfig::new(&name, Target::File { path: path.into() }).with_pattern(pattern),
        )
    }

    /// Maybe adds a log file.
    pub fn maybe_with_log_file<P: Into<PathBuf>>(self, path: Option<P>, pattern: &str) -> Self {
        match path {
            Some(path) => self.with_log_file(path, pattern),
            None => self,
        }
    }

    /// Adds a rotating log file.
    pub fn with_rotation(self, rotation: RotationConfig, pattern: &str) -> Self {
        let name = format!("rotating-{}", self.sinks.len());
        self.with_sink(SinkConfig::new(&name, Target::RotatingFile(rotation)).with_pattern(pattern))
    }

    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Ignore stdout logging
    pub fn no_stdout(self) -> Self {
        Self {
            no_stdout: true,
            ..self
        }
    }

    /// Dynamically set the stdout flag.
    pub fn with_stdout(self, yes: bool) -> Self {
        Self {
            no_stdout: !yes,
            ..self
        }
    }

    pub fn with_stdout_pattern(self, pattern: &str) -> Self {
        Self {
            stdout_pattern: pattern.into(),
            ..self
        }
    }

    /// Threshold applied to `log` records before they reach the pipeline.
    pub fn with_level(self, log_level: LevelFilter) -> Self {
        Self { log_level, ..self }
    }

    pub fn with_diagnostic_handler(self, handler: DiagnosticHandler) -> Self {
        Self {
            diagnostic_handler: Some(handler),
            ..self
        }
    }

    /// Bounded wait used when the guard is dropped.
    pub fn with_shutdown_timeout(self, shutdown_timeout: Duration) -> Self {
        Self {
            shutdown_timeout,
            ..self
        }
    }

    /// Installs the logger as the process's `log` backend.
    /// Returns a guard that will flush and shutdown the logger when dropped.
    #[must_use = "LoggerGuard must be kept alive to ensure logging works. Do \"let _guard = logger_config().init_global()?;\""]
    pub fn init_global(self) -> Result<LoggerGuard> {
        let level = self.log_level;
        let timeout = self.shutdown_timeout;
        let mut bridge = BRIDGE.lock().unwrap_or_else(PoisonError::into_inner);
        if GLOBAL.load().is_some() {
            return Err(Error::LoggerAlreadySet);
        }
        if !*bridge {
            log::set_boxed_logger(Box::new(FanLogger)).map_err(|_| Error::LoggerAlreadySet)?;
            *bridge = true;
        }
        let pipeline = Arc::new(self.build()?);
        log::set_max_level(log_filter(level));
        GLOBAL.store(Some(Arc::new(Installed {
            pipeline: pipeline.clone(),
            level,
        })));
        Ok(LoggerGuard { pipeline, timeout })
    }
}

/// Returns a default ConfigBuilder for configuring the logger.
pub fn logger_config() -> ConfigBuilder {
    ConfigBuilder::default()
}
