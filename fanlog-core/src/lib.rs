//! # fanlog-core
//! Core of fanlog: an event pipeline that keeps a bounded history and fans every
//! event out to independently formatted, independently filtered sinks.
//!
//! ```rust
//! use std::sync::Arc;
//! use fanlog_core::{DispatchMode, Level, LogMemory, NO_TAGS, Pipeline, Sink};
//!
//! let pipeline = Pipeline::new(DispatchMode::Sync).unwrap();
//! let memory = Arc::new(LogMemory::new());
//! pipeline
//!     .add_sink(Sink::from_shared("memory", memory.clone()).with_pattern("{level} > {message}"))
//!     .unwrap();
//! pipeline.submit(Level::Warn, "disk almost full", None, NO_TAGS);
//! assert_eq!(memory.lines(), vec!["WARN > disk almost full"]);
//! ```
//!
//! ## Rotating files
//! ```rust
//! use fanlog_core::{DispatchMode, Level, NO_TAGS, Pipeline, RotationConfig, Sink, caller};
//!
//! let dir = std::env::temp_dir().join("fanlog-doc-rotation");
//! let pipeline = Pipeline::new(DispatchMode::default()).unwrap();
//! let rotation = RotationConfig::new(&dir, "app")
//!     .with_max_bytes(1024 * 1024)
//!     .with_max_age_str("1d")
//!     .unwrap()
//!     .with_max_files(7);
//! pipeline.add_sink(Sink::rotating("file", rotation).unwrap()).unwrap();
//! pipeline.submit(Level::Info, "started", Some(caller!("main")), ["boot"]);
//! pipeline.drain();
//! # pipeline.shutdown(std::time::Duration::from_secs(1), true).unwrap();
//! # std::fs::remove_dir_all(dir).ok();
//! ```

mod config;
mod diagnostics;
mod error;
mod event;
mod formatter;
mod level;
mod log_rotation;
mod log_writer;
mod pipeline;
mod retention;
mod sink;
mod utils;

pub use config::{DispatchMode, FANLOG_CONFIG, FanlogConfig, OverflowPolicy, PipelineConfig};
pub use diagnostics::{Diagnostic, DiagnosticHandler, Diagnostics, PipelineStats, stderr_handler};
pub use error::{Error, Result};
pub use event::{CallerContext, LogEvent, NO_TAGS, current_thread_name};
pub use formatter::{
    DEFAULT_PATTERN, DETAILED_PATTERN, Formatter, INVALID_TIME_FORMAT, LIGHT_PATTERN,
    MINIMAL_PATTERN, UNKNOWN_PLACEHOLDER,
};
pub use level::{Level, LevelFilter};
pub use log_rotation::{RotatingFileSink, RotationConfig, parse_duration};
pub use log_writer::{LogFile, LogMemory, LogStderr, LogStdout, LogStream, LogWriter};
pub use pipeline::{Listener, Pipeline};
pub use retention::{MIN_CAPACITY, RetentionStore};
pub use sink::{PatternMap, Sink, SinkConfig, SinkRegistry, Target};
