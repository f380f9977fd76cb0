use std::{path::PathBuf, sync::LazyLock, time::Duration};

use derive_from_env::FromEnv;

use crate::{
    error::{Error, Result},
    level::LevelFilter,
    log_rotation::RotationConfig,
    sink::{PatternMap, SinkConfig, Target},
};

/// Process-wide defaults read once from `FANLOG_*` environment variables.
#[derive(FromEnv)]
#[from_env(prefix = "FANLOG")]
#[allow(non_snake_case)]
pub struct FanlogConfig {
    /// Idle time after which the async worker flushes its sinks.
    #[from_env(default = "100")]
    pub FLUSH_INTERVAL_MS: u64,
    /// Capacity of the async queue when none is given.
    #[from_env(default = "1024")]
    pub QUEUE_CAPACITY: u64,
    /// Bounded wait used when a pipeline is dropped without an explicit shutdown.
    #[from_env(default = "5000")]
    pub SHUTDOWN_TIMEOUT_MS: u64,
}

/// Environment defaults, falling back to the built-in values when a variable
/// does not parse. [`FanlogConfig::load`] reports that case as an error.
pub static FANLOG_CONFIG: LazyLock<FanlogConfig> =
    LazyLock::new(|| FanlogConfig::load().unwrap_or_default());

impl Default for FanlogConfig {
    fn default() -> Self {
        Self {
            FLUSH_INTERVAL_MS: 100,
            QUEUE_CAPACITY: 1024,
            SHUTDOWN_TIMEOUT_MS: 5000,
        }
    }
}

impl FanlogConfig {
    /// Reads the `FANLOG_*` variables now.
    pub fn load() -> Result<Self> {
        Self::from_env().map_err(|err| Error::InvalidEnvironment(format!("{err:?}")))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.FLUSH_INTERVAL_MS)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.SHUTDOWN_TIMEOUT_MS)
    }

    pub fn queue_capacity(&self) -> usize {
        usize::try_from(self.QUEUE_CAPACITY).unwrap_or(usize::MAX)
    }
}

/// What happens when a producer meets a full async queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// The producer waits for room. A stalled worker stalls every producer.
    #[default]
    Block,
    /// The oldest queued event is discarded to make room.
    DropOldest,
    /// The new event is discarded.
    DropNewest,
    /// No cap; memory grows with the backlog.
    Unbounded,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "block" => Ok(Self::Block),
            "drop-oldest" => Ok(Self::DropOldest),
            "drop-newest" => Ok(Self::DropNewest),
            "unbounded" => Ok(Self::Unbounded),
            _ => Err(Error::InvalidOverflowPolicy(s.into())),
        }
    }
}

/// Where dispatch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// On the thread calling `submit`.
    Sync,
    /// On one dedicated worker thread fed through a queue. `capacity` is ignored
    /// for [`OverflowPolicy::Unbounded`].
    Async {
        capacity: usize,
        overflow: OverflowPolicy,
    },
}

impl DispatchMode {
    /// Async mode with the environment's queue capacity and the given policy.
    pub fn async_with(overflow: OverflowPolicy) -> Self {
        DispatchMode::Async {
            capacity: FANLOG_CONFIG.queue_capacity(),
            overflow,
        }
    }
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::async_with(OverflowPolicy::default())
    }
}

/// Typed pipeline settings as produced by a configuration loader.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineConfig {
    pub mode: DispatchMode,
    /// `None` retains every event.
    pub max_retained: Option<usize>,
    pub sinks: Vec<SinkConfig>,
}

impl PipelineConfig {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_max_retained(self, max_retained: usize) -> Self {
        Self {
            max_retained: Some(max_retained),
            ..self
        }
    }

    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn terminal(self, name: &str, level: LevelFilter) -> Self {
        self.with_sink(SinkConfig::new(name, Target::Terminal).with_level(level))
    }

    pub fn file<P: Into<PathBuf>>(self, name: &str, path: P, patterns: PatternMap) -> Self {
        self.with_sink(
            SinkConfig::new(name, Target::File { path: path.into() }).with_patterns(patterns),
        )
    }

    pub fn rotating(self, name: &str, rotation: RotationConfig, patterns: PatternMap) -> Self {
        self.with_sink(SinkConfig::new(name, Target::RotatingFile(rotation)).with_patterns(patterns))
    }
}
