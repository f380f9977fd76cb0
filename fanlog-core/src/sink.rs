use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use arc_swap::ArcSwap;

use crate::{
    diagnostics::{Diagnostic, Diagnostics},
    error::{Error, Result},
    event::LogEvent,
    formatter::{Formatter, MINIMAL_PATTERN},
    level::{Level, LevelFilter},
    log_rotation::{RotatingFileSink, RotationConfig},
    log_writer::{LogFile, LogStderr, LogStdout, LogWriter},
};

/// Pattern strings per level with a default fallback, as handed over by a
/// configuration loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMap {
    pub default: String,
    pub per_level: Vec<(Level, String)>,
}

impl PatternMap {
    pub fn new(default: &str) -> Self {
        Self {
            default: default.into(),
            per_level: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: Level, pattern: &str) -> Self {
        self.per_level.retain(|(l, _)| *l != level);
        self.per_level.push((level, pattern.into()));
        self
    }
}

impl Default for PatternMap {
    fn default() -> Self {
        Self::new(MINIMAL_PATTERN)
    }
}

/// Where a configured sink writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Terminal,
    Stderr,
    File { path: PathBuf },
    RotatingFile(RotationConfig),
}

/// Typed description of one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub name: String,
    pub target: Target,
    pub level: LevelFilter,
    pub patterns: PatternMap,
}

impl SinkConfig {
    pub fn new(name: &str, target: Target) -> Self {
        Self {
            name: name.into(),
            target,
            level: LevelFilter::default(),
            patterns: PatternMap::default(),
        }
    }

    pub fn with_level(self, level: LevelFilter) -> Self {
        Self { level, ..self }
    }

    pub fn with_patterns(self, patterns: PatternMap) -> Self {
        Self { patterns, ..self }
    }

    pub fn with_pattern(self, pattern: &str) -> Self {
        Self {
            patterns: PatternMap::new(pattern),
            ..self
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledPatterns {
    default: Arc<Formatter>,
    per_level: [Option<Arc<Formatter>>; 5],
}

impl CompiledPatterns {
    fn formatter(&self, level: Level) -> &Formatter {
        self.per_level[level.index()]
            .as_deref()
            .unwrap_or(&*self.default)
    }
}

/// A named output: a writer, per-level patterns and a minimum level.
///
/// Level and patterns may be changed while events flow; a dispatch sees either
/// the old or the new value, never a mix.
pub struct Sink {
    name: String,
    writer: Arc<dyn LogWriter>,
    min_level: AtomicU8,
    patterns: ArcSwap<CompiledPatterns>,
    close_on_shutdown: bool,
}

impl Sink {
    /// A sink accepting every level with [`MINIMAL_PATTERN`].
    pub fn new<W: LogWriter + 'static>(name: &str, writer: W) -> Self {
        Self::from_shared(name, Arc::new(writer))
    }

    /// Like [`Sink::new`] for a writer that is also held elsewhere.
    pub fn from_shared(name: &str, writer: Arc<dyn LogWriter>) -> Self {
        Self {
            name: name.into(),
            writer,
            min_level: AtomicU8::new(LevelFilter::Debug.to_u8()),
            patterns: ArcSwap::from_pointee(CompiledPatterns {
                default: Arc::new(Formatter::compile(MINIMAL_PATTERN)),
                per_level: Default::default(),
            }),
            close_on_shutdown: true,
        }
    }

    /// Standard output; never closed by the registry.
    pub fn stdout(name: &str) -> Self {
        Self::new(name, LogStdout).keep_open()
    }

    /// Standard error; never closed by the registry.
    pub fn stderr(name: &str) -> Self {
        Self::new(name, LogStderr).keep_open()
    }

    pub fn file<P: Into<PathBuf>>(name: &str, path: P) -> Result<Self> {
        Ok(Self::new(name, LogFile::new(path.into())?))
    }

    pub fn rotating(name: &str, config: RotationConfig) -> Result<Self> {
        Ok(Self::new(name, RotatingFileSink::new(config)?))
    }

    /// Builds a sink from its typed description, opening files as needed.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let sink = match &config.target {
            Target::Terminal => Self::stdout(&config.name),
            Target::Stderr => Self::stderr(&config.name),
            Target::File { path } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::InvalidTarget {
                        sink: config.name.clone(),
                        reason: "file path is empty".into(),
                    });
                }
                Self::file(&config.name, path.clone()).map_err(|err| match err {
                    Error::Io(io) => Error::InvalidTarget {
                        sink: config.name.clone(),
                        reason: io.to_string(),
                    },
                    other => other,
                })?
            }
            Target::RotatingFile(rotation) => Self::rotating(&config.name, rotation.clone())?,
        };
        let sink = sink.with_min_level(config.level);
        sink.set_patterns(&config.patterns);
        Ok(sink)
    }

    pub fn with_min_level(self, level: LevelFilter) -> Self {
        self.set_min_level(level);
        self
    }

    pub fn with_pattern(self, pattern: &str) -> Self {
        self.set_pattern(pattern);
        self
    }

    pub fn with_level_pattern(self, level: Level, pattern: &str) -> Self {
        self.set_level_pattern(level, pattern);
        self
    }

    /// Marks the destination as not owned by the registry (stdout-like).
    pub fn keep_open(self) -> Self {
        Self {
            close_on_shutdown: false,
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn writer(&self) -> &Arc<dyn LogWriter> {
        &self.writer
    }

    pub fn min_level(&self) -> LevelFilter {
        LevelFilter::from_u8(self.min_level.load(Ordering::Acquire))
    }

    pub fn set_min_level(&self, level: LevelFilter) {
        self.min_level.store(level.to_u8(), Ordering::Release);
    }

    pub fn closes_on_shutdown(&self) -> bool {
        self.close_on_shutdown
    }

    /// Replaces the default pattern, keeping per-level overrides.
    pub fn set_pattern(&self, pattern: &str) {
        let default = Arc::new(Formatter::compile(pattern));
        self.patterns.rcu(|current| CompiledPatterns {
            default: default.clone(),
            per_level: current.per_level.clone(),
        });
    }

    pub fn set_level_pattern(&self, level: Level, pattern: &str) {
        let formatter = Arc::new(Formatter::compile(pattern));
        self.patterns.rcu(|current| {
            let mut patterns = CompiledPatterns::clone(current);
            patterns.per_level[level.index()] = Some(formatter.clone());
            patterns
        });
    }

    /// Replaces every pattern at once.
    pub fn set_patterns(&self, patterns: &PatternMap) {
        let mut compiled = CompiledPatterns {
            default: Arc::new(Formatter::compile(&patterns.default)),
            per_level: Default::default(),
        };
        for (level, pattern) in &patterns.per_level {
            compiled.per_level[level.index()] = Some(Arc::new(Formatter::compile(pattern)));
        }
        self.patterns.store(Arc::new(compiled));
    }

    /// Pattern used for events of `level`.
    pub fn pattern(&self, level: Level) -> String {
        self.patterns.load().formatter(level).pattern().to_string()
    }

    pub fn accepts(&self, level: Level) -> bool {
        self.min_level().accepts(level)
    }

    /// Renders and writes `event` if it passes the threshold. Returns whether
    /// the event was written.
    pub fn write(&self, event: &LogEvent) -> io::Result<bool> {
        if !self.accepts(event.level()) {
            return Ok(false);
        }
        let line = self.patterns.load().formatter(event.level()).render(event);
        self.writer.write_line(&line)?;
        Ok(true)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Closes the destination, or only flushes it for keep-open sinks.
    pub fn close(&self) -> io::Result<()> {
        if self.close_on_shutdown {
            self.writer.close()
        } else {
            self.writer.flush()
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("name", &self.name)
            .field("min_level", &self.min_level())
            .field("close_on_shutdown", &self.close_on_shutdown)
            .finish_non_exhaustive()
    }
}

/// Ordered set of sinks.
///
/// Mutations publish a new snapshot; dispatch iterates whatever snapshot was
/// current when it started and never blocks configuration calls.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: ArcSwap<Vec<Arc<Sink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sink: Sink) -> Result<Arc<Sink>> {
        let sink = Arc::new(sink);
        let mut duplicate = false;
        self.sinks.rcu(|current| {
            duplicate = current.iter().any(|s| s.name == sink.name);
            let mut next = Vec::clone(current);
            if !duplicate {
                next.push(sink.clone());
            }
            next
        });
        if duplicate {
            return Err(Error::DuplicateSink(sink.name.clone()));
        }
        Ok(sink)
    }

    /// Unregisters a sink and hands it back; the caller decides whether to close
    /// it. A dispatch already running may still write to it once.
    pub fn remove(&self, name: &str) -> Option<Arc<Sink>> {
        let mut removed = None;
        self.sinks.rcu(|current| {
            removed = current.iter().find(|s| s.name == name).cloned();
            current
                .iter()
                .filter(|s| s.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<Sink>> {
        self.sinks.load().iter().find(|s| s.name == name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Sink>> {
        self.sinks.load_full().to_vec()
    }

    pub fn len(&self) -> usize {
        self.sinks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.load().is_empty()
    }

    /// Writes `event` to every sink whose threshold it meets. A failing or
    /// panicking sink is reported and skipped; the others still receive the event.
    /// Returns how many sinks failed.
    pub fn dispatch(&self, event: &LogEvent, diagnostics: &Diagnostics) -> usize {
        self.dispatch_with(event, diagnostics, false)
    }

    /// Like [`SinkRegistry::dispatch`], and every sink that took the event is
    /// flushed before returning.
    pub fn dispatch_flushed(&self, event: &LogEvent, diagnostics: &Diagnostics) -> usize {
        self.dispatch_with(event, diagnostics, true)
    }

    fn dispatch_with(&self, event: &LogEvent, diagnostics: &Diagnostics, flush: bool) -> usize {
        let snapshot = self.sinks.load();
        let mut failures = 0;
        for sink in snapshot.iter() {
            let written = catch_unwind(AssertUnwindSafe(|| match sink.write(event) {
                Ok(true) if flush => sink.flush(),
                Ok(_) => Ok(()),
                Err(error) => Err(error),
            }));
            match written {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    failures += 1;
                    diagnostics.report(Diagnostic::SinkFailure {
                        sink: sink.name.clone(),
                        error,
                    });
                }
                Err(panic) => {
                    failures += 1;
                    diagnostics.report(Diagnostic::SinkPanicked {
                        sink: sink.name.clone(),
                        message: panic_message(panic.as_ref()),
                    });
                }
            }
        }
        failures
    }

    pub fn flush(&self, diagnostics: &Diagnostics) {
        for sink in self.sinks.load().iter() {
            if let Err(error) = sink.flush() {
                diagnostics.report(Diagnostic::SinkFailure {
                    sink: sink.name.clone(),
                    error,
                });
            }
        }
    }

    /// Closes every sink (keep-open sinks are only flushed) and empties the
    /// registry.
    pub fn close(&self, diagnostics: &Diagnostics) {
        let sinks = self.sinks.swap(Arc::new(Vec::new()));
        for sink in sinks.iter() {
            if let Err(error) = sink.close() {
                diagnostics.report(Diagnostic::SinkFailure {
                    sink: sink.name.clone(),
                    error,
                });
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
