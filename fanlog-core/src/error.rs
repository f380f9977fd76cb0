use std::time::Duration;

/// Errors raised while configuring a pipeline or one of its sinks.
///
/// Nothing in here is ever returned from [`crate::Pipeline::submit`]; failures that
/// happen while events flow are reported as [`crate::Diagnostic`] values instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Retention capacity below the minimum of 5 events.
    #[error("max retained events must be at least {min} (got {0})", min = crate::retention::MIN_CAPACITY)]
    InvalidCapacity(usize),

    /// Duration string with an unknown suffix or a bad number.
    #[error("invalid duration {0:?}, expected a number followed by d, h, m or s")]
    InvalidDuration(String),

    /// Unknown severity name.
    #[error("unknown log level {0:?}")]
    InvalidLevel(String),

    /// Sink target that cannot be opened or is not understood.
    #[error("invalid target for sink {sink:?}: {reason}")]
    InvalidTarget { sink: String, reason: String },

    /// Rotation settings that would never rotate or never keep a file.
    #[error("invalid rotation settings: {0}")]
    InvalidRotation(String),

    /// A sink with the same name is already registered.
    #[error("a sink named {0:?} is already registered")]
    DuplicateSink(String),

    /// Unknown name for a queue overflow policy.
    #[error("unknown overflow policy {0:?}, expected block, drop-oldest, drop-newest or unbounded")]
    InvalidOverflowPolicy(String),

    /// Async queue declared with no room at all.
    #[error("async queue capacity must be at least 1")]
    InvalidQueueCapacity,

    /// A `FANLOG_*` environment variable that does not parse.
    #[error("invalid FANLOG_* environment: {0}")]
    InvalidEnvironment(String),

    /// A global logger was already installed for this process.
    #[error("a global logger is already installed")]
    LoggerAlreadySet,

    /// The worker thread did not finish within the bounded wait.
    #[error("logging worker did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the configuration family, i.e. it was raised
    /// before any event could have been accepted.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::ShutdownTimeout(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[test]
fn test_error_classification() {
    assert!(Error::InvalidCapacity(3).is_configuration());
    assert!(Error::InvalidDuration("5y".into()).is_configuration());
    assert!(!Error::Io(std::io::Error::other("disk full")).is_configuration());
    assert!(!Error::ShutdownTimeout(Duration::from_secs(1)).is_configuration());
    assert_eq!(
        Error::InvalidCapacity(3).to_string(),
        "max retained events must be at least 5 (got 3)"
    );
}
