use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::level::Level;

/// Where in the calling code an event originated.
///
/// Built by the calling layer (see [`crate::caller!`] or the `log` bridge in the
/// `fanlog` crate), never derived from a stack walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    /// Fully qualified path of the calling type or module, `::` or `.` separated.
    pub class: Option<String>,
    pub method: Option<String>,
    pub native_method: bool,
    pub module: Option<String>,
    pub module_version: Option<String>,
    pub class_loader: Option<String>,
    pub thread: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl CallerContext {
    /// Context for a source location, tagged with the current thread name.
    pub fn here(module_path: &str, file: &str, line: u32) -> Self {
        Self {
            class: Some(module_path.into()),
            file: Some(file.into()),
            line: Some(line),
            thread: current_thread_name(),
            ..Self::default()
        }
    }

    pub fn with_method(self, method: &str) -> Self {
        Self {
            method: Some(method.into()),
            ..self
        }
    }

    pub fn with_module(self, module: &str, version: Option<&str>) -> Self {
        Self {
            module: Some(module.into()),
            module_version: version.map(String::from),
            ..self
        }
    }

    pub fn with_thread(self, thread: &str) -> Self {
        Self {
            thread: Some(thread.into()),
            ..self
        }
    }

    /// Last segment of [`CallerContext::class`].
    pub fn simple_class(&self) -> Option<&str> {
        let class = self.class.as_deref()?;
        Some(match split_class_path(class) {
            Some((_, name)) => name,
            None => class,
        })
    }

    /// Everything before the last segment of [`CallerContext::class`].
    pub fn package(&self) -> Option<&str> {
        split_class_path(self.class.as_deref()?).map(|(package, _)| package)
    }
}

fn split_class_path(path: &str) -> Option<(&str, &str)> {
    if let Some(pos) = path.rfind("::") {
        return Some((&path[..pos], &path[pos + 2..]));
    }
    path.rfind('.').map(|pos| (&path[..pos], &path[pos + 1..]))
}

/// Name of the calling thread, or its id when it has none.
pub fn current_thread_name() -> Option<String> {
    let thread = std::thread::current();
    Some(match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    })
}

/// Empty tag list, for call sites that attach no tags.
pub const NO_TAGS: [&str; 0] = [];

/// A single log event. Immutable once built and shared as `Arc<LogEvent>`
/// between the history and every sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    level: Level,
    timestamp: DateTime<Utc>,
    caller: Option<CallerContext>,
    message: String,
    tags: BTreeSet<String>,
}

impl LogEvent {
    /// Stamps the event with the current wall-clock time.
    pub fn new(
        level: Level,
        message: impl Into<String>,
        caller: Option<CallerContext>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::at(Utc::now(), level, message, caller, tags)
    }

    /// Builds an event with an explicit timestamp.
    pub fn at(
        timestamp: DateTime<Utc>,
        level: Level,
        message: impl Into<String>,
        caller: Option<CallerContext>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            level,
            timestamp,
            caller,
            message: message.into(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn caller(&self) -> Option<&CallerContext> {
        self.caller.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Captures a [`CallerContext`] for the current source location.
///
/// ```rust
/// let caller = fanlog_core::caller!();
/// assert_eq!(caller.file.as_deref(), Some(file!()));
/// ```
#[macro_export]
macro_rules! caller {
    () => {
        $crate::CallerContext::here(module_path!(), file!(), line!())
    };
    ($method:expr) => {
        $crate::CallerContext::here(module_path!(), file!(), line!()).with_method($method)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_split_on_rust_path() {
        let caller = CallerContext {
            class: Some("app::net::Server".into()),
            ..Default::default()
        };
        assert_eq!(caller.simple_class(), Some("Server"));
        assert_eq!(caller.package(), Some("app::net"));
    }

    #[test]
    fn test_class_split_on_dotted_path() {
        let caller = CallerContext {
            class: Some("org.example.Main".into()),
            ..Default::default()
        };
        assert_eq!(caller.simple_class(), Some("Main"));
        assert_eq!(caller.package(), Some("org.example"));
    }

    #[test]
    fn test_class_without_separator() {
        let caller = CallerContext {
            class: Some("Main".into()),
            ..Default::default()
        };
        assert_eq!(caller.simple_class(), Some("Main"));
        assert_eq!(caller.package(), None);
    }

    #[test]
    fn test_caller_macro() {
        let caller = crate::caller!("handle");
        assert_eq!(caller.class.as_deref(), Some(module_path!()));
        assert_eq!(caller.method.as_deref(), Some("handle"));
        assert!(caller.line.unwrap() > 0);
        assert!(caller.thread.is_some());
    }

    #[test]
    fn test_event_tags_deduplicate() {
        let event = LogEvent::new(Level::Info, "hi", None, ["net", "io", "net"]);
        assert_eq!(event.tags().len(), 2);
        assert!(event.has_tag("io"));
    }
}
