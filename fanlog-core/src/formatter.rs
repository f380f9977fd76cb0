use std::{fmt::Write, sync::LazyLock};

use chrono::{Datelike, Local, Timelike};
use colored::Color;
use regex::Regex;

use crate::{event::LogEvent, level::Level};

pub const MINIMAL_PATTERN: &str = "[{level}] {message}";
pub const LIGHT_PATTERN: &str = "[{time HH:mm:ss:SSS}] [{level}] | {message}";
pub const DEFAULT_PATTERN: &str = "[{time HH:mm:ss:SSS}] [{level}] | {class}.{method} > {message}";
pub const DETAILED_PATTERN: &str =
    "[{time yyyy:MM:dd HH:mm:ss:SSS}] [{level}] | [{thread}] | {class}.{method} > {message}";

pub const UNKNOWN_PLACEHOLDER: &str = "UNKNOWN_PLACEHOLDER";
pub const INVALID_TIME_FORMAT: &str = "INVALID_TIME_FORMAT";

const COLORED_MARKER: &str = "{colored}";
const RESET: &str = "\x1B[0m";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("placeholder regex is valid"));

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Level,
    EpochMillis,
    Time(Vec<TimeToken>),
    InvalidTime,
    Class,
    FullClass,
    Package,
    Method,
    NativeMethod,
    Module,
    ModuleVersion,
    ClassLoader,
    Thread,
    File,
    LineNumber,
    Message,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
enum TimeToken {
    Literal(String),
    Year,
    ShortYear,
    Month { padded: bool },
    Day { padded: bool },
    Hour { padded: bool },
    Minute { padded: bool },
    Second { padded: bool },
    Millis,
}

/// A compiled log line pattern.
///
/// Patterns are literal text with `{field}` placeholders, e.g.
/// `"[{time HH:mm:ss}] [{level}] {message}"`. A leading `{colored}` wraps the
/// level in its ANSI color. Compiling never fails: unknown placeholders render
/// as [`UNKNOWN_PLACEHOLDER`] and broken date formats as [`INVALID_TIME_FORMAT`].
#[derive(Debug, Clone, PartialEq)]
pub struct Formatter {
    pattern: String,
    colored: bool,
    segments: Vec<Segment>,
}

impl Formatter {
    pub fn compile(pattern: &str) -> Self {
        let (colored, body) = match pattern.strip_prefix(COLORED_MARKER) {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let mut segments = Vec::new();
        let mut last = 0;
        for captures in PLACEHOLDER.captures_iter(body) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(body[last..whole.start()].into()));
            }
            segments.push(parse_placeholder(name.as_str()));
            last = whole.end();
        }
        if last < body.len() {
            segments.push(Segment::Literal(body[last..].into()));
        }
        Self {
            pattern: pattern.into(),
            colored,
            segments,
        }
    }

    /// Source text this formatter was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_colored(&self) -> bool {
        self.colored
    }

    pub fn render(&self, event: &LogEvent) -> String {
        let mut out = String::with_capacity(self.pattern.len() + event.message().len());
        let caller = event.caller();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Level => {
                    if self.colored {
                        let color = level_color(event.level());
                        let _ = write!(out, "\x1B[{}m{}{RESET}", color.to_fg_str(), event.level());
                    } else {
                        out.push_str(event.level().as_str());
                    }
                }
                Segment::EpochMillis => {
                    let _ = write!(out, "{}", event.timestamp().timestamp_millis());
                }
                Segment::Time(tokens) => render_time(&mut out, tokens, event),
                Segment::InvalidTime => out.push_str(INVALID_TIME_FORMAT),
                Segment::Class => push_opt(&mut out, caller.and_then(|c| c.simple_class())),
                Segment::FullClass => push_opt(&mut out, caller.and_then(|c| c.class.as_deref())),
                Segment::Package => push_opt(&mut out, caller.and_then(|c| c.package())),
                Segment::Method => push_opt(&mut out, caller.and_then(|c| c.method.as_deref())),
                Segment::NativeMethod => {
                    let native = caller.is_some_and(|c| c.native_method);
                    out.push_str(if native { "true" } else { "false" });
                }
                Segment::Module => push_opt(&mut out, caller.and_then(|c| c.module.as_deref())),
                Segment::ModuleVersion => {
                    push_opt(&mut out, caller.and_then(|c| c.module_version.as_deref()))
                }
                Segment::ClassLoader => {
                    push_opt(&mut out, caller.and_then(|c| c.class_loader.as_deref()))
                }
                Segment::Thread => push_opt(&mut out, caller.and_then(|c| c.thread.as_deref())),
                Segment::File => push_opt(&mut out, caller.and_then(|c| c.file.as_deref())),
                Segment::LineNumber => {
                    if let Some(line) = caller.and_then(|c| c.line) {
                        let _ = write!(out, "{line}");
                    }
                }
                Segment::Message => out.push_str(event.message()),
                Segment::Unknown => out.push_str(UNKNOWN_PLACEHOLDER),
            }
        }
        out
    }

    /// One-shot compile and render.
    pub fn format(event: &LogEvent, pattern: &str) -> String {
        Self::compile(pattern).render(event)
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::compile(MINIMAL_PATTERN)
    }
}

fn push_opt(out: &mut String, value: Option<&str>) {
    if let Some(value) = value {
        out.push_str(value);
    }
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Debug => Color::Blue,
        Level::Info => Color::Green,
        Level::Warn => Color::Yellow,
        Level::Error => Color::Red,
        Level::Fatal => Color::Magenta,
    }
}

fn parse_placeholder(name: &str) -> Segment {
    if let Some(format) = name.strip_prefix("time ") {
        return match parse_time_format(format.trim()) {
            Some(tokens) => Segment::Time(tokens),
            None => Segment::InvalidTime,
        };
    }
    match name {
        "level" => Segment::Level,
        "time" => Segment::EpochMillis,
        "class" => Segment::Class,
        "fullClass" => Segment::FullClass,
        "package" => Segment::Package,
        "method" => Segment::Method,
        "nativeMethod" => Segment::NativeMethod,
        "module" => Segment::Module,
        "moduleVersion" => Segment::ModuleVersion,
        "classLoader" => Segment::ClassLoader,
        "thread" => Segment::Thread,
        "file" => Segment::File,
        "lineNumber" => Segment::LineNumber,
        "message" => Segment::Message,
        _ => Segment::Unknown,
    }
}

/// Parses `yyyy MM dd HH mm ss SSS` style date formats. Letters repeat to form a
/// field, `'quoted'` text is literal and any unsupported letter invalidates the
/// whole format.
fn parse_time_format(format: &str) -> Option<Vec<TimeToken>> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                literal.push('\'');
                continue;
            }
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        literal.push('\'');
                    }
                    Some('\'') => break,
                    Some(c) => literal.push(c),
                    None => return None,
                }
            }
            continue;
        }
        if !c.is_ascii_alphabetic() {
            literal.push(c);
            continue;
        }
        let mut count = 1;
        while chars.peek() == Some(&c) {
            chars.next();
            count += 1;
        }
        let padded = count >= 2;
        let token = match (c, count) {
            ('y', 2) => TimeToken::ShortYear,
            ('y', _) => TimeToken::Year,
            ('M', 1..=2) => TimeToken::Month { padded },
            ('d', 1..=2) => TimeToken::Day { padded },
            ('H', 1..=2) => TimeToken::Hour { padded },
            ('m', 1..=2) => TimeToken::Minute { padded },
            ('s', 1..=2) => TimeToken::Second { padded },
            ('S', 1..=3) => TimeToken::Millis,
            _ => return None,
        };
        if !literal.is_empty() {
            tokens.push(TimeToken::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(token);
    }
    if !literal.is_empty() {
        tokens.push(TimeToken::Literal(literal));
    }
    Some(tokens)
}

fn render_time(out: &mut String, tokens: &[TimeToken], event: &LogEvent) {
    let time = event.timestamp().with_timezone(&Local);
    for token in tokens {
        let _ = match token {
            TimeToken::Literal(text) => out.write_str(text),
            TimeToken::Year => write!(out, "{:04}", time.year()),
            TimeToken::ShortYear => write!(out, "{:02}", time.year().rem_euclid(100)),
            TimeToken::Month { padded } => write_field(out, time.month(), *padded),
            TimeToken::Day { padded } => write_field(out, time.day(), *padded),
            TimeToken::Hour { padded } => write_field(out, time.hour(), *padded),
            TimeToken::Minute { padded } => write_field(out, time.minute(), *padded),
            TimeToken::Second { padded } => write_field(out, time.second(), *padded),
            TimeToken::Millis => write!(out, "{:03}", time.timestamp_subsec_millis().min(999)),
        };
    }
}

fn write_field(out: &mut String, value: u32, padded: bool) -> std::fmt::Result {
    if padded {
        write!(out, "{value:02}")
    } else {
        write!(out, "{value}")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::event::{CallerContext, NO_TAGS};

    fn event(level: Level, message: &str) -> LogEvent {
        LogEvent::new(level, message, None, NO_TAGS)
    }

    fn event_at(millis: i64) -> LogEvent {
        let time = Utc.timestamp_millis_opt(millis).unwrap();
        LogEvent::at(time, Level::Info, "hi", None, NO_TAGS)
    }

    #[test]
    fn test_literal_pattern() {
        let formatter = Formatter::compile("[{level}] {message}");
        assert_eq!(formatter.render(&event(Level::Debug, "hi")), "[DEBUG] hi");
        assert_eq!(formatter.render(&event(Level::Warn, "hi")), "[WARN] hi");
    }

    #[test]
    fn test_unmatched_braces_pass_through() {
        let formatter = Formatter::compile("no fields { here } but {{ odd");
        assert_eq!(formatter.render(&event(Level::Info, "x")), "no fields UNKNOWN_PLACEHOLDER but {{ odd");
        assert_eq!(Formatter::format(&event(Level::Info, "x"), "plain"), "plain");
    }

    #[test]
    fn test_year_of_fixed_timestamp() {
        // 2021-06-15T12:00:00Z, far enough from new year for any time zone.
        let event = event_at(1_623_758_400_000);
        assert_eq!(Formatter::format(&event, "{time yyyy}"), "2021");
        assert_eq!(Formatter::format(&event, "{time yy}"), "21");
        assert_eq!(Formatter::format(&event, "{time yyyy-MM}"), "2021-06");
    }

    #[test]
    fn test_full_date_format_matches_local_time() {
        let event = event_at(1_623_758_400_123);
        let local = event.timestamp().with_timezone(&Local);
        let expected = local.format("%Y/%m/%d %H:%M:%S.%3f").to_string();
        assert_eq!(
            Formatter::format(&event, "{time yyyy/MM/dd HH:mm:ss.SSS}"),
            expected
        );
        assert!(expected.ends_with(".123"));
    }

    #[test]
    fn test_quoted_literal_in_date_format() {
        let event = event_at(1_623_758_400_000);
        assert_eq!(Formatter::format(&event, "{time 'year' yyyy}"), "year 2021");
        assert_eq!(Formatter::format(&event, "{time yyyy''}"), "2021'");
    }

    #[test]
    fn test_raw_epoch_millis() {
        let event = event_at(1_623_758_400_123);
        assert_eq!(Formatter::format(&event, "{time}"), "1623758400123");
    }

    #[test]
    fn test_invalid_time_format() {
        let event = event_at(0);
        assert_eq!(Formatter::format(&event, "{time qqq}"), INVALID_TIME_FORMAT);
        assert_eq!(Formatter::format(&event, "{time 'open}"), INVALID_TIME_FORMAT);
        assert_eq!(Formatter::format(&event, "a {time yyyy-ZZ} b"), "a INVALID_TIME_FORMAT b");
    }

    #[test]
    fn test_unknown_placeholder() {
        assert_eq!(
            Formatter::format(&event(Level::Info, "m"), "{nope} {message}"),
            "UNKNOWN_PLACEHOLDER m"
        );
    }

    #[test]
    fn test_colored_level_is_reset() {
        let formatter = Formatter::compile("{colored}[{level}] {message}");
        assert!(formatter.is_colored());
        assert_eq!(
            formatter.render(&event(Level::Error, "boom")),
            "[\x1B[31mERROR\x1B[0m] boom"
        );
        assert_eq!(
            formatter.render(&event(Level::Fatal, "boom")),
            "[\x1B[35mFATAL\x1B[0m] boom"
        );
        assert!(formatter.render(&event(Level::Debug, "x")).contains("\x1B[34mDEBUG\x1B[0m"));
    }

    #[test]
    fn test_colored_marker_only_leading() {
        let formatter = Formatter::compile("{level} {colored}");
        assert!(!formatter.is_colored());
        assert_eq!(formatter.render(&event(Level::Info, "x")), "INFO UNKNOWN_PLACEHOLDER");
    }

    #[test]
    fn test_caller_fields() {
        let caller = CallerContext {
            class: Some("app::db::Pool".into()),
            method: Some("acquire".into()),
            native_method: false,
            module: Some("app".into()),
            module_version: Some("1.2.0".into()),
            class_loader: Some("app-loader".into()),
            thread: Some("worker-1".into()),
            file: Some("src/db.rs".into()),
            line: Some(42),
        };
        let event = LogEvent::new(Level::Info, "ready", Some(caller), NO_TAGS);
        let rendered = Formatter::format(
            &event,
            "{class}|{fullClass}|{package}|{method}|{nativeMethod}|{module}@{moduleVersion}|{classLoader}|{thread}|{file}:{lineNumber}|{message}",
        );
        assert_eq!(
            rendered,
            "Pool|app::db::Pool|app::db|acquire|false|app@1.2.0|app-loader|worker-1|src/db.rs:42|ready"
        );
    }

    #[test]
    fn test_missing_caller_renders_empty() {
        assert_eq!(
            Formatter::format(&event(Level::Info, "m"), "<{class}.{method}:{lineNumber}> {message}"),
            "<.:> m"
        );
    }

    #[test]
    fn test_presets_compile_without_unknowns() {
        let event = LogEvent::new(Level::Info, "m", Some(crate::caller!("run")), NO_TAGS);
        for pattern in [MINIMAL_PATTERN, LIGHT_PATTERN, DEFAULT_PATTERN, DETAILED_PATTERN] {
            let rendered = Formatter::format(&event, pattern);
            assert!(!rendered.contains(UNKNOWN_PLACEHOLDER), "{pattern}");
            assert!(!rendered.contains(INVALID_TIME_FORMAT), "{pattern}");
            assert!(rendered.ends_with('m'));
        }
    }

    #[test]
    fn test_formatter_is_shareable_across_threads() {
        let formatter = std::sync::Arc::new(Formatter::compile("{level}:{message}"));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let formatter = formatter.clone();
                std::thread::spawn(move || formatter.render(&event(Level::Info, &i.to_string())))
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), format!("INFO:{i}"));
        }
    }
}
