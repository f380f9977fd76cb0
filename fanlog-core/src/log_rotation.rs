use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

use crate::{
    error::{Error, Result},
    log_writer::{LogWriter, closed_error},
    utils::lock,
};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%6f";
/// Length of a rendered [`TIMESTAMP_FORMAT`].
const TIMESTAMP_DIGITS: usize = 20;

/// Parses compact durations such as `"7d"`, `"1h"`, `"30m"` or `"10s"`. A leading
/// `+` is accepted (`"+7d"`).
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || Error::InvalidDuration(text.into());
    let trimmed = text.trim();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (number, unit) = trimmed.split_at(split);
    let value: u64 = number.parse().map_err(|_| invalid())?;
    let seconds = match unit {
        "d" => value.checked_mul(86_400),
        "h" => value.checked_mul(3_600),
        "m" => value.checked_mul(60),
        "s" => Some(value),
        _ => None,
    }
    .ok_or_else(invalid)?;
    Ok(Duration::from_secs(seconds))
}

/// Settings for a [`RotatingFileSink`].
///
/// Files live in `folder` and are named `<filename>_<timestamp>.<extension>`.
/// At least one of `max_bytes` and `max_age` must be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub folder: PathBuf,
    pub filename: String,
    pub extension: String,
    pub max_bytes: Option<u64>,
    pub max_age: Option<Duration>,
    pub max_files: usize,
}

impl RotationConfig {
    /// Size and age unset, `.log` files, ten files kept.
    pub fn new<P: AsRef<Path>>(folder: P, filename: &str) -> Self {
        Self {
            folder: folder.as_ref().to_path_buf(),
            filename: filename.into(),
            extension: "log".into(),
            max_bytes: None,
            max_age: None,
            max_files: 10,
        }
    }

    pub fn with_extension(self, extension: &str) -> Self {
        Self {
            extension: extension.into(),
            ..self
        }
    }

    pub fn with_max_bytes(self, max_bytes: u64) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..self
        }
    }

    pub fn with_max_age(self, max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            ..self
        }
    }

    /// Same as [`RotationConfig::with_max_age`] with a compact duration string.
    pub fn with_max_age_str(self, max_age: &str) -> Result<Self> {
        Ok(self.with_max_age(parse_duration(max_age)?))
    }

    pub fn with_max_files(self, max_files: usize) -> Self {
        Self { max_files, ..self }
    }

    fn validate(&self) -> Result<()> {
        if self.max_bytes.is_none() && self.max_age.is_none() {
            return Err(Error::InvalidRotation(
                "at least one of max_bytes or max_age must be set".into(),
            ));
        }
        if self.max_bytes == Some(0) {
            return Err(Error::InvalidRotation("max_bytes must be positive".into()));
        }
        if self.max_age == Some(Duration::ZERO) {
            return Err(Error::InvalidRotation("max_age must be positive".into()));
        }
        if self.max_files < 1 {
            return Err(Error::InvalidRotation("max_files must be at least 1".into()));
        }
        if self.filename.is_empty() {
            return Err(Error::InvalidRotation("filename must not be empty".into()));
        }
        Ok(())
    }
}

struct RotationState {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    opened_at: DateTime<Utc>,
    current_size: u64,
    last_rotation: Instant,
    closed: bool,
}

/// A log file that rotates on size or age and keeps at most `max_files` files.
///
/// The size/age check, the rotation and the write happen under one lock, so the
/// sink can be shared by several callers without interleaving a rotation.
pub struct RotatingFileSink {
    config: RotationConfig,
    state: Mutex<RotationState>,
}

impl RotatingFileSink {
    pub fn new(config: RotationConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.folder)?;
        let opened_at = Utc::now();
        let (file, path) = open_timestamped_file(&config, opened_at)?;
        Ok(Self {
            config,
            state: Mutex::new(RotationState {
                file: Some(file),
                path,
                opened_at,
                current_size: 0,
                last_rotation: Instant::now(),
                closed: false,
            }),
        })
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Path of the file currently written to.
    pub fn current_path(&self) -> PathBuf {
        lock(&self.state).path.clone()
    }

    /// Bytes written to the current file since it was opened.
    pub fn current_size(&self) -> u64 {
        lock(&self.state).current_size
    }

    /// Log files of this sink, oldest first.
    pub fn files(&self) -> io::Result<Vec<PathBuf>> {
        Ok(self.list_files()?.into_iter().map(|(_, path)| path).collect())
    }

    fn should_rotate(&self, state: &RotationState) -> bool {
        if let Some(max_bytes) = self.config.max_bytes
            && state.current_size >= max_bytes
        {
            return true;
        }
        if let Some(max_age) = self.config.max_age
            && state.last_rotation.elapsed() >= max_age
        {
            return true;
        }
        false
    }

    fn rotate(&self, state: &mut RotationState) -> io::Result<()> {
        if let Some(mut file) = state.file.take() {
            file.flush()?;
        }
        let closed_at = Utc::now();
        if state.path.exists() {
            let stem = format!(
                "{}_{}_{}",
                self.config.filename,
                state.opened_at.format(TIMESTAMP_FORMAT),
                closed_at.format(TIMESTAMP_FORMAT)
            );
            let archive = unique_path(&self.config.folder, &stem, &self.config.extension);
            fs::rename(&state.path, archive)?;
        }
        let (file, path) = open_timestamped_file(&self.config, closed_at)?;
        state.file = Some(file);
        state.path = path;
        state.opened_at = closed_at;
        state.current_size = 0;
        state.last_rotation = Instant::now();
        Ok(())
    }

    fn list_files(&self) -> io::Result<Vec<(SystemTime, PathBuf)>> {
        let prefix = format!("{}_", self.config.filename);
        let suffix = format!(".{}", self.config.extension);
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.config.folder)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let stamp = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix));
            if !stamp.is_some_and(is_own_stamp) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }
        files.sort();
        Ok(files)
    }

    /// Deletes the oldest files until at most `max_files` remain. The active file
    /// counts towards the limit but is never removed.
    fn cleanup(&self, active: &Path) -> io::Result<()> {
        let files = self.list_files()?;
        let mut excess = files.len().saturating_sub(self.config.max_files);
        let mut first_error = None;
        for (_, path) in files {
            if excess == 0 {
                break;
            }
            if path == active {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => excess -= 1,
                Err(err) => {
                    excess -= 1;
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl LogWriter for RotatingFileSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(closed_error(&state.path));
        }
        let mut pruned = Ok(());
        if self.should_rotate(&state) {
            self.rotate(&mut state)?;
            pruned = self.cleanup(&state.path);
        }
        if state.file.is_none() {
            // A previous rotation failed half way, start over with a fresh file.
            let opened_at = Utc::now();
            let (file, path) = open_timestamped_file(&self.config, opened_at)?;
            state.file = Some(file);
            state.path = path;
            state.opened_at = opened_at;
            state.current_size = 0;
            state.last_rotation = Instant::now();
        }
        if let Some(file) = state.file.as_mut() {
            writeln!(file, "{line}")?;
        }
        state.current_size += line.len() as u64 + 1;
        // the line is written even when pruning old files failed
        pruned
    }

    fn flush(&self) -> io::Result<()> {
        match lock(&self.state).file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.closed = true;
        match state.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `<stem>.<ext>`, or `<stem>-<n>.<ext>` with the first free `n`.
/// Matches `<ts>` or `<ts>_<ts>`, optionally followed by a `-<n>` counter.
fn is_own_stamp(stamp: &str) -> bool {
    let (stamps, counter) = match stamp.split_once('-') {
        Some((stamps, counter)) => (stamps, Some(counter)),
        None => (stamp, None),
    };
    let is_timestamp =
        |part: &str| part.len() == TIMESTAMP_DIGITS && part.bytes().all(|b| b.is_ascii_digit());
    let stamps_ok = match stamps.split_once('_') {
        Some((opened, closed)) => is_timestamp(opened) && is_timestamp(closed),
        None => is_timestamp(stamps),
    };
    stamps_ok
        && counter.is_none_or(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn unique_path(folder: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = folder.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| folder.join(format!("{stem}-{n}.{extension}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn open_timestamped_file(
    config: &RotationConfig,
    at: DateTime<Utc>,
) -> io::Result<(BufWriter<File>, PathBuf)> {
    let stem = format!("{}_{}", config.filename, at.format(TIMESTAMP_FORMAT));
    let path = unique_path(&config.folder, &stem, &config.extension);
    let file = File::options().create_new(true).write(true).open(&path)?;
    Ok((BufWriter::new(file), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn read_all_log_content(sink: &RotatingFileSink) -> String {
        let mut content = String::new();
        for f in sink.files().unwrap() {
            content.push_str(&fs::read_to_string(f).unwrap());
        }
        content
    }

    fn line(i: usize) -> String {
        // 40 bytes + newline
        format!("line{i:03} padding padding padding padding")
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("+7d").unwrap(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for text in ["7w", "d", "10", "", "1.5h", "-1h", "1hh"] {
            assert!(
                matches!(parse_duration(text), Err(Error::InvalidDuration(_))),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rotation_config_age_string_fails_early() {
        let err = RotationConfig::new("/tmp", "app")
            .with_max_age_str("3y")
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_validation() {
        let dir = tempfile::tempdir().unwrap();
        let base = RotationConfig::new(dir.path(), "app");
        assert!(matches!(
            RotatingFileSink::new(base.clone()),
            Err(Error::InvalidRotation(_))
        ));
        assert!(matches!(
            RotatingFileSink::new(base.clone().with_max_bytes(100).with_max_files(0)),
            Err(Error::InvalidRotation(_))
        ));
        assert!(matches!(
            RotatingFileSink::new(base.clone().with_max_bytes(0)),
            Err(Error::InvalidRotation(_))
        ));
        assert!(RotatingFileSink::new(base.with_max_bytes(100)).is_ok());
    }

    #[test]
    fn test_size_rotation_opens_new_file_after_limit() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RotatingFileSink::new(
            RotationConfig::new(dir.path(), "app").with_max_bytes(100),
        )
        .unwrap();
        let first = sink.current_path();
        // 3 x 41 bytes: the third write crosses 100 bytes
        for i in 0..3 {
            sink.write_line(&line(i)).unwrap();
        }
        assert_eq!(sink.current_path(), first);
        assert_eq!(sink.current_size(), 123);
        thread::sleep(Duration::from_millis(2));
        sink.write_line(&line(3)).unwrap();
        assert_ne!(sink.current_path(), first);
        assert_eq!(sink.current_size(), 41);
        sink.flush().unwrap();
        assert_eq!(sink.files().unwrap().len(), 2);
    }

    #[test]
    fn test_size_rotation_keeps_two_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RotatingFileSink::new(
            RotationConfig::new(dir.path(), "app")
                .with_max_bytes(100)
                .with_max_files(2),
        )
        .unwrap();
        // rotations happen before writes 3, 6, 9, 12 and 15
        for i in 0..16 {
            thread::sleep(Duration::from_millis(2));
            sink.write_line(&line(i)).unwrap();
        }
        sink.flush().unwrap();

        let files = sink.files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1], sink.current_path());
        let archived = fs::read_to_string(&files[0]).unwrap();
        assert_eq!(archived, format!("{}\n{}\n{}\n", line(12), line(13), line(14)));
        let active = fs::read_to_string(&files[1]).unwrap();
        assert_eq!(active, format!("{}\n", line(15)));
    }

    #[test]
    fn test_archive_name_records_span() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RotatingFileSink::new(
            RotationConfig::new(dir.path(), "app").with_max_bytes(10),
        )
        .unwrap();
        sink.write_line("0123456789").unwrap();
        thread::sleep(Duration::from_millis(2));
        sink.write_line("next").unwrap();
        let files = sink.files().unwrap();
        assert_eq!(files.len(), 2);
        let archived = files[0].file_name().unwrap().to_string_lossy().to_string();
        // app_<opened>_<closed>.log
        assert_eq!(archived.matches('_').count(), 2, "{archived}");
        assert!(archived.ends_with(".log"));
    }

    #[test]
    fn test_unique_path_disambiguates() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "app_1", "log");
        File::create(&first).unwrap();
        let second = unique_path(dir.path(), "app_1", "log");
        assert_eq!(second, dir.path().join("app_1-1.log"));
        File::create(&second).unwrap();
        assert_eq!(unique_path(dir.path(), "app_1", "log"), dir.path().join("app_1-2.log"));
    }

    #[test]
    fn test_time_rotation_creates_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RotatingFileSink::new(
            RotationConfig::new(dir.path(), "app").with_max_age(Duration::from_millis(50)),
        )
        .unwrap();

        sink.write_line("line1").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.files().unwrap().len(), 1);

        thread::sleep(Duration::from_millis(60));
        sink.write_line("line2").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.files().unwrap().len(), 2);

        thread::sleep(Duration::from_millis(60));
        sink.write_line("line3").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.files().unwrap().len(), 3);

        let content = read_all_log_content(&sink);
        assert_eq!(content, "line1\nline2\nline3\n");
    }

    #[test]
    fn test_cleanup_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("other_20200101.log"), "x").unwrap();
        fs::write(dir.path().join("app_notes.txt"), "x").unwrap();
        let sink = RotatingFileSink::new(
            RotationConfig::new(dir.path(), "app")
                .with_max_bytes(5)
                .with_max_files(1),
        )
        .unwrap();
        for i in 0..4 {
            thread::sleep(Duration::from_millis(2));
            sink.write_line(&format!("entry{i}")).unwrap();
        }
        assert_eq!(sink.files().unwrap(), vec![sink.current_path()]);
        assert!(dir.path().join("other_20200101.log").exists());
        assert!(dir.path().join("app_notes.txt").exists());
    }

    #[test]
    fn test_cleanup_spares_files_sharing_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let foreign = dir.path().join("app_v2_20240101000000000000.log");
        fs::write(&foreign, "keep me").unwrap();
        let sink = RotatingFileSink::new(
            RotationConfig::new(dir.path(), "app")
                .with_max_bytes(5)
                .with_max_files(1),
        )
        .unwrap();
        for i in 0..3 {
            thread::sleep(Duration::from_millis(2));
            sink.write_line(&format!("entry{i}")).unwrap();
        }
        assert_eq!(sink.files().unwrap(), vec![sink.current_path()]);
        assert_eq!(fs::read_to_string(&foreign).unwrap(), "keep me");
    }

    #[test]
    fn test_own_stamp_shapes() {
        let ts = "20240101120000123456";
        assert!(is_own_stamp(ts));
        assert!(is_own_stamp(&format!("{ts}_{ts}")));
        assert!(is_own_stamp(&format!("{ts}_{ts}-3")));
        assert!(!is_own_stamp(&format!("v2_{ts}")));
        assert!(!is_own_stamp("notes"));
        assert!(!is_own_stamp(&format!("{ts}-")));
    }

    #[test]
    fn test_concurrent_writers_never_lose_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = std::sync::Arc::new(
            RotatingFileSink::new(
                RotationConfig::new(dir.path(), "app")
                    .with_max_bytes(256)
                    .with_max_files(1_000),
            )
            .unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        sink.write_line(&format!("t{t}-{i:02}")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        sink.flush().unwrap();
        let content = read_all_log_content(&sink);
        assert_eq!(content.lines().count(), 200);
        for t in 0..4 {
            for i in 0..50 {
                assert!(content.contains(&format!("t{t}-{i:02}\n")));
            }
        }
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RotatingFileSink::new(
            RotationConfig::new(dir.path(), "app").with_max_bytes(100),
        )
        .unwrap();
        sink.write_line("before").unwrap();
        sink.close().unwrap();
        assert!(sink.write_line("after").is_err());
        assert_eq!(fs::read_to_string(sink.current_path()).unwrap(), "before\n");
    }
}
