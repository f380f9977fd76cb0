use std::{
    fs::{self, File},
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::utils::lock;

/// A destination for rendered log lines.
///
/// Writers are shared between the sink registry and whoever else holds them, so
/// every method takes `&self` and implementations guard their own state.
pub trait LogWriter: Send + Sync {
    /// Writes one rendered line; the writer appends the line terminator.
    fn write_line(&self, line: &str) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;
    /// Flushes and releases the destination. Later writes fail.
    fn close(&self) -> io::Result<()> {
        self.flush()
    }
}

/// Process standard output.
#[derive(Default, Debug)]
pub struct LogStdout;

impl LogWriter for LogStdout {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()
    }

    fn flush(&self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Process standard error.
#[derive(Default, Debug)]
pub struct LogStderr;

impl LogWriter for LogStderr {
    fn write_line(&self, line: &str) -> io::Result<()> {
        writeln!(io::stderr().lock(), "{line}")
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().flush()
    }
}

pub(crate) fn closed_error(what: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("log file {} is closed", what.display()),
    )
}

/// A plain log file, created if missing and appended to otherwise.
pub struct LogFile {
    path: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
}

impl LogFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            file: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogWriter for LogFile {
    fn write_line(&self, line: &str) -> io::Result<()> {
        match lock(&self.file).as_mut() {
            Some(file) => writeln!(file, "{line}"),
            None => Err(closed_error(&self.path)),
        }
    }

    fn flush(&self) -> io::Result<()> {
        match lock(&self.file).as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    fn close(&self) -> io::Result<()> {
        match lock(&self.file).take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Adapter turning any [`Write`] into a [`LogWriter`].
pub struct LogStream<W> {
    inner: Mutex<W>,
}

impl<W: Write + Send> LogStream<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> LogWriter for LogStream<W> {
    fn write_line(&self, line: &str) -> io::Result<()> {
        writeln!(lock(&self.inner), "{line}")
    }

    fn flush(&self) -> io::Result<()> {
        lock(&self.inner).flush()
    }
}

/// Keeps every written line in memory. Handy as a capture target in tests and
/// for in-process consumers of rendered output.
#[derive(Default, Debug)]
pub struct LogMemory {
    lines: Mutex<Vec<String>>,
}

impl LogMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn clear(&self) {
        lock(&self.lines).clear();
    }
}

impl LogWriter for LogMemory {
    fn write_line(&self, line: &str) -> io::Result<()> {
        lock(&self.lines).push(line.to_string());
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test_log_file.log");
        let log_file = LogFile::new(&path).unwrap();
        log_file.write_line("Hello, world!").unwrap();
        log_file.write_line("rust is awesome !").unwrap();
        log_file.flush().unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Hello, world!\nrust is awesome !\n"
        );
    }

    #[test]
    fn test_log_file_appends_to_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.log");
        fs::write(&path, "old\n").unwrap();
        let log_file = LogFile::new(&path).unwrap();
        log_file.write_line("new").unwrap();
        log_file.close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }

    #[test]
    fn test_log_file_rejects_writes_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = LogFile::new(dir.path().join("closed.log")).unwrap();
        log_file.close().unwrap();
        let err = log_file.write_line("late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        // closing twice is harmless
        log_file.close().unwrap();
    }

    #[test]
    fn test_log_stream() {
        let stream = LogStream::new(Vec::new());
        stream.write_line("a").unwrap();
        stream.write_line("b").unwrap();
        assert_eq!(stream.into_inner(), b"a\nb\n");
    }

    #[test]
    fn test_log_memory() {
        let memory = LogMemory::new();
        memory.write_line("one").unwrap();
        memory.write_line("two").unwrap();
        assert_eq!(memory.lines(), vec!["one", "two"]);
        memory.clear();
        assert!(memory.lines().is_empty());
    }

    #[test]
    fn test_log_stdout() {
        let stdout = LogStdout;
        stdout.write_line("Hello, world!").unwrap();
        stdout.flush().unwrap();
    }
}
