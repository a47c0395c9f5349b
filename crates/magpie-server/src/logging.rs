//! Log sink with SIGHUP reopening.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

enum Target {
    Stdout,
    File(std::fs::File),
}

/// A log destination that can be reopened in place, for logrotate.
pub struct LogSink {
    path: Mutex<Option<PathBuf>>,
    target: Mutex<Target>,
}

impl LogSink {
    /// Open the sink: a file when a path is given, stdout otherwise.
    pub fn open(path: Option<PathBuf>) -> io::Result<Self> {
        let target = match &path {
            Some(path) => Target::File(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => Target::Stdout,
        };
        Ok(Self {
            path: Mutex::new(path),
            target: Mutex::new(target),
        })
    }

    /// Re-open the sink, optionally switching to a new path.
    pub fn reopen(&self, new_path: Option<PathBuf>) -> io::Result<()> {
        let mut path = self.path.lock().unwrap_or_else(|e| e.into_inner());
        *path = new_path;
        let target = match &*path {
            Some(path) => Target::File(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => Target::Stdout,
        };
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = target;
        Ok(())
    }

    /// Whether logs currently go to stdout.
    pub fn is_stdout(&self) -> bool {
        matches!(
            &*self.target.lock().unwrap_or_else(|e| e.into_inner()),
            Target::Stdout
        )
    }
}

/// Cloneable writer handle over a shared [`LogSink`].
#[derive(Clone)]
pub struct LogWriter(pub Arc<LogSink>);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self.0.target.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *target {
            Target::Stdout => io::stdout().write(buf),
            Target::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut target = self.0.target.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *target {
            Target::Stdout => io::stdout().flush(),
            Target::File(file) => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
