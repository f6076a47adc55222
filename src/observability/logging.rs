//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from configuration
//! - Route output to stderr or a log file
//! - Reopen the log file on request (SIGUSR1) for rotation
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unable to open log file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("logging already initialized: {0}")]
    Init(#[from] TryInitError),
}

/// Append-mode log file that can be swapped for a fresh handle.
#[derive(Debug, Clone)]
pub struct LogFile {
    inner: Arc<LogFileInner>,
}

#[derive(Debug)]
struct LogFileInner {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            inner: Arc::new(LogFileInner {
                path,
                file: Mutex::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Close the current handle and open the path again.
    ///
    /// On failure the old handle stays in place.
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.inner.path)?;
        let mut file = self.inner.file.lock();
        let _ = file.flush();
        *file = fresh;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writer handed out per event.
pub struct LogFileWriter<'a> {
    file: &'a Mutex<File>,
}

impl Write for LogFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // One lock per event keeps lines whole across a reopen.
        self.file.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: &self.inner.file,
        }
    }
}

/// Handle kept by the signal dispatcher to rotate logs.
#[derive(Debug, Clone, Default)]
pub struct LogHandle {
    file: Option<LogFile>,
}

impl LogHandle {
    pub fn stderr() -> Self {
        Self { file: None }
    }

    pub fn file(file: LogFile) -> Self {
        Self { file: Some(file) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(LogFile::path)
    }

    /// Reopen the log file. Logging to stderr has nothing to reopen.
    pub fn reopen(&self) -> io::Result<()> {
        match &self.file {
            Some(file) => file.reopen(),
            None => Ok(()),
        }
    }
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &ObservabilityConfig) -> Result<LogHandle, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)?,
    };

    let (writer, handle, ansi) = match &config.log_file {
        Some(path) => {
            let file = LogFile::open(path).map_err(|source| LoggingError::Open {
                path: path.clone(),
                source,
            })?;
            (BoxMakeWriter::new(file.clone()), LogHandle::file(file), false)
        }
        None => (BoxMakeWriter::new(io::stderr), LogHandle::stderr(), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_writer(writer),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init()?,
    }

    tracing::debug!(log_file = ?handle.path(), "Logging initialized");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_follows_a_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.log");
        let rotated = dir.path().join("handoff.log.1");
        let log = LogFile::open(&path).unwrap();

        log.make_writer().write_all(b"before\n").unwrap();
        std::fs::rename(&path, &rotated).unwrap();
        log.make_writer().write_all(b"still old\n").unwrap();

        LogHandle::file(log.clone()).reopen().unwrap();
        log.make_writer().write_all(b"after\n").unwrap();

        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "before\nstill old\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn failed_reopen_keeps_the_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("logs");
        std::fs::create_dir(&sub).unwrap();
        let path = sub.join("handoff.log");
        let log = LogFile::open(&path).unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::remove_dir(&sub).unwrap();
        assert!(log.reopen().is_err());
        log.make_writer().write_all(b"kept\n").unwrap();
    }

    #[test]
    fn stderr_handle_reopens_trivially() {
        assert!(LogHandle::stderr().reopen().is_ok());
        assert!(LogHandle::stderr().path().is_none());
    }
}
