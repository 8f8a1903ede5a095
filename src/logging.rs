// src/logging.rs
use crate::error::VaranResult;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Append-mode log sink that can be reopened in place, so an external
/// rotation (rename + rotate request) takes effect without restarting.
#[derive(Clone)]
pub struct RotatingFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RotatingFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn reopen(&self) -> io::Result<()> {
        let fresh = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = fresh;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.flush()
    }
}

/// Install the tracing subscriber. `level` takes an EnvFilter directive
/// string ("info", "varan=debug,access=info", ...); an explicit
/// RUST_LOG wins over the configured level. Returns the file sink when
/// one was configured so the dispatcher can service rotate requests.
pub fn init(level: &str, file: Option<&Path>) -> VaranResult<Option<RotatingFile>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match file {
        Some(path) => {
            let sink = RotatingFile::open(path)?;
            let writer = sink.clone();
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .try_init()
                .ok();
            Ok(Some(sink))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .ok();
            Ok(None)
        }
    }
}
