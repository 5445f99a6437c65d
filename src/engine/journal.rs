//! Per-run session log.
//!
//! Lines look like `2024-05-01 12:00:00 - INFO - message`. The engine opens
//! the sink when a run starts and closes it when the run ends.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        })
    }
}

pub fn format_line(level: Level, message: &str) -> String {
    format!(
        "{} - {} - {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        level,
        message
    )
}

/// Destination for session log lines
pub trait LogSink: Send {
    fn record(&mut self, level: Level, message: &str);

    /// Flush and release the sink; later records may be dropped
    fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn info(&mut self, message: &str) {
        self.record(Level::Info, message);
    }

    fn warn(&mut self, message: &str) {
        self.record(Level::Warning, message);
    }

    fn error(&mut self, message: &str) {
        self.record(Level::Error, message);
    }
}

/// Appends to `session.log`
pub struct FileLog {
    writer: Option<BufWriter<File>>,
}

impl FileLog {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
        })
    }
}

impl LogSink for FileLog {
    fn record(&mut self, level: Level, message: &str) {
        if let Some(writer) = self.writer.as_mut() {
            let written = writeln!(writer, "{}", format_line(level, message)).and_then(|_| writer.flush());
            if let Err(e) = written {
                tracing::warn!("Failed to write session log: {}", e);
            }
        }
    }

    fn close(&mut self) -> std::io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Keeps lines in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    lines: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Lines containing `needle`
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }
}

impl LogSink for MemoryLog {
    fn record(&mut self, level: Level, message: &str) {
        if !self.is_closed() {
            self.lines.lock().push(format_line(level, message));
        }
    }

    fn close(&mut self) -> std::io::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}
