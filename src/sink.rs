//! # Result Sinks
//!
//! Destinations for the human-readable benchmark record: one line per call
//! followed by the summary block. Diagnostics go through `tracing`; only the
//! record itself passes through a [`ResultSink`].
//!
//! Sinks are shared by every device loop, so implementations take `&self` and
//! serialise their writes internally. A line is always written whole.
//!
//! A failing file never aborts a run. [`LogWriter`] logs a warning once and
//! carries on writing to the console.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Receiver of benchmark record lines
pub trait ResultSink: Send + Sync {
    fn write_line(&self, line: &str);

    /// Push buffered lines to their destination
    fn flush(&self) -> Result<()>;
}

/// Writes record lines to standard output
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl ResultSink for ConsoleSink {
    fn write_line(&self, line: &str) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        let _ = writeln!(handle, "{}", line);
    }

    fn flush(&self) -> Result<()> {
        io::stdout().flush().context("failed to flush stdout")
    }
}

/// Buffered, line-serialised file writer
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    /// Open `path`, truncating it unless `append` is set.
    pub fn open(path: &Path, append: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .with_context(|| format!("failed to open result log {}", path.display()))?;
        debug!("Writing results to {:?} (append: {})", path, append);

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn try_write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }
}

impl ResultSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Err(e) = self.try_write_line(line) {
            warn!("Failed to write to {:?}: {}", self.path, e);
        }
    }

    fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

/// Record writer used by the binary: a file, the console, or both.
///
/// The file falls back to the console the first time a write fails; the
/// remaining lines of the run are then printed instead.
#[derive(Debug)]
pub struct LogWriter {
    file: Option<FileSink>,
    console: bool,
    degraded: AtomicBool,
}

impl LogWriter {
    pub fn console() -> Self {
        Self {
            file: None,
            console: true,
            degraded: AtomicBool::new(false),
        }
    }

    /// Build a writer for an optional log file.
    ///
    /// If the file cannot be opened the writer warns and uses the console.
    pub fn open(path: Option<&Path>, append: bool, console: bool) -> Self {
        let file = match path.map(|p| FileSink::open(p, append)).transpose() {
            Ok(file) => file,
            Err(e) => {
                warn!("{:#}; writing results to the console instead", e);
                return Self::console();
            }
        };
        Self {
            console: console || file.is_none(),
            file,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether a file failure moved output to the console
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn degrade(&self, error: &dyn std::fmt::Display) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                "Result log unavailable ({}); continuing on the console",
                error
            );
        }
    }
}

impl ResultSink for LogWriter {
    fn write_line(&self, line: &str) {
        let mut to_console = self.console;
        if let Some(file) = self.file.as_ref().filter(|_| !self.is_degraded()) {
            if let Err(e) = file.try_write_line(line) {
                self.degrade(&e);
                to_console = true;
            }
        } else if self.file.is_some() {
            to_console = true;
        }

        if to_console {
            ConsoleSink.write_line(line);
        }
    }

    fn flush(&self) -> Result<()> {
        if let Some(file) = self.file.as_ref().filter(|_| !self.is_degraded()) {
            if let Err(e) = file.flush() {
                self.degrade(&format!("{:#}", e));
            }
        }
        ConsoleSink.flush()
    }
}

/// Collects record lines in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ResultSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_truncates_or_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.log");

        let sink = FileSink::open(&path, false).unwrap();
        sink.write_line("first");
        sink.flush().unwrap();
        drop(sink);

        let sink = FileSink::open(&path, true).unwrap();
        sink.write_line("second");
        sink.flush().unwrap();
        drop(sink);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        let sink = FileSink::open(&path, false).unwrap();
        sink.write_line("third");
        sink.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "third\n");
    }

    #[test]
    fn test_concurrent_lines_are_not_torn() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.log");
        let sink = Arc::new(FileSink::open(&path, false).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        sink.write_line(&format!("device-{} line {} {}", t, i, "x".repeat(64)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 800);
        assert!(lines
            .iter()
            .all(|l| l.starts_with("device-") && l.ends_with(&"x".repeat(64))));
    }

    #[test]
    fn test_log_writer_falls_back_to_console_when_open_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no-such-dir").join("results.log");
        let writer = LogWriter::open(Some(&missing), false, false);
        assert!(writer.file.is_none());
        assert!(writer.console);
        writer.write_line("still recorded");
        writer.flush().unwrap();
    }

    #[test]
    fn test_log_writer_file_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.log");
        let writer = LogWriter::open(Some(&path), false, false);
        assert!(!writer.console);
        writer.write_line("[0]start:a->end:b = 1");
        writer.flush().unwrap();
        assert!(!writer.is_degraded());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[0]start:a->end:b = 1\n"
        );
    }

    #[test]
    fn test_log_writer_without_file_uses_console() {
        let writer = LogWriter::open(None, false, false);
        assert!(writer.console);
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.write_line("a");
        sink.write_line("b");
        assert_eq!(sink.lines(), vec!["a".to_string(), "b".to_string()]);
    }
}
