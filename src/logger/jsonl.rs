//! Activity log as line-delimited JSON.
//!
//! Every line is one complete JSON object, assembled in memory and appended
//! with a single `write_all` so a `tail -f` reader never sees a torn line.
//!
//! When the primary file cannot be written the writer degrades one step at a
//! time: fallback file, then stderr with an `[SLT-JSONL]` prefix, then silent
//! discard. Ingestion never stops because the activity log is unavailable.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TwinError};

/// Severity level for activity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Kinds of activity recorded by a twin session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionStop,
    LiveStoreCleared,
    BrokerConnected,
    BrokerError,
    ReadingDropped,
    StorageError,
    ObserverError,
    SelectionPublished,
    SelectionUnreadable,
    ActuatorCommand,
    Error,
}

/// One activity line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Pipeline that produced the event (`sensors`, `actuators`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Raw payload text for dropped readings and actuator commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// `live` or `history`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    /// `host:port` of the broker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<String>>,
    /// Row or message count (rows cleared, readings accepted, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create an entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
            severity,
            pipeline: None,
            topic: None,
            payload: None,
            value: None,
            store: None,
            broker: None,
            selection: None,
            count: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    /// Attach the code and message of a [`TwinError`].
    #[must_use]
    pub fn with_error(mut self, error: &TwinError) -> Self {
        self.ok = Some(false);
        self.error_code = Some(error.code().to_string());
        self.error_message = Some(error.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

/// Settings for [`JsonlWriter`].
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Second file to try when the primary cannot be opened or written.
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size. Default: 16 MiB.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`. Default: 3.
    pub max_rotated_files: u32,
    /// Seconds between forced `sync_data` calls. Default: 10.
    pub fsync_interval_secs: u64,
}

impl JsonlConfig {
    /// Settings for the given primary path, falling back to the temp dir.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: Some(std::env::temp_dir().join("smartlab-twin-activity.jsonl")),
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval_secs: 10,
        }
    }
}

/// Append-only JSONL writer with size rotation and a degradation chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<BufWriter<File>>,
    sink: Sink,
    bytes_written: u64,
    last_fsync: Instant,
}

impl JsonlWriter {
    /// Open the primary path, degrading as far as needed. Never fails.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            sink: Sink::Discard,
            bytes_written: 0,
            last_fsync: Instant::now(),
        };
        writer.open_sink(Sink::Primary);
        writer
    }

    /// Serialize and append one entry.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[SLT-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    /// Flush and `sync_data` the current file.
    pub fn fsync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
            let _ = file.get_ref().sync_data();
        }
        self.last_fsync = Instant::now();
    }

    /// Current sink: `normal`, `fallback`, `stderr` or `discard`.
    #[must_use]
    pub fn state(&self) -> &'static str {
        match self.sink {
            Sink::Primary => "normal",
            Sink::Fallback => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    /// Return to the primary path if it has become writable again.
    pub fn try_recover(&mut self) {
        if self.sink == Sink::Primary {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.file = Some(BufWriter::new(file));
            self.sink = Sink::Primary;
            self.bytes_written = size;
            let _ = writeln!(
                io::stderr(),
                "[SLT-JSONL] recovered to primary path: {}",
                self.config.path.display()
            );
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.file.is_some() && self.bytes_written + len > self.config.max_size_bytes {
            self.rotate();
        }

        match self.sink {
            Sink::Primary | Sink::Fallback => {
                let written = self
                    .file
                    .as_mut()
                    .is_some_and(|file| file.write_all(line.as_bytes()).is_ok());
                if written {
                    self.bytes_written += len;
                    if self.last_fsync.elapsed().as_secs() >= self.config.fsync_interval_secs {
                        self.fsync();
                    }
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            Sink::Stderr => {
                let _ = write!(io::stderr(), "[SLT-JSONL] {line}");
            }
            Sink::Discard => {}
        }
    }

    fn sink_path(&self, sink: Sink) -> Option<&Path> {
        match sink {
            Sink::Primary => Some(self.config.path.as_path()),
            Sink::Fallback => self.config.fallback_path.as_deref(),
            Sink::Stderr | Sink::Discard => None,
        }
    }

    /// Open `sink`, walking down the chain until something accepts writes.
    fn open_sink(&mut self, sink: Sink) {
        self.file = None;
        match sink {
            Sink::Primary | Sink::Fallback => {
                let opened = self.sink_path(sink).map(open_append);
                match opened {
                    Some(Ok((file, size))) => {
                        if sink == Sink::Fallback {
                            let _ = writeln!(
                                io::stderr(),
                                "[SLT-JSONL] primary path failed, using fallback: {}",
                                self.config
                                    .fallback_path
                                    .as_deref()
                                    .map(Path::display)
                                    .map(|d| d.to_string())
                                    .unwrap_or_default()
                            );
                        }
                        self.file = Some(BufWriter::new(file));
                        self.sink = sink;
                        self.bytes_written = size;
                    }
                    _ => self.open_sink(next_sink(sink)),
                }
            }
            Sink::Stderr => {
                let _ = writeln!(
                    io::stderr(),
                    "[SLT-JSONL] activity log files unavailable, using stderr"
                );
                self.sink = Sink::Stderr;
            }
            Sink::Discard => self.sink = Sink::Discard,
        }
    }

    fn degrade(&mut self) {
        self.open_sink(next_sink(self.sink));
    }

    fn rotate(&mut self) {
        self.flush();
        self.file = None;
        let Some(base) = self.sink_path(self.sink).map(Path::to_path_buf) else {
            return;
        };

        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for index in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, index), rotated_name(&base, index + 1));
        }
        if keep > 0 {
            let _ = fs::rename(&base, rotated_name(&base, 1));
        } else {
            let _ = fs::remove_file(&base);
        }

        match open_append(&base) {
            Ok((file, _)) => {
                self.file = Some(BufWriter::new(file));
                self.bytes_written = 0;
            }
            Err(_) => self.degrade(),
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

const fn next_sink(sink: Sink) -> Sink {
    match sink {
        Sink::Primary => Sink::Fallback,
        Sink::Fallback => Sink::Stderr,
        Sink::Stderr | Sink::Discard => Sink::Discard,
    }
}

/// Open or create `path` for appending, creating parent directories.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| TwinError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TwinError::io(path, source))?;
    let size = file.metadata().map_or(0, |m| m.len());
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.2`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
