//! Activity logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Pipelines, stores and the
//! selection channel hold a cloneable [`ActivityLoggerHandle`] and send
//! [`ActivityEvent`]s over a bounded crossbeam channel with `try_send`, so a
//! slow disk never stalls the MQTT receive loop.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, TwinError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for activity events.
const CHANNEL_CAPACITY: usize = 1024;

/// Raw payloads longer than this are cut before logging.
const MAX_LOGGED_PAYLOAD: usize = 256;

/// Everything a twin session reports to the activity log.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    SessionStarted {
        version: String,
        config_hash: String,
        broker: String,
    },
    SessionStopped {
        reason: String,
        uptime_secs: u64,
        readings_accepted: u64,
    },
    LiveStoreCleared {
        path: String,
        rows: u64,
    },
    BrokerConnected {
        pipeline: String,
        broker: String,
        topics: usize,
    },
    BrokerError {
        pipeline: String,
        broker: String,
        message: String,
        retry_in_ms: u64,
    },
    ReadingDropped {
        pipeline: String,
        topic: String,
        payload: String,
        reason: String,
    },
    StorageError {
        store: String,
        topic: Option<String>,
        code: String,
        message: String,
    },
    ObserverError {
        pipeline: String,
        observer: String,
        topic: String,
        message: String,
    },
    SelectionPublished {
        path: String,
        topics: Vec<String>,
    },
    SelectionUnreadable {
        path: String,
        message: String,
    },
    ActuatorCommand {
        topic: String,
        payload: String,
        ok: bool,
        message: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel asking the logger thread to flush and exit.
    Shutdown,
}

/// Cloneable, non-blocking sender for activity events.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Option<Sender<ActivityEvent>>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// A handle that discards everything. Used by one-shot CLI commands.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an event. Drops it and bumps the counter if the channel is full.
    pub fn send(&self, event: ActivityEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(TrySendError::Full(_)) = tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Number of events dropped due to channel back-pressure.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only while the queue is full.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ActivityEvent::Shutdown);
        }
    }
}

/// Options for the activity logger thread.
pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    /// Default capacity, writing to `path`.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            jsonl: JsonlConfig::for_path(path),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread.
///
/// The thread runs until [`ActivityLoggerHandle::shutdown`] is called or every
/// handle has been dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx: Some(tx),
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("slt-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped))
        .map_err(|e| TwinError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(jsonl);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.count = Some(lost);
            warn.details = Some(format!("{lost} activity events dropped due to back-pressure"));
            writer.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        writer.write_entry(&to_log_entry(event));
        if rx.is_empty() {
            writer.flush();
            writer.try_recover();
        }
    }

    writer.flush();
    writer.fsync();
}

fn to_log_entry(event: ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::SessionStarted {
            version,
            config_hash,
            broker,
        } => {
            let mut e = LogEntry::new(EventType::SessionStart, Severity::Info);
            e.broker = Some(broker);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::SessionStopped {
            reason,
            uptime_secs,
            readings_accepted,
        } => {
            let mut e = LogEntry::new(EventType::SessionStop, Severity::Info);
            e.count = Some(readings_accepted);
            e.duration_ms = Some(uptime_secs.saturating_mul(1000));
            e.details = Some(format!("reason={reason}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::LiveStoreCleared { path, rows } => {
            let mut e = LogEntry::new(EventType::LiveStoreCleared, Severity::Info);
            e.store = Some("live".to_string());
            e.count = Some(rows);
            e.details = Some(path);
            e.ok = Some(true);
            e
        }
        ActivityEvent::BrokerConnected {
            pipeline,
            broker,
            topics,
        } => {
            let mut e = LogEntry::new(EventType::BrokerConnected, Severity::Info);
            e.pipeline = Some(pipeline);
            e.broker = Some(broker);
            e.count = Some(topics as u64);
            e.ok = Some(true);
            e
        }
        ActivityEvent::BrokerError {
            pipeline,
            broker,
            message,
            retry_in_ms,
        } => {
            let mut e = LogEntry::new(EventType::BrokerError, Severity::Warning);
            e.pipeline = Some(pipeline);
            e.broker = Some(broker);
            e.ok = Some(false);
            e.error_code = Some("SLT-3001".to_string());
            e.error_message = Some(message);
            e.duration_ms = Some(retry_in_ms);
            e
        }
        ActivityEvent::ReadingDropped {
            pipeline,
            topic,
            payload,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::ReadingDropped, Severity::Warning);
            e.pipeline = Some(pipeline);
            e.topic = Some(topic);
            e.payload = Some(truncate_payload(payload));
            e.ok = Some(false);
            e.error_code = Some("SLT-2001".to_string());
            e.error_message = Some(reason);
            e
        }
        ActivityEvent::StorageError {
            store,
            topic,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::StorageError, Severity::Warning);
            e.store = Some(store);
            e.topic = topic;
            e.ok = Some(false);
            e.error_code = Some(code);
            e.error_message = Some(message);
            e
        }
        ActivityEvent::ObserverError {
            pipeline,
            observer,
            topic,
            message,
        } => {
            let mut e = LogEntry::new(EventType::ObserverError, Severity::Warning);
            e.pipeline = Some(pipeline);
            e.topic = Some(topic);
            e.ok = Some(false);
            e.error_code = Some("SLT-3004".to_string());
            e.error_message = Some(message);
            e.details = Some(format!("observer={observer}"));
            e
        }
        ActivityEvent::SelectionPublished { path, topics } => {
            let mut e = LogEntry::new(EventType::SelectionPublished, Severity::Info);
            e.count = Some(topics.len() as u64);
            e.selection = Some(topics);
            e.details = Some(path);
            e.ok = Some(true);
            e
        }
        ActivityEvent::SelectionUnreadable { path, message } => {
            let mut e = LogEntry::new(EventType::SelectionUnreadable, Severity::Warning);
            e.details = Some(path);
            e.ok = Some(false);
            e.error_message = Some(message);
            e
        }
        ActivityEvent::ActuatorCommand {
            topic,
            payload,
            ok,
            message,
        } => {
            let severity = if ok { Severity::Info } else { Severity::Warning };
            let mut e = LogEntry::new(EventType::ActuatorCommand, severity);
            e.topic = Some(topic);
            e.payload = Some(truncate_payload(payload));
            e.ok = Some(ok);
            e.error_message = message;
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code);
            e.error_message = Some(message);
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::SessionStop, Severity::Info),
    }
}

fn truncate_payload(mut payload: String) -> String {
    if payload.len() > MAX_LOGGED_PAYLOAD {
        let mut cut = MAX_LOGGED_PAYLOAD;
        while !payload.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.truncate(cut);
        payload.push('…');
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl: JsonlConfig {
                path: dir.join("activity.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: 64,
        }
    }

    fn read_events(dir: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(dir.join("activity.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        handle.send(ActivityEvent::SessionStarted {
            version: "0.3.1".to_string(),
            config_hash: "abc".to_string(),
            broker: "localhost:1883".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let events = read_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "session_start");
        assert_eq!(events[0]["broker"], "localhost:1883");
    }

    #[test]
    fn handles_from_several_threads_share_one_log() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        let other = handle.clone();

        let sender = thread::spawn(move || {
            other.send(ActivityEvent::ReadingDropped {
                pipeline: "sensors".to_string(),
                topic: "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>".to_string(),
                payload: "not-a-number".to_string(),
                reason: "invalid float literal".to_string(),
            });
        });
        sender.join().unwrap();
        handle.send(ActivityEvent::SelectionPublished {
            path: "/tmp/shared_topic.json".to_string(),
            topics: vec!["T1".to_string(), "T2".to_string()],
        });
        handle.shutdown();
        join.join().unwrap();

        let events = read_events(dir.path());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "reading_dropped");
        assert_eq!(events[0]["error_code"], "SLT-2001");
        assert_eq!(events[1]["selection"], serde_json::json!(["T1", "T2"]));
    }

    #[test]
    fn long_payloads_are_truncated() {
        let long = "9".repeat(1000);
        let cut = truncate_payload(long);
        assert!(cut.len() < 300);
        assert!(cut.ends_with('…'));
        assert_eq!(truncate_payload("23.5".to_string()), "23.5");
    }

    #[test]
    fn disabled_handle_discards_silently() {
        let handle = ActivityLoggerHandle::disabled();
        handle.send(ActivityEvent::Error {
            code: "SLT-3900".to_string(),
            message: "ignored".to_string(),
        });
        handle.shutdown();
        assert_eq!(handle.dropped_events(), 0);
    }

    #[test]
    fn full_channel_counts_drops() {
        let (tx, _rx) = bounded::<ActivityEvent>(1);
        let handle = ActivityLoggerHandle {
            tx: Some(tx),
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..3 {
            handle.send(ActivityEvent::Error {
                code: "SLT-3900".to_string(),
                message: "burst".to_string(),
            });
        }
        assert_eq!(handle.dropped_events(), 2);
    }
}
