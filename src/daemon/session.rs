//! Twin session: the `sltwin run` lifecycle.
//!
//! `init` prepares everything that does not need the broker (logger, topic
//! registries, schema, cleared live store), `start_pipelines` brings up one
//! receive loop per topic family, `run` waits for a shutdown signal, and
//! `shutdown` stops the loops and flushes the activity log in order.

#![allow(missing_docs)]

use std::cell::RefCell;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{Result, TwinError};
use crate::daemon::signals::{ShutdownCoordinator, ShutdownTask, SignalHandler};
use crate::ingest::backoff::sleep_unless_stopped;
use crate::ingest::dispatch::{Dispatcher, PipelineStats};
use crate::ingest::pipeline::{BrokerEndpoint, IngestionPipeline, PipelineHandle};
use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use crate::registry::topics::TopicRegistry;
use crate::store::dual::DualStore;

/// How often the idle loop reports pipeline counters on stderr.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Pipeline names, also used for thread and client-id suffixes.
pub const SENSOR_PIPELINE: &str = "sensors";
pub const ACTUATOR_PIPELINE: &str = "actuators";

/// What a finished session reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub uptime_secs: u64,
    pub live_rows_cleared: u64,
    pub readings_accepted: u64,
    pub pipelines: Vec<PipelineReport>,
    pub clean: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub name: String,
    #[serde(flatten)]
    pub stats: PipelineStats,
}

pub struct TwinSession {
    config: Config,
    broker: BrokerEndpoint,
    sensors: TopicRegistry,
    actuators: TopicRegistry,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    signal_handler: SignalHandler,
    pipelines: Vec<PipelineHandle>,
    start_time: Instant,
    live_rows_cleared: u64,
    finished: Option<SessionSummary>,
}

impl TwinSession {
    /// Build the session from configuration.
    ///
    /// Ensures both schemas and clears the live store. A store that cannot be
    /// opened or cleared is logged and the session carries on with the other.
    pub fn init(config: Config, signal_handler: SignalHandler) -> Result<Self> {
        let start_time = Instant::now();

        // 1. Activity logger.
        let (logger_handle, logger_join) =
            spawn_logger(ActivityLoggerConfig::for_path(&config.paths.activity_log))?;

        // 2. Topic registries.
        let sensors = TopicRegistry::sensors_from_config(&config.topics)?;
        let actuators = TopicRegistry::actuators_from_config(&config.topics)?;

        // 3. Schemas + fresh live store.
        let stores = DualStore::open(
            &config.paths.live_db,
            &config.paths.history_db,
            logger_handle.clone(),
        );
        let live_rows_cleared = match stores.clear_live() {
            Ok(rows) => {
                eprintln!("[SLT-SESSION] live store cleared ({rows} rows)");
                rows
            }
            Err(err) => {
                eprintln!("[SLT-SESSION] could not clear live store: {err}");
                logger_handle.send(ActivityEvent::Error {
                    code: err.code().to_string(),
                    message: format!("live store not cleared: {err}"),
                });
                0
            }
        };
        drop(stores);

        let broker = BrokerEndpoint::from_config(&config.broker);
        logger_handle.send(ActivityEvent::SessionStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: config.stable_hash().unwrap_or_default(),
            broker: broker.label(),
        });

        Ok(Self {
            config,
            broker,
            sensors,
            actuators,
            logger_handle,
            logger_join: Some(logger_join),
            signal_handler,
            pipelines: Vec::new(),
            start_time,
            live_rows_cleared,
            finished: None,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn sensors(&self) -> &TopicRegistry {
        &self.sensors
    }

    #[must_use]
    pub const fn actuators(&self) -> &TopicRegistry {
        &self.actuators
    }

    #[must_use]
    pub fn logger(&self) -> ActivityLoggerHandle {
        self.logger_handle.clone()
    }

    #[must_use]
    pub const fn live_rows_cleared(&self) -> u64 {
        self.live_rows_cleared
    }

    /// A dispatcher whose only observer writes to both stores.
    ///
    /// Every pipeline gets its own pair of connections.
    #[must_use]
    pub fn store_dispatcher(&self, pipeline: &str) -> Dispatcher {
        let stores = DualStore::open(
            &self.config.paths.live_db,
            &self.config.paths.history_db,
            self.logger_handle.clone(),
        );
        Dispatcher::new(pipeline, self.logger_handle.clone()).with_observer(
            "dual-store",
            move |reading| {
                if stores.write(reading).any_written() {
                    Ok(())
                } else {
                    Err(TwinError::StoreUnavailable {
                        store: "live+history".to_string(),
                    })
                }
            },
        )
    }

    /// Start the sensor and actuator receive loops.
    ///
    /// Families with no configured topics are skipped.
    pub fn start_pipelines(&mut self) -> Result<()> {
        let families = [
            (SENSOR_PIPELINE, self.sensors.topics().to_vec()),
            (ACTUATOR_PIPELINE, self.actuators.topics().to_vec()),
        ];
        for (name, topics) in families {
            if topics.is_empty() {
                eprintln!("[SLT-SESSION] no {name} topics configured, pipeline not started");
                continue;
            }
            let dispatcher = self.store_dispatcher(name);
            let handle =
                IngestionPipeline::start(&self.broker, topics, dispatcher, self.logger())?;
            self.pipelines.push(handle);
        }
        Ok(())
    }

    /// Counters of every running pipeline.
    #[must_use]
    pub fn pipeline_reports(&self) -> Vec<PipelineReport> {
        self.pipelines
            .iter()
            .map(|p| PipelineReport {
                name: p.name().to_string(),
                stats: p.stats(),
            })
            .collect()
    }

    /// Start the pipelines and block until shutdown is requested.
    pub fn run(&mut self) -> Result<SessionSummary> {
        eprintln!(
            "[SLT-SESSION] starting: broker={} sensors={} actuators={}",
            self.broker.label(),
            self.sensors.topics().len(),
            self.actuators.topics().len()
        );
        self.start_pipelines()?;

        let flag = self.signal_handler.flag();
        while sleep_unless_stopped(STATUS_INTERVAL, &flag) {
            for report in self.pipeline_reports() {
                let s = report.stats;
                eprintln!(
                    "[SLT-SESSION] {}: received={} accepted={} dropped={} observer_failures={} reconnects={}",
                    report.name,
                    s.received,
                    s.accepted,
                    s.decode_errors,
                    s.observer_failures,
                    s.reconnects
                );
            }
        }
        eprintln!("[SLT-SESSION] shutdown requested");

        Ok(self.shutdown("signal"))
    }

    /// Stop pipelines, log the session end and flush the activity log.
    /// Idempotent: later calls return the first summary.
    pub fn shutdown(&mut self, reason: &str) -> SessionSummary {
        if let Some(summary) = &self.finished {
            return summary.clone();
        }
        let uptime_secs = self.start_time.elapsed().as_secs();
        let pipelines = std::mem::take(&mut self.pipelines);
        let labels: Vec<String> = pipelines
            .iter()
            .map(|p| format!("stop {} pipeline", p.name()))
            .collect();
        let reports = RefCell::new(Vec::with_capacity(pipelines.len()));
        let logger = self.logger_handle.clone();
        let logger_join = self.logger_join.take();

        let mut tasks: Vec<ShutdownTask<'_>> = Vec::new();
        for (label, mut pipeline) in labels.iter().zip(pipelines) {
            let reports = &reports;
            tasks.push((
                label.as_str(),
                Box::new(move || {
                    let stats = pipeline.stop();
                    reports.borrow_mut().push(PipelineReport {
                        name: pipeline.name().to_string(),
                        stats,
                    });
                    true
                }),
            ));
        }
        tasks.push((
            "flush activity log",
            Box::new(|| {
                let accepted = reports.borrow().iter().map(|r| r.stats.accepted).sum();
                logger.send(ActivityEvent::SessionStopped {
                    reason: reason.to_string(),
                    uptime_secs,
                    readings_accepted: accepted,
                });
                logger.shutdown();
                logger_join.is_none_or(|join| join.join().is_ok())
            }),
        ));

        let clean = ShutdownCoordinator::new().execute(tasks);
        let pipelines = reports.into_inner();
        let summary = SessionSummary {
            uptime_secs,
            live_rows_cleared: self.live_rows_cleared,
            readings_accepted: pipelines.iter().map(|r| r.stats.accepted).sum(),
            pipelines,
            clean,
        };
        eprintln!("[SLT-SESSION] shutdown complete (uptime={uptime_secs}s)");
        self.finished = Some(summary.clone());
        summary
    }
}

impl Drop for TwinSession {
    fn drop(&mut self) {
        if self.finished.is_none() {
            let _ = self.shutdown("dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::ReadingStore;
    use crate::store::sqlite::tests::reading;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.paths.live_db = dir.join("live.sqlite3");
        config.paths.history_db = dir.join("history.sqlite3");
        config.paths.selection_file = dir.join("shared_topic.json");
        config.paths.activity_log = dir.join("activity.jsonl");
        config.broker.host = "127.0.0.1".to_string();
        config.broker.port = 1;
        config
    }

    #[test]
    fn init_clears_live_but_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        for path in [&config.paths.live_db, &config.paths.history_db] {
            let store = ReadingStore::open_with_schema(path).unwrap();
            store.write(&reading("T1", 0, 1.0)).unwrap();
            store.write(&reading("T1", 1, 2.0)).unwrap();
        }

        let mut session = TwinSession::init(config.clone(), SignalHandler::unregistered()).unwrap();
        assert_eq!(session.live_rows_cleared(), 2);
        let summary = session.shutdown("test");
        assert!(summary.clean);
        assert!(summary.pipelines.is_empty());

        let live = ReadingStore::open(&config.paths.live_db).unwrap();
        let history = ReadingStore::open(&config.paths.history_db).unwrap();
        assert_eq!(live.count().unwrap(), 0);
        assert_eq!(history.count().unwrap(), 2);
    }

    #[test]
    fn store_dispatcher_writes_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut session = TwinSession::init(config.clone(), SignalHandler::unregistered()).unwrap();

        let mut dispatcher = session.store_dispatcher(SENSOR_PIPELINE);
        assert_eq!(dispatcher.observer_count(), 1);
        assert!(dispatcher.handle_message("T1", b"23.5").is_some());
        drop(dispatcher);
        session.shutdown("test");

        let live = ReadingStore::open(&config.paths.live_db).unwrap();
        let history = ReadingStore::open(&config.paths.history_db).unwrap();
        assert_eq!(live.read_by_topic("T1").unwrap()[0].value, 23.5);
        assert_eq!(history.read_by_topic("T1").unwrap()[0].value, 23.5);
    }

    #[test]
    fn shutdown_is_idempotent_and_logs_session_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut session = TwinSession::init(config.clone(), SignalHandler::unregistered()).unwrap();
        let first = session.shutdown("test");
        let second = session.shutdown("again");
        assert_eq!(first.uptime_secs, second.uptime_secs);

        let log = std::fs::read_to_string(&config.paths.activity_log).unwrap();
        assert!(log.contains("\"session_start\""));
        assert!(log.contains("\"session_stop\""));
        assert_eq!(log.matches("\"session_stop\"").count(), 1);
    }

    #[test]
    fn started_pipelines_stop_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            TwinSession::init(config_in(dir.path()), SignalHandler::unregistered()).unwrap();
        session.start_pipelines().unwrap();
        let names: Vec<String> = session
            .pipeline_reports()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec![SENSOR_PIPELINE.to_string(), ACTUATOR_PIPELINE.to_string()]);

        let summary = session.shutdown("test");
        assert_eq!(summary.pipelines.len(), 2);
        assert_eq!(summary.readings_accepted, 0);
    }
}
