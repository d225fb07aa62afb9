//! Observer fan-out for decoded readings.
//!
//! The dispatcher is the broker-independent half of an ingestion pipeline:
//! it takes raw `(topic, payload)` pairs, decodes them, and hands each
//! accepted [`Reading`] to every registered observer in registration order.
//! A failing or panicking observer is logged and skipped; the next observer
//! still runs and the dispatcher keeps going.

#![allow(missing_docs)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;

use crate::core::errors::{Result, TwinError};
use crate::ingest::reading::{Reading, decode, payload_text};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Callback receiving every accepted reading.
pub type ObserverFn = Box<dyn FnMut(&Reading) -> Result<()> + Send>;

struct Observer {
    name: String,
    callback: ObserverFn,
}

/// Live counters of one pipeline, shared with its handle.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    received: AtomicU64,
    accepted: AtomicU64,
    decode_errors: AtomicU64,
    observer_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub accepted: u64,
    pub decode_errors: u64,
    pub observer_failures: u64,
    pub reconnects: u64,
}

impl PipelineCounters {
    #[must_use]
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            observer_failures: self.observer_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decode-and-notify stage of a pipeline.
pub struct Dispatcher {
    pipeline: String,
    observers: Vec<Observer>,
    counters: Arc<PipelineCounters>,
    logger: ActivityLoggerHandle,
}

impl Dispatcher {
    #[must_use]
    pub fn new(pipeline: impl Into<String>, logger: ActivityLoggerHandle) -> Self {
        Self {
            pipeline: pipeline.into(),
            observers: Vec::new(),
            counters: Arc::new(PipelineCounters::default()),
            logger,
        }
    }

    /// Register an observer. Observers run in the order they were added.
    pub fn add_observer<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: FnMut(&Reading) -> Result<()> + Send + 'static,
    {
        self.observers.push(Observer {
            name: name.into(),
            callback: Box::new(callback),
        });
    }

    /// Builder form of [`Dispatcher::add_observer`].
    #[must_use]
    pub fn with_observer<F>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: FnMut(&Reading) -> Result<()> + Send + 'static,
    {
        self.add_observer(name, callback);
        self
    }

    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Handle a message received now.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Option<Reading> {
        self.handle_message_at(topic, payload, Local::now().naive_local())
    }

    /// Handle a message received at `received_at`.
    ///
    /// Returns the reading when the payload decoded, `None` when it was dropped.
    pub fn handle_message_at(
        &mut self,
        topic: &str,
        payload: &[u8],
        received_at: NaiveDateTime,
    ) -> Option<Reading> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match decode(topic, payload, received_at) {
            Ok(reading) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                self.notify(&reading);
                Some(reading)
            }
            Err(err) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                let payload = payload_text(payload);
                eprintln!(
                    "[SLT-INGEST] {}: dropped non-numeric payload {payload:?} on {topic}",
                    self.pipeline
                );
                self.logger.send(ActivityEvent::ReadingDropped {
                    pipeline: self.pipeline.clone(),
                    topic: topic.to_string(),
                    payload,
                    reason: err.to_string(),
                });
                None
            }
        }
    }

    /// Hand `reading` to every observer, isolating failures.
    pub fn notify(&mut self, reading: &Reading) {
        for observer in &mut self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (observer.callback)(reading)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(panic) => TwinError::Observer {
                    observer: observer.name.clone(),
                    details: format!("panicked: {}", panic_message(panic.as_ref())),
                },
            };
            self.counters
                .observer_failures
                .fetch_add(1, Ordering::Relaxed);
            eprintln!(
                "[SLT-INGEST] {}: observer {} failed on {}: {failure}",
                self.pipeline, observer.name, reading.topic
            );
            self.logger.send(ActivityEvent::ObserverError {
                pipeline: self.pipeline.clone(),
                observer: observer.name.clone(),
                topic: reading.topic.clone(),
                message: failure.to_string(),
            });
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
