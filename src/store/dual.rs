//! Live + history dual write.
//!
//! Each reading goes to the live store first, then to the history store. The
//! two writes are independent: a store that failed to open, or a write that
//! fails, is logged and counted while the other store carries on. Partial
//! success is the normal degraded mode, never an error for the caller.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::core::errors::{Result, TwinError};
use crate::ingest::reading::Reading;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::store::sqlite::ReadingStore;

/// Which of the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    Live,
    History,
}

impl StoreRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::History => "history",
        }
    }
}

/// Result of one store's part of a dual write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Written,
    /// The store never opened.
    Unavailable,
    /// The insert failed; carries the error code.
    Failed(&'static str),
}

impl StoreWrite {
    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Per-store outcome of [`DualStore::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub live: StoreWrite,
    pub history: StoreWrite,
}

impl WriteOutcome {
    /// At least one store accepted the reading.
    #[must_use]
    pub const fn any_written(&self) -> bool {
        self.live.is_written() || self.history.is_written()
    }
}

/// Counters shared between a [`DualStore`] and whoever reports on it.
#[derive(Debug, Default)]
pub struct StoreCounters {
    live_written: AtomicU64,
    live_failed: AtomicU64,
    history_written: AtomicU64,
    history_failed: AtomicU64,
}

/// Point-in-time copy of [`StoreCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCountersSnapshot {
    pub live_written: u64,
    pub live_failed: u64,
    pub history_written: u64,
    pub history_failed: u64,
}

impl StoreCounters {
    #[must_use]
    pub fn snapshot(&self) -> StoreCountersSnapshot {
        StoreCountersSnapshot {
            live_written: self.live_written.load(Ordering::Relaxed),
            live_failed: self.live_failed.load(Ordering::Relaxed),
            history_written: self.history_written.load(Ordering::Relaxed),
            history_failed: self.history_failed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, role: StoreRole, outcome: &StoreWrite) {
        let counter = match (role, outcome.is_written()) {
            (StoreRole::Live, true) => &self.live_written,
            (StoreRole::Live, false) => &self.live_failed,
            (StoreRole::History, true) => &self.history_written,
            (StoreRole::History, false) => &self.history_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The live and history stores of one writer.
pub struct DualStore {
    live: Option<ReadingStore>,
    history: Option<ReadingStore>,
    logger: ActivityLoggerHandle,
    counters: Arc<StoreCounters>,
}

impl DualStore {
    /// Open both stores and ensure their schema. Never fails: a store that
    /// cannot be opened is logged and left out.
    #[must_use]
    pub fn open(live_path: &Path, history_path: &Path, logger: ActivityLoggerHandle) -> Self {
        let live = open_role(StoreRole::Live, live_path, &logger);
        let history = open_role(StoreRole::History, history_path, &logger);
        Self::from_stores(live, history, logger)
    }

    /// Wrap already-open stores.
    #[must_use]
    pub fn from_stores(
        live: Option<ReadingStore>,
        history: Option<ReadingStore>,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            live,
            history,
            logger,
            counters: Arc::new(StoreCounters::default()),
        }
    }

    #[must_use]
    pub fn live(&self) -> Option<&ReadingStore> {
        self.live.as_ref()
    }

    #[must_use]
    pub fn history(&self) -> Option<&ReadingStore> {
        self.history.as_ref()
    }

    /// Shared counters; stays valid after the store moves into an observer.
    #[must_use]
    pub fn counters(&self) -> Arc<StoreCounters> {
        Arc::clone(&self.counters)
    }

    /// Delete every live row. History is never cleared.
    pub fn clear_live(&self) -> Result<u64> {
        let store = self.live.as_ref().ok_or_else(|| TwinError::StoreUnavailable {
            store: StoreRole::Live.as_str().to_string(),
        })?;
        let rows = store.clear()?;
        self.logger.send(ActivityEvent::LiveStoreCleared {
            path: store.path().display().to_string(),
            rows,
        });
        Ok(rows)
    }

    /// Write `reading` to live, then history.
    pub fn write(&self, reading: &Reading) -> WriteOutcome {
        WriteOutcome {
            live: self.write_one(StoreRole::Live, self.live.as_ref(), reading),
            history: self.write_one(StoreRole::History, self.history.as_ref(), reading),
        }
    }

    fn write_one(
        &self,
        role: StoreRole,
        store: Option<&ReadingStore>,
        reading: &Reading,
    ) -> StoreWrite {
        let outcome = match store {
            None => StoreWrite::Unavailable,
            Some(store) => match store.write(reading) {
                Ok(()) => StoreWrite::Written,
                Err(err) => {
                    eprintln!(
                        "[SLT-STORE] {} write failed for {}: {err}",
                        role.as_str(),
                        reading.topic
                    );
                    self.logger.send(ActivityEvent::StorageError {
                        store: role.as_str().to_string(),
                        topic: Some(reading.topic.clone()),
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                    StoreWrite::Failed(err.code())
                }
            },
        };
        self.counters.record(role, &outcome);
        outcome
    }
}

fn open_role(role: StoreRole, path: &Path, logger: &ActivityLoggerHandle) -> Option<ReadingStore> {
    match ReadingStore::open_with_schema(path) {
        Ok(store) => Some(store),
        Err(err) => {
            eprintln!(
                "[SLT-STORE] failed to open {} store at {}: {err}",
                role.as_str(),
                path.display()
            );
            logger.send(ActivityEvent::StorageError {
                store: role.as_str().to_string(),
                topic: None,
                code: err.code().to_string(),
                message: err.to_string(),
            });
            None
        }
    }
}
