//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use smartlab_twin::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, SelectionMode};
pub use crate::core::errors::{Result, TwinError};

// Registry
pub use crate::registry::status::{Status, classify};
pub use crate::registry::topics::{ALL_CHOICE, TopicGroup, TopicRegistry, topic_label};

// Ingestion
pub use crate::ingest::actuator::{peek_payload, publish_command};
pub use crate::ingest::dispatch::{Dispatcher, PipelineStats};
pub use crate::ingest::pipeline::{BrokerEndpoint, IngestionPipeline, PipelineHandle};
pub use crate::ingest::reading::Reading;

// Persistence
#[cfg(feature = "sqlite")]
pub use crate::store::dual::{DualStore, WriteOutcome};
#[cfg(feature = "sqlite")]
pub use crate::store::export::export_all_to_flat_file;
#[cfg(feature = "sqlite")]
pub use crate::store::sqlite::ReadingStore;

// Selection
pub use crate::selection::channel::SelectionChannel;
pub use crate::selection::watcher::SelectionWatcher;

// Logging
pub use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};

// Session
#[cfg(all(feature = "daemon", feature = "sqlite"))]
pub use crate::daemon::session::TwinSession;
#[cfg(feature = "daemon")]
pub use crate::daemon::signals::SignalHandler;
