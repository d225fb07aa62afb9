#![forbid(unsafe_code)]

//! SmartLab twin (sltwin) — sensor ingestion core of the smart apartment
//! digital twin.
//!
//! 1. **Ingestion** — MQTT receive loops decode sensor and actuator payloads
//!    into [`Reading`](ingest::reading::Reading)s and hand them to observers
//! 2. **Persistence** — every reading is written to a live store (cleared per
//!    session) and a history store (kept)
//! 3. **Selection channel** — the operator's current topic selection is shared
//!    with visualizers through an atomically replaced JSON file
//!
//! # Library usage
//!
//! ```rust,no_run
//! use smartlab_twin::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use smartlab_twin::core::config::Config;
//! use smartlab_twin::selection::channel::SelectionChannel;
//! ```

pub mod prelude;

#[cfg(feature = "cli")]
pub mod cli;
pub mod core;
pub mod daemon;
pub mod ingest;
pub mod logger;
pub mod registry;
pub mod selection;
#[cfg(feature = "sqlite")]
pub mod store;
