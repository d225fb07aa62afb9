//! Poll-and-compare consumer side of the selection channel.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::ingest::backoff::sleep_unless_stopped;
use crate::selection::channel::SelectionChannel;

/// Default poll interval for consumers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Detects selection changes by comparing each read with the last one seen.
pub struct SelectionWatcher {
    channel: SelectionChannel,
    last_seen: Option<Vec<String>>,
}

impl SelectionWatcher {
    #[must_use]
    pub fn new(channel: SelectionChannel) -> Self {
        Self {
            channel,
            last_seen: None,
        }
    }

    #[must_use]
    pub const fn channel(&self) -> &SelectionChannel {
        &self.channel
    }

    /// Last selection reported as a change.
    #[must_use]
    pub fn last_seen(&self) -> Option<&[String]> {
        self.last_seen.as_deref()
    }

    /// Read once. Returns the selection when it differs from the last one
    /// seen; the first poll always reports.
    pub fn poll(&mut self) -> Option<Vec<String>> {
        let current = self.channel.read_selection();
        if self.last_seen.as_ref() == Some(&current) {
            return None;
        }
        self.last_seen = Some(current.clone());
        Some(current)
    }

    /// Poll every `interval` until `stop` is raised, calling `on_change` for
    /// each change. Returns the number of changes delivered.
    pub fn run_until<F>(&mut self, interval: Duration, stop: &AtomicBool, mut on_change: F) -> u64
    where
        F: FnMut(&[String]),
    {
        let mut changes = 0;
        while !stop.load(Ordering::SeqCst) {
            if let Some(selection) = self.poll() {
                changes += 1;
                on_change(&selection);
            }
            if !sleep_unless_stopped(interval, stop) {
                break;
            }
        }
        changes
    }
}
