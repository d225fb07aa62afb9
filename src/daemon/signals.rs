//! SIGINT/SIGTERM handling and ordered shutdown.
//!
//! Signals only raise a flag; the session loop and the watch loop poll it
//! between iterations, so cancellation latency is bounded by their poll
//! interval.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Shutdown flag raised by SIGINT/SIGTERM or programmatically.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create the flag and register it for SIGINT and SIGTERM.
    ///
    /// Registration is best-effort: a failure is logged and Ctrl-C simply
    /// terminates the process the default way.
    #[must_use]
    pub fn new() -> Self {
        let handler = Self::unregistered();
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            if let Err(e) =
                signal_hook::flag::register(signal, Arc::clone(&handler.shutdown_flag))
            {
                eprintln!("[SLT-SIGNAL] failed to register {name}: {e}");
            }
        }
        handler
    }

    /// A flag no OS signal is wired to. For tests and embedding.
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    /// The raw flag, for loops that take `&AtomicBool`.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// A named shutdown step. Returns `true` when it completed cleanly.
pub type ShutdownTask<'a> = (&'a str, Box<dyn FnOnce() -> bool + 'a>);

/// Runs shutdown steps in order within an overall time budget.
pub struct ShutdownCoordinator {
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator with a 10-second budget.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }

    /// Run `tasks` in order. Returns `true` if every task succeeded in time;
    /// tasks left once the budget is spent are skipped.
    pub fn execute(&self, tasks: Vec<ShutdownTask<'_>>) -> bool {
        let start = Instant::now();
        let mut all_ok = true;

        for (name, task) in tasks {
            if start.elapsed() > self.timeout {
                eprintln!("[SLT-SHUTDOWN] timeout reached, skipping {name}");
                all_ok = false;
                continue;
            }
            if task() {
                eprintln!("[SLT-SHUTDOWN] {name}: ok");
            } else {
                eprintln!("[SLT-SHUTDOWN] {name}: failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
