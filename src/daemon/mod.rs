//! Session lifecycle: the long-running `run` loop and signal handling.

#[cfg(all(feature = "daemon", feature = "sqlite"))]
pub mod session;
#[cfg(feature = "daemon")]
pub mod signals;
