//! Selection channel: the shared "current selection" file and its watchers.

pub mod channel;
pub mod watcher;
