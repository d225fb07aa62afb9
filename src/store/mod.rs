//! SQLite persistence: one reading store, the live + history pair, CSV export.

pub mod dual;
pub mod export;
pub mod sqlite;
