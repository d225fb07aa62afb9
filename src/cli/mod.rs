//! Terminal front-ends of the `sltwin` binary.
#![allow(missing_docs)]

pub mod watch;
