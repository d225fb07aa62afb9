//! Ingestion: payload decoding, observer dispatch, MQTT receive loops, actuator commands.

pub mod actuator;
pub mod backoff;
pub mod dispatch;
pub mod pipeline;
pub mod reading;
