//! Runtime bootstrap: logging, metric descriptions and process-level errors.

pub mod error;
pub mod telemetry;
