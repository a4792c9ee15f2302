//! Process bootstrap: error reporting and telemetry.

pub mod error;
pub mod telemetry;
