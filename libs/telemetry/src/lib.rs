//! Logging and metric helpers shared by hookgram binaries and libraries.
//!
//! Every process calls [`init_telemetry`] once at startup; libraries only use
//! `tracing` macros and the counter helpers exported here.

mod config;
mod labels;
mod metrics;
mod tracing_init;

pub use config::{TelemetryConfig, TelemetryProtocol};
pub use labels::TelemetryLabels;
pub use metrics::{record_counter, record_histogram};
pub use tracing_init::{delivery_span, init_telemetry, telemetry_enabled};
