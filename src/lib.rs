pub mod config;
pub mod error;
pub mod event;
pub mod inflight;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod slowhttp;
pub mod stats;
pub mod telemetry;
pub mod timer;
