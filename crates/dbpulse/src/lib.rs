//! dbpulse - Database Health Monitor
#![forbid(unsafe_code)]
//!
//! This crate wires the metric engine, the cache-aside layer and the
//! ingestion pipeline into one service:
//!
//! - **Configuration**: TOML file with per-section defaults
//! - **Service**: provider → cache → producer for every request
//! - **Scheduler**: samples every family at a fixed interval
//! - **Pipeline**: assembles and runs all of the above plus the consumer

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod service;

pub use config::PulseConfig;
pub use error::{PulseError, Result};
pub use pipeline::{Pipeline, ShutdownReport};
pub use scheduler::{SamplerHandle, start_sampling_task};
pub use service::{MonitorService, ServiceStats, build_providers};
