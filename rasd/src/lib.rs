//! Host runtime for the Ranging Service.
//!
//! Everything the protocol crate deliberately leaves out lives here:
//!
//! - [`config`]: serde-backed configuration with a TOML loader and a
//!   validation pass that reports every problem at once.
//! - [`telemetry`]: fire-and-forget metrics events over a channel to a
//!   dedicated aggregator thread.
//! - [`runtime`]: the per-process registry mapping connections to RRSP
//!   contexts and the deferred work-queue pump that drives them.

#![forbid(unsafe_code)]

pub mod config;
pub mod runtime;
pub mod telemetry;

pub use config::{load_config, RasConfig};
pub use runtime::{RasHost, WorkScheduler};
