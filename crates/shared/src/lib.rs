//! Shared types for the cirrus platform.
//!
//! Everything the server crates and external tooling agree on lives here:
//! the worker lifecycle states and the configuration loading machinery.
//! This crate stays free of async and infrastructure dependencies.

pub mod config;
pub mod states;

pub use config::{ApiRateLimits, AzureSettings, ConfigError, ConfigLoader, ServerSettings};
pub use states::WorkerState;
