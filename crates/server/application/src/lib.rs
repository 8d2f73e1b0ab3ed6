//! Application layer for the cirrus control plane.
//!
//! The two long-running loops (provisioning and scanning) and the default
//! capacity estimation live here, written against the domain ports only.

pub mod workers;

pub use workers::estimator::{DemandSource, SimpleEstimator, StaticDemand};
pub use workers::provisioning::{ProvisioningConfig, ProvisioningService};
pub use workers::scanner::{ScannerConfig, WorkerScanner};
