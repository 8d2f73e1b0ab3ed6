//! Infrastructure layer for the cirrus control plane.
//!
//! Concrete implementations of the domain ports: the Azure provider with
//! its rate-limited ARM gateway, the in-memory stores, and the
//! structured-log error reporter.

pub mod persistence;
pub mod providers;
pub mod reporting;
