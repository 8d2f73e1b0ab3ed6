//! Azure worker provider.
//!
//! One worker is a VM plus its public IP, NIC, and managed disks. The
//! provider drives each worker through a provisioning pipeline
//! (ip → nic → vm → disks), classifies live VMs on every scan pass, and
//! tears everything down in reverse order when the worker is no longer
//! wanted. Every cloud call goes through the rate-limited gateway; every
//! observable step is persisted before the next call that depends on it.

pub mod attestation;
pub mod client;
pub mod gateway;
pub mod names;
pub mod provider;
pub mod steps;

pub use attestation::{AttestationError, AttestationVerifier, AttestedPayload};
pub use client::{ArmClient, ArmResource, AzureApi, CloudError, CreateStarted, ResourceKind};
pub use gateway::{BucketKind, CloudGateway};
pub use provider::{AzureProvider, AzureProviderBuilder};
