// Cirrus control plane - Domain Layer
//
// Bounded contexts:
// - shared_kernel: base ids, worker-id validation, shared errors
// - workers: Worker/WorkerPool aggregates, provider port, store ports
// - reporting: pool-scoped error notification port

pub mod reporting;
pub mod shared_kernel;
pub mod workers;

pub use reporting::*;
pub use shared_kernel::*;
pub use workers::*;
