pub mod memory;

pub use memory::{InMemoryWorkerPoolStore, InMemoryWorkerStore};
