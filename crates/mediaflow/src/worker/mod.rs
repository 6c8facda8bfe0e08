//! Worker pool draining the durable dispatch queue.

pub mod pool;

pub use pool::{DeliveryResult, WorkerPool, WorkerSettings};
