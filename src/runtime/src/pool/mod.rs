//! Bounded worker pool for per-image registry work.
//!
//! Existence checks and copies are independent per image, so they run
//! through a [`WorkerPool`] that caps how many are in flight at once.

pub mod worker_pool;

pub use worker_pool::{WorkOutcome, WorkerPool};
