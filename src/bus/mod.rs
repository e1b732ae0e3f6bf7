//! Asynchronous job delivery on top of the store's job table.
//!
//! Producers commit jobs in the same transaction as the state that caused
//! them. Workers lease jobs, run a [`JobHandler`], and record the returned
//! [`JobOutcome`]: success, deferral without penalty, retry with exponential
//! backoff, or permanent failure.

mod backoff;
mod outcome;
mod worker;

pub use backoff::RetryConfig;
pub use outcome::JobOutcome;
pub use worker::{JobHandler, Processed, Worker, Wakeup, spawn_workers};
