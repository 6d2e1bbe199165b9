//! conveyor-sync: concurrency primitives for the conveyor task client.
//!
//! Two small building blocks shared by brokers and result backends:
//! a bounded [`Pool`] that lends out connections/channels fairly, and a
//! [`FutureMap`] that lets result producers and consumers meet on a task id
//! regardless of which side arrives first.

pub mod future_map;
pub mod pool;

pub use future_map::{FutureMap, Rejection};
pub use pool::{Manager, Pool, PoolGuard, PoolStatus};
