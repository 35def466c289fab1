//! System utilities module
//!
//! Provides thread-safe primitives, power locking, and log sink pools
//! following Wings patterns.

mod locker;
mod sink;

pub use locker::{Locker, LockerGuard};
pub use sink::SinkPool;
