//! Prometheus metrics for the reconcile engine
//!
//! Controllers and work queues report here; the host may expose them with
//! [`serve`].

mod prometheus;

pub use self::prometheus::*;
