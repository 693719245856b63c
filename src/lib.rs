//! Reconcile Engine
//!
//! Turns change notifications for Kubernetes-style objects into deduplicated
//! reconcile requests and drives a bounded pool of workers that call user
//! reconciliation logic until each request converges.
//!
//! The pieces, leaf first:
//! - [`reconciler::Request`]: the key of one object to reconcile
//! - [`handler`]: maps [`event::ChangeEvent`]s to requests
//! - [`workqueue`]: the deduplicating, rate-limited queue
//! - [`controller`]: the worker pool and lifecycle binding it all together

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod handler;
pub mod inject;
pub mod metrics;
pub mod predicate;
pub mod reconciler;
pub mod source;
pub mod workqueue;

pub use controller::{Controller, ControllerOptions, ControllerState};
pub use error::{Error, Result};
pub use event::ChangeEvent;
pub use reconciler::{ReconcileContext, ReconcileResult, Reconciler, Request};
