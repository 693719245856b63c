//! Error types for the reconcile engine

use thiserror::Error;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
///
/// Per-reconcile failures are not represented here: a reconciler returns an
/// `anyhow::Error`, which is logged and requeued with backoff by the worker.
#[derive(Error, Debug)]
pub enum Error {
    /// Controller options failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A component rejected its injected dependencies
    #[error("Injection into {component} failed: {source}")]
    Inject {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    /// Start was called on a controller that is already running or stopped
    #[error("Controller '{0}' was already started")]
    AlreadyStarted(String),

    /// The controller no longer accepts registrations
    #[error("Controller '{0}' is stopped")]
    Stopped(String),

    /// A watch source failed to start
    #[error("Source for controller '{controller}' failed to start: {source}")]
    SourceStart {
        controller: String,
        #[source]
        source: anyhow::Error,
    },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an injection error for the named component
    pub fn inject(component: impl Into<String>, source: anyhow::Error) -> Self {
        Error::Inject {
            component: component.into(),
            source,
        }
    }
}
