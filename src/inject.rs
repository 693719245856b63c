//! Dependency injection
//!
//! Components (reconcilers, sources, handlers, mappers) may want a Kubernetes
//! client or the controller's stop token. Instead of discovering that through
//! reflection, each component exposes an `inject` hook that the controller
//! calls exactly once after construction. An error from the hook fails the
//! registration of that component.

use kube::Client;
use tokio_util::sync::CancellationToken;

/// Dependencies offered to components at registration time
#[derive(Clone)]
pub struct Dependencies {
    controller: String,
    client: Option<Client>,
    stop: CancellationToken,
}

impl Dependencies {
    pub fn new(controller: impl Into<String>, client: Option<Client>, stop: CancellationToken) -> Self {
        Self {
            controller: controller.into(),
            client,
            stop,
        }
    }

    /// Name of the controller the component is registered with
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Kubernetes client, when the host configured one
    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    /// Kubernetes client, or an error naming the controller that lacks one
    pub fn require_client(&self) -> anyhow::Result<Client> {
        self.client.clone().ok_or_else(|| {
            anyhow::anyhow!(
                "controller '{}' was not configured with a Kubernetes client",
                self.controller
            )
        })
    }

    /// Token cancelled when the controller stops
    pub fn stop(&self) -> CancellationToken {
        self.stop.clone()
    }
}
