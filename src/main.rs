//! Reconcile Engine host
//!
//! Main entry point. Loads configuration, sets up tracing and the Kubernetes
//! client, and runs a Pod controller on the engine until SIGINT/SIGTERM.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reconcile_engine::{
    config::{EngineConfig, LogFormat},
    handler::EnqueueRequestForObject,
    inject::Dependencies,
    metrics,
    predicate::{Predicate, ResourceVersionChanged},
    source::KubeWatch,
    Controller, ControllerOptions, ReconcileContext, ReconcileResult, Reconciler, Request,
};

/// Re-check interval for pods that are not yet running
const PENDING_RECHECK: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load()?;
    init_tracing(config.log_format);

    info!("Starting Reconcile Engine");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    let controller = Controller::new(
        "pod-phase",
        ControllerOptions::new(PodPhaseReconciler::default())
            .max_concurrent_reconciles(config.max_concurrent_reconciles)
            .rate_limiter(config.backoff.rate_limiter::<Request>())
            .client(client.clone()),
    )?;

    let source = match &config.namespace {
        Some(namespace) => KubeWatch::new(Api::<Pod>::namespaced(client.clone(), namespace)),
        None => KubeWatch::all(),
    };
    let predicates: Vec<Box<dyn Predicate<Pod>>> = vec![Box::new(ResourceVersionChanged)];
    controller
        .watch(source, EnqueueRequestForObject, predicates)
        .await?;

    let stop = CancellationToken::new();
    let run = controller.start(stop.clone());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => {
            error!("Controller exited unexpectedly");
            metrics::set_ready(false);
            result?;
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
            stop.cancel();
            run.await?;
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping controllers");
            metrics::set_ready(false);
            stop.cancel();
            run.await?;
        }
    }

    info!("Reconcile Engine stopped");
    Ok(())
}

/// Logs the phase of every pod and re-checks pods that have not started
#[derive(Default)]
struct PodPhaseReconciler {
    client: Option<Client>,
}

#[async_trait]
impl Reconciler for PodPhaseReconciler {
    async fn reconcile(
        &self,
        ctx: ReconcileContext,
        request: Request,
    ) -> anyhow::Result<ReconcileResult> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no Kubernetes client injected"))?;
        let namespace = request.namespace.as_deref().unwrap_or("default");
        let api: Api<Pod> = Api::namespaced(client, namespace);

        let pod = tokio::select! {
            pod = api.get_opt(&request.name) => pod?,
            _ = ctx.cancelled() => return Ok(ReconcileResult::done()),
        };
        let Some(pod) = pod else {
            info!(request = %request, "Pod deleted");
            return Ok(ReconcileResult::done());
        };

        let phase = pod
            .status
            .and_then(|status| status.phase)
            .unwrap_or_else(|| "Unknown".to_string());
        info!(request = %request, phase = %phase, "Observed pod");

        match phase.as_str() {
            "Pending" | "Unknown" => Ok(ReconcileResult::requeue_after(PENDING_RECHECK)),
            "Failed" => {
                warn!(request = %request, "Pod failed");
                Ok(ReconcileResult::done())
            }
            _ => Ok(ReconcileResult::done()),
        }
    }

    fn inject(&mut self, deps: &Dependencies) -> anyhow::Result<()> {
        self.client = Some(deps.require_client()?);
        Ok(())
    }
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
