//! Controller
//!
//! Binds watches, a work queue, a worker pool and a reconciler into a named
//! unit with a `Created -> Running -> Stopping -> Stopped` lifecycle.

mod watch;
mod worker;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::watch::{Watch, WatchRegistration};
use self::worker::Worker;
use crate::error::{Error, Result};
use crate::handler::EventHandler;
use crate::inject::Dependencies;
use crate::metrics;
use crate::predicate::Predicate;
use crate::reconciler::{Reconciler, Request};
use crate::source::Source;
use crate::workqueue::{lock, RateLimiter, WorkQueue};

/// Worker count used when the options leave it at zero
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 1;

lazy_static::lazy_static! {
    /// Names of live controllers; names label metrics, so they must be unique
    static ref CONTROLLER_NAMES: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Options for [`Controller::new`]
#[derive(Default)]
pub struct ControllerOptions {
    /// Reconciliation logic; required
    pub reconciler: Option<Box<dyn Reconciler>>,
    /// Number of workers; `0` means [`DEFAULT_MAX_CONCURRENT_RECONCILES`]
    pub max_concurrent_reconciles: usize,
    /// Backoff for failing requests; exponential 5ms..1000s when unset
    pub rate_limiter: Option<Box<dyn RateLimiter<Request>>>,
    /// Client offered to components through injection
    pub client: Option<Client>,
    /// Abandon a reconcile after this long and retry it with backoff
    pub reconcile_timeout: Option<Duration>,
}

impl ControllerOptions {
    pub fn new(reconciler: impl Reconciler) -> Self {
        Self {
            reconciler: Some(Box::new(reconciler)),
            ..Default::default()
        }
    }

    pub fn max_concurrent_reconciles(mut self, workers: usize) -> Self {
        self.max_concurrent_reconciles = workers;
        self
    }

    pub fn rate_limiter(mut self, limiter: impl RateLimiter<Request> + 'static) -> Self {
        self.rate_limiter = Some(Box::new(limiter));
        self
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = Some(timeout);
        self
    }
}

/// Lifecycle state of a controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ControllerState::Created => "created",
            ControllerState::Running => "running",
            ControllerState::Stopping => "stopping",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// A watch waiting to be started by the run loop
struct Registration {
    watch: Box<dyn Watch>,
    /// Present when the caller of `watch` waits for the source to start
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// A named reconciliation unit
///
/// Create it with [`Controller::new`], register watches with
/// [`Controller::watch`], then run it with [`Controller::start`]. The
/// controller can be shared (e.g. in an `Arc`) to register watches while it
/// runs.
pub struct Controller {
    name: Arc<str>,
    queue: Arc<WorkQueue<Request>>,
    reconciler: Arc<dyn Reconciler>,
    max_concurrent_reconciles: usize,
    reconcile_timeout: Option<Duration>,
    deps: Dependencies,
    scope: CancellationToken,
    state: Mutex<ControllerState>,
    registrations: mpsc::UnboundedSender<Registration>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Registration>>>,
    running_workers: Arc<AtomicUsize>,
}

impl Controller {
    /// Validate `options`, inject the reconciler and build the controller
    ///
    /// Creates no tasks; nothing runs until [`start`](Self::start).
    pub fn new(name: impl Into<String>, options: ControllerOptions) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("must specify a name for the controller"));
        }
        let Some(mut reconciler) = options.reconciler else {
            return Err(Error::validation(format!(
                "must specify a reconciler for controller '{}'",
                name
            )));
        };

        let scope = CancellationToken::new();
        let deps = Dependencies::new(name.clone(), options.client, scope.clone());
        reconciler
            .inject(&deps)
            .map_err(|e| Error::inject("reconciler", e))?;

        if !lock(&CONTROLLER_NAMES).insert(name.clone()) {
            return Err(Error::validation(format!(
                "controller name '{}' is already in use",
                name
            )));
        }

        let max_concurrent_reconciles = match options.max_concurrent_reconciles {
            0 => DEFAULT_MAX_CONCURRENT_RECONCILES,
            n => n,
        };
        let queue = match options.rate_limiter {
            Some(limiter) => WorkQueue::new(name.clone(), limiter),
            None => WorkQueue::with_default_rate_limiter(name.clone()),
        };
        let (registrations, pending) = mpsc::unbounded_channel();

        Ok(Self {
            name: Arc::from(name),
            queue: Arc::new(queue),
            reconciler: Arc::from(reconciler),
            max_concurrent_reconciles,
            reconcile_timeout: options.reconcile_timeout,
            deps,
            scope,
            state: Mutex::new(ControllerState::Created),
            registrations,
            pending: Mutex::new(Some(pending)),
            running_workers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ControllerState {
        *lock(&self.state)
    }

    /// The controller's work queue; handlers outside a watch may add to it directly
    pub fn queue(&self) -> &Arc<WorkQueue<Request>> {
        &self.queue
    }

    pub fn max_concurrent_reconciles(&self) -> usize {
        self.max_concurrent_reconciles
    }

    /// Worker tasks currently alive
    pub fn running_workers(&self) -> usize {
        self.running_workers.load(Ordering::SeqCst)
    }

    /// Register a source and the handler its events go to
    ///
    /// Before the controller runs, the watch is established by
    /// [`start`](Self::start), and a source that fails to start fails `start`.
    /// While it runs, the watch is established right away and the source's
    /// start error is returned here; events observed before registration are
    /// not replayed.
    pub async fn watch<K, S, H>(
        &self,
        source: S,
        handler: H,
        predicates: Vec<Box<dyn Predicate<K>>>,
    ) -> Result<()>
    where
        K: Send + 'static,
        S: Source<K> + 'static,
        H: EventHandler<K> + 'static,
    {
        let (mut source, mut handler) = (source, handler);
        source
            .inject(&self.deps)
            .map_err(|e| Error::inject("source", e))?;
        handler
            .inject(&self.deps)
            .map_err(|e| Error::inject("event handler", e))?;

        let watch = Box::new(WatchRegistration::new(
            self.name.clone(),
            Box::new(source),
            Box::new(handler),
            predicates,
        ));

        match self.state() {
            ControllerState::Created => self.submit(Registration { watch, ack: None }),
            ControllerState::Running => {
                let (ack, started) = oneshot::channel();
                self.submit(Registration {
                    watch,
                    ack: Some(ack),
                })?;
                started
                    .await
                    .map_err(|_| Error::Stopped(self.name.to_string()))?
            }
            ControllerState::Stopping | ControllerState::Stopped => {
                Err(Error::Stopped(self.name.to_string()))
            }
        }
    }

    fn submit(&self, registration: Registration) -> Result<()> {
        self.registrations
            .send(registration)
            .map_err(|_| Error::Stopped(self.name.to_string()))
    }

    /// Run the controller until `stop` is cancelled
    ///
    /// Establishes the registered watches, starts the workers, and blocks.
    /// On stop, no new work is handed out, in-flight reconciles see their
    /// context cancelled and are allowed to finish, and every worker is joined
    /// before this returns. Returns an error if a watch registered before
    /// start failed to establish, or if the controller was already started.
    pub async fn start(&self, stop: CancellationToken) -> Result<()> {
        let mut registrations = self.begin()?;
        info!(
            controller = %self.name,
            workers = self.max_concurrent_reconciles,
            "Starting controller"
        );
        metrics::MAX_CONCURRENT_RECONCILES
            .with_label_values(&[&*self.name])
            .set(self.max_concurrent_reconciles as f64);

        let mut sources = JoinSet::new();
        let mut workers = JoinSet::new();

        let outcome = match self.establish_pending(&mut registrations, &mut sources, &stop).await {
            Err(e) => Err(e),
            Ok(()) => {
                for id in 0..self.max_concurrent_reconciles {
                    workers.spawn(self.worker(id).run());
                }
                info!(controller = %self.name, "Controller started");
                self.run_until_stopped(&mut registrations, &mut sources, &stop)
                    .await;
                Ok(())
            }
        };

        self.drain(registrations, sources, workers).await;
        outcome
    }

    /// Created -> Running, taking the registration receiver
    fn begin(&self) -> Result<mpsc::UnboundedReceiver<Registration>> {
        let mut state = lock(&self.state);
        if *state != ControllerState::Created {
            return Err(Error::AlreadyStarted(self.name.to_string()));
        }
        let pending = lock(&self.pending)
            .take()
            .ok_or_else(|| Error::AlreadyStarted(self.name.to_string()))?;
        *state = ControllerState::Running;
        Ok(pending)
    }

    fn set_state(&self, next: ControllerState) {
        *lock(&self.state) = next;
    }

    fn worker(&self, id: usize) -> Worker {
        Worker {
            id,
            controller: self.name.clone(),
            queue: self.queue.clone(),
            reconciler: self.reconciler.clone(),
            scope: self.scope.clone(),
            timeout: self.reconcile_timeout,
            running: self.running_workers.clone(),
        }
    }

    /// Establish watches registered before start; workers wait for these
    async fn establish_pending(
        &self,
        registrations: &mut mpsc::UnboundedReceiver<Registration>,
        sources: &mut JoinSet<()>,
        stop: &CancellationToken,
    ) -> Result<()> {
        while let Ok(registration) = registrations.try_recv() {
            if stop.is_cancelled() {
                break;
            }
            self.establish(registration, sources, stop).await?;
        }
        Ok(())
    }

    /// Serve late registrations until `stop` fires
    async fn run_until_stopped(
        &self,
        registrations: &mut mpsc::UnboundedReceiver<Registration>,
        sources: &mut JoinSet<()>,
        stop: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(registration) = registrations.recv() => {
                    if let Err(e) = self.establish(registration, sources, stop).await {
                        // only registrations nobody waits on end up here
                        warn!(controller = %self.name, error = %e, "Watch failed to start");
                    }
                }
                Some(joined) = sources.join_next(), if !sources.is_empty() => {
                    self.dispatch_exited(joined);
                }
            }
        }
    }

    /// Start one watch; the error goes to the waiting caller if there is one
    async fn establish(
        &self,
        registration: Registration,
        sources: &mut JoinSet<()>,
        stop: &CancellationToken,
    ) -> Result<()> {
        let Registration { watch, ack } = registration;
        let started = tokio::select! {
            started = watch.start(self.queue.clone(), self.scope.clone()) => started,
            _ = stop.cancelled() => {
                // a stop during start is a graceful shutdown, not a failure
                if let Some(ack) = ack {
                    let _ = ack.send(Err(Error::Stopped(self.name.to_string())));
                }
                return Ok(());
            }
        };

        let outcome = match started {
            Ok(dispatch) => {
                sources.spawn(dispatch);
                Ok(())
            }
            Err(source) => {
                error!(controller = %self.name, error = %source, "Source failed to start");
                Err(Error::SourceStart {
                    controller: self.name.to_string(),
                    source,
                })
            }
        };

        match ack {
            Some(ack) => {
                let _ = ack.send(outcome);
                Ok(())
            }
            None => outcome,
        }
    }

    /// Report a finished event dispatch task
    ///
    /// A panicking mapper or handler ends its own dispatch task only; the
    /// watch stays down until the controller is restarted.
    fn dispatch_exited(&self, joined: std::result::Result<(), JoinError>) {
        match joined {
            Ok(()) => debug!(controller = %self.name, "Event source ended"),
            Err(e) => {
                error!(controller = %self.name, error = %e, "Event dispatch task failed");
                metrics::WATCH_FAILURES
                    .with_label_values(&[&*self.name])
                    .inc();
            }
        }
    }

    /// Stop handing out work and wait for every task of this controller
    async fn drain(
        &self,
        registrations: mpsc::UnboundedReceiver<Registration>,
        mut sources: JoinSet<()>,
        mut workers: JoinSet<()>,
    ) {
        self.set_state(ControllerState::Stopping);
        info!(
            controller = %self.name,
            in_flight = self.queue.in_flight(),
            "Stopping controller, waiting for in-flight reconciles"
        );

        // Unanswered registrations see their ack dropped and report Stopped.
        drop(registrations);
        self.scope.cancel();
        self.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(controller = %self.name, error = %e, "Worker task failed");
            }
        }
        while let Some(joined) = sources.join_next().await {
            self.dispatch_exited(joined);
        }

        self.set_state(ControllerState::Stopped);
        info!(controller = %self.name, "Controller stopped");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.scope.cancel();
        lock(&CONTROLLER_NAMES).remove(&*self.name);
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("max_concurrent_reconciles", &self.max_concurrent_reconciles)
            .finish()
    }
}
