//! The single state cell behind every foundation.
//!
//! A foundation's status, its runtime handles and its teardown action are
//! replaced together as one record. Every successful start opens a new
//! generation; the stop handle returned by that start only resets state
//! while its own generation is still the current one, so a stale handle can
//! never tear down a newer run.

use std::{
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use moonwall_tracing::foundation_span;
use tokio::sync::{Mutex, watch};
use tracing::{Instrument as _, debug, error, info, warn};

use crate::{
    config::FoundationKind,
    errors::{HealthCheckError, HealthCheckReason, ShutdownError, StartupError, StartupReason},
    policy::{OperationKind, TimeoutSpec, with_timeout},
    resource::Cleanup,
    status::FoundationStatus,
};

type TeardownSlot = Arc<Mutex<Option<Cleanup>>>;

struct ActiveRun<R> {
    generation: u64,
    runtime: Arc<R>,
    teardown: TeardownSlot,
}

impl<R> Clone for ActiveRun<R> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            runtime: Arc::clone(&self.runtime),
            teardown: Arc::clone(&self.teardown),
        }
    }
}

struct LifecycleState<R> {
    status: FoundationStatus,
    name: Option<String>,
    run: Option<ActiveRun<R>>,
}

struct Shared<R> {
    kind: FoundationKind,
    state: watch::Sender<LifecycleState<R>>,
    status: watch::Sender<FoundationStatus>,
    generation: AtomicU64,
}

impl<R> Shared<R> {
    fn replace(&self, next: LifecycleState<R>) {
        let status = next.status.clone();
        self.state.send_replace(next);
        self.status.send_replace(status);
    }
}

trait RunReset: Send + Sync {
    fn reset(&self, generation: u64) -> bool;
}

impl<R: Send + Sync> RunReset for Shared<R> {
    fn reset(&self, generation: u64) -> bool {
        let current = self
            .state
            .borrow()
            .run
            .as_ref()
            .map(|run| run.generation);
        if current != Some(generation) {
            return false;
        }
        let name = self.state.borrow().name.clone();
        self.replace(LifecycleState {
            status: self.kind.idle_status(),
            name,
            run: None,
        });
        true
    }
}

/// What a successful bring-up hands back to the lifecycle.
pub struct Activation<R, I> {
    pub status: FoundationStatus,
    pub runtime: R,
    pub info: I,
    pub cleanup: Cleanup,
}

/// The value returned by a successful start: caller-facing info plus the
/// action that stops exactly this run.
#[derive(Debug)]
pub struct Started<I> {
    pub info: I,
    pub stop: StopHandle,
}

/// Stops the run that produced it. Calling it more than once is a no-op.
#[derive(Clone)]
pub struct StopHandle {
    kind: FoundationKind,
    name: String,
    generation: u64,
    teardown: TeardownSlot,
    owner: Weak<dyn RunReset>,
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl StopHandle {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn stop(&self) -> Result<(), ShutdownError> {
        release(
            self.kind,
            &self.name,
            self.generation,
            &self.teardown,
            self.owner.upgrade(),
        )
        .await
    }

    /// Converts the handle into a plain [`Cleanup`], e.g. for signal handlers.
    pub fn into_cleanup(self) -> Cleanup {
        let name = format!("{} foundation {}", self.kind, self.name);
        Cleanup::new(name, move || async move {
            self.stop().await.map_err(Into::into)
        })
    }
}

async fn release(
    kind: FoundationKind,
    name: &str,
    generation: u64,
    teardown: &TeardownSlot,
    owner: Option<Arc<dyn RunReset>>,
) -> Result<(), ShutdownError> {
    let Some(cleanup) = teardown.lock().await.take() else {
        debug!(%kind, %name, generation, "stop already performed for this run");
        return Ok(());
    };

    let spec = TimeoutSpec::new(
        OperationKind::FoundationShutdown,
        format!("stopping {kind} foundation `{name}`"),
    )
    .with_context("foundation", kind);

    let outcome = with_timeout(spec, cleanup.run())
        .instrument(foundation_span(kind.as_str(), "shutdown", Some(name)))
        .await;

    if let Some(owner) = owner {
        if !owner.reset(generation) {
            debug!(%kind, %name, generation, "run superseded; state left untouched");
        }
    }

    match outcome {
        Ok(Ok(())) => {
            info!(%kind, %name, "foundation stopped");
            Ok(())
        }
        Ok(Err(cleanup_error)) => {
            let failed = vec![cleanup_error.resource().to_owned()];
            Err(ShutdownError::new(
                kind,
                name,
                cleanup_error.to_string(),
                failed,
                Some(cleanup_error.into()),
            ))
        }
        Err(timeout) => Err(ShutdownError::new(
            kind,
            name,
            timeout.message().to_owned(),
            Vec::new(),
            Some(timeout.into()),
        )),
    }
}

/// Shared status, runtime and teardown bookkeeping for one foundation.
pub struct Lifecycle<R> {
    inner: Arc<Shared<R>>,
}

impl<R: Send + Sync + 'static> Lifecycle<R> {
    #[must_use]
    pub fn new(kind: FoundationKind) -> Self {
        let (state, _) = watch::channel(LifecycleState {
            status: kind.idle_status(),
            name: None,
            run: None,
        });
        let (status, _) = watch::channel(kind.idle_status());
        Self {
            inner: Arc::new(Shared {
                kind,
                state,
                status,
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> FoundationKind {
        self.inner.kind
    }

    #[must_use]
    pub fn status(&self) -> FoundationStatus {
        self.inner.state.borrow().status.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FoundationStatus> {
        self.inner.status.subscribe()
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.inner.state.borrow().name.clone()
    }

    /// Runtime handles of the current run, if the foundation is active.
    #[must_use]
    pub fn runtime(&self) -> Option<Arc<R>> {
        let state = self.inner.state.borrow();
        if !state.status.is_active() {
            return None;
        }
        state.run.as_ref().map(|run| Arc::clone(&run.runtime))
    }

    /// Like [`Self::runtime`] but produces the health-check failure for an
    /// inactive foundation.
    pub fn require_active(&self) -> Result<Arc<R>, HealthCheckError> {
        self.runtime().ok_or_else(|| {
            let kind = self.kind();
            let expected = if kind.is_connection() {
                "connected"
            } else {
                "running"
            };
            HealthCheckError::new(
                kind,
                self.name().unwrap_or_default(),
                HealthCheckReason::NotRunning {
                    expected,
                    status: self.status().label().to_owned(),
                },
            )
        })
    }

    /// Moves into the pending state, refusing if a run is active or pending.
    pub fn begin(&self, name: &str) -> Result<(), StartupError> {
        let kind = self.kind();
        let mut accepted = false;
        self.inner.state.send_if_modified(|state| {
            if state.status.is_busy() {
                return false;
            }
            *state = LifecycleState {
                status: kind.pending_status(),
                name: Some(name.to_owned()),
                run: None,
            };
            accepted = true;
            true
        });
        if !accepted {
            warn!(%kind, %name, "start requested while foundation is active");
            return Err(StartupError::new(kind, name, StartupReason::AlreadyRunning));
        }
        self.inner.status.send_replace(kind.pending_status());
        Ok(())
    }

    pub fn fail(&self, error: &StartupError) {
        let name = self.name();
        self.inner.replace(LifecycleState {
            status: FoundationStatus::Failed {
                error: error.to_string(),
            },
            name,
            run: None,
        });
    }

    pub fn activate(&self, status: FoundationStatus, runtime: R, cleanup: Cleanup) -> StopHandle {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let teardown: TeardownSlot = Arc::new(Mutex::new(Some(cleanup)));
        let name = self.name().unwrap_or_default();

        self.inner.replace(LifecycleState {
            status,
            name: Some(name.clone()),
            run: Some(ActiveRun {
                generation,
                runtime: Arc::new(runtime),
                teardown: Arc::clone(&teardown),
            }),
        });

        let owner: Weak<dyn RunReset> = Arc::downgrade(&self.inner) as Weak<dyn RunReset>;
        StopHandle {
            kind: self.kind(),
            name,
            generation,
            teardown,
            owner,
        }
    }

    /// Runs `bring_up` under the startup deadline and records the outcome.
    pub async fn start<I, F>(
        &self,
        name: &str,
        startup_timeout_ms: Option<u64>,
        bring_up: F,
    ) -> Result<Started<I>, StartupError>
    where
        F: Future<Output = Result<Activation<R, I>, StartupReason>> + Send,
    {
        let kind = self.kind();
        self.begin(name)?;
        info!(%kind, %name, "starting foundation");

        let spec = TimeoutSpec::new(
            OperationKind::FoundationStartup,
            format!("starting {kind} foundation `{name}`"),
        )
        .with_duration_ms(startup_timeout_ms)
        .with_context("foundation", kind);

        let outcome = with_timeout(spec, bring_up)
            .instrument(foundation_span(kind.as_str(), "startup", Some(name)))
            .await
            .unwrap_or_else(|timeout| Err(StartupReason::Timeout(timeout)));

        match outcome {
            Ok(activation) => {
                info!(%kind, %name, status = %activation.status, "foundation started");
                let stop = self.activate(activation.status, activation.runtime, activation.cleanup);
                Ok(Started {
                    info: activation.info,
                    stop,
                })
            }
            Err(reason) => {
                let error = StartupError::new(kind, name, reason);
                error!(%kind, %name, %error, "foundation failed to start");
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Tears down the current run. A no-op when nothing is running.
    pub async fn teardown(&self) -> Result<(), ShutdownError> {
        let kind = self.kind();
        let (run, name) = {
            let state = self.inner.state.borrow();
            (state.run.clone(), state.name.clone().unwrap_or_default())
        };
        let Some(run) = run else {
            warn!(%kind, %name, "stop requested but foundation is not running");
            return Ok(());
        };
        let owner: Arc<dyn RunReset> = Arc::clone(&self.inner) as Arc<dyn RunReset>;
        release(kind, &name, run.generation, &run.teardown, Some(owner)).await
    }
}
