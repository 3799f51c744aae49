//! Process-signal driven teardown.
//!
//! Each registration installs one listener per termination signal. When a
//! signal arrives the registered cleanup runs (bounded by a grace period),
//! the signal is recorded as the termination reason and the process exits
//! with the conventional `128 + signo` code.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{policy::defaults, resource::Cleanup};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub const ALL: [Self; 2] = [Self::Interrupt, Self::Terminate];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }

    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
        }
    }

    /// Installs the OS-level handler right away so a signal arriving before
    /// the listener task is polled is not lost.
    fn listen(self) -> io::Result<Listener> {
        Listener::install(self)
    }
}

#[cfg(unix)]
struct Listener(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Listener {
    fn install(signal: ShutdownSignal) -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let kind = match signal {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
        };
        unix_signal(kind).map(Self)
    }

    async fn recv(mut self) {
        self.0.recv().await;
    }
}

#[cfg(not(unix))]
struct Listener(ShutdownSignal);

#[cfg(not(unix))]
impl Listener {
    fn install(signal: ShutdownSignal) -> io::Result<Self> {
        Ok(Self(signal))
    }

    async fn recv(self) {
        match self.0 {
            ShutdownSignal::Interrupt => {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            ShutdownSignal::Terminate => std::future::pending().await,
        }
    }
}

type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Clone)]
pub struct ShutdownOptions {
    grace_period: Duration,
    exit: ExitFn,
}

impl ShutdownOptions {
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Replaces the final `process::exit`.
    #[must_use]
    pub fn with_exit(mut self, exit: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit = Arc::new(exit);
        self
    }
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            grace_period: defaults::FOUNDATION_SHUTDOWN,
            exit: Arc::new(|code| std::process::exit(code)),
        }
    }
}

impl std::fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownOptions")
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("signal handlers require a running Tokio runtime")]
pub struct NoRuntimeError;

static TERMINATION_REASON: Mutex<Option<ShutdownSignal>> = Mutex::new(None);
static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(0);
static REGISTRY: LazyLock<Mutex<HashMap<u64, Vec<(ShutdownSignal, JoinHandle<()>)>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The signal that most recently triggered a shutdown, if any.
#[must_use]
pub fn termination_reason() -> Option<ShutdownSignal> {
    *TERMINATION_REASON
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn record_termination(signal: ShutdownSignal) {
    *TERMINATION_REASON
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(signal);
}

/// Number of live listeners for `signal` across all registrations.
#[must_use]
pub fn registered_handlers(signal: ShutdownSignal) -> usize {
    REGISTRY
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .values()
        .flatten()
        .filter(|(registered, _)| *registered == signal)
        .count()
}

/// Handle returned by [`register_signal_cleanup`]. Dropping it leaves the
/// listeners installed; call [`SignalRegistration::unregister`] to remove
/// them.
#[derive(Debug)]
#[must_use = "listeners stay installed until `unregister` is called"]
pub struct SignalRegistration {
    id: u64,
}

impl SignalRegistration {
    pub fn unregister(self) {
        let removed = REGISTRY
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.id);
        for (_, handle) in removed.into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Installs interrupt and terminate listeners that run `cleanup` and exit.
pub fn register_signal_cleanup(
    cleanup: Cleanup,
    options: ShutdownOptions,
) -> Result<SignalRegistration, NoRuntimeError> {
    let handle = Handle::try_current().map_err(|_| NoRuntimeError)?;
    let _entered = handle.enter();
    let id = NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed);
    let slot = Arc::new(tokio::sync::Mutex::new(Some(cleanup)));

    let listeners = ShutdownSignal::ALL
        .into_iter()
        .filter_map(|signal| {
            let listener = match signal.listen() {
                Ok(listener) => listener,
                Err(error) => {
                    warn!(signal = signal.name(), %error, "failed to listen for signal");
                    return None;
                }
            };
            let slot = Arc::clone(&slot);
            let options = options.clone();
            let task = handle.spawn(async move {
                listener.recv().await;
                let cleanup = slot.lock().await.take();
                let code = run_signal_shutdown(signal, cleanup, options.grace_period).await;
                (options.exit)(code);
            });
            Some((signal, task))
        })
        .collect();

    REGISTRY
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(id, listeners);

    Ok(SignalRegistration { id })
}

/// Records `signal`, runs `cleanup` within `grace_period` and returns the
/// exit code the process should terminate with.
pub async fn run_signal_shutdown(
    signal: ShutdownSignal,
    cleanup: Option<Cleanup>,
    grace_period: Duration,
) -> i32 {
    record_termination(signal);
    info!(signal = signal.name(), "received termination signal; cleaning up");

    if let Some(cleanup) = cleanup {
        let name = cleanup.name().to_owned();
        match tokio::time::timeout(grace_period, cleanup.run()).await {
            Ok(Ok(())) => info!(resource = %name, "cleanup finished"),
            Ok(Err(error)) => error!(resource = %name, %error, "cleanup failed during shutdown"),
            Err(_) => error!(
                resource = %name,
                grace_ms = grace_period.as_millis(),
                "cleanup did not finish within grace period"
            ),
        }
    }

    signal.exit_code()
}
