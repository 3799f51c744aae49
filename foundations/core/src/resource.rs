//! Acquire/use/release discipline shared by every foundation.
//!
//! A [`Cleanup`] runs at most once. If it is dropped without having been run
//! (the owning future was cancelled by a timeout, a caller bailed out early) it
//! is handed to the current Tokio runtime so the resource is still released.

use std::{fmt, future::Future};

use futures::{FutureExt as _, future::BoxFuture};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::DynError;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), DynError>> + Send>;

#[must_use = "a cleanup that is never run is released in the background on drop"]
pub struct Cleanup {
    name: String,
    action: Option<CleanupFn>,
}

impl Cleanup {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Some(Box::new(move || action().boxed())),
        }
    }

    pub fn noop(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(mut self) -> Result<(), CleanupError> {
        let Some(action) = self.action.take() else {
            return Ok(());
        };
        debug!(resource = %self.name, "releasing resource");
        action().await.map_err(|source| CleanupError {
            resource: self.name.clone(),
            source,
        })
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("name", &self.name)
            .field("pending", &self.action.is_some())
            .finish()
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let Some(action) = self.action.take() else {
            return;
        };
        let name = self.name.clone();
        if let Ok(handle) = Handle::try_current() {
            warn!(resource = %name, "cleanup dropped before running; releasing in background");
            handle.spawn(async move {
                if let Err(error) = action().await {
                    warn!(resource = %name, %error, "background release failed");
                }
            });
        } else {
            warn!(resource = %name, "cleanup dropped outside of a runtime; resource may leak");
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to release {resource}: {source}")]
pub struct CleanupError {
    resource: String,
    #[source]
    source: DynError,
}

impl CleanupError {
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// A resource paired with the action that releases it.
#[derive(Debug)]
pub struct Managed<T> {
    resource: T,
    cleanup: Cleanup,
}

impl<T> Managed<T> {
    pub const fn new(resource: T, cleanup: Cleanup) -> Self {
        Self { resource, cleanup }
    }

    pub const fn resource(&self) -> &T {
        &self.resource
    }

    pub fn into_parts(self) -> (T, Cleanup) {
        (self.resource, self.cleanup)
    }

    pub async fn release(self) -> Result<(), CleanupError> {
        self.cleanup.run().await
    }
}

#[derive(Clone, Debug)]
pub struct AcquireOptions {
    resource_name: String,
    suppress_cleanup_errors: bool,
}

impl AcquireOptions {
    #[must_use]
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            suppress_cleanup_errors: true,
        }
    }

    /// When `false`, a release failure after a successful use is returned to
    /// the caller instead of only being logged.
    #[must_use]
    pub fn suppress_cleanup_errors(mut self, suppress: bool) -> Self {
        self.suppress_cleanup_errors = suppress;
        self
    }

    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError<E> {
    #[error(transparent)]
    Failed(E),
    #[error(transparent)]
    Cleanup(CleanupError),
}

/// Runs `acquire` and binds `release` to the acquired value.
///
/// `release` is called once with a borrow of the resource to build the
/// release future; that future is only polled when the returned
/// [`Managed`] is released (explicitly or on drop).
pub async fn with_acquire_release<T, E, A, R, RFut>(
    options: &AcquireOptions,
    acquire: A,
    release: R,
) -> Result<Managed<T>, E>
where
    A: Future<Output = Result<T, E>>,
    R: FnOnce(&T) -> RFut,
    RFut: Future<Output = Result<(), DynError>> + Send + 'static,
{
    let resource = acquire.await?;
    debug!(resource = %options.resource_name, "resource acquired");
    let release = release(&resource);
    Ok(Managed::new(
        resource,
        Cleanup::new(options.resource_name.clone(), move || release),
    ))
}

/// Acquire, use, release. The release runs whether or not `use_resource`
/// succeeds; a release failure never replaces a failure of the use itself.
pub async fn use_resource<T, U, E, A, R, RFut, F, UFut>(
    options: &AcquireOptions,
    acquire: A,
    release: R,
    use_resource: F,
) -> Result<U, ResourceError<E>>
where
    A: Future<Output = Result<T, E>>,
    R: FnOnce(&T) -> RFut,
    RFut: Future<Output = Result<(), DynError>> + Send + 'static,
    F: FnOnce(T) -> UFut,
    UFut: Future<Output = Result<U, E>>,
{
    let managed = with_acquire_release(options, acquire, release)
        .await
        .map_err(ResourceError::Failed)?;
    let (resource, cleanup) = managed.into_parts();

    let outcome = use_resource(resource).await;
    let released = cleanup.run().await;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(value), Err(error)) => {
            warn!(resource = %options.resource_name, %error, "release failed");
            if options.suppress_cleanup_errors {
                Ok(value)
            } else {
                Err(ResourceError::Cleanup(error))
            }
        }
        (Err(primary), released) => {
            if let Err(error) = released {
                warn!(
                    resource = %options.resource_name,
                    %error,
                    "release failed after use failure"
                );
            }
            Err(ResourceError::Failed(primary))
        }
    }
}

/// Outcome of a batch of cleanups.
#[derive(Debug, Default)]
pub struct CleanupReport {
    released: Vec<String>,
    failures: Vec<CleanupError>,
}

impl CleanupReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn released(&self) -> &[String] {
        &self.released
    }

    #[must_use]
    pub fn failures(&self) -> &[CleanupError] {
        &self.failures
    }

    #[must_use]
    pub fn failed_resources(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|failure| failure.resource().to_owned())
            .collect()
    }

    pub fn into_failures(self) -> Vec<CleanupError> {
        self.failures
    }
}

/// Runs every cleanup in order. Individual failures are logged and collected;
/// they never stop the batch.
pub async fn combine_cleanups(cleanups: Vec<Cleanup>) -> CleanupReport {
    let mut report = CleanupReport::default();
    for cleanup in cleanups {
        let name = cleanup.name().to_owned();
        match cleanup.run().await {
            Ok(()) => report.released.push(name),
            Err(error) => {
                warn!(resource = %name, %error, "cleanup step failed; continuing");
                report.failures.push(error);
            }
        }
    }
    report
}

/// Nested acquisitions released in reverse order of acquisition.
#[derive(Debug, Default)]
pub struct ResourceScope {
    cleanups: Vec<Cleanup>,
}

impl ResourceScope {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cleanups: Vec::new(),
        }
    }

    pub fn defer(&mut self, cleanup: Cleanup) {
        self.cleanups.push(cleanup);
    }

    pub fn adopt<T>(&mut self, managed: Managed<T>) -> T {
        let (resource, cleanup) = managed.into_parts();
        self.defer(cleanup);
        resource
    }

    pub async fn acquire<T, E, A, R, RFut>(
        &mut self,
        options: &AcquireOptions,
        acquire: A,
        release: R,
    ) -> Result<T, E>
    where
        A: Future<Output = Result<T, E>>,
        R: FnOnce(&T) -> RFut,
        RFut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        let managed = with_acquire_release(options, acquire, release).await?;
        Ok(self.adopt(managed))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cleanups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cleanups.is_empty()
    }

    fn drain_lifo(&mut self) -> Vec<Cleanup> {
        let mut cleanups = std::mem::take(&mut self.cleanups);
        cleanups.reverse();
        cleanups
    }

    /// Releases everything acquired so far, most recent first.
    pub async fn close(mut self) -> CleanupReport {
        combine_cleanups(self.drain_lifo()).await
    }

    /// Folds the scope into one cleanup that releases in LIFO order and fails
    /// if any step failed.
    pub fn into_cleanup(mut self, name: impl Into<String>) -> Cleanup {
        let cleanups = self.drain_lifo();
        Cleanup::new(name, move || async move {
            let report = combine_cleanups(cleanups).await;
            if report.is_clean() {
                Ok(())
            } else {
                Err(format!(
                    "failed to release: {}",
                    report.failed_resources().join(", ")
                )
                .into())
            }
        })
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if self.cleanups.is_empty() {
            return;
        }
        let cleanups = self.drain_lifo();
        drop(Cleanup::new("resource scope", move || async move {
            combine_cleanups(cleanups).await;
            Ok(())
        }));
    }
}
