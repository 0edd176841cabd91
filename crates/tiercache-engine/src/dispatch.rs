//! Delayed job execution for derived-value recomputes.
//!
//! A recompute blocks on payload I/O, so dispatchers run jobs off the async
//! executor: [`RuntimeDispatch`] sleeps on the tokio timer and then hands the
//! job to the blocking pool, while [`ThreadDispatch`] spawns one named OS
//! thread per job and needs no runtime at all.

use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error};

/// A unit of recompute work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs a job after a delay.
pub trait Dispatch: Send + Sync {
    fn dispatch_after(&self, delay: Duration, job: Job);

    /// Run `job` as soon as possible.
    fn dispatch(&self, job: Job) {
        self.dispatch_after(Duration::ZERO, job);
    }
}

// ---------------------------------------------------------------------------
// Tokio runtime
// ---------------------------------------------------------------------------

/// Dispatcher backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct RuntimeDispatch {
    handle: Handle,
}

impl RuntimeDispatch {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Dispatcher for the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Dispatch for RuntimeDispatch {
    fn dispatch_after(&self, delay: Duration, job: Job) {
        debug!(delay_ms = delay.as_millis() as u64, "recompute dispatched");
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                error!(error = %e, "recompute job failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Plain threads
// ---------------------------------------------------------------------------

/// Dispatcher that runs every job on its own named thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadDispatch;

impl ThreadDispatch {
    pub fn new() -> Self {
        Self
    }
}

impl Dispatch for ThreadDispatch {
    fn dispatch_after(&self, delay: Duration, job: Job) {
        let spawned = std::thread::Builder::new()
            .name("tiercache-recompute".into())
            .spawn(move || {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                job();
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn recompute thread");
        }
    }
}
