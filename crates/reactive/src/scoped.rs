//! Scoped resources with exactly-once finalization
//!
//! [`using_when`] acquires a resource, runs a unit of work with it and then
//! runs an async finalizer. The finalizer observes how the scope ended:
//!
//! | Channel | How it ends | Outcome |
//! |---------|-------------|---------|
//! | completion | the work future resolves `Ok` | `Completed` |
//! | error | the work future resolves `Err` | `Failed` |
//! | panic | the work closure or its future panics | `Failed`, then the panic resumes |
//! | cancellation | the outer future is dropped while the work is pending | `Cancelled` |
//!
//! The finalizer runs once on every channel. On cancellation there is no
//! caller left to await it, so it is spawned on the current tokio runtime
//! (or driven to completion in place when no runtime is running). A
//! finalizer that already started keeps running if the outer future is
//! dropped mid-way.
//!
//! Dropping the future before its first poll acquires nothing and therefore
//! finalizes nothing. The engines' acquiring futures arm an
//! [`AcquireGuard`] for every step that takes a resource, so cancellation
//! while acquiring releases whatever was taken so far.
//!
//! Detached cleanup outside a tokio runtime is driven with
//! `futures::executor::block_on`. Dropping a pending scope from inside
//! another `futures` executor therefore panics, as executors do not nest;
//! drop such scopes on a tokio runtime.

use conduit_core::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::warn;

/// How a scope ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    /// The unit of work succeeded
    Completed,
    /// The unit of work failed or panicked
    Failed,
    /// The scope was dropped before the unit of work finished
    Cancelled,
}

/// Acquire a resource, use it, and finalize it exactly once
///
/// A failure of the unit of work stays the reported error; a finalizer
/// failure is attached to it (or reported on its own after a success).
pub async fn using_when<Res, R, Acq, Use, UseFut, Fin>(
    acquire: Acq,
    use_fn: Use,
    finalize: Fin,
) -> Result<R>
where
    Res: Clone + Send + 'static,
    Acq: Future<Output = Result<Res>>,
    Use: FnOnce(Res) -> UseFut,
    UseFut: Future<Output = Result<R>>,
    Fin: FnOnce(Res, ScopeOutcome) -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    let resource = acquire.await?;
    let mut guard = FinalizeGuard::new(resource.clone(), finalize);

    let work = std::panic::catch_unwind(AssertUnwindSafe(|| use_fn(resource)));
    let result = match work {
        Ok(work) => AssertUnwindSafe(work).catch_unwind().await,
        Err(panic) => Err(panic),
    };
    let result = match result {
        Ok(result) => result,
        Err(panic) => {
            if let Err(e) = guard.finalize(ScopeOutcome::Failed).await {
                warn!(error = %e, "scope finalizer failed after a panic");
            }
            std::panic::resume_unwind(panic)
        }
    };

    let outcome = match result {
        Ok(_) => ScopeOutcome::Completed,
        Err(_) => ScopeOutcome::Failed,
    };
    let cleanup = guard.finalize(outcome).await;
    Error::merge_cleanup(result, cleanup)
}

/// Owns the finalizer until it has run to completion
struct FinalizeGuard<Res, Fin>
where
    Fin: FnOnce(Res, ScopeOutcome) -> BoxFuture<'static, Result<()>>,
{
    pending: Option<(Res, Fin)>,
    running: Option<BoxFuture<'static, Result<()>>>,
}

impl<Res, Fin> FinalizeGuard<Res, Fin>
where
    Res: Send + 'static,
    Fin: FnOnce(Res, ScopeOutcome) -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    fn new(resource: Res, finalize: Fin) -> Self {
        Self {
            pending: Some((resource, finalize)),
            running: None,
        }
    }

    async fn finalize(&mut self, outcome: ScopeOutcome) -> Result<()> {
        if let Some((resource, finalize)) = self.pending.take() {
            self.running = Some(finalize(resource, outcome));
        }
        let result = match self.running.as_mut() {
            Some(running) => running.await,
            None => Ok(()),
        };
        self.running = None;
        result
    }
}

impl<Res, Fin> Drop for FinalizeGuard<Res, Fin>
where
    Fin: FnOnce(Res, ScopeOutcome) -> BoxFuture<'static, Result<()>>,
{
    fn drop(&mut self) {
        let finalizer = match (self.running.take(), self.pending.take()) {
            (Some(running), _) => running,
            (None, Some((resource, finalize))) => {
                let outcome = if std::thread::panicking() {
                    ScopeOutcome::Failed
                } else {
                    ScopeOutcome::Cancelled
                };
                finalize(resource, outcome)
            }
            (None, None) => return,
        };
        run_detached(finalizer);
    }
}

/// Cleanup armed while a resource is being acquired
///
/// Dropped while armed, the cleanup runs detached like a cancelled scope's
/// finalizer. [`disarm`](Self::disarm) hands the resource over once
/// acquisition succeeded.
pub(crate) struct AcquireGuard {
    cleanup: Option<BoxFuture<'static, Result<()>>>,
}

impl AcquireGuard {
    pub(crate) fn new(cleanup: BoxFuture<'static, Result<()>>) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// A guard with nothing to release
    pub(crate) fn empty() -> Self {
        Self { cleanup: None }
    }

    /// Run `first` before the cleanup already armed
    pub(crate) fn prepend(mut self, first: BoxFuture<'static, Result<()>>) -> Self {
        let rest = self.cleanup.take();
        Self::new(
            async move {
                let first = first.await;
                let rest = match rest {
                    Some(rest) => rest.await,
                    None => Ok(()),
                };
                Error::merge_cleanup(first, rest)
            }
            .boxed(),
        )
    }

    /// Acquisition succeeded; the cleanup will never run
    pub(crate) fn disarm(mut self) {
        self.cleanup = None;
    }

    /// Acquisition failed; run the cleanup now
    pub(crate) async fn release(mut self) -> Result<()> {
        let result = match self.cleanup.as_mut() {
            Some(cleanup) => cleanup.await,
            None => Ok(()),
        };
        self.cleanup = None;
        result
    }
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            run_detached(cleanup);
        }
    }
}

fn run_detached(finalizer: BoxFuture<'static, Result<()>>) {
    let task = async move {
        if let Err(e) = finalizer.await {
            warn!(error = %e, "detached scope finalizer failed");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => futures::executor::block_on(task),
    }
}
