//! Single-owner runner.
//!
//! A [`Runner`] lets any number of threads drive a resource that must only be
//! touched by one execution context at a time. Work from outside the owner is
//! marshalled through the [`Scheduler`]; work issued from code that is already
//! running on the owner for the same runner executes in place, because
//! resubmitting it would deadlock a single-threaded owner loop that is busy
//! running the outer call.
//!
//! ```text
//! caller thread                      owner (scheduler loop)
//! ─────────────                      ──────────────────────
//! call(ctx, op, work)
//!   closed? ──────────────► Closed
//!   ctx expired? ─────────► Canceled
//!   on owner? ────────────► run work in place
//!   submit(job) ──────────────────►  job: tag ctx, run work,
//!   select { result, cancel,         send (value, error)
//!            deadline }  ◄──────────
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use crossbeam::channel;
use tether_types::{RunnerConfig, RunnerId};
use tokio::sync::oneshot;

use crate::context::{CancelCause, Context};
use crate::error::RunnerError;
use crate::scheduler::{Job, Scheduler};

/// Drives a resource of type `R` through scheduler `S`.
///
/// Cheap to clone; clones share the resource, the scheduler and the closed flag.
pub struct Runner<R, S> {
    inner: Arc<Inner<R, S>>,
}

/// Non-owning handle that does not keep the resource alive.
pub struct WeakRunner<R, S> {
    inner: Weak<Inner<R, S>>,
}

struct Inner<R, S> {
    id: RunnerId,
    config: RunnerConfig,
    scheduler: S,
    resource: Owned<R>,
    closed: AtomicBool,
    /// Thread running a scheduled work item of this runner, if any.
    active: Mutex<Option<ThreadId>>,
}

/// The resource, only reachable from the owner.
struct Owned<R>(R);

// SAFETY: `&R` is only handed out by `Owned::get`, whose callers are on the
// owner: inside a job (which `Scheduler` implementations never run
// concurrently, with happens-before between jobs) or nested in such a job on
// the same thread. A `!Sync` resource is therefore never observed from two
// threads at once. It may move between threads across jobs, hence `R: Send`.
unsafe impl<R: Send> Sync for Owned<R> {}

impl<R> Owned<R> {
    /// # Safety
    ///
    /// The caller must be running inside a job submitted by this runner, or
    /// nested within one on the same thread.
    unsafe fn get(&self) -> &R {
        &self.0
    }
}

/// Marks the current thread as executing a job for one runner.
struct OwnerScope<'a> {
    active: &'a Mutex<Option<ThreadId>>,
    previous: Option<ThreadId>,
}

impl<'a> OwnerScope<'a> {
    fn enter(active: &'a Mutex<Option<ThreadId>>) -> Self {
        let previous = lock(active).replace(thread::current().id());
        Self { active, previous }
    }
}

impl Drop for OwnerScope<'_> {
    fn drop(&mut self) {
        *lock(self.active) = self.previous;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R, S> Runner<R, S>
where
    R: Send + 'static,
    S: Scheduler + 'static,
{
    /// Wrap `resource`, which from now on is only touched through `scheduler`.
    pub fn new(resource: R, scheduler: S, config: RunnerConfig) -> Self {
        let id = RunnerId::next();
        tracing::debug!(runner = %config.name(), %id, "Runner created");
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                scheduler,
                resource: Owned(resource),
                closed: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        }
    }

    /// Run `work` on the owner and wait for its result.
    ///
    /// Fails fast with [`RunnerError::Closed`] after shutdown and with
    /// [`RunnerError::Canceled`] if `ctx` is already done. If the context has no
    /// deadline, the configured `max_wait` is applied. Cancellation only stops
    /// the wait: work that already started on the owner runs to completion and
    /// its result is discarded.
    pub fn call<T, E, F>(&self, ctx: &Context, op: &str, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<RunnerError> + Send + 'static,
        F: FnOnce(&Context, &R) -> Result<T, E> + Send + 'static,
    {
        let ctx = self.inner.admit(ctx, op)?;
        if self.inner.is_on_owner(&ctx) {
            return self.inner.run_in_place(&ctx, op, work);
        }

        let (tx, rx) = channel::bounded(1);
        let label = op.to_owned();
        self.inner.submit(&ctx, op, move |inner, ctx, resource| {
            let outcome = inner.contain(&label, || work(ctx, resource));
            // The caller may have stopped waiting; the slot never blocks.
            let _ = tx.try_send(outcome);
        })?;

        let deadline = ctx.deadline().map_or_else(channel::never, channel::at);
        let done = ctx.done();
        crossbeam::select! {
            recv(rx) -> outcome => match outcome {
                Ok(outcome) => flatten(outcome),
                Err(_) => Err(self.inner.abandoned(op).into()),
            },
            recv(done) -> _ => Err(self.inner.canceled(op, CancelCause::Canceled).into()),
            recv(deadline) -> _ => {
                Err(self.inner.canceled(op, CancelCause::DeadlineExceeded).into())
            }
        }
    }

    /// Async form of [`call`](Self::call).
    ///
    /// Requires a tokio runtime with the time driver when the effective context
    /// has a deadline.
    pub async fn call_async<T, E, F>(&self, ctx: &Context, op: &str, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<RunnerError> + Send + 'static,
        F: FnOnce(&Context, &R) -> Result<T, E> + Send + 'static,
    {
        let ctx = self.inner.admit(ctx, op)?;
        if self.inner.is_on_owner(&ctx) {
            return self.inner.run_in_place(&ctx, op, work);
        }

        let (tx, rx) = oneshot::channel();
        let label = op.to_owned();
        self.inner.submit(&ctx, op, move |inner, ctx, resource| {
            let _ = tx.send(inner.contain(&label, || work(ctx, resource)));
        })?;

        tokio::select! {
            outcome = rx => match outcome {
                Ok(outcome) => flatten(outcome),
                Err(_) => Err(self.inner.abandoned(op).into()),
            },
            cause = ctx.cancelled() => Err(self.inner.canceled(op, cause).into()),
        }
    }

    /// Queue `work` on the owner without waiting for it.
    ///
    /// The result only reflects admission and submission. Panics inside posted
    /// work are logged and swallowed when recovery is enabled.
    pub fn post<F>(&self, ctx: &Context, op: &str, work: F) -> Result<(), RunnerError>
    where
        F: FnOnce(&Context, &R) + Send + 'static,
    {
        let ctx = self.inner.admit(ctx, op)?;
        if self.inner.is_on_owner(&ctx) {
            let _ = self
                .inner
                .run_in_place(&ctx, op, |ctx, resource| -> Result<(), RunnerError> {
                    work(ctx, resource);
                    Ok(())
                });
            return Ok(());
        }

        let label = op.to_owned();
        self.inner.submit(&ctx, op, move |inner, ctx, resource| {
            let _ = inner.contain(&label, || work(ctx, resource));
        })
    }
}

impl<R, S> Runner<R, S> {
    /// Close the runner. Idempotent.
    ///
    /// Later calls and posts fail with [`RunnerError::Closed`]. Work the
    /// scheduler already accepted is left to finish; draining it is the
    /// scheduler's job.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(runner = %self.name(), id = %self.inner.id, "Runner shut down");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn id(&self) -> RunnerId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn scheduler(&self) -> &S {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakRunner<R, S> {
        WeakRunner {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<R, S> Clone for Runner<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, S> fmt::Debug for Runner<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<R, S> WeakRunner<R, S> {
    #[must_use]
    pub fn upgrade(&self) -> Option<Runner<R, S>> {
        self.inner.upgrade().map(|inner| Runner { inner })
    }

    /// A runner that no longer exists reports closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner
            .upgrade()
            .is_none_or(|inner| inner.closed.load(Ordering::Acquire))
    }
}

impl<R, S> Clone for WeakRunner<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<R, S> Inner<R, S>
where
    R: Send + 'static,
    S: Scheduler + 'static,
{
    /// Closed check and context normalization shared by every entry point.
    fn admit(&self, ctx: &Context, op: &str) -> Result<Context, RunnerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RunnerError::Closed {
                runner: self.config.name().to_owned(),
                op: op.to_owned(),
            });
        }
        let ctx = match self.config.max_wait() {
            Some(max_wait) if ctx.deadline().is_none() => ctx.with_timeout(max_wait),
            _ => ctx.clone(),
        };
        if let Some(cause) = ctx.err() {
            return Err(self.canceled(op, cause));
        }
        Ok(ctx)
    }

    /// Whether `ctx` was issued by work of this runner that is running on the
    /// current thread right now.
    fn is_on_owner(&self, ctx: &Context) -> bool {
        if !ctx.is_owned_by(self.id) {
            return false;
        }
        let on_owner = *lock(&self.active) == Some(thread::current().id());
        if !on_owner {
            tracing::debug!(
                runner = %self.config.name(),
                "Owner marker seen off the owner thread; scheduling instead"
            );
        }
        on_owner
    }

    fn run_in_place<T, E, F>(&self, ctx: &Context, op: &str, work: F) -> Result<T, E>
    where
        E: From<RunnerError>,
        F: FnOnce(&Context, &R) -> Result<T, E>,
    {
        tracing::trace!(runner = %self.config.name(), op, "Re-entrant call, running in place");
        // SAFETY: `is_on_owner` confirmed a job of this runner is executing on
        // this thread, and we are nested inside it.
        let resource = unsafe { self.resource.get() };
        flatten(self.contain(op, || work(ctx, resource)))
    }

    fn submit<W>(self: &Arc<Self>, ctx: &Context, op: &str, work: W) -> Result<(), RunnerError>
    where
        W: FnOnce(&Self, &Context, &R) + Send + 'static,
    {
        let inner = Arc::clone(self);
        let ctx = ctx.with_owner(self.id);
        let job: Job = Box::new(move || {
            let _scope = OwnerScope::enter(&inner.active);
            // SAFETY: we are the job the scheduler is running.
            let resource = unsafe { inner.resource.get() };
            work(inner.as_ref(), &ctx, resource);
        });

        if self.scheduler.submit(job) {
            tracing::debug!(runner = %self.config.name(), op, "Submitted to owner");
            Ok(())
        } else {
            tracing::warn!(runner = %self.config.name(), op, "Scheduler rejected work");
            Err(RunnerError::ScheduleRejected {
                runner: self.config.name().to_owned(),
                op: op.to_owned(),
            })
        }
    }
}

impl<R, S> Inner<R, S> {
    /// Run `f`, turning a panic into [`RunnerError::Panicked`] when recovery is enabled.
    fn contain<T>(&self, op: &str, f: impl FnOnce() -> T) -> Result<T, RunnerError> {
        if !self.config.recover_panics() {
            return Ok(f());
        }
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            let message = panic_payload_to_string(payload.as_ref());
            tracing::warn!(
                runner = %self.config.name(),
                op,
                "Recovered panic in work: {message}"
            );
            RunnerError::Panicked {
                runner: self.config.name().to_owned(),
                op: op.to_owned(),
                message,
            }
        })
    }

    fn canceled(&self, op: &str, cause: CancelCause) -> RunnerError {
        tracing::debug!(runner = %self.config.name(), op, %cause, "Call canceled");
        RunnerError::Canceled {
            runner: self.config.name().to_owned(),
            op: op.to_owned(),
            cause,
        }
    }

    fn abandoned(&self, op: &str) -> RunnerError {
        tracing::warn!(runner = %self.config.name(), op, "Work dropped without a result");
        RunnerError::Abandoned {
            runner: self.config.name().to_owned(),
            op: op.to_owned(),
        }
    }
}

fn flatten<T, E: From<RunnerError>>(outcome: Result<Result<T, E>, RunnerError>) -> Result<T, E> {
    outcome.unwrap_or_else(|err| Err(err.into()))
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;
    use crate::scheduler::QueueScheduler;

    fn config() -> RunnerConfig {
        RunnerConfig::new("test").unwrap()
    }

    #[test]
    fn panic_payload_strings() {
        assert_eq!(panic_payload_to_string(&"static"), "static");
        assert_eq!(panic_payload_to_string(&"owned".to_string()), "owned");
        assert_eq!(panic_payload_to_string(&42_u8), "unknown panic");
    }

    #[test]
    fn owner_scope_restores_previous_thread() {
        let active = Mutex::new(None);
        {
            let _outer = OwnerScope::enter(&active);
            assert_eq!(*lock(&active), Some(thread::current().id()));
            {
                let _inner = OwnerScope::enter(&active);
            }
            assert_eq!(*lock(&active), Some(thread::current().id()));
        }
        assert_eq!(*lock(&active), None);
    }

    #[test]
    fn call_runs_on_queue_thread() {
        let (scheduler, handle) = QueueScheduler::spawn_thread("call").unwrap();
        let runner = Runner::new(Cell::new(1_u32), scheduler, config());

        let value: Result<u32, RunnerError> =
            runner.call(&Context::background(), "double", |_, cell| {
                cell.set(cell.get() * 2);
                Ok(cell.get())
            });
        assert_eq!(value, Ok(2));

        runner.scheduler().close();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn work_sees_owner_marker() {
        let (scheduler, handle) = QueueScheduler::spawn_thread("marker").unwrap();
        let runner = Runner::new((), scheduler, config());
        let id = runner.id();

        let owned: Result<bool, RunnerError> =
            runner.call(&Context::background(), "probe", move |ctx, _| {
                Ok(ctx.is_owned_by(id))
            });
        assert_eq!(owned, Ok(true));

        runner.scheduler().close();
        handle.join().unwrap();
    }

    #[test]
    fn max_wait_applies_only_without_caller_deadline() {
        let (scheduler, mut queue) = QueueScheduler::new("deadline");
        let runner = Runner::new(
            (),
            scheduler,
            config().with_max_wait(Duration::from_secs(30)),
        );

        let admitted = runner.inner.admit(&Context::background(), "op").unwrap();
        let remaining = admitted.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(25));

        let caller = Context::background().with_timeout(Duration::from_secs(120));
        let admitted = runner.inner.admit(&caller, "op").unwrap();
        assert_eq!(admitted.deadline(), caller.deadline());

        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn weak_runner_reports_closed_when_dropped() {
        let (scheduler, _queue) = QueueScheduler::new("weak");
        let runner = Runner::new((), scheduler, config());
        let weak = runner.downgrade();
        assert!(!weak.is_closed());
        assert!(weak.upgrade().is_some());

        runner.shutdown();
        assert!(weak.is_closed());

        drop(runner);
        assert!(weak.is_closed());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn debug_shows_name_and_state() {
        let (scheduler, _queue) = QueueScheduler::new("debug");
        let runner = Runner::new((), scheduler, config());
        let rendered = format!("{runner:?}");
        assert!(rendered.contains("\"test\""));
        assert!(rendered.contains("closed: false"));
    }
}
