//! Cancellation-aware call context.
//!
//! A [`Context`] travels with every runner operation. It carries an optional
//! deadline, an optional [`CancelToken`], and the owner markers of the runners
//! whose work is currently executing on the caller's behalf. Contexts are
//! immutable values; the `with_*` methods derive new ones.

use std::fmt;
use std::future::pending;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use tether_types::RunnerId;
use tokio::sync::Notify;

/// Why a context stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelCause {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cooperative cancellation signal shared between a context and its owner.
///
/// Cancelling is idempotent and propagates to every child token created with
/// [`CancelToken::child`]. Cancelling a child never affects its parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    /// Disconnects when the token is cancelled; blocking waiters select on it.
    done: Receiver<()>,
    /// Wakes async waiters.
    notify: Notify,
}

struct TokenState {
    cancelled: bool,
    done_tx: Option<Sender<()>>,
    children: Vec<Weak<TokenInner>>,
}

impl TokenInner {
    fn new() -> Self {
        let (done_tx, done) = channel::bounded(0);
        Self {
            state: Mutex::new(TokenState {
                cancelled: false,
                done_tx: Some(done_tx),
                children: Vec::new(),
            }),
            done,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.done_tx = None;
            mem::take(&mut state.children)
        };
        self.notify.notify_waiters();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new()),
        }
    }

    /// Create a token that is cancelled whenever `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut state = self.inner.lock();
        if state.cancelled {
            drop(state);
            child.cancel();
        } else {
            state.children.retain(|weak| weak.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a cancel between the check and the
            // await is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn done(&self) -> Receiver<()> {
        self.inner.done.clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Owner markers form a persistent stack so nested runners share tails.
#[derive(Debug)]
struct OwnerMark {
    runner: RunnerId,
    parent: Option<Arc<OwnerMark>>,
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: Option<CancelToken>,
    owners: Option<Arc<OwnerMark>>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires at `deadline`, or earlier if `self` already does.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(self.deadline.map_or(deadline, |current| current.min(deadline)));
        ctx
    }

    /// Derive a context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a cancellable context.
    ///
    /// The returned token cancels the new context only; cancelling `self`
    /// still cancels the new context too.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelToken) {
        let token = self
            .token
            .as_ref()
            .map_or_else(CancelToken::new, CancelToken::child);
        let mut ctx = self.clone();
        ctx.token = Some(token.clone());
        (ctx, token)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, saturating at zero.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context is done, or `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<CancelCause> {
        if self.token.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Some(CancelCause::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve when the context is cancelled or its deadline passes.
    ///
    /// Requires a tokio runtime with the time driver enabled when the context
    /// has a deadline.
    pub async fn cancelled(&self) -> CancelCause {
        let token = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(deadline.into()).await;
                }
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            () = token => CancelCause::Canceled,
            () = deadline => CancelCause::DeadlineExceeded,
        }
    }

    /// Receiver that disconnects when the token is cancelled. Never fires for
    /// contexts without a token. Deadlines are not reflected here.
    pub(crate) fn done(&self) -> Receiver<()> {
        self.token
            .as_ref()
            .map_or_else(channel::never, CancelToken::done)
    }

    pub(crate) fn with_owner(&self, runner: RunnerId) -> Self {
        let mut ctx = self.clone();
        ctx.owners = Some(Arc::new(OwnerMark {
            runner,
            parent: self.owners.clone(),
        }));
        ctx
    }

    pub(crate) fn is_owned_by(&self, runner: RunnerId) -> bool {
        let mut mark = self.owners.as_deref();
        while let Some(current) = mark {
            if current.runner == runner {
                return true;
            }
            mark = current.parent.as_deref();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_live() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.deadline(), None);
        assert_eq!(ctx.remaining(), None);
    }

    #[test]
    fn with_deadline_never_extends() {
        let soon = Instant::now() + Duration::from_millis(50);
        let later = soon + Duration::from_secs(10);
        let ctx = Context::background().with_deadline(soon).with_deadline(later);
        assert_eq!(ctx.deadline(), Some(soon));

        let ctx = Context::background().with_deadline(later).with_deadline(soon);
        assert_eq!(ctx.deadline(), Some(soon));
    }

    #[test]
    fn expired_deadline_reports_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert_eq!(ctx.err(), Some(CancelCause::DeadlineExceeded));
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let ctx = Context::background().with_timeout(Duration::MAX);
        assert_eq!(ctx.err(), None);
    }

    #[test]
    fn cancel_wins_over_deadline() {
        let (ctx, token) = Context::background()
            .with_timeout(Duration::ZERO)
            .with_cancel();
        token.cancel();
        assert_eq!(ctx.err(), Some(CancelCause::Canceled));
    }

    #[test]
    fn parent_cancel_reaches_child_context() {
        let (parent, parent_token) = Context::background().with_cancel();
        let (child, child_token) = parent.with_cancel();

        child_token.cancel();
        assert_eq!(child.err(), Some(CancelCause::Canceled));
        assert_eq!(parent.err(), None);

        let (child, _token) = parent.with_cancel();
        parent_token.cancel();
        assert_eq!(child.err(), Some(CancelCause::Canceled));
    }

    #[test]
    fn child_of_cancelled_token_starts_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.child().is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn done_disconnects_on_cancel() {
        let (ctx, token) = Context::background().with_cancel();
        let done = ctx.done();
        assert_eq!(done.try_recv(), Err(channel::TryRecvError::Empty));

        token.cancel();
        assert_eq!(done.recv(), Err(channel::RecvError));
    }

    #[test]
    fn done_without_token_never_fires() {
        let done = Context::background().done();
        assert_eq!(
            done.recv_timeout(Duration::from_millis(10)),
            Err(channel::RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn owner_markers_nest() {
        let a = RunnerId::next();
        let b = RunnerId::next();
        let ctx = Context::background().with_owner(a);
        assert!(ctx.is_owned_by(a));
        assert!(!ctx.is_owned_by(b));

        let nested = ctx.with_owner(b);
        assert!(nested.is_owned_by(a));
        assert!(nested.is_owned_by(b));
        assert!(!Context::background().is_owned_by(a));
    }

    #[test]
    fn derived_contexts_keep_owner_markers() {
        let id = RunnerId::next();
        let ctx = Context::background()
            .with_owner(id)
            .with_timeout(Duration::from_secs(1));
        let (ctx, _token) = ctx.with_cancel();
        assert!(ctx.is_owned_by(id));
    }

    #[tokio::test]
    async fn cancelled_resolves_on_token() {
        let (ctx, token) = Context::background().with_cancel();
        let waiter = tokio::spawn(async move { ctx.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), CancelCause::Canceled);
    }

    #[tokio::test]
    async fn cancelled_resolves_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.cancelled().await, CancelCause::DeadlineExceeded);
    }
}
