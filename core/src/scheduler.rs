//! The scheduling seam between a runner and its owner.
//!
//! A [`Scheduler`] accepts boxed jobs and runs them one at a time on the
//! owner. The runner only ever calls [`Scheduler::submit`]; driving the
//! execution loop is the host's business. [`QueueScheduler`] is the stock
//! implementation: a FIFO queue drained by a single [`JobQueue`] consumer.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tokio::sync::mpsc;

/// A unit of work handed to a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Submission primitive for the owner's execution loop.
///
/// # Safety
///
/// Runners hand `!Sync` resources to jobs on the strength of this contract, so
/// a broken implementation is a data race. Implementations must guarantee:
///
/// - A job is never started on one thread while another job accepted by this
///   scheduler is still running on a different thread.
/// - The end of each job happens-before the start of the next one (any
///   channel, lock, or thread handoff provides this).
///
/// Jobs may be run on any single thread at a time, in acceptance order, and
/// may be dropped unrun. Returning `false` declines the job; it is dropped
/// without running.
pub unsafe trait Scheduler: Send + Sync {
    fn submit(&self, job: Job) -> bool;
}

// SAFETY: forwards to the inner scheduler, which upholds the contract.
unsafe impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn submit(&self, job: Job) -> bool {
        (**self).submit(job)
    }
}

enum Message {
    Run(Job),
    Close,
}

/// Producer half of a FIFO job queue.
///
/// Cheap to clone; every clone feeds the same [`JobQueue`].
#[derive(Clone)]
pub struct QueueScheduler {
    tx: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    name: Arc<str>,
}

/// Consumer half of a FIFO job queue. Exactly one exists per queue.
pub struct JobQueue {
    rx: mpsc::UnboundedReceiver<Message>,
    name: Arc<str>,
}

impl QueueScheduler {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> (Self, JobQueue) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            name: Arc::clone(&name),
        };
        (scheduler, JobQueue { rx, name })
    }

    /// Create a queue drained by a dedicated OS thread.
    ///
    /// The thread exits after [`close`](Self::close) once the backlog is drained,
    /// or when every `QueueScheduler` clone has been dropped. Joining yields the
    /// number of jobs it ran.
    pub fn spawn_thread(name: &str) -> io::Result<(Self, thread::JoinHandle<usize>)> {
        let (scheduler, queue) = Self::new(name);
        let handle = thread::Builder::new()
            .name(format!("tether-{name}"))
            .spawn(move || queue.run_blocking())?;
        Ok((scheduler, handle))
    }

    /// Stop accepting jobs. Jobs already queued still run.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(queue = %self.name, "Job queue closing");
            let _ = self.tx.send(Message::Close);
        }
    }

    /// Whether submissions are being declined.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// SAFETY: the channel has a single consumer, the non-`Clone` `JobQueue`, whose
// drain methods take `self` or `&mut self` and run each job to completion on
// the calling thread before receiving the next. The channel handoff orders
// consecutive jobs.
unsafe impl Scheduler for QueueScheduler {
    fn submit(&self, job: Job) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Message::Run(job)).is_ok()
    }
}

impl JobQueue {
    /// Drain jobs on the current thread until the queue closes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run_blocking(mut self) -> usize {
        tracing::info!(queue = %self.name, "Job queue started");
        let mut ran = 0;
        while let Some(message) = self.rx.blocking_recv() {
            ran += self.handle(message);
        }
        tracing::info!(queue = %self.name, ran, "Job queue stopped");
        ran
    }

    /// Drain jobs from an async task until the queue closes.
    ///
    /// Jobs run synchronously inside the task, so this belongs on a runtime
    /// (or `LocalSet`) dedicated to the owner.
    pub async fn run(mut self) -> usize {
        tracing::info!(queue = %self.name, "Job queue started");
        let mut ran = 0;
        while let Some(message) = self.rx.recv().await {
            ran += self.handle(message);
        }
        tracing::info!(queue = %self.name, ran, "Job queue stopped");
        ran
    }

    /// Run every job queued right now without waiting for more.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(message) = self.rx.try_recv() {
            ran += self.handle(message);
        }
        ran
    }

    fn handle(&mut self, message: Message) -> usize {
        match message {
            Message::Run(job) => {
                job();
                1
            }
            Message::Close => {
                // Already-buffered jobs are still delivered after close().
                self.rx.close();
                0
            }
        }
    }
}
