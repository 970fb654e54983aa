//! Concurrent increment workload against a queue-backed runner.

use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use tether_core::{
    Context, QueueScheduler, Registry, Runner, RunnerConfig, RunnerError, RunnerErrorKind,
};
use tokio::task;

use crate::Args;

/// Single-threaded resource: only ever touched on the owner thread.
#[derive(Debug, Default)]
struct Counter {
    value: Cell<u64>,
}

type Capability = fn(&Counter) -> u64;

fn increment(counter: &Counter) -> u64 {
    let next = counter.value.get() + 1;
    counter.value.set(next);
    next
}

fn read(counter: &Counter) -> u64 {
    counter.value.get()
}

fn capabilities() -> Result<Registry<Capability>> {
    let registry = Registry::new();
    registry.register("increment", increment as Capability)?;
    registry.register("read", read as Capability)?;
    Ok(registry)
}

#[derive(Debug, Default)]
pub(crate) struct Report {
    runner: String,
    calls: usize,
    succeeded: usize,
    duplicates: usize,
    failures: BTreeMap<RunnerErrorKind, usize>,
    final_value: u64,
    jobs_run: usize,
    elapsed: Duration,
}

impl Report {
    fn record(&mut self, outcomes: Vec<Result<u64, RunnerError>>, seen: &mut HashSet<u64>) {
        for outcome in outcomes {
            match outcome {
                Ok(value) => {
                    self.succeeded += 1;
                    if !seen.insert(value) {
                        self.duplicates += 1;
                    }
                }
                Err(err) => *self.failures.entry(err.kind()).or_default() += 1,
            }
        }
    }

    /// Every increment observed a distinct value and none were lost.
    ///
    /// Timed-out calls may still have landed, so the final value can exceed
    /// the success count but never the number of calls.
    pub(crate) fn is_consistent(&self) -> bool {
        let succeeded = self.succeeded as u64;
        let calls = self.calls as u64;
        self.duplicates == 0 && self.final_value >= succeeded && self.final_value <= calls
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "runner:      {}", self.runner)?;
        writeln!(f, "calls:       {}", self.calls)?;
        writeln!(f, "succeeded:   {}", self.succeeded)?;
        writeln!(f, "duplicates:  {}", self.duplicates)?;
        writeln!(f, "final value: {}", self.final_value)?;
        writeln!(f, "jobs run:    {}", self.jobs_run)?;
        write!(f, "elapsed:     {:.2?}", self.elapsed)?;
        for (kind, count) in &self.failures {
            write!(f, "\nfailed ({kind:?}): {count}")?;
        }
        Ok(())
    }
}

fn call_context(timeout: Option<Duration>) -> Context {
    let background = Context::background();
    match timeout {
        Some(timeout) => background.with_timeout(timeout),
        None => background,
    }
}

/// Split `total` into `parts` shares that differ by at most one.
fn shares(total: usize, parts: usize) -> impl Iterator<Item = usize> {
    let base = total / parts;
    let extra = total % parts;
    (0..parts).map(move |index| base + usize::from(index < extra))
}

pub(crate) async fn run(config: RunnerConfig, args: &Args) -> Result<Report> {
    let (scheduler, owner) = QueueScheduler::spawn_thread(config.name())
        .context("failed to spawn owner thread")?;
    let runner = Runner::new(Counter::default(), scheduler.clone(), config);
    let ops = capabilities()?;
    let bump = ops.get("increment").context("increment not registered")?;
    let peek = ops.get("read").context("read not registered")?;

    tracing::info!(
        runner = %runner.name(),
        calls = args.calls,
        threads = args.threads,
        "Starting workload"
    );
    let started = Instant::now();

    let mut workers = Vec::with_capacity(args.threads);
    for share in shares(args.calls, args.threads) {
        let runner = runner.clone();
        let timeout = args.timeout();
        workers.push(task::spawn_blocking(move || {
            (0..share)
                .map(|_| {
                    runner.call(&call_context(timeout), "increment", move |_, counter| {
                        Ok::<_, RunnerError>(bump(counter))
                    })
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut report = Report {
        runner: runner.name().to_string(),
        calls: args.calls,
        ..Report::default()
    };
    let mut seen = HashSet::with_capacity(args.calls);
    for worker in workers {
        report.record(worker.await?, &mut seen);
    }

    runner.post(&Context::background(), "snapshot", move |_, counter| {
        tracing::info!(value = peek(counter), "Workload drained");
    })?;
    report.final_value = runner
        .call_async(&Context::background(), "read", move |_, counter| {
            Ok::<_, RunnerError>(peek(counter))
        })
        .await?;
    report.elapsed = started.elapsed();

    runner.shutdown();
    scheduler.close();
    report.jobs_run = task::spawn_blocking(move || owner.join())
        .await?
        .map_err(|_| anyhow!("owner thread panicked"))?;

    Ok(report)
}
