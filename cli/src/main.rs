//! tether CLI - exercise a runner under concurrent load.
//!
//! ```text
//! tether [--config PATH] [--runner KEY] [--calls N] [--threads N] [--timeout-ms N]
//! ```
//!
//! Builds a runner around a counter resource owned by a dedicated queue
//! thread, fires `--calls` increments from `--threads` blocking callers, then
//! reads the counter back with an async call. A clean run ends with the counter
//! equal to the number of successful increments and no duplicate values.

mod stress;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tether_config::TetherConfig;
use tether_core::RunnerConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_RUNNER_KEY: &str = "default";
const DEFAULT_CALLS: usize = 500;
const DEFAULT_THREADS: usize = 8;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[derive(Debug, Parser)]
#[command(name = "tether")]
#[command(about = "Drive a single-owner runner from many threads and report what happened")]
struct Args {
    /// Config file to read instead of ~/.tether/config.toml
    #[arg(long)]
    config: Option<PathBuf>,
    /// Key of the [runners.<key>] table to use
    #[arg(long, default_value = DEFAULT_RUNNER_KEY)]
    runner: String,
    /// Total number of increment calls
    #[arg(long, default_value_t = DEFAULT_CALLS, value_parser = positive_count)]
    calls: usize,
    /// Number of blocking caller threads
    #[arg(long, default_value_t = DEFAULT_THREADS, value_parser = positive_count)]
    threads: usize,
    /// Per-call timeout in milliseconds; 0 disables it
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,
}

impl Args {
    fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for Args {
    fn default() -> Self {
        Self::parse_from(["tether"])
    }
}

fn positive_count(raw: &str) -> Result<usize, String> {
    let count: usize = raw.parse().map_err(|err| format!("{err}"))?;
    if count == 0 {
        return Err("must be at least 1".to_string());
    }
    Ok(count)
}

/// Resolve the runner config: explicit file, then `~/.tether/config.toml`,
/// then built-in defaults named after the runner key.
fn runner_config(args: &Args) -> Result<RunnerConfig> {
    let file = match &args.config {
        Some(path) => Some(TetherConfig::load_from(path)?),
        None => TetherConfig::load()?,
    };

    if let Some(config) = file.as_ref().and_then(|file| file.runner(&args.runner)) {
        return Ok(config.clone());
    }
    if args.config.is_some() {
        bail!("no [runners.{}] table in config", args.runner);
    }
    tracing::debug!(runner = %args.runner, "No config found; using defaults");
    Ok(RunnerConfig::new(&args.runner)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = runner_config(&args)?;
    let report = stress::run(config, &args).await?;

    println!("{report}");
    if !report.is_consistent() {
        bail!("runner produced inconsistent results");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(["tether"].into_iter().chain(args.iter().copied()))
    }

    #[test]
    fn defaults_without_arguments() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.config, None);
        assert_eq!(args.runner, DEFAULT_RUNNER_KEY);
        assert_eq!(args.calls, DEFAULT_CALLS);
        assert_eq!(args.threads, DEFAULT_THREADS);
        assert_eq!(args.timeout(), None);
    }

    #[test]
    fn parses_all_flags() {
        let args = parse(&[
            "--config",
            "/tmp/tether.toml",
            "--runner",
            "lua",
            "--calls",
            "40",
            "--threads",
            "4",
            "--timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/tether.toml")));
        assert_eq!(args.runner, "lua");
        assert_eq!(args.calls, 40);
        assert_eq!(args.threads, 4);
        assert_eq!(args.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn zero_timeout_means_none() {
        assert_eq!(parse(&["--timeout-ms", "0"]).unwrap().timeout(), None);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["--calls"]).is_err());
        assert!(parse(&["--calls", "zero"]).is_err());
        assert!(parse(&["--threads", "0"]).is_err());
        assert!(parse(&["--timeout-ms", "-5"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
    }

    #[test]
    fn positive_count_rejects_zero() {
        assert_eq!(positive_count("3"), Ok(3));
        assert!(positive_count("0").is_err());
        assert!(positive_count("").is_err());
    }

    #[test]
    fn explicit_config_without_runner_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runners.other]\nname = \"other\"\n").unwrap();

        let args = Args {
            config: Some(path.clone()),
            ..Args::default()
        };
        assert!(runner_config(&args).is_err());

        let args = Args {
            config: Some(path),
            runner: "other".to_string(),
            ..Args::default()
        };
        assert_eq!(runner_config(&args).unwrap().name(), "other");
    }
}
