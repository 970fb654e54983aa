//! Runner configuration.
//!
//! The raw TOML shape (`max_wait_ms` as a signed integer, where anything `<= 0`
//! means "no implicit timeout") stays private. It is resolved into
//! [`RunnerConfig`] at the deserialization boundary, so a `RunnerConfig` that
//! exists is a valid one.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerConfigError {
    #[error("runner name must not be empty")]
    EmptyName,
}

// Default value function for serde (bool::default() is false, so only true needs a fn)
const fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRunnerConfig {
    name: String,
    #[serde(default)]
    max_wait_ms: i64,
    #[serde(default = "default_true")]
    recover_panics: bool,
}

/// Validated runner configuration.
///
/// Consumed once when a runner is built and immutable afterwards.
///
/// ```toml
/// name = "lua"
/// max_wait_ms = 5000
/// recover_panics = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRunnerConfig")]
pub struct RunnerConfig {
    /// Diagnostic label used in logs and error messages.
    name: String,
    /// Implicit timeout applied to calls whose context has no deadline.
    max_wait: Option<Duration>,
    /// Convert panics raised by work into errors instead of unwinding the owner.
    recover_panics: bool,
}

impl TryFrom<RawRunnerConfig> for RunnerConfig {
    type Error = RunnerConfigError;

    fn try_from(raw: RawRunnerConfig) -> Result<Self, Self::Error> {
        Ok(Self::new(raw.name)?
            .with_max_wait_millis(raw.max_wait_ms)
            .with_recover_panics(raw.recover_panics))
    }
}

impl RunnerConfig {
    /// A config with no implicit timeout and panic recovery enabled.
    pub fn new(name: impl Into<String>) -> Result<Self, RunnerConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RunnerConfigError::EmptyName);
        }
        Ok(Self {
            name,
            max_wait: None,
            recover_panics: true,
        })
    }

    /// Set the implicit timeout. A zero duration disables it.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = (!max_wait.is_zero()).then_some(max_wait);
        self
    }

    /// Set the implicit timeout in milliseconds. Values `<= 0` disable it.
    pub fn with_max_wait_millis(mut self, millis: i64) -> Self {
        self.max_wait = u64::try_from(millis)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        self
    }

    pub fn with_recover_panics(mut self, recover_panics: bool) -> Self {
        self.recover_panics = recover_panics;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    #[must_use]
    pub fn recover_panics(&self) -> bool {
        self.recover_panics
    }
}
