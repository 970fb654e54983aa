//! Configuration loading for tether.
//!
//! Runner configurations live in `~/.tether/config.toml`, one table per runner:
//!
//! ```toml
//! [runners.lua]
//! name = "lua-engine"
//! max_wait_ms = 5000
//! recover_panics = true
//! ```
//!
//! Each table is validated into a [`RunnerConfig`] while parsing; an invalid
//! table fails the whole load rather than being silently skipped.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tether_types::RunnerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Parsed `config.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    #[serde(default)]
    runners: BTreeMap<String, RunnerConfig>,
}

impl TetherConfig {
    /// Load the config from the default location.
    ///
    /// Returns `Ok(None)` when there is no home directory or no config file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(path = %path.display(), "Failed to read config: {err}");
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::parse(&content) {
            Ok(config) => {
                tracing::debug!(
                    path = %path.display(),
                    runners = config.runners.len(),
                    "Loaded config"
                );
                Ok(config)
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "Failed to parse config: {err}");
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Runner config stored under `[runners.<key>]`.
    #[must_use]
    pub fn runner(&self, key: &str) -> Option<&RunnerConfig> {
        self.runners.get(key)
    }

    /// All runner configs, ordered by key.
    pub fn runners(&self) -> impl Iterator<Item = (&str, &RunnerConfig)> {
        self.runners.iter().map(|(key, config)| (key.as_str(), config))
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn empty_document_has_no_runners() {
        let config = TetherConfig::parse("").unwrap();
        assert_eq!(config.runners().count(), 0);
    }

    #[test]
    fn parses_runner_tables() {
        let config = TetherConfig::parse(
            r#"
            [runners.lua]
            name = "lua-engine"
            max_wait_ms = 5000

            [runners.sql]
            name = "sqlite"
            recover_panics = false
            "#,
        )
        .unwrap();

        let lua = config.runner("lua").unwrap();
        assert_eq!(lua.name(), "lua-engine");
        assert_eq!(lua.max_wait(), Some(Duration::from_secs(5)));
        assert!(lua.recover_panics());

        let sql = config.runner("sql").unwrap();
        assert_eq!(sql.max_wait(), None);
        assert!(!sql.recover_panics());

        let keys: Vec<&str> = config.runners().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["lua", "sql"]);
    }

    #[test]
    fn invalid_runner_fails_whole_parse() {
        let err = TetherConfig::parse(
            r#"
            [runners.bad]
            name = " "
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("runner name must not be empty"));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[runners.a]\nname = \"alpha\"\n").unwrap();

        let config = TetherConfig::load_from(&path).unwrap();
        assert_eq!(config.runner("a").unwrap().name(), "alpha");
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let err = TetherConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn load_from_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "invalid toml [").unwrap();

        let err = TetherConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn config_path_is_under_home() {
        if let Some(path) = config_path() {
            assert!(path.ends_with(".tether/config.toml"));
        }
    }
}
