//! Layered configuration: defaults, then an optional TOML file, then
//! `STRAND_*` environment variables.

use crate::engine::{ConsolidationRule, EngineConfig};
use crate::error::QueryError;
use crate::telemetry::tracing_event_listener;
use crate::types::ConsolidationFunc;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "strand.toml";
/// Prefix of environment overrides, e.g. `STRAND_MAX_GRID_STEP`.
pub const ENV_PREFIX: &str = "STRAND";

/// `[[consolidation]]` entry: metrics matching `pattern` use `func`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidationFileRule {
    pub pattern: String,
    pub func: ConsolidationFunc,
}

/// Engine settings as read from file + env. Every field optional for layering.
#[derive(Debug, Default, Deserialize)]
pub struct EngineFileConfig {
    pub max_grid_step: Option<i64>,
    pub fallback_step: Option<i64>,
    pub fetch_timeout_ms: Option<u64>,
    pub worker_threads: Option<usize>,
    /// Route engine events to `tracing`.
    pub log_events: Option<bool>,
    /// Metric index used by `search`.
    pub index_file: Option<String>,
    #[serde(default)]
    pub consolidation: Vec<ConsolidationFileRule>,
}

/// Where to read configuration from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Explicit file; must exist.
    pub file: Option<PathBuf>,
    /// Skip every file, including the default one.
    pub no_config: bool,
}

impl EngineFileConfig {
    /// Loads and merges the configured sources.
    ///
    /// # Errors
    /// Returns `ConfigError` if an explicit file is missing, a source cannot be
    /// parsed, or a value has the wrong type.
    pub fn load(sources: &ConfigSources) -> Result<Self, QueryError> {
        let mut builder = Config::builder();

        if !sources.no_config {
            match &sources.file {
                Some(path) => {
                    if !path.exists() {
                        return Err(QueryError::ConfigError(format!(
                            "config file not found: {}",
                            path.display()
                        )));
                    }
                    builder = builder.add_source(File::from(path.as_path()).required(true));
                }
                None => {
                    let default_path = Path::new(DEFAULT_CONFIG_FILE);
                    if default_path.exists() {
                        builder = builder.add_source(File::from(default_path).required(false));
                    }
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        let merged = builder.build().map_err(|e| QueryError::ConfigError(e.to_string()))?;
        merged
            .try_deserialize()
            .map_err(|e| QueryError::ConfigError(e.to_string()))
    }

    /// Merges onto `base`, overwriting only fields that are set.
    ///
    /// # Errors
    /// Returns `ConfigError` for non-positive steps or a zero worker count, and
    /// `InvalidPattern` for a bad consolidation pattern.
    pub fn apply(&self, base: &mut EngineConfig) -> Result<(), QueryError> {
        if let Some(step) = self.max_grid_step {
            if step <= 0 {
                return Err(QueryError::ConfigError(format!("max_grid_step must be positive, got {}", step)));
            }
            base.max_grid_step = step;
        }
        if let Some(step) = self.fallback_step {
            if step <= 0 {
                return Err(QueryError::ConfigError(format!("fallback_step must be positive, got {}", step)));
            }
            base.fallback_step = step;
        }
        if let Some(ms) = self.fetch_timeout_ms {
            base.fetch_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(n) = self.worker_threads {
            if n == 0 {
                return Err(QueryError::ConfigError("worker_threads must be at least 1".to_string()));
            }
            base.worker_threads = Some(n);
        }
        if self.log_events == Some(true) {
            base.event_listener = tracing_event_listener();
        }
        if !self.consolidation.is_empty() {
            base.consolidation_rules = self
                .consolidation
                .iter()
                .map(|rule| ConsolidationRule::new(&rule.pattern, rule.func))
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }

    /// Default engine configuration with this file config applied.
    pub fn to_engine_config(&self) -> Result<EngineConfig, QueryError> {
        let mut config = EngineConfig::default();
        self.apply(&mut config)?;
        Ok(config)
    }
}
