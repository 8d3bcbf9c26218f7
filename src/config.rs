use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Top-level configuration, read from `~/.conductor/conductor.toml`.
///
/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Execution settings for the workflow coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Concurrency bound used when a definition leaves `max_parallel_tasks` at 0.
    pub default_max_parallel_tasks: usize,
    /// Soft timeout per task when the workflow carries no duration estimate.
    pub default_task_timeout_ms: u64,
    /// Slack applied to the estimate-derived per-task timeout.
    pub task_timeout_factor: f64,
    /// Sweep passes after the level groups for blocked or waiting tasks.
    pub max_retry_passes: u32,
    /// Pause after a sweep pass that dispatched nothing.
    pub retry_backoff_ms: u64,
    /// Capacity of the coordinator event channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_max_parallel_tasks: 4,
            default_task_timeout_ms: 300_000,
            task_timeout_factor: 1.5,
            max_retry_passes: 3,
            retry_backoff_ms: 100,
            event_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Routing heuristic and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    pub confidence_threshold: f64,
    pub cache_max_entries: usize,
    pub cache_eviction_interval_secs: u64,
    pub specialization_weight: f64,
    pub skill_weight: f64,
    pub performance_weight: f64,
    /// Active task count at which an agent's load factor reaches zero.
    pub load_saturation: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.75,
            cache_max_entries: 1000,
            cache_eviction_interval_secs: 300,
            specialization_weight: 0.4,
            skill_weight: 0.3,
            performance_weight: 0.3,
            load_saturation: 10,
        }
    }
}

impl RoutingConfig {
    pub fn cache_eviction_interval(&self) -> Duration {
        Duration::from_secs(self.cache_eviction_interval_secs)
    }
}

/// Agent registry settings, including the skill-nudging parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub performance_history_size: usize,
    pub learning_enabled: bool,
    pub default_learning_rate: f64,
    /// Score recorded against an agent whose task timed out.
    pub timeout_penalty_score: f64,
    /// Score recorded against an agent whose task failed.
    pub failure_score: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            performance_history_size: 100,
            learning_enabled: true,
            default_learning_rate: 0.1,
            timeout_penalty_score: 0.1,
            failure_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub collection_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval_ms: 5_000,
        }
    }
}

impl MetricsConfig {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms.max(1))
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Config::load_from path={}", path.display());
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            "Config loaded: max_parallel={}, confidence_threshold={}, history={}",
            config.coordinator.default_max_parallel_tasks,
            config.routing.confidence_threshold,
            config.registry.performance_history_size
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            debug!("Creating conductor directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject values the coordinator cannot work with.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::Validation(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("routing.confidence_threshold", self.routing.confidence_threshold)?;
        unit("registry.default_learning_rate", self.registry.default_learning_rate)?;
        unit("registry.timeout_penalty_score", self.registry.timeout_penalty_score)?;
        unit("registry.failure_score", self.registry.failure_score)?;

        if self.registry.performance_history_size == 0 {
            return Err(Error::Validation(
                "registry.performance_history_size must be at least 1".to_string(),
            ));
        }
        if self.coordinator.task_timeout_factor <= 0.0 {
            return Err(Error::Validation(
                "coordinator.task_timeout_factor must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
