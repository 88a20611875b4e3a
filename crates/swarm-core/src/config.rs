//! Swarm-wide configuration, loaded from TOML the way the rest of the
//! pack's CLI tools configure themselves, with `serde(default)` filling
//! in sane values for anything the caller omits. Unknown keys are
//! accepted and ignored by `toml`'s default deserialization behavior.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::economics::{BudgetConfig, BudgetMode};
use crate::health::HealthThresholds;
use crate::queue::{ConflictStrategy, QueueConfig};
use crate::resilience::ResilienceConfig;
use crate::types::SubtaskType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse swarm config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Maximum dispatch attempts per subtask. Recognized under the alias
    /// `worker_retries` too -- the two names describe the same budget.
    #[serde(alias = "worker_retries")]
    pub max_dispatches_per_task: u32,
    pub partial_dependency_threshold: f64,
    pub file_conflict_strategy: FileConflictStrategyConfig,
    pub max_tokens: u64,
    pub warning_threshold: f64,
    pub throttle_threshold: f64,
    pub extension_allowance_tokens: u64,
    pub max_extensions: u32,
    pub health_min_samples: u32,
    pub health_max_failure_rate: f64,
    pub health_max_hollow_rate: f64,
    pub health_max_rate_limits_per_window: u32,
    pub health_max_quality_rejections: u32,
    pub micro_decompose_min_complexity: u8,
    pub degraded_acceptance_min_tool_calls: i64,
    /// Minimum response length (bytes) below which a zero-tool-call
    /// completion is hollow outright, independent of its wording.
    pub hollow_output_threshold: usize,
    pub max_task_duration_secs: u64,
    pub max_idle_duration_secs: u64,
    pub wrapup_duration_secs: u64,
    pub event_bus_capacity: usize,
    /// Milliseconds to sleep between successive dispatch spawns within a
    /// wave, so a burst of concurrent calls against the same provider
    /// doesn't immediately trip its rate limiter.
    pub dispatch_stagger_ms: u64,
    /// Consecutive timeouts against the same model before it is logged
    /// as a standing problem, independent of the rolling failure-rate
    /// health check.
    pub consecutive_timeout_limit: u32,
    /// Whether a quality-gate rejection path is active at all (the gate
    /// itself is invoked by the caller; this only controls whether its
    /// verdict is allowed to affect model health).
    pub quality_gates: bool,
    pub auto_split_enabled: bool,
    /// Minimum complexity (inclusive) for a subtask to be offered to the
    /// auto-split judge.
    pub auto_split_complexity_floor: u8,
    pub auto_split_max_subtasks: usize,
    /// Subtask types eligible for auto-split. Defaults to everything
    /// except research/review/document, which are not meaningfully
    /// divisible the way an implementation task is.
    pub auto_split_splittable_types: BTreeSet<SubtaskType>,
    pub enable_model_failover: bool,
    /// Recognized but not wired to a subsystem in this design -- there is
    /// no persistence layer, external verification pass, or wave-review
    /// gate here, so these are accepted the way `toml` accepts any
    /// unrecognized key: present for forward compatibility with a config
    /// file that names them.
    pub enable_persistence: bool,
    pub enable_verification: bool,
    pub enable_wave_review: bool,
    pub max_cost: Option<f64>,
    pub soft_cost_limit: Option<f64>,
    pub max_duration_secs: Option<u64>,
    pub soft_duration_limit_secs: Option<u64>,
    pub max_iterations: Option<u32>,
    pub target_iterations: Option<u32>,
    pub budget_mode: BudgetModeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetModeConfig {
    Strict,
    DoomloopOnly,
}

impl From<BudgetModeConfig> for BudgetMode {
    fn from(value: BudgetModeConfig) -> Self {
        match value {
            BudgetModeConfig::Strict => BudgetMode::Strict,
            BudgetModeConfig::DoomloopOnly => BudgetMode::DoomloopOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileConflictStrategyConfig {
    Serialize,
    Ignore,
}

impl From<FileConflictStrategyConfig> for ConflictStrategy {
    fn from(value: FileConflictStrategyConfig) -> Self {
        match value {
            FileConflictStrategyConfig::Serialize => ConflictStrategy::Serialize,
            FileConflictStrategyConfig::Ignore => ConflictStrategy::Ignore,
        }
    }
}

fn default_splittable_types() -> BTreeSet<SubtaskType> {
    [SubtaskType::Implement, SubtaskType::Test, SubtaskType::Refactor, SubtaskType::Verify].into_iter().collect()
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_dispatches_per_task: 3,
            partial_dependency_threshold: 0.5,
            file_conflict_strategy: FileConflictStrategyConfig::Serialize,
            max_tokens: 2_000_000,
            warning_threshold: 0.7,
            throttle_threshold: 0.85,
            extension_allowance_tokens: 200_000,
            max_extensions: 2,
            health_min_samples: 5,
            health_max_failure_rate: 0.5,
            health_max_hollow_rate: 0.3,
            health_max_rate_limits_per_window: 2,
            health_max_quality_rejections: 3,
            micro_decompose_min_complexity: 6,
            degraded_acceptance_min_tool_calls: 1,
            hollow_output_threshold: 40,
            max_task_duration_secs: 1800,
            max_idle_duration_secs: 300,
            wrapup_duration_secs: 60,
            event_bus_capacity: 1024,
            dispatch_stagger_ms: 150,
            consecutive_timeout_limit: 3,
            quality_gates: false,
            auto_split_enabled: false,
            auto_split_complexity_floor: 9,
            auto_split_max_subtasks: 4,
            auto_split_splittable_types: default_splittable_types(),
            enable_model_failover: true,
            enable_persistence: false,
            enable_verification: false,
            enable_wave_review: false,
            max_cost: None,
            soft_cost_limit: None,
            max_duration_secs: None,
            soft_duration_limit_secs: None,
            max_iterations: None,
            target_iterations: None,
            budget_mode: BudgetModeConfig::Strict,
        }
    }
}

impl SwarmConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.partial_dependency_threshold) {
            return Err(ConfigError::Invalid("partial_dependency_threshold must be in [0,1]".into()));
        }
        if !(0.0..=1.0).contains(&self.warning_threshold) {
            return Err(ConfigError::Invalid("warning_threshold must be in [0,1]".into()));
        }
        if !(0.0..=1.0).contains(&self.throttle_threshold) {
            return Err(ConfigError::Invalid("throttle_threshold must be in [0,1]".into()));
        }
        if self.warning_threshold > self.throttle_threshold {
            return Err(ConfigError::Invalid("warning_threshold must not exceed throttle_threshold".into()));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be greater than zero".into()));
        }
        if self.max_dispatches_per_task == 0 {
            return Err(ConfigError::Invalid("max_dispatches_per_task must be greater than zero".into()));
        }
        if self.auto_split_enabled && self.auto_split_max_subtasks == 0 {
            return Err(ConfigError::Invalid("auto_split_max_subtasks must be greater than zero when auto-split is enabled".into()));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_dispatches_per_task: self.max_dispatches_per_task,
            partial_dependency_threshold: self.partial_dependency_threshold,
            file_conflict_strategy: self.file_conflict_strategy.into(),
        }
    }

    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            max_tokens: self.max_tokens,
            warning_threshold: self.warning_threshold,
            throttle_threshold: self.throttle_threshold,
            extension_allowance_tokens: self.extension_allowance_tokens,
            max_extensions: self.max_extensions,
            max_cost: self.max_cost,
            soft_cost_limit: self.soft_cost_limit,
            max_duration: self.max_duration_secs.map(std::time::Duration::from_secs),
            soft_duration_limit: self.soft_duration_limit_secs.map(std::time::Duration::from_secs),
            max_iterations: self.max_iterations,
            target_iterations: self.target_iterations,
            mode: self.budget_mode.into(),
        }
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            min_samples: self.health_min_samples,
            max_failure_rate: self.health_max_failure_rate,
            max_hollow_rate: self.health_max_hollow_rate,
            max_rate_limits_per_window: self.health_max_rate_limits_per_window,
            max_quality_rejections: self.health_max_quality_rejections,
        }
    }

    pub fn resilience_config(&self) -> ResilienceConfig {
        ResilienceConfig {
            micro_decompose_min_complexity: self.micro_decompose_min_complexity,
            degraded_acceptance_min_tool_calls: self.degraded_acceptance_min_tool_calls,
            hollow_output_threshold: self.hollow_output_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        SwarmConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config = SwarmConfig::from_toml("max_tokens = 500000\n").unwrap();
        assert_eq!(config.max_tokens, 500_000);
        assert_eq!(config.max_dispatches_per_task, 3);
    }

    #[test]
    fn worker_retries_alias_feeds_max_dispatches_per_task() {
        let config = SwarmConfig::from_toml("worker_retries = 5\n").unwrap();
        assert_eq!(config.max_dispatches_per_task, 5);
    }

    #[test]
    fn warning_above_throttle_is_rejected() {
        let mut config = SwarmConfig::default();
        config.warning_threshold = 0.9;
        config.throttle_threshold = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_tokens_is_rejected() {
        let mut config = SwarmConfig::default();
        config.max_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_subtasks_rejected_only_when_auto_split_enabled() {
        let mut config = SwarmConfig::default();
        config.auto_split_max_subtasks = 0;
        assert!(config.validate().is_ok(), "auto-split is disabled by default, so this is harmless");
        config.auto_split_enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn budget_related_keys_round_trip_through_toml() {
        let config = SwarmConfig::from_toml(
            "max_cost = 12.5\n\
             soft_cost_limit = 10.0\n\
             max_duration_secs = 3600\n\
             soft_duration_limit_secs = 2400\n\
             max_iterations = 50\n\
             target_iterations = 40\n\
             budget_mode = \"doomloop_only\"\n",
        )
        .unwrap();
        assert_eq!(config.max_cost, Some(12.5));
        assert_eq!(config.soft_cost_limit, Some(10.0));
        assert_eq!(config.max_duration_secs, Some(3600));
        assert_eq!(config.soft_duration_limit_secs, Some(2400));
        assert_eq!(config.max_iterations, Some(50));
        assert_eq!(config.target_iterations, Some(40));
        assert_eq!(config.budget_mode, BudgetModeConfig::DoomloopOnly);

        let budget = config.budget_config();
        assert_eq!(budget.max_cost, Some(12.5));
        assert_eq!(budget.soft_cost_limit, Some(10.0));
        assert_eq!(budget.max_duration, Some(std::time::Duration::from_secs(3600)));
        assert_eq!(budget.soft_duration_limit, Some(std::time::Duration::from_secs(2400)));
        assert_eq!(budget.max_iterations, Some(50));
        assert_eq!(budget.target_iterations, Some(40));
        assert_eq!(budget.mode, BudgetMode::DoomloopOnly);
    }

    #[test]
    fn budget_fields_default_to_none_and_strict_mode() {
        let config = SwarmConfig::default();
        assert_eq!(config.max_cost, None);
        assert_eq!(config.soft_cost_limit, None);
        assert_eq!(config.max_duration_secs, None);
        assert_eq!(config.max_iterations, None);
        assert_eq!(config.budget_mode, BudgetModeConfig::Strict);
        let budget = config.budget_config();
        assert_eq!(budget.mode, BudgetMode::Strict);
    }
}
