//! Configuration management for guardian-core.
//!
//! Provides centralized, serde-backed configuration with secure defaults
//! and environment-variable overrides (`GUARDIAN_<SECTION>__<FIELD>`).

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the guardian core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    pub store: StoreConfig,
    pub policy: PolicyConfig,
    pub scheduler: SchedulerConfig,
    pub loop_config: LoopConfig,
    pub sanitizer: SanitizerConfig,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            policy: PolicyConfig::default(),
            scheduler: SchedulerConfig::default(),
            loop_config: LoopConfig::default(),
            sanitizer: SanitizerConfig::default(),
        }
    }
}

impl GuardianConfig {
    /// Load defaults, then apply any recognized environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("GUARDIAN_STORE__PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("GUARDIAN_POLICY__MAX_SINGLE_TRANSFER_CENTS") {
            if let Ok(n) = v.parse() {
                self.policy.max_single_transfer_cents = n;
            }
        }
        if let Ok(v) = env::var("GUARDIAN_SCHEDULER__TICK_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.scheduler.tick_interval_secs = n;
            }
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// How often the checkpoint operation should run, in seconds.
    pub checkpoint_interval_secs: u64,
    /// KV pruning retention window, in days.
    pub kv_retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            checkpoint_interval_secs: 300,
            kv_retention_days: 30,
        }
    }
}

fn default_store_path() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("guardian").join("guardian.db")
}

/// Treasury / financial policy configuration — §6 of the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub max_single_transfer_cents: i64,
    pub max_hourly_transfer_cents: i64,
    pub max_daily_transfer_cents: i64,
    pub minimum_reserve_cents: i64,
    pub max_x402_payment_cents: i64,
    pub x402_allowed_domains: Vec<String>,
    pub transfer_cooldown_ms: u64,
    pub max_transfers_per_turn: u32,
    pub max_inference_daily_cents: i64,
    pub require_confirmation_above_cents: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_single_transfer_cents: 5000,
            max_hourly_transfer_cents: 10000,
            max_daily_transfer_cents: 25000,
            minimum_reserve_cents: 1000,
            max_x402_payment_cents: 100,
            x402_allowed_domains: vec!["conway.tech".to_string()],
            transfer_cooldown_ms: 0,
            max_transfers_per_turn: 2,
            max_inference_daily_cents: 50000,
            require_confirmation_above_cents: 1000,
        }
    }
}

/// Durable scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub low_compute_multiplier: u32,
    pub default_task_timeout_secs: u64,
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            low_compute_multiplier: 4,
            default_task_timeout_secs: 30,
            default_max_retries: 1,
        }
    }
}

/// Agent loop configuration — turn bounds, loop/idle/error thresholds,
/// and the token budget allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_tool_calls_per_turn: u32,
    pub max_repetitive_turns: u32,
    pub max_idle_turns: u32,
    pub max_consecutive_errors: u32,
    pub idle_sleep_secs: u64,
    pub error_sleep_secs: u64,
    pub token_budget: TokenBudget,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_tool_calls_per_turn: 10,
            max_repetitive_turns: 3,
            max_idle_turns: 3,
            max_consecutive_errors: 5,
            idle_sleep_secs: 60,
            error_sleep_secs: 300,
            token_budget: TokenBudget::default(),
        }
    }
}

/// Token budget allocation; components must sum to `total`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    pub total: u32,
    pub system_prompt: u32,
    pub recent_turns: u32,
    pub tool_results: u32,
    pub memory: u32,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            total: 100_000,
            system_prompt: 20_000,
            recent_turns: 50_000,
            tool_results: 20_000,
            memory: 10_000,
        }
    }
}

impl TokenBudget {
    pub fn is_consistent(&self) -> bool {
        self.system_prompt + self.recent_turns + self.tool_results + self.memory == self.total
    }
}

/// Injection-defense sanitizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerConfig {
    pub max_size_bytes: usize,
    pub per_source_rate_limit_per_minute: u32,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024,
            per_source_rate_limit_per_minute: 11,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_token_budget_is_consistent() {
        assert!(TokenBudget::default().is_consistent());
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = GuardianConfig::default();
        assert_eq!(config.policy.max_single_transfer_cents, 5000);
        assert_eq!(config.policy.max_hourly_transfer_cents, 10000);
        assert_eq!(config.policy.max_daily_transfer_cents, 25000);
        assert_eq!(config.policy.require_confirmation_above_cents, 1000);
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.loop_config.max_tool_calls_per_turn, 10);
    }

    #[test]
    fn env_override_applies() {
        env::set_var("GUARDIAN_POLICY__MAX_SINGLE_TRANSFER_CENTS", "9999");
        let config = GuardianConfig::load();
        assert_eq!(config.policy.max_single_transfer_cents, 9999);
        env::remove_var("GUARDIAN_POLICY__MAX_SINGLE_TRANSFER_CENTS");
    }
}
