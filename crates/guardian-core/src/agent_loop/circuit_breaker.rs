//! Per-tool circuit breaker — backs the agent loop's consecutive-error
//! gating (spec §4.5 "MAX_CONSECUTIVE_ERRORS"). Closed → Open → HalfOpen,
//! grounded on the teacher's `reasoning/circuit_breaker.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("circuit open for tool '{tool_name}': {consecutive_failures} consecutive failures, recovery in {recovery_remaining:?}")]
pub struct CircuitOpenError {
    pub tool_name: String,
    pub consecutive_failures: u32,
    pub recovery_remaining: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
        }
    }

    pub fn check(&mut self, tool_name: &str) -> Result<(), CircuitOpenError> {
        match &self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 1;
                    tracing::info!(tool = tool_name, "circuit breaker transitioning to half-open");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        tool_name: tool_name.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: self.config.recovery_timeout - opened_at.elapsed(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        tool_name: tool_name.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: Duration::from_secs(0),
                    })
                }
            }
        }
    }

    pub fn record_success(&mut self, tool_name: &str) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.half_open_calls = 0;
                tracing::info!(tool = tool_name, "circuit breaker recovered, now closed");
            }
            CircuitState::Open { .. } => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
            }
        }
    }

    pub fn record_failure(&mut self, tool_name: &str) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open { opened_at: Instant::now() };
                    tracing::warn!(tool = tool_name, failures = self.failure_count, "circuit breaker tripped open");
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open { opened_at: Instant::now() };
                self.half_open_calls = 0;
                tracing::warn!(tool = tool_name, "circuit breaker recovery failed, back to open");
            }
            CircuitState::Open { .. } => {
                self.failure_count += 1;
            }
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Registry of per-tool breakers, shared across the agent loop.
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    pub async fn check(&self, tool_name: &str) -> Result<(), CircuitOpenError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(tool_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.check(tool_name)
    }

    pub async fn record_success(&self, tool_name: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(tool_name) {
            breaker.record_success(tool_name);
        }
    }

    pub async fn record_failure(&self, tool_name: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(tool_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.record_failure(tool_name);
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed_and_allows_calls() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(*cb.state(), CircuitState::Closed);
        assert!(cb.check("tool").is_ok());
    }

    #[test]
    fn trips_open_after_threshold_consecutive_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
            half_open_max_calls: 1,
        };
        let mut cb = CircuitBreaker::new(config);
        for _ in 0..4 {
            cb.record_failure("tool");
            assert_eq!(*cb.state(), CircuitState::Closed);
        }
        cb.record_failure("tool");
        assert!(matches!(*cb.state(), CircuitState::Open { .. }));
        assert!(cb.check("tool").is_err());
    }

    #[test]
    fn recovers_through_half_open_on_success() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(1),
            half_open_max_calls: 1,
        };
        let mut cb = CircuitBreaker::new(config);
        cb.record_failure("tool");
        cb.record_failure("tool");
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.check("tool").is_ok());
        assert_eq!(*cb.state(), CircuitState::HalfOpen);
        cb.record_success("tool");
        assert_eq!(*cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_isolates_breakers_per_tool() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..5 {
            registry.record_failure("failing_tool").await;
        }
        assert!(registry.check("failing_tool").await.is_err());
        assert!(registry.check("healthy_tool").await.is_ok());
    }
}
