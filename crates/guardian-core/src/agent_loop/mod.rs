//! The bounded think/act/observe loop — spec §4.5.
//!
//! `AgentLoop` owns the policy engine, per-tool circuit breakers, and the
//! injection sanitizer, and exposes `run_turn` as the single entry point
//! a host process drives: propose tool calls, get back a persisted
//! `Turn` with each call's policy-gated outcome. Grounded on the
//! teacher's `reasoning/orchestrator.rs` bounded-step-loop shape, with
//! the model-calling step left to the caller (out of scope here — this
//! crate's job is the safety core around that step, not the model call
//! itself).

pub mod circuit_breaker;
pub mod sanitizer;
mod turns;

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::approval::ApprovalBroker;
use crate::config::{LoopConfig, SanitizerConfig};
use crate::error::LoopError;
use crate::inbox::Inbox;
use crate::policy::{PolicyEngine, TurnContext};
use crate::reasoning_log::ReasoningLog;
use crate::spend::{SpendRecordRequest, SpendTracker};
use crate::store::Store;
use crate::types::{
    AgentState, InputSource, MonotonicId, PolicyAction, ReasoningPhase, SpendCategory,
    SurvivalTier, ToolCallResult, Turn,
};

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError};
pub use sanitizer::{Finding, SanitizeMode, SanitizeResult, Sanitizer, ThreatLevel};
pub use turns::{persist_tool_call, persist_turn, persist_turn_with_inbox_acks, InboxAck};

const AGENT_STATE_KV_KEY: &str = "agent_loop.state";
const LAST_KNOWN_BALANCE_KV_KEY: &str = "agent_loop.last_known_balance_cents";

/// Maximum inbox messages claimed into a single turn when no other input
/// is pending (spec §4.5 "atomically claim up to N inbox messages").
const MAX_INBOX_MESSAGES_PER_TURN: u32 = 5;

/// Tools that don't mutate environment or financial state — every other
/// registered tool counts as mutating for idle-turn detection (spec
/// §4.5 "idle turns are turns that made no mutating tool call").
const NON_MUTATING_TOOLS: &[&str] = &["read_file", "chat", "inference"];

fn is_mutating(tool_name: &str) -> bool {
    !NON_MUTATING_TOOLS.contains(&tool_name)
}

/// Financial category a successful call should be recorded under.
fn spend_category(tool_name: &str) -> Option<SpendCategory> {
    match tool_name {
        "transfer_credits" | "fund_child" => Some(SpendCategory::Transfer),
        "x402_fetch" => Some(SpendCategory::X402),
        "chat" | "inference" => Some(SpendCategory::Inference),
        _ => None,
    }
}

/// What the loop asks the caller to actually do: invoke a tool and
/// report back what happened. The loop decides whether a call may
/// happen and records the outcome; it never performs the side effect
/// itself — that belongs to the sandbox/inference collaborators.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, args: &Value) -> Result<String, String>;
}

/// Supplies the agent's current credit balance (e.g. from a wallet
/// service) — external to this crate (spec §4.2).
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn current_balance_cents(&self) -> Result<i64, String>;
}

/// One proposed tool call, prior to policy evaluation.
#[derive(Debug, Clone)]
pub struct ProposedCall {
    pub tool_name: String,
    pub args: Value,
}

/// Input driving one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub source: InputSource,
    pub text: Option<String>,
}

/// Why a proposed call didn't execute.
#[derive(Debug, Clone, PartialEq)]
pub enum CallRejection {
    Denied { reason_code: String, human_message: String },
    Quarantined { approval_id: String, reason_code: String },
    CircuitOpen { recovery_remaining_secs: u64 },
}

/// Outcome of one proposed call.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Executed(ToolCallResult),
    Rejected(CallRejection),
}

/// In-memory state carried across turns within one process lifetime —
/// reset on restart, unlike the persisted `AgentState` tag.
#[derive(Debug, Default)]
struct LoopTracking {
    consecutive_errors: u32,
    idle_turns: u32,
    recent_signatures: VecDeque<String>,
}

pub struct AgentLoop<'a> {
    store: &'a Store,
    policy: PolicyEngine,
    breakers: CircuitBreakerRegistry,
    sanitizer: Sanitizer,
    config: LoopConfig,
    tracking: tokio::sync::Mutex<LoopTracking>,
}

impl<'a> AgentLoop<'a> {
    pub fn new(store: &'a Store, policy: PolicyEngine, config: LoopConfig, sanitizer_config: SanitizerConfig) -> Self {
        Self {
            store,
            policy,
            breakers: CircuitBreakerRegistry::default(),
            sanitizer: Sanitizer::new(sanitizer_config),
            config,
            tracking: tokio::sync::Mutex::new(LoopTracking::default()),
        }
    }

    /// Read the persisted agent state, defaulting to `Setup` on a fresh
    /// store or a store read failure (fail safe, not fail open).
    pub async fn persisted_state(&self) -> AgentState {
        match self.store.kv_get(AGENT_STATE_KV_KEY).await {
            Ok(Some(raw)) => AgentState::from_persisted(&raw),
            Ok(None) => AgentState::Setup,
            Err(e) => {
                tracing::error!(error = %e, "failed to read persisted agent state, defaulting to setup");
                AgentState::Setup
            }
        }
    }

    pub async fn persist_state(&self, state: AgentState) -> Result<(), LoopError> {
        self.store.kv_set(AGENT_STATE_KV_KEY, state.as_str()).await?;
        Ok(())
    }

    /// Resolve the current survival tier. Prefers a live balance fetch;
    /// if the balance source is unreachable, falls back to the last
    /// cached balance and logs an `api_unreachable` event. A balance
    /// that has never been observed resolves to the `-1` sentinel,
    /// which `SurvivalTier::from_balance_cents` maps to `Critical` —
    /// the fail-safe posture when finances are unknown.
    pub async fn resolve_tier(&self, balances: &dyn BalanceSource) -> SurvivalTier {
        let balance = match balances.current_balance_cents().await {
            Ok(cents) => {
                if let Err(e) = self.store.kv_set(LAST_KNOWN_BALANCE_KV_KEY, &cents.to_string()).await {
                    tracing::error!(error = %e, "failed to cache balance");
                }
                cents
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, event = "api_unreachable", "balance source unreachable, falling back to cache");
                match self.store.kv_get(LAST_KNOWN_BALANCE_KV_KEY).await {
                    Ok(Some(raw)) => raw.parse().unwrap_or(-1),
                    _ => -1,
                }
            }
        };
        SurvivalTier::from_balance_cents(balance)
    }

    /// Execute one proposed tool call under full gating: circuit breaker,
    /// policy engine, sanitization of the result, spend tracking, and
    /// reasoning-log linkage. Does not persist the call row — callers
    /// accumulate outcomes into a `Turn` and persist once via
    /// [`turns::persist_turn`].
    pub async fn execute_call(
        &self,
        turn_id: &MonotonicId,
        turn_context: TurnContext,
        call: &ProposedCall,
        executor: &dyn ToolExecutor,
    ) -> Result<CallOutcome, LoopError> {
        if let Err(open) = self.breakers.check(&call.tool_name).await {
            return Ok(CallOutcome::Rejected(CallRejection::CircuitOpen {
                recovery_remaining_secs: open.recovery_remaining.as_secs(),
            }));
        }

        let decision = self
            .policy
            .evaluate_and_log(&call.tool_name, call.args.clone(), turn_context, Some(turn_id.clone()), Some(self.store))
            .await;

        match decision.action {
            PolicyAction::Deny => {
                self.breakers.record_failure(&call.tool_name).await;
                Ok(CallOutcome::Rejected(CallRejection::Denied {
                    reason_code: decision.reason_code,
                    human_message: decision.human_message,
                }))
            }
            PolicyAction::Quarantine => {
                let approval = ApprovalBroker::new(self.store)
                    .request(
                        &call.tool_name,
                        call.args.clone(),
                        decision.risk_level,
                        &decision.human_message,
                        chrono::Duration::hours(24),
                    )
                    .await?;
                Ok(CallOutcome::Rejected(CallRejection::Quarantined {
                    approval_id: approval.id,
                    reason_code: decision.reason_code,
                }))
            }
            PolicyAction::Allow => {
                let start = std::time::Instant::now();
                let outcome = executor.execute(&call.tool_name, &call.args).await;
                let duration_ms = start.elapsed().as_millis() as u64;

                let (result_text, error) = match outcome {
                    Ok(text) => {
                        self.breakers.record_success(&call.tool_name).await;
                        let sanitized = self.sanitizer.sanitize(&call.tool_name, &text, SanitizeMode::ToolResult);
                        (Some(sanitized.content), None)
                    }
                    Err(err) => {
                        self.breakers.record_failure(&call.tool_name).await;
                        (None, Some(err))
                    }
                };

                if error.is_none() {
                    if let Some(category) = spend_category(&call.tool_name) {
                        if let Some(cents) = call.args.get("amount_cents").and_then(Value::as_i64) {
                            let tracker = SpendTracker::new(self.store);
                            if let Err(e) = tracker
                                .record_spend(SpendRecordRequest {
                                    tool_name: call.tool_name.clone(),
                                    amount_cents: cents,
                                    recipient: call.args.get("recipient").and_then(Value::as_str).map(str::to_string),
                                    domain: call.args.get("domain").and_then(Value::as_str).map(str::to_string),
                                    category,
                                })
                                .await
                            {
                                tracing::error!(error = %e, "failed to record spend");
                            }
                        }
                    }
                }

                Ok(CallOutcome::Executed(ToolCallResult {
                    id: MonotonicId::new(),
                    turn_id: turn_id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: call.args.clone(),
                    result_text,
                    error,
                    duration_ms,
                }))
            }
        }
    }

    /// Run a full turn: sanitize untrusted input, execute up to
    /// `max_tool_calls_per_turn` proposed calls under policy gating,
    /// update loop/idle/error tracking, and persist the turn and its
    /// tool calls atomically.
    pub async fn run_turn(
        &self,
        input: TurnInput,
        proposed_calls: Vec<ProposedCall>,
        executor: &dyn ToolExecutor,
    ) -> Result<Turn, LoopError> {
        let turn_id = MonotonicId::new();
        let reasoning = ReasoningLog::new(self.store);
        let mut step = 0u32;

        // Sanitize explicitly supplied untrusted input (e.g. a heartbeat
        // wake with attached text). A blocked result is never folded into
        // the turn as-is — it's replaced with a placeholder that carries
        // no attacker-controlled content.
        let explicit_input = match (&input.text, input.source) {
            (Some(text), InputSource::Heartbeat | InputSource::Undefined) => {
                let sanitized = self.sanitizer.sanitize("social_address", text, SanitizeMode::SocialAddress);
                if !sanitized.is_clean() {
                    reasoning
                        .append(
                            &turn_id,
                            step,
                            ReasoningPhase::Thinking,
                            &format!(
                                "sanitized untrusted input: {} findings, blocked={}",
                                sanitized.findings.len(),
                                sanitized.blocked
                            ),
                            None,
                            None,
                            None,
                        )
                        .await?;
                    step += 1;
                }
                if sanitized.blocked {
                    Some("[input blocked by injection defense sanitizer]".to_string())
                } else {
                    Some(sanitized.content)
                }
            }
            (text, _) => text.clone(),
        };

        // Inbox injection (spec §4.5): absent other pending input, claim
        // up to N inbox messages, sanitize and concatenate them as input
        // tagged source "agent".
        let mut input_source = input.source;
        let mut claimed_ids: Vec<String> = Vec::new();
        let input_text = if explicit_input.is_some() {
            explicit_input
        } else {
            let inbox = Inbox::new(self.store);
            let claimed = inbox.claim(MAX_INBOX_MESSAGES_PER_TURN).await?;
            if claimed.is_empty() {
                None
            } else {
                let mut parts = Vec::with_capacity(claimed.len());
                for message in &claimed {
                    claimed_ids.push(message.id.clone());
                    let sanitized = self.sanitizer.sanitize(&message.from, &message.content, SanitizeMode::SocialAddress);
                    if sanitized.blocked {
                        reasoning
                            .append(
                                &turn_id,
                                step,
                                ReasoningPhase::Error,
                                &format!("blocked inbox message {} from {}", message.id, message.from),
                                None,
                                None,
                                None,
                            )
                            .await?;
                        step += 1;
                        continue;
                    }
                    parts.push(sanitized.content);
                }
                input_source = InputSource::Agent;
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n---\n"))
                }
            }
        };

        let body_result = self
            .run_turn_body(&turn_id, input_source, input_text, proposed_calls, executor, &reasoning, step)
            .await;

        let turn = match body_result {
            Ok(turn) => turn,
            Err(e) => {
                // Any fallible step failing after an inbox claim means the
                // claim never reaches an ack; put claimed messages back so
                // a future turn can retry them (spec §4.6 "atomic ack" —
                // the rollback side).
                if !claimed_ids.is_empty() {
                    let inbox = Inbox::new(self.store);
                    for id in &claimed_ids {
                        if let Err(reset_err) = inbox.reset_in_progress(std::slice::from_ref(id)).await {
                            tracing::error!(error = %reset_err, id = %id, "failed to reset inbox message after turn error");
                        }
                    }
                }
                return Err(e);
            }
        };

        let acks: Vec<InboxAck> = claimed_ids.into_iter().map(InboxAck::Processed).collect();
        turns::persist_turn_with_inbox_acks(self.store, &turn, &acks).await?;
        Ok(turn)
    }

    /// The fallible bulk of a turn: execute each proposed call under
    /// gating, track loop/idle/error state, and assemble the `Turn` —
    /// split out from [`Self::run_turn`] so a failure here can still
    /// reset any inbox messages already claimed for this turn.
    async fn run_turn_body(
        &self,
        turn_id: &MonotonicId,
        input_source: InputSource,
        input_text: Option<String>,
        proposed_calls: Vec<ProposedCall>,
        executor: &dyn ToolExecutor,
        reasoning: &ReasoningLog<'_>,
        mut step: u32,
    ) -> Result<Turn, LoopError> {
        let bounded_calls = proposed_calls
            .into_iter()
            .take(self.config.max_tool_calls_per_turn as usize);

        let mut tool_calls = Vec::new();
        let mut turn_context = TurnContext::new(input_source);
        let mut had_error = false;
        let mut signature_parts = Vec::new();

        for call in bounded_calls {
            turn_context.turn_tool_call_count = tool_calls.len() as u32;
            signature_parts.push(call.tool_name.clone());

            let outcome = self.execute_call(turn_id, turn_context.clone(), &call, executor).await?;
            match outcome {
                CallOutcome::Executed(result) => {
                    had_error = had_error || result.error.is_some();
                    reasoning
                        .append(
                            turn_id,
                            step,
                            ReasoningPhase::Execute,
                            &format!("called {}", result.tool_name),
                            Some(&result.id),
                            None,
                            None,
                        )
                        .await?;
                    step += 1;
                    tool_calls.push(result);
                }
                CallOutcome::Rejected(rejection) => {
                    had_error = true;
                    reasoning
                        .append(turn_id, step, ReasoningPhase::Error, &format!("{rejection:?}"), None, None, None)
                        .await?;
                    step += 1;
                }
            }
        }

        self.update_tracking(had_error, &tool_calls, signature_parts).await;

        Ok(Turn {
            id: turn_id.clone(),
            created_at: Utc::now(),
            state: AgentState::Running.as_str().to_string(),
            input_text,
            input_source: Some(input_source.as_str().to_string()),
            assistant_text: None,
            tool_calls,
            token_usage: 0,
            cost_cents: 0,
        })
    }

    async fn update_tracking(&self, had_error: bool, tool_calls: &[ToolCallResult], signature_parts: Vec<String>) {
        let mut tracking = self.tracking.lock().await;

        tracking.consecutive_errors = if had_error { tracking.consecutive_errors + 1 } else { 0 };

        if tool_calls.iter().any(|c| is_mutating(&c.tool_name)) {
            tracking.idle_turns = 0;
        } else {
            tracking.idle_turns += 1;
        }

        let signature = signature_parts.join(",");
        tracking.recent_signatures.push_back(signature);
        while tracking.recent_signatures.len() > self.config.max_repetitive_turns as usize {
            tracking.recent_signatures.pop_front();
        }
    }

    /// True once the last `max_consecutive_errors` turns all recorded an
    /// error — callers should transition to `Sleeping` and back off.
    pub async fn consecutive_errors_exceeded(&self) -> bool {
        self.tracking.lock().await.consecutive_errors >= self.config.max_consecutive_errors
    }

    /// True once the last `max_idle_turns` turns made no mutating call.
    pub async fn idle_exceeded(&self) -> bool {
        self.tracking.lock().await.idle_turns >= self.config.max_idle_turns
    }

    /// True if the last `max_repetitive_turns` turns all issued the exact
    /// same non-empty sequence of tool names — a sign the agent is stuck.
    pub async fn repetitive_loop_detected(&self) -> bool {
        let tracking = self.tracking.lock().await;
        let needed = self.config.max_repetitive_turns as usize;
        if tracking.recent_signatures.len() < needed {
            return false;
        }
        if tracking.recent_signatures.iter().any(String::is_empty) {
            return false;
        }
        let first = &tracking.recent_signatures[0];
        tracking.recent_signatures.iter().all(|s| s == first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::policy;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, _tool_name: &str, _args: &Value) -> Result<String, String> {
            Ok("ok".to_string())
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl ToolExecutor for FailingExecutor {
        async fn execute(&self, _tool_name: &str, _args: &Value) -> Result<String, String> {
            Err("boom".to_string())
        }
    }

    struct FixedBalance(i64);

    #[async_trait]
    impl BalanceSource for FixedBalance {
        async fn current_balance_cents(&self) -> Result<i64, String> {
            Ok(self.0)
        }
    }

    struct UnreachableBalance;

    #[async_trait]
    impl BalanceSource for UnreachableBalance {
        async fn current_balance_cents(&self) -> Result<i64, String> {
            Err("timeout".to_string())
        }
    }

    fn agent_loop(store: &Store) -> AgentLoop<'_> {
        let policy = policy::default_engine(&PolicyConfig::default());
        AgentLoop::new(store, policy, LoopConfig::default(), SanitizerConfig::default())
    }

    #[tokio::test]
    async fn allowed_call_executes_and_persists() {
        let store = Store::open_in_memory().unwrap();
        let loop_ = agent_loop(&store);
        let turn = loop_
            .run_turn(
                TurnInput { source: InputSource::Agent, text: None },
                vec![ProposedCall { tool_name: "read_file".to_string(), args: json!({"path": "README.md"}) }],
                &EchoExecutor,
            )
            .await
            .unwrap();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].result_text.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn denied_call_is_rejected_not_executed() {
        let store = Store::open_in_memory().unwrap();
        let loop_ = agent_loop(&store);
        let turn = loop_
            .run_turn(
                TurnInput { source: InputSource::Agent, text: None },
                vec![ProposedCall {
                    tool_name: "write_file".to_string(),
                    args: json!({"path": "/root/.guardian/wallet.json"}),
                }],
                &EchoExecutor,
            )
            .await
            .unwrap();
        assert!(turn.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn consecutive_failures_trip_error_threshold() {
        let store = Store::open_in_memory().unwrap();
        let mut config = LoopConfig::default();
        config.max_consecutive_errors = 2;
        let policy = policy::default_engine(&PolicyConfig::default());
        let loop_ = AgentLoop::new(&store, policy, config, SanitizerConfig::default());

        for _ in 0..2 {
            loop_
                .run_turn(
                    TurnInput { source: InputSource::Agent, text: None },
                    vec![ProposedCall { tool_name: "read_file".to_string(), args: json!({"path": "x"}) }],
                    &FailingExecutor,
                )
                .await
                .unwrap();
        }
        assert!(loop_.consecutive_errors_exceeded().await);
    }

    #[tokio::test]
    async fn idle_turns_with_no_mutating_calls_trip_idle_threshold() {
        let store = Store::open_in_memory().unwrap();
        let mut config = LoopConfig::default();
        config.max_idle_turns = 2;
        let policy = policy::default_engine(&PolicyConfig::default());
        let loop_ = AgentLoop::new(&store, policy, config, SanitizerConfig::default());

        for _ in 0..2 {
            loop_
                .run_turn(
                    TurnInput { source: InputSource::Agent, text: None },
                    vec![ProposedCall { tool_name: "read_file".to_string(), args: json!({"path": "x"}) }],
                    &EchoExecutor,
                )
                .await
                .unwrap();
        }
        assert!(loop_.idle_exceeded().await);
    }

    #[tokio::test]
    async fn repeated_identical_tool_sequences_are_flagged() {
        let store = Store::open_in_memory().unwrap();
        let mut config = LoopConfig::default();
        config.max_repetitive_turns = 2;
        let policy = policy::default_engine(&PolicyConfig::default());
        let loop_ = AgentLoop::new(&store, policy, config, SanitizerConfig::default());

        for _ in 0..2 {
            loop_
                .run_turn(
                    TurnInput { source: InputSource::Agent, text: None },
                    vec![ProposedCall { tool_name: "read_file".to_string(), args: json!({"path": "x"}) }],
                    &EchoExecutor,
                )
                .await
                .unwrap();
        }
        assert!(loop_.repetitive_loop_detected().await);
    }

    #[tokio::test]
    async fn balance_source_failure_falls_back_to_cache_then_sentinel() {
        let store = Store::open_in_memory().unwrap();
        let loop_ = agent_loop(&store);

        assert_eq!(loop_.resolve_tier(&FixedBalance(500)).await, SurvivalTier::High);
        assert_eq!(loop_.resolve_tier(&UnreachableBalance).await, SurvivalTier::High);
    }

    #[tokio::test]
    async fn unknown_balance_resolves_to_critical_sentinel() {
        let store = Store::open_in_memory().unwrap();
        let loop_ = agent_loop(&store);
        assert_eq!(loop_.resolve_tier(&UnreachableBalance).await, SurvivalTier::Critical);
    }

    #[tokio::test]
    async fn claims_inbox_messages_as_input_when_none_pending() {
        use crate::inbox::Inbox;
        use crate::types::InboxMessage;
        use crate::types::InboxStatus;

        let store = Store::open_in_memory().unwrap();
        let loop_ = agent_loop(&store);
        let inbox = Inbox::new(&store);
        inbox
            .receive(&InboxMessage {
                id: "msg-1".to_string(),
                from: "peer-a".to_string(),
                to: "self".to_string(),
                content: "hello from the inbox".to_string(),
                signed_at: None,
                received_at: Utc::now(),
                processed_at: None,
                status: InboxStatus::Received,
                retry_count: 0,
                max_retries: 3,
            })
            .await
            .unwrap();

        let turn = loop_
            .run_turn(TurnInput { source: InputSource::Agent, text: None }, vec![], &EchoExecutor)
            .await
            .unwrap();

        assert_eq!(turn.input_source.as_deref(), Some("agent"));
        assert!(turn.input_text.as_deref().unwrap().contains("hello from the inbox"));
        let message = inbox.get("msg-1").await.unwrap().unwrap();
        assert_eq!(message.status, InboxStatus::Processed);
    }

    #[tokio::test]
    async fn persisted_state_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let loop_ = agent_loop(&store);
        assert_eq!(loop_.persisted_state().await, AgentState::Setup);
        loop_.persist_state(AgentState::Running).await.unwrap();
        assert_eq!(loop_.persisted_state().await, AgentState::Running);
    }
}
