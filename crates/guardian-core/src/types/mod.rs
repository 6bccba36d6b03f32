//! Core data model: the entities described in spec §3.
//!
//! Timestamps are `chrono::DateTime<Utc>`; identifiers for turns and tool
//! calls use [`MonotonicId`], a fixed-width hex encoding of
//! (millisecond timestamp, monotonic counter) that sorts lexicographically
//! in creation order, matching the "unique id (monotonic lexicographic
//! identifier)" requirement in spec §3.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

static MONOTONIC_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A monotonically increasing, lexicographically sortable identifier.
///
/// Encoded as 12 hex digits of millisecond timestamp followed by 16 hex
/// digits of a process-wide monotonic counter. Fixed width hex sorts
/// identically to numeric order, so two ids compare correctly as plain
/// strings (which is how they're stored and indexed).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonotonicId(pub String);

impl MonotonicId {
    pub fn new() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let counter = MONOTONIC_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:012x}{:016x}", millis, counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MonotonicId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MonotonicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MonotonicId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The trust tag derived from a turn's input source — spec §4.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    Undefined,
    Heartbeat,
    Creator,
    Agent,
    System,
    Wakeup,
}

impl InputSource {
    pub fn authority(self) -> AuthorityLevel {
        match self {
            InputSource::Undefined | InputSource::Heartbeat => AuthorityLevel::External,
            InputSource::Creator | InputSource::Agent => AuthorityLevel::Agent,
            InputSource::System | InputSource::Wakeup => AuthorityLevel::System,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InputSource::Undefined => "undefined",
            InputSource::Heartbeat => "heartbeat",
            InputSource::Creator => "creator",
            InputSource::Agent => "agent",
            InputSource::System => "system",
            InputSource::Wakeup => "wakeup",
        }
    }
}

/// Derived trust tag of the input source that initiated a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorityLevel {
    External,
    Agent,
    System,
}

/// Risk level declared per tool — used by rule selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Safe,
    Caution,
    Dangerous,
    Forbidden,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Caution => "caution",
            RiskLevel::Dangerous => "dangerous",
            RiskLevel::Forbidden => "forbidden",
        }
    }
}

/// A tool registered at startup: name, category, risk level, handler
/// (the handler itself lives outside this crate — the sandbox/inference
/// collaborators own execution; this crate only needs the declared shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreTool {
    pub name: String,
    pub category: String,
    pub risk_level: RiskLevel,
}

/// One cycle of the agent loop — spec §3 "Turn".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: MonotonicId,
    pub created_at: DateTime<Utc>,
    pub state: String,
    pub input_text: Option<String>,
    pub input_source: Option<String>,
    pub assistant_text: Option<String>,
    pub tool_calls: Vec<ToolCallResult>,
    pub token_usage: u64,
    pub cost_cents: i64,
}

/// Child of a turn: the result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: MonotonicId,
    pub turn_id: MonotonicId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result_text: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One action tag returned by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    Quarantine,
}

impl PolicyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Deny => "deny",
            PolicyAction::Quarantine => "quarantine",
        }
    }
}

/// Append-only record of one policy evaluation — spec §3 "PolicyDecision".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub id: MonotonicId,
    pub turn_id: Option<MonotonicId>,
    pub tool_name: String,
    pub args_hash: String,
    pub risk_level: RiskLevel,
    pub action: PolicyAction,
    pub rules_evaluated: Vec<String>,
    pub rules_triggered: Vec<String>,
    pub reason_code: String,
    pub human_message: String,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Spend category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendCategory {
    Transfer,
    X402,
    Inference,
    Other,
}

impl SpendCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SpendCategory::Transfer => "transfer",
            SpendCategory::X402 => "x402",
            SpendCategory::Inference => "inference",
            SpendCategory::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(SpendCategory::Transfer),
            "x402" => Some(SpendCategory::X402),
            "inference" => Some(SpendCategory::Inference),
            "other" => Some(SpendCategory::Other),
            _ => None,
        }
    }
}

/// One recorded spend row — spec §3 "SpendEntry".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendEntry {
    pub id: i64,
    pub tool_name: String,
    pub amount_cents: i64,
    pub recipient: Option<String>,
    pub domain: Option<String>,
    pub category: SpendCategory,
    pub window_hour: String,
    pub window_day: String,
    pub created_at: DateTime<Utc>,
}

/// Inbox message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Received,
    InProgress,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InboxStatus::Received => "received",
            InboxStatus::InProgress => "in_progress",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "received" => Some(InboxStatus::Received),
            "in_progress" => Some(InboxStatus::InProgress),
            "processed" => Some(InboxStatus::Processed),
            "failed" => Some(InboxStatus::Failed),
            _ => None,
        }
    }
}

/// An inbound message — spec §3 "InboxMessage".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub signed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: InboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// A recurring scheduler task definition — spec §3 "HeartbeatSchedule".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSchedule {
    pub task_name: String,
    pub schedule_expr: ScheduleExpr,
    pub enabled: bool,
    pub priority: i32,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub tier_minimum: SurvivalTier,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub fail_count: u64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Either a cron expression or a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleExpr {
    Cron(String),
    IntervalSecs(u64),
}

/// Result tag of one scheduled execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Failure,
    Timeout,
    Skipped,
}

impl RunResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::Failure => "failure",
            RunResult::Timeout => "timeout",
            RunResult::Skipped => "skipped",
        }
    }
}

/// One execution history row — spec §3 "HeartbeatHistory".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatHistory {
    pub id: i64,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: RunResult,
    pub error: Option<String>,
    pub should_wake: Option<bool>,
}

/// A dedup key guarding at-most-once processing of an external event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupKey {
    pub key: String,
    pub task_name: String,
    pub expires_at: DateTime<Utc>,
}

/// A wake event enqueued by a task or external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeEvent {
    pub id: i64,
    pub source: String,
    pub reason: String,
    pub payload: Option<serde_json::Value>,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}

/// Phase tag of one reasoning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPhase {
    Thinking,
    Plan,
    WaitingApproval,
    Execute,
    Error,
}

impl ReasoningPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningPhase::Thinking => "thinking",
            ReasoningPhase::Plan => "plan",
            ReasoningPhase::WaitingApproval => "waiting_approval",
            ReasoningPhase::Execute => "execute",
            ReasoningPhase::Error => "error",
        }
    }
}

/// Append-only per-turn reasoning step — spec §3 "ReasoningStep".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub id: i64,
    pub turn_id: MonotonicId,
    pub step_number: u32,
    pub phase: ReasoningPhase,
    pub content: String,
    pub linked_tool_call_id: Option<MonotonicId>,
    pub linked_policy_id: Option<MonotonicId>,
    pub linked_approval_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Status of an out-of-band approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }
}

/// Quarantine resolution request — spec §3 "ApprovalRequest".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub risk_level: RiskLevel,
    pub human_message: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolver: Option<String>,
}

/// Survival tier bucketed from credit balance — spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SurvivalTier {
    Dead,
    Critical,
    LowCompute,
    Normal,
    High,
}

impl SurvivalTier {
    /// Pure mapping from credit balance (cents) to tier. Zero credits maps
    /// to `Critical`, never `Dead` — `Dead` is explicit-only (spec §9 open
    /// question 3 / SPEC_FULL.md decision 3).
    pub fn from_balance_cents(balance_cents: i64) -> Self {
        match balance_cents {
            b if b <= 10 => SurvivalTier::Critical,
            b if b <= 50 => SurvivalTier::LowCompute,
            b if b <= 100 => SurvivalTier::Normal,
            _ => SurvivalTier::High,
        }
    }
}

/// Agent loop state — spec §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Setup,
    Waking,
    Running,
    Sleeping,
    LowCompute,
    Critical,
    Dead,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Setup => "setup",
            AgentState::Waking => "waking",
            AgentState::Running => "running",
            AgentState::Sleeping => "sleeping",
            AgentState::LowCompute => "low_compute",
            AgentState::Critical => "critical",
            AgentState::Dead => "dead",
        }
    }

    /// Parse a persisted state tag, coercing anything unrecognized to
    /// `Setup` (spec §4.5: "invalid persisted state coerces to setup at
    /// load with an error log").
    pub fn from_persisted(s: &str) -> Self {
        match s {
            "setup" => AgentState::Setup,
            "waking" => AgentState::Waking,
            "running" => AgentState::Running,
            "sleeping" => AgentState::Sleeping,
            "low_compute" => AgentState::LowCompute,
            "critical" => AgentState::Critical,
            "dead" => AgentState::Dead,
            other => {
                tracing::error!(persisted_state = other, "invalid persisted agent state, coercing to setup");
                AgentState::Setup
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ids_sort_in_creation_order() {
        let a = MonotonicId::new();
        let b = MonotonicId::new();
        let c = MonotonicId::new();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn authority_derivation_matches_spec_table() {
        assert_eq!(InputSource::Undefined.authority(), AuthorityLevel::External);
        assert_eq!(InputSource::Heartbeat.authority(), AuthorityLevel::External);
        assert_eq!(InputSource::Creator.authority(), AuthorityLevel::Agent);
        assert_eq!(InputSource::Agent.authority(), AuthorityLevel::Agent);
        assert_eq!(InputSource::System.authority(), AuthorityLevel::System);
        assert_eq!(InputSource::Wakeup.authority(), AuthorityLevel::System);
    }

    #[test]
    fn survival_tier_zero_balance_is_critical_never_dead() {
        assert_eq!(SurvivalTier::from_balance_cents(0), SurvivalTier::Critical);
        assert_eq!(SurvivalTier::from_balance_cents(10), SurvivalTier::Critical);
        assert_eq!(SurvivalTier::from_balance_cents(11), SurvivalTier::LowCompute);
        assert_eq!(SurvivalTier::from_balance_cents(50), SurvivalTier::LowCompute);
        assert_eq!(SurvivalTier::from_balance_cents(51), SurvivalTier::Normal);
        assert_eq!(SurvivalTier::from_balance_cents(100), SurvivalTier::Normal);
        assert_eq!(SurvivalTier::from_balance_cents(101), SurvivalTier::High);
    }

    #[test]
    fn invalid_persisted_state_coerces_to_setup() {
        assert_eq!(AgentState::from_persisted("garbage"), AgentState::Setup);
        assert_eq!(AgentState::from_persisted("dead"), AgentState::Dead);
    }
}
