//! Rule shape — spec §4.3.1.
//!
//! Rules are values, not subclasses (spec §9): the registry is a vector
//! of trait objects, grounded on the teacher's `ReasoningPolicyGate`
//! trait-object pattern in `reasoning/policy_bridge.rs`.

use std::collections::HashSet;

use serde_json::Value;

use crate::types::{AuthorityLevel, RiskLevel};

/// A tool call under evaluation, plus the turn-level context the rules
/// need (spec §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolMeta {
    pub name: String,
    pub category: String,
    pub risk_level: RiskLevel,
}

/// Turn-scoped context accompanying a policy request.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub input_source: crate::types::InputSource,
    pub turn_tool_call_count: u32,
    pub session_spend_cents: i64,
    /// Current account balance, when known to the caller. Backs
    /// `financial.minimum_reserve` (spec §9 open question 1: lifted
    /// into a real enforcing rule rather than kept as an inert
    /// declaration).
    pub account_balance_cents: Option<i64>,
}

impl TurnContext {
    pub fn new(input_source: crate::types::InputSource) -> Self {
        Self {
            input_source,
            turn_tool_call_count: 0,
            session_spend_cents: 0,
            account_balance_cents: None,
        }
    }
}

/// One evaluation request.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub tool: ToolMeta,
    pub args: Value,
    pub turn_context: TurnContext,
}

impl PolicyRequest {
    pub fn authority(&self) -> AuthorityLevel {
        self.turn_context.input_source.authority()
    }
}

/// Selector for which requests a rule applies to.
#[derive(Debug, Clone)]
pub enum AppliesTo {
    All,
    ByName(HashSet<String>),
    ByCategory(HashSet<String>),
    ByRisk(HashSet<RiskLevel>),
    /// Matches if either of the two selectors would match — used where
    /// the spec's own rule catalogue is ambiguous between a name-based
    /// and category-based vector (spec §9 open question 2).
    Any(Vec<AppliesTo>),
}

impl AppliesTo {
    pub fn matches(&self, tool: &ToolMeta) -> bool {
        match self {
            AppliesTo::All => true,
            AppliesTo::ByName(names) => names.contains(&tool.name),
            AppliesTo::ByCategory(categories) => categories.contains(&tool.category),
            AppliesTo::ByRisk(levels) => levels.contains(&tool.risk_level),
            AppliesTo::Any(selectors) => selectors.iter().any(|s| s.matches(tool)),
        }
    }
}

/// Outcome of one rule's evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Allow,
    Deny,
    Quarantine,
}

/// The result a rule returns when it has something to say about a
/// request. `None` (via `evaluate` returning `Option<RuleResult>`) means
/// the rule has no opinion.
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub rule_id: String,
    pub outcome: RuleOutcome,
    pub reason_code: String,
    pub human_message: String,
}

impl RuleResult {
    pub fn deny(rule_id: &str, reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            outcome: RuleOutcome::Deny,
            reason_code: reason_code.to_string(),
            human_message: message.into(),
        }
    }

    pub fn quarantine(rule_id: &str, reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            outcome: RuleOutcome::Quarantine,
            reason_code: reason_code.to_string(),
            human_message: message.into(),
        }
    }
}

/// A pure-data predicate over a request. Evaluation may consult the
/// store (e.g. rate-limit rules query the decision log) but must never
/// raise across this boundary — see `engine::PolicyEngine::evaluate`'s
/// fail-closed wrapper.
#[async_trait::async_trait]
pub trait Rule: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    fn priority(&self) -> i32;
    fn applies_to(&self) -> &AppliesTo;

    /// Evaluate the rule. `store` is `None` when the caller has no store
    /// available (used by tests exercising the fail-closed store-missing
    /// path directly); rules that need the store must return
    /// `deny("DB_UNAVAILABLE")` rather than panicking.
    async fn evaluate(
        &self,
        request: &PolicyRequest,
        store: Option<&crate::store::Store>,
    ) -> Result<Option<RuleResult>, anyhow::Error>;
}
