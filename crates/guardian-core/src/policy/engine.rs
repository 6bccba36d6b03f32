//! Policy engine — spec §4.3.
//!
//! Priority-ordered evaluation with fail-closed semantics and durable,
//! append-only decision logging.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;

use crate::store::Store;
use crate::types::{MonotonicId, PolicyAction, PolicyDecision as PolicyDecisionRecord, RiskLevel};

use super::rule::{PolicyRequest, Rule, RuleOutcome, ToolMeta, TurnContext};

/// Outcome returned to the caller (distinct from the persisted record,
/// which additionally carries a generated id and timestamp).
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason_code: String,
    pub human_message: String,
    pub rules_evaluated: Vec<String>,
    pub rules_triggered: Vec<String>,
    pub args_hash: String,
    pub tool_name: String,
    pub risk_level: RiskLevel,
    pub latency_ms: u64,
}

/// Priority-ordered rule registry plus the tool catalogue needed to
/// resolve `category`/`risk_level` for a bare tool name.
pub struct PolicyEngine {
    rules: Vec<Box<dyn Rule>>,
    tools: HashMap<String, ToolMeta>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            tools: HashMap::new(),
        }
    }

    /// Register a rule. Rules are re-sorted by priority (ascending) after
    /// every registration; equal-priority rules keep insertion order
    /// (a stable sort guarantees this) — spec §4.3.3 step 1.
    pub fn register_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.priority());
    }

    /// Register a tool's declared shape so bare tool names can be
    /// resolved to category/risk for selector matching.
    pub fn register_tool(&mut self, tool: ToolMeta) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn tool(&self, name: &str) -> Option<&ToolMeta> {
        self.tools.get(name)
    }

    /// Evaluate a request and persist the resulting decision. Logging
    /// failure must not suppress returning the decision upstream (spec
    /// §4.3.4) — the persistence error is logged, not returned.
    pub async fn evaluate_and_log(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        turn_context: TurnContext,
        turn_id: Option<MonotonicId>,
        store: Option<&Store>,
    ) -> PolicyDecision {
        let decision = self.evaluate(tool_name, args, turn_context, store).await;

        if let Some(store) = store {
            let record = PolicyDecisionRecord {
                id: MonotonicId::new(),
                turn_id,
                tool_name: decision.tool_name.clone(),
                args_hash: decision.args_hash.clone(),
                risk_level: decision.risk_level,
                action: decision.action,
                rules_evaluated: decision.rules_evaluated.clone(),
                rules_triggered: decision.rules_triggered.clone(),
                reason_code: decision.reason_code.clone(),
                human_message: decision.human_message.clone(),
                latency_ms: decision.latency_ms,
                created_at: Utc::now(),
            };
            if let Err(e) = persist_decision(store, &record).await {
                tracing::error!(error = %e, "failed to persist policy decision");
            }
        }

        decision
    }

    /// Evaluate a request without persisting it. `evaluate_and_log` is
    /// the entry point production code should use; this is exposed for
    /// tests and for the rate-limit-without-store scenario (spec §8
    /// scenario 5).
    pub async fn evaluate(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        turn_context: TurnContext,
        store: Option<&Store>,
    ) -> PolicyDecision {
        let start = Instant::now();
        let args_hash = super::hashing::args_hash(&args);

        let tool = match self.tools.get(tool_name) {
            Some(t) => t.clone(),
            None => {
                return PolicyDecision {
                    action: PolicyAction::Deny,
                    reason_code: "UNKNOWN_TOOL".to_string(),
                    human_message: format!("Unknown tool: {tool_name}"),
                    rules_evaluated: Vec::new(),
                    rules_triggered: Vec::new(),
                    args_hash,
                    tool_name: tool_name.to_string(),
                    risk_level: RiskLevel::Forbidden,
                    latency_ms: elapsed_ms(start),
                };
            }
        };

        let request = PolicyRequest {
            tool: tool.clone(),
            args,
            turn_context,
        };

        let mut rules_evaluated = Vec::new();
        let mut rules_triggered = Vec::new();
        let mut first_quarantine: Option<(String, String, String)> = None;

        for rule in self.rules.iter().filter(|r| r.applies_to().matches(&tool)) {
            rules_evaluated.push(rule.id().to_string());

            let outcome = rule.evaluate(&request, store).await;
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(rule = rule.id(), tool = tool_name, error = %e, "rule evaluator failed");
                    rules_triggered.push(rule.id().to_string());
                    return PolicyDecision {
                        action: PolicyAction::Deny,
                        reason_code: "RULE_ERROR".to_string(),
                        human_message: format!("Rule {} failed: {}", rule.id(), e),
                        rules_evaluated,
                        rules_triggered,
                        args_hash,
                        tool_name: tool_name.to_string(),
                        risk_level: tool.risk_level,
                        latency_ms: elapsed_ms(start),
                    };
                }
            };

            let Some(result) = result else { continue };
            rules_triggered.push(result.rule_id.clone());

            match result.outcome {
                RuleOutcome::Deny => {
                    return PolicyDecision {
                        action: PolicyAction::Deny,
                        reason_code: result.reason_code,
                        human_message: result.human_message,
                        rules_evaluated,
                        rules_triggered,
                        args_hash,
                        tool_name: tool_name.to_string(),
                        risk_level: tool.risk_level,
                        latency_ms: elapsed_ms(start),
                    };
                }
                RuleOutcome::Quarantine => {
                    if first_quarantine.is_none() {
                        first_quarantine =
                            Some((result.reason_code, result.human_message, result.rule_id));
                    }
                }
                RuleOutcome::Allow => {}
            }
        }

        if let Some((reason_code, human_message, _rule_id)) = first_quarantine {
            return PolicyDecision {
                action: PolicyAction::Quarantine,
                reason_code,
                human_message,
                rules_evaluated,
                rules_triggered,
                args_hash,
                tool_name: tool_name.to_string(),
                risk_level: tool.risk_level,
                latency_ms: elapsed_ms(start),
            };
        }

        PolicyDecision {
            action: PolicyAction::Allow,
            reason_code: "ALLOWED".to_string(),
            human_message: "Allowed".to_string(),
            rules_evaluated,
            rules_triggered,
            args_hash,
            tool_name: tool_name.to_string(),
            risk_level: tool.risk_level,
            latency_ms: elapsed_ms(start),
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

async fn persist_decision(
    store: &Store,
    record: &PolicyDecisionRecord,
) -> Result<(), crate::error::StoreError> {
    let rules_evaluated = serde_json::to_string(&record.rules_evaluated)
        .map_err(|e| crate::error::StoreError::Serialization(e.to_string()))?;
    let rules_triggered = serde_json::to_string(&record.rules_triggered)
        .map_err(|e| crate::error::StoreError::Serialization(e.to_string()))?;
    let turn_id = record.turn_id.as_ref().map(|id| id.to_string());

    store
        .read(|conn| {
            conn.execute(
                "INSERT INTO policy_decisions
                    (id, turn_id, tool_name, args_hash, risk_level, decision,
                     rules_evaluated, rules_triggered, reason_code, human_message,
                     latency_ms, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                rusqlite::params![
                    record.id.to_string(),
                    turn_id,
                    record.tool_name,
                    record.args_hash,
                    record.risk_level.as_str(),
                    record.action.as_str(),
                    rules_evaluated,
                    rules_triggered,
                    record.reason_code,
                    record.human_message,
                    record.latency_ms as i64,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
}

/// Count `allow` decisions for a tool in the last `window` — used by
/// rate-limit rules. Returns an error if the store is unreachable so
/// callers can fail closed with `DB_UNAVAILABLE`.
pub async fn count_recent_allows(
    store: &Store,
    tool_name: &str,
    since: chrono::DateTime<Utc>,
) -> Result<i64, crate::error::StoreError> {
    let since = since.to_rfc3339();
    let tool_name = tool_name.to_string();
    store
        .read(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM policy_decisions
                 WHERE tool_name = ?1 AND decision = 'allow' AND created_at >= ?2",
                rusqlite::params![tool_name, since],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
}
