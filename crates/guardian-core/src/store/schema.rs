//! SQL schema for the persistent store — spec §6's required table list.
//!
//! Tables beyond the four core components (identity, installed_tools,
//! soul_history, the memory tiers, inference_costs, model_registry) are
//! owned by external collaborators per spec §1; this crate only needs to
//! guarantee their shape exists and is versioned alongside everything
//! else, so no Rust accessor is provided for them here.

/// Schema applied by migration 1. Kept as one batch, mirroring the
/// teacher's `SqliteJobStore::init_schema` (`execute_batch` with
/// `CREATE TABLE IF NOT EXISTS` + indexes).
pub const MIGRATION_1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    state TEXT NOT NULL,
    input_text TEXT,
    input_source TEXT,
    assistant_text TEXT,
    token_usage INTEGER NOT NULL DEFAULT 0,
    cost_cents INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tool_calls (
    id TEXT PRIMARY KEY,
    turn_id TEXT NOT NULL REFERENCES turns(id),
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL,
    result_text TEXT,
    error TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tool_calls_turn_id ON tool_calls(turn_id);

CREATE TABLE IF NOT EXISTS policy_decisions (
    id TEXT PRIMARY KEY,
    turn_id TEXT,
    tool_name TEXT NOT NULL,
    args_hash TEXT NOT NULL,
    risk_level TEXT NOT NULL,
    decision TEXT NOT NULL CHECK (decision IN ('allow','deny','quarantine')),
    rules_evaluated TEXT NOT NULL DEFAULT '[]',
    rules_triggered TEXT NOT NULL DEFAULT '[]',
    reason_code TEXT NOT NULL,
    human_message TEXT NOT NULL,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_policy_decisions_args_hash ON policy_decisions(args_hash);
CREATE INDEX IF NOT EXISTS idx_policy_decisions_tool_decision ON policy_decisions(tool_name, decision, created_at);

CREATE TABLE IF NOT EXISTS spend_tracking (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_name TEXT NOT NULL,
    amount_cents INTEGER NOT NULL CHECK (amount_cents >= 0),
    recipient TEXT,
    domain TEXT,
    category TEXT NOT NULL CHECK (category IN ('transfer','x402','inference','other')),
    window_hour TEXT NOT NULL,
    window_day TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spend_category_hour ON spend_tracking(category, window_hour);
CREATE INDEX IF NOT EXISTS idx_spend_category_day ON spend_tracking(category, window_day);

CREATE TABLE IF NOT EXISTS inbox_messages (
    id TEXT PRIMARY KEY,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    content TEXT NOT NULL,
    signed_at TEXT,
    received_at TEXT NOT NULL,
    processed_at TEXT,
    status TEXT NOT NULL CHECK (status IN ('received','in_progress','processed','failed')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3
);
CREATE INDEX IF NOT EXISTS idx_inbox_status ON inbox_messages(status);

CREATE TABLE IF NOT EXISTS heartbeat_schedule (
    task_name TEXT PRIMARY KEY,
    schedule_expr TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 100,
    timeout_ms INTEGER NOT NULL DEFAULT 30000,
    max_retries INTEGER NOT NULL DEFAULT 1,
    tier_minimum TEXT NOT NULL DEFAULT 'critical',
    last_run_at TEXT,
    next_run_at TEXT,
    last_result TEXT,
    last_error TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    fail_count INTEGER NOT NULL DEFAULT 0,
    lease_owner TEXT,
    lease_expires_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_heartbeat_schedule_next_run ON heartbeat_schedule(next_run_at);

CREATE TABLE IF NOT EXISTS heartbeat_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_ms INTEGER,
    result TEXT NOT NULL CHECK (result IN ('success','failure','timeout','skipped')),
    error TEXT,
    should_wake INTEGER
);
CREATE INDEX IF NOT EXISTS idx_heartbeat_history_task ON heartbeat_history(task_name, started_at);

CREATE TABLE IF NOT EXISTS heartbeat_dedup (
    key TEXT PRIMARY KEY,
    task_name TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heartbeat_dedup_expires ON heartbeat_dedup(expires_at);

CREATE TABLE IF NOT EXISTS wake_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    reason TEXT NOT NULL,
    payload TEXT,
    consumed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_wake_events_consumed ON wake_events(consumed, id);

CREATE TABLE IF NOT EXISTS reasoning_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    turn_id TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    phase TEXT NOT NULL CHECK (phase IN ('thinking','plan','waiting_approval','execute','error')),
    content TEXT NOT NULL,
    linked_tool_call_id TEXT,
    linked_policy_id TEXT,
    linked_approval_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reasoning_steps_turn ON reasoning_steps(turn_id, step_number);

CREATE TABLE IF NOT EXISTS approval_requests (
    id TEXT PRIMARY KEY,
    tool_name TEXT NOT NULL,
    tool_args TEXT NOT NULL,
    risk_level TEXT NOT NULL,
    human_message TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending','approved','denied','expired')),
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    resolved_at TEXT,
    resolver TEXT
);
CREATE INDEX IF NOT EXISTS idx_approval_requests_status ON approval_requests(status);

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- External-collaborator-owned tables: persistence contract only, no
-- accessor surface in this crate (spec §1 Non-goals / §6).
CREATE TABLE IF NOT EXISTS identity (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS installed_tools (
    name TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    installed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS soul_history (
    version INTEGER PRIMARY KEY,
    previous_version INTEGER,
    change_source TEXT NOT NULL CHECK (change_source IN ('agent','human','system','genesis','reflection')),
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS working_memory (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS episodic_memory (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS semantic_memory (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS procedural_memory (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS relationship_memory (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inference_costs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model TEXT NOT NULL,
    cost_cents INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS model_registry (
    model TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Ordered list of (version, sql) migrations. Each is applied inside its
/// own transaction and must be idempotent (safe to re-run) — spec §4.1.
pub fn migrations() -> Vec<(u32, &'static str)> {
    vec![(1, MIGRATION_1)]
}

/// The highest schema version this build understands. The store refuses
/// to open a database whose recorded version exceeds this.
pub const KNOWN_SCHEMA_VERSION: u32 = 1;
