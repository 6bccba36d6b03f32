//! Crash-safe heartbeat scheduler — spec §4.4.
//!
//! Grounded on the teacher's `scheduler/heartbeat.rs` (adaptive tick
//! interval, history accounting) and `scheduler/job_store.rs` (durable
//! row-per-task persistence, due-task query shape). Leases make task
//! execution exclusive across process restarts; dedup keys give
//! external wake sources at-most-once delivery; wake events are a FIFO
//! queue the agent loop drains between turns.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use rusqlite::{params, OptionalExtension};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::store::Store;
use crate::types::{
    DedupKey, HeartbeatHistory, HeartbeatSchedule, MonotonicId, RunResult, ScheduleExpr,
    SurvivalTier, WakeEvent,
};

/// Supplies the agent's current credit and USDC balances for the tick
/// that's about to run — external to this crate (spec §4.2/§4.4). Fetched
/// once per tick; every task in that tick shares the same reading.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn current_balances_cents(&self) -> Result<(i64, i64), String>;
}

/// One tick's worth of context: which tasks are due, gated by survival
/// tier, in priority order, plus the shared balance reading and store
/// handle every task in this tick sees (spec §4.4 step 2 — "all tasks in
/// the tick share this context, no further balance fetches").
pub struct TickContext<'a> {
    pub tick_id: MonotonicId,
    pub started_at: DateTime<Utc>,
    pub credit_balance_cents: i64,
    pub usdc_balance_cents: i64,
    pub tier: SurvivalTier,
    pub low_compute_multiplier: u32,
    pub config: SchedulerConfig,
    pub db: &'a Store,
    pub due_tasks: Vec<HeartbeatSchedule>,
}

/// Outcome of one `Scheduler::tick` pass.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick_id: Option<MonotonicId>,
    pub ran: Vec<(String, RunResult)>,
    /// True if this call returned immediately because another tick was
    /// already in flight (spec §4.4 step 1 "overlap guard").
    pub skipped_overlap: bool,
}

/// Durable task definitions and their execution history/leases/dedup.
pub struct Scheduler<'a> {
    store: &'a Store,
    config: SchedulerConfig,
    tick_in_flight: AtomicBool,
}

impl<'a> Scheduler<'a> {
    pub fn new(store: &'a Store, config: SchedulerConfig) -> Self {
        Self { store, config, tick_in_flight: AtomicBool::new(false) }
    }

    /// Insert or replace a task definition.
    pub async fn upsert_task(&self, task: &HeartbeatSchedule) -> Result<(), SchedulerError> {
        let schedule_expr = encode_schedule(&task.schedule_expr);
        let next_run_at = compute_next_run(&task.schedule_expr, Utc::now())?;
        self.store
            .read(move |conn| {
                conn.execute(
                    "INSERT INTO heartbeat_schedule
                        (task_name, schedule_expr, enabled, priority, timeout_ms, max_retries,
                         tier_minimum, last_run_at, next_run_at, last_result, last_error,
                         run_count, fail_count, lease_owner, lease_expires_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,NULL,?8,NULL,NULL,0,0,NULL,NULL)
                     ON CONFLICT(task_name) DO UPDATE SET
                        schedule_expr = excluded.schedule_expr,
                        enabled = excluded.enabled,
                        priority = excluded.priority,
                        timeout_ms = excluded.timeout_ms,
                        max_retries = excluded.max_retries,
                        tier_minimum = excluded.tier_minimum,
                        next_run_at = excluded.next_run_at",
                    params![
                        task.task_name,
                        schedule_expr,
                        task.enabled as i64,
                        task.priority,
                        task.timeout_ms as i64,
                        task.max_retries,
                        tier_str(task.tier_minimum),
                        next_run_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Tasks whose `next_run_at` has passed, eligible at the given
    /// survival tier, ordered by priority ascending (spec §4.4 tick
    /// algorithm step 1-2).
    pub async fn due_tasks(&self, tier: SurvivalTier) -> Result<Vec<HeartbeatSchedule>, SchedulerError> {
        let now = Utc::now().to_rfc3339();
        let rows: Vec<HeartbeatSchedule> = self
            .store
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_name, schedule_expr, enabled, priority, timeout_ms, max_retries,
                            tier_minimum, last_run_at, next_run_at, last_result, last_error,
                            run_count, fail_count, lease_owner, lease_expires_at
                     FROM heartbeat_schedule
                     WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                     ORDER BY priority ASC",
                )?;
                let rows = stmt
                    .query_map(params![now], |row| row_to_task(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows.into_iter().filter(|t| t.tier_minimum <= tier).collect())
    }

    /// Build the tick context for the current moment: fetch the balance
    /// once, derive the survival tier from it, and load the tasks due at
    /// that tier — spec §4.4 step 2. On a balance-fetch failure the
    /// balance defaults to 0 (which `SurvivalTier::from_balance_cents`
    /// already maps to `critical`).
    pub async fn build_tick_context(&self, balances: &dyn BalanceSource) -> Result<TickContext<'a>, SchedulerError> {
        let (credit_balance_cents, usdc_balance_cents) = match balances.current_balances_cents().await {
            Ok(v) => v,
            Err(reason) => {
                tracing::warn!(reason = %reason, event = "api_unreachable", "scheduler balance source unreachable, defaulting to 0/critical");
                (0, 0)
            }
        };
        let tier = SurvivalTier::from_balance_cents(credit_balance_cents);
        let due_tasks = self.due_tasks(tier).await?;
        Ok(TickContext {
            tick_id: MonotonicId::new(),
            started_at: Utc::now(),
            credit_balance_cents,
            usdc_balance_cents,
            tier,
            low_compute_multiplier: self.config.low_compute_multiplier,
            config: self.config.clone(),
            db: self.store,
            due_tasks,
        })
    }

    /// Run one full tick: build the shared context, then for each due
    /// task (priority ascending) acquire its lease and run it under
    /// `execute_task`'s timeout, releasing the lease afterward — spec
    /// §4.4 steps 1-4. A second call while one is in flight returns
    /// immediately with `skipped_overlap = true` and no side effects.
    pub async fn tick<F, Fut>(
        &self,
        owner: &str,
        balances: &dyn BalanceSource,
        run_task: F,
    ) -> Result<TickReport, SchedulerError>
    where
        F: Fn(&HeartbeatSchedule, &TickContext<'_>) -> Fut,
        Fut: Future<Output = Result<bool, String>>,
    {
        if self.tick_in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(TickReport { skipped_overlap: true, ..Default::default() });
        }

        let result = self.run_tick(owner, balances, run_task).await;
        self.tick_in_flight.store(false, Ordering::Release);
        result
    }

    async fn run_tick<F, Fut>(&self, owner: &str, balances: &dyn BalanceSource, run_task: F) -> Result<TickReport, SchedulerError>
    where
        F: Fn(&HeartbeatSchedule, &TickContext<'_>) -> Fut,
        Fut: Future<Output = Result<bool, String>>,
    {
        let ctx = self.build_tick_context(balances).await?;
        let mut ran = Vec::new();

        for task in &ctx.due_tasks {
            let lease_ttl = Duration::milliseconds(task.timeout_ms as i64);
            if !self.acquire_task_lease(&task.task_name, owner, lease_ttl).await? {
                continue;
            }

            let timeout = std::time::Duration::from_millis(task.timeout_ms);
            let result = self.execute_task(task, timeout, || run_task(task, &ctx)).await?;
            self.release_task_lease(&task.task_name, owner).await?;
            ran.push((task.task_name.clone(), result));
        }

        Ok(TickReport { tick_id: Some(ctx.tick_id), ran, skipped_overlap: false })
    }

    /// Attempt to acquire an exclusive lease on `task_name` for `owner`.
    /// Fails (returns `false`) if a live lease is already held by
    /// someone else (spec §4.4: "lease-based exclusive execution").
    pub async fn acquire_task_lease(
        &self,
        task_name: &str,
        owner: &str,
        lease_duration: Duration,
    ) -> Result<bool, SchedulerError> {
        let task_name = task_name.to_string();
        let owner = owner.to_string();
        let now = Utc::now();
        let expires = (now + lease_duration).to_rfc3339();
        let now_str = now.to_rfc3339();

        let acquired = self
            .store
            .run_transaction(move |tx| {
                let current: Option<(Option<String>, Option<String>)> = tx
                    .query_row(
                        "SELECT lease_owner, lease_expires_at FROM heartbeat_schedule WHERE task_name = ?1",
                        params![task_name],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let Some((lease_owner, lease_expires_at)) = current else {
                    return Ok(false);
                };

                let lease_is_live = match (&lease_owner, &lease_expires_at) {
                    (Some(_), Some(expires_at)) => expires_at.as_str() > now_str.as_str(),
                    _ => false,
                };
                if lease_is_live {
                    return Ok(false);
                }

                tx.execute(
                    "UPDATE heartbeat_schedule SET lease_owner = ?1, lease_expires_at = ?2 WHERE task_name = ?3",
                    params![owner, expires, task_name],
                )?;
                Ok(true)
            })
            .await?;
        Ok(acquired)
    }

    /// Release a lease this owner holds. A no-op if the lease has
    /// already expired or been reassigned.
    pub async fn release_task_lease(&self, task_name: &str, owner: &str) -> Result<(), SchedulerError> {
        self.store
            .read(|conn| {
                conn.execute(
                    "UPDATE heartbeat_schedule SET lease_owner = NULL, lease_expires_at = NULL
                     WHERE task_name = ?1 AND lease_owner = ?2",
                    params![task_name, owner],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Clear leases whose `lease_expires_at` has passed — run at
    /// process start so a crash mid-execution doesn't wedge a task
    /// forever (spec §4.4 "crash safety").
    pub async fn clear_expired_leases(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now().to_rfc3339();
        let n = self
            .store
            .read(move |conn| {
                Ok(conn.execute(
                    "UPDATE heartbeat_schedule SET lease_owner = NULL, lease_expires_at = NULL
                     WHERE lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
                    params![now],
                )?)
            })
            .await?;
        Ok(n)
    }

    /// Record a dedup key; returns `false` without inserting if the key
    /// is already present and unexpired (spec §4.4 "at-most-once
    /// processing keyed by an idempotency key").
    pub async fn try_insert_dedup(&self, key: &DedupKey) -> Result<bool, SchedulerError> {
        let key_value = key.key.clone();
        let task_name = key.task_name.clone();
        let expires_at = key.expires_at.to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let inserted = self
            .store
            .run_transaction(move |tx| {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT expires_at FROM heartbeat_dedup WHERE key = ?1",
                        params![key_value],
                        |row| row.get(0),
                    )
                    .optional()?;

                if let Some(expires) = existing {
                    if expires.as_str() > now.as_str() {
                        return Ok(false);
                    }
                    tx.execute("DELETE FROM heartbeat_dedup WHERE key = ?1", params![key_value])?;
                }

                tx.execute(
                    "INSERT INTO heartbeat_dedup (key, task_name, expires_at) VALUES (?1, ?2, ?3)",
                    params![key_value, task_name, expires_at],
                )?;
                Ok(true)
            })
            .await?;
        Ok(inserted)
    }

    /// Delete dedup keys whose expiry has passed.
    pub async fn prune_expired_dedup(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now().to_rfc3339();
        let n = self
            .store
            .read(move |conn| {
                Ok(conn.execute("DELETE FROM heartbeat_dedup WHERE expires_at <= ?1", params![now])?)
            })
            .await?;
        Ok(n)
    }

    /// Enqueue a wake event.
    pub async fn push_wake_event(
        &self,
        source: &str,
        reason: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), SchedulerError> {
        let payload_json = payload.map(|p| p.to_string());
        self.store
            .read(move |conn| {
                conn.execute(
                    "INSERT INTO wake_events (source, reason, payload, consumed, created_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    params![source, reason, payload_json, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Pop the oldest unconsumed wake event, marking it consumed in the
    /// same round trip (FIFO, spec §4.4).
    pub async fn pop_wake_event(&self) -> Result<Option<WakeEvent>, SchedulerError> {
        let event = self
            .store
            .run_transaction(|tx| {
                let row: Option<(i64, String, String, Option<String>, String)> = tx
                    .query_row(
                        "SELECT id, source, reason, payload, created_at FROM wake_events
                         WHERE consumed = 0 ORDER BY id ASC LIMIT 1",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                    )
                    .optional()?;

                let Some((id, source, reason, payload, created_at)) = row else {
                    return Ok(None);
                };
                tx.execute("UPDATE wake_events SET consumed = 1 WHERE id = ?1", params![id])?;

                let payload = payload.map(|p| crate::store::safe_json_decode(&p, "wake_event.payload"));
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());

                Ok(Some(WakeEvent {
                    id,
                    source,
                    reason,
                    payload,
                    consumed: true,
                    created_at,
                }))
            })
            .await?;
        Ok(event)
    }

    /// Run one task to completion under `timeout`, recording history and
    /// updating run/fail counters and the next scheduled time — spec
    /// §4.4 tick algorithm steps 3-6.
    pub async fn execute_task<F, Fut>(
        &self,
        task: &HeartbeatSchedule,
        timeout: std::time::Duration,
        work: F,
    ) -> Result<RunResult, SchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<bool, String>>,
    {
        let started_at = Utc::now();
        let outcome = tokio::time::timeout(timeout, work()).await;

        let (result, error, should_wake) = match outcome {
            Ok(Ok(should_wake)) => (RunResult::Success, None, should_wake),
            Ok(Err(e)) => (RunResult::Failure, Some(e), false),
            Err(_) => (RunResult::Timeout, Some("task timed out".to_string()), false),
        };

        self.record_history(task, started_at, result, error.clone(), should_wake).await?;
        self.advance_schedule(task, result, error).await?;

        Ok(result)
    }

    async fn record_history(
        &self,
        task: &HeartbeatSchedule,
        started_at: DateTime<Utc>,
        result: RunResult,
        error: Option<String>,
        should_wake: bool,
    ) -> Result<(), SchedulerError> {
        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0);
        let task_name = task.task_name.clone();
        self.store
            .read(move |conn| {
                conn.execute(
                    "INSERT INTO heartbeat_history
                        (task_name, started_at, ended_at, duration_ms, result, error, should_wake)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        task_name,
                        started_at.to_rfc3339(),
                        ended_at.to_rfc3339(),
                        duration_ms,
                        result.as_str(),
                        error,
                        should_wake as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn advance_schedule(
        &self,
        task: &HeartbeatSchedule,
        result: RunResult,
        error: Option<String>,
    ) -> Result<(), SchedulerError> {
        let next_run_at = compute_next_run(&task.schedule_expr, Utc::now())?;
        let task_name = task.task_name.clone();
        let succeeded = matches!(result, RunResult::Success);
        self.store
            .read(move |conn| {
                conn.execute(
                    "UPDATE heartbeat_schedule SET
                        last_run_at = ?1,
                        next_run_at = ?2,
                        last_result = ?3,
                        last_error = ?4,
                        run_count = run_count + 1,
                        fail_count = fail_count + ?5
                     WHERE task_name = ?6",
                    params![
                        Utc::now().to_rfc3339(),
                        next_run_at.to_rfc3339(),
                        result.as_str(),
                        error,
                        (!succeeded) as i64,
                        task_name,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Execution history for one task, newest first.
    pub async fn history_for(&self, task_name: &str, limit: u32) -> Result<Vec<HeartbeatHistory>, SchedulerError> {
        let task_name = task_name.to_string();
        let rows = self
            .store
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_name, started_at, ended_at, duration_ms, result, error, should_wake
                     FROM heartbeat_history WHERE task_name = ?1 ORDER BY started_at DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![task_name, limit], |row| row_to_history(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub fn tick_interval(&self, tier: SurvivalTier) -> std::time::Duration {
        let base = self.config.tick_interval_secs;
        let secs = if matches!(tier, SurvivalTier::Critical | SurvivalTier::LowCompute) {
            base * self.config.low_compute_multiplier as u64
        } else {
            base
        };
        std::time::Duration::from_secs(secs)
    }
}

fn tier_str(tier: SurvivalTier) -> &'static str {
    match tier {
        SurvivalTier::Dead => "dead",
        SurvivalTier::Critical => "critical",
        SurvivalTier::LowCompute => "low_compute",
        SurvivalTier::Normal => "normal",
        SurvivalTier::High => "high",
    }
}

fn tier_from_str(s: &str) -> SurvivalTier {
    match s {
        "dead" => SurvivalTier::Dead,
        "low_compute" => SurvivalTier::LowCompute,
        "normal" => SurvivalTier::Normal,
        "high" => SurvivalTier::High,
        _ => SurvivalTier::Critical,
    }
}

fn encode_schedule(expr: &ScheduleExpr) -> String {
    match expr {
        ScheduleExpr::Cron(s) => format!("cron:{s}"),
        ScheduleExpr::IntervalSecs(n) => format!("interval:{n}"),
    }
}

fn decode_schedule(raw: &str) -> ScheduleExpr {
    if let Some(rest) = raw.strip_prefix("cron:") {
        ScheduleExpr::Cron(rest.to_string())
    } else if let Some(rest) = raw.strip_prefix("interval:") {
        ScheduleExpr::IntervalSecs(rest.parse().unwrap_or(60))
    } else {
        ScheduleExpr::IntervalSecs(60)
    }
}

/// Compute the next run time for a schedule expression. Invalid cron
/// expressions are rejected at `upsert_task` time, not here, so this is
/// expected to succeed for any persisted row.
fn compute_next_run(expr: &ScheduleExpr, from: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    match expr {
        ScheduleExpr::IntervalSecs(secs) => Ok(from + Duration::seconds(*secs as i64)),
        ScheduleExpr::Cron(s) => {
            let schedule = CronSchedule::from_str(s)
                .map_err(|e| SchedulerError::InvalidSchedule(format!("{s}: {e}")))?;
            schedule
                .after(&from)
                .next()
                .ok_or_else(|| SchedulerError::InvalidSchedule(format!("no future occurrence for {s}")))
        }
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<HeartbeatSchedule> {
    let schedule_raw: String = row.get(1)?;
    let tier_raw: String = row.get(6)?;
    let last_run_at: Option<String> = row.get(7)?;
    let next_run_at: Option<String> = row.get(8)?;
    Ok(HeartbeatSchedule {
        task_name: row.get(0)?,
        schedule_expr: decode_schedule(&schedule_raw),
        enabled: row.get::<_, i64>(2)? != 0,
        priority: row.get(3)?,
        timeout_ms: row.get::<_, i64>(4)? as u64,
        max_retries: row.get(5)?,
        tier_minimum: tier_from_str(&tier_raw),
        last_run_at: last_run_at.and_then(|s| parse_rfc3339(&s)),
        next_run_at: next_run_at.and_then(|s| parse_rfc3339(&s)),
        last_result: row.get(9)?,
        last_error: row.get(10)?,
        run_count: row.get::<_, i64>(11)? as u64,
        fail_count: row.get::<_, i64>(12)? as u64,
        lease_owner: row.get(13)?,
        lease_expires_at: row.get::<_, Option<String>>(14)?.and_then(|s| parse_rfc3339(&s)),
    })
}

fn row_to_history(row: &rusqlite::Row) -> rusqlite::Result<HeartbeatHistory> {
    let result_raw: String = row.get(5)?;
    let result = match result_raw.as_str() {
        "success" => RunResult::Success,
        "failure" => RunResult::Failure,
        "timeout" => RunResult::Timeout,
        _ => RunResult::Skipped,
    };
    Ok(HeartbeatHistory {
        id: row.get(0)?,
        task_name: row.get(1)?,
        started_at: parse_rfc3339(&row.get::<_, String>(2)?).unwrap_or_else(Utc::now),
        ended_at: row.get::<_, Option<String>>(3)?.and_then(|s| parse_rfc3339(&s)),
        duration_ms: row.get::<_, Option<i64>>(4)?.map(|n| n as u64),
        result,
        error: row.get(6)?,
        should_wake: row.get::<_, Option<i64>>(7)?.map(|n| n != 0),
    })
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    fn interval_task(name: &str, secs: u64) -> HeartbeatSchedule {
        HeartbeatSchedule {
            task_name: name.to_string(),
            schedule_expr: ScheduleExpr::IntervalSecs(secs),
            enabled: true,
            priority: 100,
            timeout_ms: 5000,
            max_retries: 1,
            tier_minimum: SurvivalTier::Critical,
            last_run_at: None,
            next_run_at: None,
            last_result: None,
            last_error: None,
            run_count: 0,
            fail_count: 0,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_and_due_task_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        scheduler.upsert_task(&interval_task("heartbeat.check_balance", 0)).await.unwrap();

        let due = scheduler.due_tasks(SurvivalTier::Normal).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_name, "heartbeat.check_balance");
    }

    #[tokio::test]
    async fn tier_gating_excludes_tasks_above_current_tier() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let mut task = interval_task("heartbeat.expensive", 0);
        task.tier_minimum = SurvivalTier::High;
        scheduler.upsert_task(&task).await.unwrap();

        assert!(scheduler.due_tasks(SurvivalTier::Normal).await.unwrap().is_empty());
        assert_eq!(scheduler.due_tasks(SurvivalTier::High).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released_or_expired() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        scheduler.upsert_task(&interval_task("heartbeat.lease_test", 60)).await.unwrap();

        assert!(scheduler.acquire_task_lease("heartbeat.lease_test", "owner-a", Duration::seconds(60)).await.unwrap());
        assert!(!scheduler.acquire_task_lease("heartbeat.lease_test", "owner-b", Duration::seconds(60)).await.unwrap());

        scheduler.release_task_lease("heartbeat.lease_test", "owner-a").await.unwrap();
        assert!(scheduler.acquire_task_lease("heartbeat.lease_test", "owner-b", Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        scheduler.upsert_task(&interval_task("heartbeat.expiring", 60)).await.unwrap();

        assert!(scheduler.acquire_task_lease("heartbeat.expiring", "owner-a", Duration::seconds(-1)).await.unwrap());
        assert!(scheduler.acquire_task_lease("heartbeat.expiring", "owner-b", Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn dedup_rejects_duplicate_unexpired_key() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let key = DedupKey {
            key: "wakeup:123".to_string(),
            task_name: "heartbeat.wakeup".to_string(),
            expires_at: Utc::now() + Duration::minutes(5),
        };
        assert!(scheduler.try_insert_dedup(&key).await.unwrap());
        assert!(!scheduler.try_insert_dedup(&key).await.unwrap());
    }

    #[tokio::test]
    async fn wake_events_are_fifo_and_consumed_once() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        scheduler.push_wake_event("heartbeat", "low_balance", None).await.unwrap();
        scheduler.push_wake_event("inbox", "new_message", None).await.unwrap();

        let first = scheduler.pop_wake_event().await.unwrap().unwrap();
        assert_eq!(first.reason, "low_balance");
        let second = scheduler.pop_wake_event().await.unwrap().unwrap();
        assert_eq!(second.reason, "new_message");
        assert!(scheduler.pop_wake_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execute_task_records_history_and_advances_schedule() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let task = interval_task("heartbeat.work", 60);
        scheduler.upsert_task(&task).await.unwrap();

        let result = scheduler
            .execute_task(&task, std::time::Duration::from_secs(1), || async { Ok(false) })
            .await
            .unwrap();
        assert_eq!(result, RunResult::Success);

        let history = scheduler.history_for("heartbeat.work", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result, RunResult::Success);
    }

    #[tokio::test]
    async fn execute_task_times_out() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let task = interval_task("heartbeat.slow", 60);
        scheduler.upsert_task(&task).await.unwrap();

        let result = scheduler
            .execute_task(&task, std::time::Duration::from_millis(10), || async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(false)
            })
            .await
            .unwrap();
        assert_eq!(result, RunResult::Timeout);
    }

    struct FixedBalances(i64, i64);

    #[async_trait]
    impl BalanceSource for FixedBalances {
        async fn current_balances_cents(&self) -> Result<(i64, i64), String> {
            Ok((self.0, self.1))
        }
    }

    struct UnreachableBalances;

    #[async_trait]
    impl BalanceSource for UnreachableBalances {
        async fn current_balances_cents(&self) -> Result<(i64, i64), String> {
            Err("timeout".to_string())
        }
    }

    #[tokio::test]
    async fn tick_context_derives_tier_from_balance_and_shares_it() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let ctx = scheduler.build_tick_context(&FixedBalances(7500, 200)).await.unwrap();
        assert_eq!(ctx.tier, SurvivalTier::High);
        assert_eq!(ctx.credit_balance_cents, 7500);
        assert_eq!(ctx.usdc_balance_cents, 200);
    }

    #[tokio::test]
    async fn tick_context_defaults_to_critical_when_balance_unreachable() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let ctx = scheduler.build_tick_context(&UnreachableBalances).await.unwrap();
        assert_eq!(ctx.tier, SurvivalTier::Critical);
        assert_eq!(ctx.credit_balance_cents, 0);
    }

    #[tokio::test]
    async fn tick_runs_due_tasks_in_priority_order_and_releases_leases() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let mut low_priority = interval_task("heartbeat.second", 60);
        low_priority.priority = 200;
        let mut high_priority = interval_task("heartbeat.first", 60);
        high_priority.priority = 100;
        scheduler.upsert_task(&low_priority).await.unwrap();
        scheduler.upsert_task(&high_priority).await.unwrap();

        let order = std::sync::Mutex::new(Vec::new());
        let report = scheduler
            .tick("proc-1", &FixedBalances(5000, 0), |task, _ctx| {
                order.lock().unwrap().push(task.task_name.clone());
                async { Ok(false) }
            })
            .await
            .unwrap();

        assert!(!report.skipped_overlap);
        assert_eq!(report.ran.len(), 2);
        assert_eq!(*order.lock().unwrap(), vec!["heartbeat.first", "heartbeat.second"]);

        // Leases must be released once the tick completes.
        assert!(scheduler.acquire_task_lease("heartbeat.first", "other-owner", Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn tick_skips_tasks_above_current_tier() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        let mut task = interval_task("heartbeat.expensive", 60);
        task.tier_minimum = SurvivalTier::High;
        scheduler.upsert_task(&task).await.unwrap();

        let report = scheduler
            .tick("proc-1", &FixedBalances(0, 0), |_task, _ctx| async { Ok(false) })
            .await
            .unwrap();
        assert!(report.ran.is_empty());
    }

    #[tokio::test]
    async fn second_concurrent_tick_is_skipped_by_overlap_guard() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&store, SchedulerConfig::default());
        scheduler.upsert_task(&interval_task("heartbeat.guarded", 60)).await.unwrap();

        // Simulate a tick already in flight.
        scheduler.tick_in_flight.store(true, Ordering::SeqCst);
        let report = scheduler
            .tick("proc-1", &FixedBalances(5000, 0), |_task, _ctx| async { Ok(false) })
            .await
            .unwrap();
        assert!(report.skipped_overlap);
        assert!(report.ran.is_empty());
    }
}
