//! Append-only reasoning journal — spec §4.5 / §3 "ReasoningStep".
//!
//! Each turn's think/act/observe steps are logged here, optionally
//! linked to the tool call, policy decision, or approval request they
//! produced — grounded on the teacher's `reasoning/journal.rs` append-only
//! event log shape.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{MonotonicId, ReasoningPhase, ReasoningStep};

pub struct ReasoningLog<'a> {
    store: &'a Store,
}

impl<'a> ReasoningLog<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Append one step. `step_number` is caller-assigned (monotonic
    /// within a turn) rather than derived here, so callers can log
    /// think/act/observe steps as they happen without a read-then-write
    /// round trip.
    pub async fn append(
        &self,
        turn_id: &MonotonicId,
        step_number: u32,
        phase: ReasoningPhase,
        content: &str,
        linked_tool_call_id: Option<&MonotonicId>,
        linked_policy_id: Option<&MonotonicId>,
        linked_approval_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let turn_id = turn_id.to_string();
        let content = content.to_string();
        let linked_tool_call_id = linked_tool_call_id.map(|id| id.to_string());
        let linked_policy_id = linked_policy_id.map(|id| id.to_string());
        let linked_approval_id = linked_approval_id.map(str::to_string);

        self.store
            .read(move |conn| {
                conn.execute(
                    "INSERT INTO reasoning_steps
                        (turn_id, step_number, phase, content, linked_tool_call_id,
                         linked_policy_id, linked_approval_id, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        turn_id,
                        step_number,
                        phase.as_str(),
                        content,
                        linked_tool_call_id,
                        linked_policy_id,
                        linked_approval_id,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// All steps for a turn, in recorded order.
    pub async fn steps_for_turn(&self, turn_id: &MonotonicId) -> Result<Vec<ReasoningStep>, StoreError> {
        let turn_id = turn_id.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, turn_id, step_number, phase, content, linked_tool_call_id,
                            linked_policy_id, linked_approval_id, created_at
                     FROM reasoning_steps WHERE turn_id = ?1 ORDER BY step_number ASC",
                )?;
                let rows = stmt
                    .query_map(params![turn_id], row_to_step)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<ReasoningStep> {
    let phase_raw: String = row.get(3)?;
    let phase = match phase_raw.as_str() {
        "thinking" => ReasoningPhase::Thinking,
        "plan" => ReasoningPhase::Plan,
        "waiting_approval" => ReasoningPhase::WaitingApproval,
        "execute" => ReasoningPhase::Execute,
        _ => ReasoningPhase::Error,
    };
    let linked_tool_call_id: Option<String> = row.get(5)?;
    let linked_policy_id: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(ReasoningStep {
        id: row.get(0)?,
        turn_id: MonotonicId::from(row.get::<_, String>(1)?),
        step_number: row.get(2)?,
        phase,
        content: row.get(4)?,
        linked_tool_call_id: linked_tool_call_id.map(MonotonicId::from),
        linked_policy_id: linked_policy_id.map(MonotonicId::from),
        linked_approval_id: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appended_steps_come_back_in_order() {
        let store = Store::open_in_memory().unwrap();
        let log = ReasoningLog::new(&store);
        let turn_id = MonotonicId::new();

        log.append(&turn_id, 0, ReasoningPhase::Thinking, "considering options", None, None, None)
            .await
            .unwrap();
        log.append(&turn_id, 1, ReasoningPhase::Execute, "called transfer_credits", None, None, None)
            .await
            .unwrap();

        let steps = log.steps_for_turn(&turn_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].phase, ReasoningPhase::Thinking);
        assert_eq!(steps[1].phase, ReasoningPhase::Execute);
    }
}
