//! Turn persistence — spec §4.5 "a turn and every tool call it made
//! commit atomically, or neither does".
//!
//! Grounded on the teacher's `scheduler/job_store.rs` pattern of writing
//! a parent row and its children inside one `Transaction`.

use chrono::Utc;
use rusqlite::params;

use crate::error::StoreError;
use crate::inbox::{mark_failed_in_tx, mark_processed_in_tx};
use crate::store::Store;
use crate::types::{Turn, ToolCallResult};

/// How a claimed inbox message folded into this turn should be
/// acknowledged once the turn itself commits — spec §4.6 "atomic ack":
/// `mark_inbox_processed`/`mark_inbox_failed` run inside the same
/// transaction that writes the turn.
#[derive(Debug, Clone)]
pub enum InboxAck {
    Processed(String),
    Failed(String),
}

pub async fn persist_turn(store: &Store, turn: &Turn) -> Result<(), StoreError> {
    persist_turn_with_inbox_acks(store, turn, &[]).await
}

/// Persist a turn and its tool calls, and fold a batch of inbox
/// acknowledgements into the same transaction — so a rollback of the
/// turn write also rolls back the ack, leaving claimed messages
/// `in_progress` for the crash-recovery path to pick up later.
pub async fn persist_turn_with_inbox_acks(
    store: &Store,
    turn: &Turn,
    inbox_acks: &[InboxAck],
) -> Result<(), StoreError> {
    let turn = turn.clone();
    let inbox_acks = inbox_acks.to_vec();
    let processed_at = Utc::now().to_rfc3339();
    store
        .run_transaction(move |tx| {
            tx.execute(
                "INSERT INTO turns
                    (id, created_at, state, input_text, input_source, assistant_text,
                     token_usage, cost_cents)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    turn.id.to_string(),
                    turn.created_at.to_rfc3339(),
                    turn.state,
                    turn.input_text,
                    turn.input_source,
                    turn.assistant_text,
                    turn.token_usage as i64,
                    turn.cost_cents,
                ],
            )?;

            for call in &turn.tool_calls {
                insert_tool_call(tx, call)?;
            }

            for ack in &inbox_acks {
                match ack {
                    InboxAck::Processed(id) => mark_processed_in_tx(tx, id, &processed_at)?,
                    InboxAck::Failed(id) => mark_failed_in_tx(tx, id)?,
                }
            }
            Ok(())
        })
        .await
}

/// Append one more tool call to an already-persisted turn — used when a
/// turn accumulates tool calls one at a time rather than all at once.
pub async fn persist_tool_call(store: &Store, call: &ToolCallResult) -> Result<(), StoreError> {
    let call = call.clone();
    store
        .run_transaction(move |tx| {
            insert_tool_call(tx, &call)?;
            Ok(())
        })
        .await
}

fn insert_tool_call(tx: &rusqlite::Transaction<'_>, call: &ToolCallResult) -> Result<(), StoreError> {
    let arguments = serde_json::to_string(&call.arguments)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    tx.execute(
        "INSERT INTO tool_calls (id, turn_id, tool_name, arguments, result_text, error, duration_ms)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            call.id.to_string(),
            call.turn_id.to_string(),
            call.tool_name,
            arguments,
            call.result_text,
            call.error,
            call.duration_ms as i64,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::types::MonotonicId;

    #[tokio::test]
    async fn turn_and_tool_calls_persist_atomically() {
        let store = Store::open_in_memory().unwrap();
        let turn_id = MonotonicId::new();
        let call_id = MonotonicId::new();

        let turn = Turn {
            id: turn_id.clone(),
            created_at: Utc::now(),
            state: "running".to_string(),
            input_text: Some("hi".to_string()),
            input_source: Some("agent".to_string()),
            assistant_text: Some("ok".to_string()),
            tool_calls: vec![ToolCallResult {
                id: call_id,
                turn_id: turn_id.clone(),
                tool_name: "read_file".to_string(),
                arguments: json!({"path": "README.md"}),
                result_text: Some("contents".to_string()),
                error: None,
                duration_ms: 12,
            }],
            token_usage: 100,
            cost_cents: 0,
        };

        persist_turn(&store, &turn).await.unwrap();

        let count: i64 = store
            .read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM tool_calls WHERE turn_id = ?1", params![turn_id.to_string()], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn persisting_a_turn_acks_claimed_inbox_messages_atomically() {
        use crate::inbox::Inbox;
        use crate::types::{InboxMessage, InboxStatus};

        let store = Store::open_in_memory().unwrap();
        let inbox = Inbox::new(&store);
        inbox
            .receive(&InboxMessage {
                id: "msg-1".to_string(),
                from: "peer-a".to_string(),
                to: "self".to_string(),
                content: "hi".to_string(),
                signed_at: None,
                received_at: Utc::now(),
                processed_at: None,
                status: InboxStatus::Received,
                retry_count: 0,
                max_retries: 3,
            })
            .await
            .unwrap();
        let claimed = inbox.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let turn_id = MonotonicId::new();
        let turn = Turn {
            id: turn_id.clone(),
            created_at: Utc::now(),
            state: "running".to_string(),
            input_text: Some("hi".to_string()),
            input_source: Some("agent".to_string()),
            assistant_text: None,
            tool_calls: vec![],
            token_usage: 0,
            cost_cents: 0,
        };

        persist_turn_with_inbox_acks(&store, &turn, &[InboxAck::Processed(claimed[0].id.clone())])
            .await
            .unwrap();

        let message = inbox.get("msg-1").await.unwrap().unwrap();
        assert_eq!(message.status, InboxStatus::Processed);
    }
}
