//! Inbox retry/dedup protocol — spec §4.6.
//!
//! Messages are claimed in a batch, processed, and acknowledged
//! (processed or failed) with retry counts capped at `max_retries`.
//! Claiming and status transitions are single statements guarded by the
//! store's mutex, matching the teacher's `job_store.rs` claim-then-ack
//! shape rather than introducing a separate lock.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::InboxError;
use crate::store::Store;
use crate::types::{InboxMessage, InboxStatus};

pub struct Inbox<'a> {
    store: &'a Store,
}

impl<'a> Inbox<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert a newly received message. Duplicate ids (the sender's own
    /// idempotency key) are ignored rather than erroring, giving
    /// at-most-once delivery on the inbound side.
    pub async fn receive(&self, message: &InboxMessage) -> Result<bool, InboxError> {
        let id = message.id.clone();
        let from = message.from.clone();
        let to = message.to.clone();
        let content = message.content.clone();
        let signed_at = message.signed_at.map(|t| t.to_rfc3339());
        let received_at = message.received_at.to_rfc3339();
        let max_retries = message.max_retries;

        let inserted = self
            .store
            .read(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO inbox_messages
                        (id, sender, recipient, content, signed_at, received_at, processed_at,
                         status, retry_count, max_retries)
                     VALUES (?1,?2,?3,?4,?5,?6,NULL,'received',0,?7)",
                    params![id, from, to, content, signed_at, received_at, max_retries],
                )?;
                Ok(n)
            })
            .await?;
        Ok(inserted > 0)
    }

    /// Claim up to `limit` messages eligible for processing (`status =
    /// 'received' AND retry_count < max_retries`), marking them
    /// `in_progress` and incrementing their `retry_count` so a claim that
    /// never reaches an ack still counts toward the retry cap (spec §4.6
    /// "increment `retry_count` on claim").
    pub async fn claim(&self, limit: u32) -> Result<Vec<InboxMessage>, InboxError> {
        let claimed = self
            .store
            .run_transaction(move |tx| {
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM inbox_messages
                         WHERE status = 'received' AND retry_count < max_retries
                         ORDER BY received_at ASC LIMIT ?1",
                    )?;
                    stmt.query_map(params![limit], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };

                let mut messages = Vec::with_capacity(ids.len());
                for id in &ids {
                    tx.execute(
                        "UPDATE inbox_messages SET status = 'in_progress', retry_count = retry_count + 1 WHERE id = ?1",
                        params![id],
                    )?;
                    let message = tx.query_row(
                        "SELECT id, sender, recipient, content, signed_at, received_at,
                                processed_at, status, retry_count, max_retries
                         FROM inbox_messages WHERE id = ?1",
                        params![id],
                        row_to_message,
                    )?;
                    messages.push(message);
                }
                Ok(messages)
            })
            .await?;
        Ok(claimed)
    }

    /// Mark a batch of claimed messages as successfully processed.
    pub async fn mark_processed(&self, ids: &[String]) -> Result<(), InboxError> {
        let ids = ids.to_vec();
        let processed_at = Utc::now().to_rfc3339();
        self.store
            .run_transaction(move |tx| {
                for id in &ids {
                    mark_processed_in_tx(tx, id, &processed_at)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Mark a message as failed. `retry_count` was already incremented at
    /// claim time; this only decides whether the cap has been reached —
    /// `failed` terminally if so, otherwise reset to `received` so a
    /// future claim can retry it.
    pub async fn mark_failed(&self, id: &str) -> Result<(), InboxError> {
        let id = id.to_string();
        self.store
            .run_transaction(move |tx| mark_failed_in_tx(tx, &id))
            .await?;
        Ok(())
    }

    /// Reset a set of `in_progress` messages back to `received` —
    /// recovery path for a crash between claim and ack (spec §4.6
    /// "crash between claim and ack must not lose or duplicate a
    /// message").
    pub async fn reset_in_progress(&self, ids: &[String]) -> Result<(), InboxError> {
        for id in ids {
            let id = id.clone();
            self.store
                .read(move |conn| {
                    conn.execute(
                        "UPDATE inbox_messages SET status = 'received' WHERE id = ?1 AND status = 'in_progress'",
                        params![id],
                    )?;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Reset every `in_progress` message back to `received` — run once
    /// at startup to recover from an unclean shutdown.
    pub async fn reset_all_in_progress(&self) -> Result<usize, InboxError> {
        let n = self
            .store
            .read(|conn| {
                Ok(conn.execute(
                    "UPDATE inbox_messages SET status = 'received' WHERE status = 'in_progress'",
                    [],
                )?)
            })
            .await?;
        Ok(n)
    }

    pub async fn unprocessed_count(&self) -> Result<i64, InboxError> {
        let count = self
            .store
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM inbox_messages WHERE status IN ('received','in_progress')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(count)
    }

    pub async fn get(&self, id: &str) -> Result<Option<InboxMessage>, InboxError> {
        let id = id.to_string();
        let message = self
            .store
            .read(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, sender, recipient, content, signed_at, received_at,
                                processed_at, status, retry_count, max_retries
                         FROM inbox_messages WHERE id = ?1",
                        params![id],
                        row_to_message,
                    )
                    .optional()?)
            })
            .await?;
        Ok(message)
    }
}

/// Acknowledge one claimed message as processed, within a caller-owned
/// transaction — lets `turns::persist_turn` fold the ack into the same
/// atomic write as the turn it was claimed for (spec §4.6 "atomic ack").
pub(crate) fn mark_processed_in_tx(tx: &rusqlite::Transaction<'_>, id: &str, processed_at: &str) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE inbox_messages SET status = 'processed', processed_at = ?1 WHERE id = ?2",
        params![processed_at, id],
    )?;
    Ok(())
}

/// Same as [`Inbox::mark_failed`] but composable inside a caller-owned
/// transaction.
pub(crate) fn mark_failed_in_tx(tx: &rusqlite::Transaction<'_>, id: &str) -> rusqlite::Result<()> {
    let (retry_count, max_retries): (u32, u32) = tx.query_row(
        "SELECT retry_count, max_retries FROM inbox_messages WHERE id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let status = if retry_count >= max_retries { "failed" } else { "received" };
    tx.execute("UPDATE inbox_messages SET status = ?1 WHERE id = ?2", params![status, id])?;
    Ok(())
}

/// Same as [`Inbox::reset_in_progress`] but composable inside a
/// caller-owned transaction — used when a turn errors and its claimed
/// messages must go back to `received` atomically with any partial state.
pub(crate) fn reset_in_progress_in_tx(tx: &rusqlite::Transaction<'_>, id: &str) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE inbox_messages SET status = 'received' WHERE id = ?1 AND status = 'in_progress'",
        params![id],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<InboxMessage> {
    let signed_at: Option<String> = row.get(4)?;
    let received_at: String = row.get(5)?;
    let processed_at: Option<String> = row.get(6)?;
    let status_raw: String = row.get(7)?;
    Ok(InboxMessage {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        content: row.get(3)?,
        signed_at: signed_at.and_then(|s| parse_rfc3339(&s)),
        received_at: parse_rfc3339(&received_at).unwrap_or_else(Utc::now),
        processed_at: processed_at.and_then(|s| parse_rfc3339(&s)),
        status: InboxStatus::from_str(&status_raw).unwrap_or(InboxStatus::Received),
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
    })
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, max_retries: u32) -> InboxMessage {
        InboxMessage {
            id: id.to_string(),
            from: "peer-a".to_string(),
            to: "self".to_string(),
            content: "hello".to_string(),
            signed_at: None,
            received_at: Utc::now(),
            processed_at: None,
            status: InboxStatus::Received,
            retry_count: 0,
            max_retries,
        }
    }

    #[tokio::test]
    async fn receive_is_idempotent_on_duplicate_id() {
        let store = Store::open_in_memory().unwrap();
        let inbox = Inbox::new(&store);
        assert!(inbox.receive(&message("msg-1", 3)).await.unwrap());
        assert!(!inbox.receive(&message("msg-1", 3)).await.unwrap());
        assert_eq!(inbox.unprocessed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_marks_in_progress_and_mark_processed_clears_it() {
        let store = Store::open_in_memory().unwrap();
        let inbox = Inbox::new(&store);
        inbox.receive(&message("msg-1", 3)).await.unwrap();

        let claimed = inbox.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, InboxStatus::InProgress);

        inbox.mark_processed(&[claimed[0].id.clone()]).await.unwrap();
        assert_eq!(inbox.unprocessed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_message_retries_until_max_then_stays_failed() {
        let store = Store::open_in_memory().unwrap();
        let inbox = Inbox::new(&store);
        inbox.receive(&message("msg-1", 2)).await.unwrap();

        inbox.claim(10).await.unwrap();
        inbox.mark_failed("msg-1").await.unwrap();
        let after_first = inbox.get("msg-1").await.unwrap().unwrap();
        assert_eq!(after_first.status, InboxStatus::Received);
        assert_eq!(after_first.retry_count, 1);

        inbox.claim(10).await.unwrap();
        inbox.mark_failed("msg-1").await.unwrap();
        let after_second = inbox.get("msg-1").await.unwrap().unwrap();
        assert_eq!(after_second.status, InboxStatus::Failed);
        assert_eq!(after_second.retry_count, 2);
    }

    #[tokio::test]
    async fn reset_in_progress_recovers_from_crash_between_claim_and_ack() {
        let store = Store::open_in_memory().unwrap();
        let inbox = Inbox::new(&store);
        inbox.receive(&message("msg-1", 3)).await.unwrap();
        inbox.claim(10).await.unwrap();

        let n = inbox.reset_all_in_progress().await.unwrap();
        assert_eq!(n, 1);
        let message = inbox.get("msg-1").await.unwrap().unwrap();
        assert_eq!(message.status, InboxStatus::Received);
    }

    #[tokio::test]
    async fn claim_increments_retry_count_so_repeated_crashes_exhaust_retries() {
        let store = Store::open_in_memory().unwrap();
        let inbox = Inbox::new(&store);
        inbox.receive(&message("msg-1", 3)).await.unwrap();

        for expected_retry_count in 1..=3u32 {
            let claimed = inbox.claim(10).await.unwrap();
            assert_eq!(claimed.len(), 1, "expected a claim at retry {expected_retry_count}");
            assert_eq!(claimed[0].retry_count, expected_retry_count);
            inbox.reset_in_progress(&[claimed[0].id.clone()]).await.unwrap();
        }

        // retry_count is now 3 == max_retries; the crash-recovery path
        // never got an ack in, but the message is exhausted all the same.
        let claimed = inbox.claim(10).await.unwrap();
        assert!(claimed.is_empty());
        let message = inbox.get("msg-1").await.unwrap().unwrap();
        assert_eq!(message.retry_count, 3);
        assert_eq!(message.status, InboxStatus::Received);
    }
}
