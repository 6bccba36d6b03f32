//! Approval broker — spec §4.3.4 "quarantine resolution".
//!
//! A quarantined tool call becomes a durable `ApprovalRequest` awaiting
//! an out-of-band human decision (over whatever channel the deployment
//! wires up — this crate only owns the durable state machine). Requests
//! left `pending` past `expires_at` resolve to `Expired` lazily, the
//! first time they're read, rather than through a background sweep.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{ApprovalRequest, ApprovalStatus, MonotonicId, RiskLevel};

pub struct ApprovalBroker<'a> {
    store: &'a Store,
}

impl<'a> ApprovalBroker<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// File a new approval request, pending for `ttl`.
    pub async fn request(
        &self,
        tool_name: &str,
        tool_args: serde_json::Value,
        risk_level: RiskLevel,
        human_message: &str,
        ttl: Duration,
    ) -> Result<ApprovalRequest, StoreError> {
        let id = MonotonicId::new().to_string();
        let now = Utc::now();
        let expires_at = now + ttl;
        let tool_args_json = tool_args.to_string();

        self.store
            .read({
                let id = id.clone();
                let tool_name = tool_name.to_string();
                let human_message = human_message.to_string();
                move |conn| {
                    conn.execute(
                        "INSERT INTO approval_requests
                            (id, tool_name, tool_args, risk_level, human_message, status,
                             created_at, expires_at, resolved_at, resolver)
                         VALUES (?1,?2,?3,?4,?5,'pending',?6,?7,NULL,NULL)",
                        params![
                            id,
                            tool_name,
                            tool_args_json,
                            risk_level.as_str(),
                            human_message,
                            now.to_rfc3339(),
                            expires_at.to_rfc3339(),
                        ],
                    )?;
                    Ok(())
                }
            })
            .await?;

        Ok(ApprovalRequest {
            id,
            tool_name: tool_name.to_string(),
            tool_args,
            risk_level,
            human_message: human_message.to_string(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at,
            resolved_at: None,
            resolver: None,
        })
    }

    /// Read one request, lazily expiring it if its TTL has passed.
    pub async fn get(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        let id = id.to_string();
        let request = self
            .store
            .read(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, tool_name, tool_args, risk_level, human_message, status,
                                created_at, expires_at, resolved_at, resolver
                         FROM approval_requests WHERE id = ?1",
                        params![id],
                        row_to_request,
                    )
                    .optional()?)
            })
            .await?;

        let Some(mut request) = request else { return Ok(None) };
        if request.status == ApprovalStatus::Pending && request.expires_at <= Utc::now() {
            self.resolve(&request.id, ApprovalStatus::Expired, "timeout").await?;
            request.status = ApprovalStatus::Expired;
            request.resolved_at = Some(Utc::now());
        }
        Ok(Some(request))
    }

    /// Resolve a pending request. Resolving an already-resolved request
    /// is a no-op (the `status = 'pending'` guard keeps this idempotent).
    pub async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolver: &str,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let resolver = resolver.to_string();
        self.store
            .read(move |conn| {
                conn.execute(
                    "UPDATE approval_requests SET status = ?1, resolved_at = ?2, resolver = ?3
                     WHERE id = ?4 AND status = 'pending'",
                    params![status.as_str(), Utc::now().to_rfc3339(), resolver, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn approve(&self, id: &str, resolver: &str) -> Result<(), StoreError> {
        self.resolve(id, ApprovalStatus::Approved, resolver).await
    }

    pub async fn deny(&self, id: &str, resolver: &str) -> Result<(), StoreError> {
        self.resolve(id, ApprovalStatus::Denied, resolver).await
    }

    /// Pending requests, oldest first — what a human-facing surface
    /// would poll to render a review queue.
    pub async fn pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        self.store
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, tool_name, tool_args, risk_level, human_message, status,
                            created_at, expires_at, resolved_at, resolver
                     FROM approval_requests WHERE status = 'pending' ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map([], row_to_request)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<ApprovalRequest> {
    let tool_args_raw: String = row.get(2)?;
    let risk_raw: String = row.get(3)?;
    let status_raw: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let expires_at: String = row.get(7)?;
    let resolved_at: Option<String> = row.get(8)?;

    Ok(ApprovalRequest {
        id: row.get(0)?,
        tool_name: row.get(1)?,
        tool_args: crate::store::safe_json_decode(&tool_args_raw, "approval_requests.tool_args"),
        risk_level: match risk_raw.as_str() {
            "safe" => RiskLevel::Safe,
            "caution" => RiskLevel::Caution,
            "dangerous" => RiskLevel::Dangerous,
            _ => RiskLevel::Forbidden,
        },
        human_message: row.get(4)?,
        status: match status_raw.as_str() {
            "pending" => ApprovalStatus::Pending,
            "approved" => ApprovalStatus::Approved,
            "denied" => ApprovalStatus::Denied,
            _ => ApprovalStatus::Expired,
        },
        created_at: parse_rfc3339(&created_at).unwrap_or_else(Utc::now),
        expires_at: parse_rfc3339(&expires_at).unwrap_or_else(Utc::now),
        resolved_at: resolved_at.and_then(|s| parse_rfc3339(&s)),
        resolver: row.get(9)?,
    })
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn request_then_approve_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let broker = ApprovalBroker::new(&store);
        let request = broker
            .request(
                "transfer_credits",
                json!({"amount_cents": 2000}),
                RiskLevel::Dangerous,
                "Transfer exceeds confirmation threshold",
                Duration::hours(1),
            )
            .await
            .unwrap();

        broker.approve(&request.id, "operator@example.com").await.unwrap();
        let resolved = broker.get(&request.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.resolver.as_deref(), Some("operator@example.com"));
    }

    #[tokio::test]
    async fn pending_request_past_ttl_expires_lazily() {
        let store = Store::open_in_memory().unwrap();
        let broker = ApprovalBroker::new(&store);
        let request = broker
            .request(
                "x402_fetch",
                json!({}),
                RiskLevel::Caution,
                "awaiting confirmation",
                Duration::seconds(-1),
            )
            .await
            .unwrap();

        let read_back = broker.get(&request.id).await.unwrap().unwrap();
        assert_eq!(read_back.status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn resolving_twice_keeps_first_resolution() {
        let store = Store::open_in_memory().unwrap();
        let broker = ApprovalBroker::new(&store);
        let request = broker
            .request("transfer_credits", json!({}), RiskLevel::Dangerous, "msg", Duration::hours(1))
            .await
            .unwrap();

        broker.approve(&request.id, "alice").await.unwrap();
        broker.deny(&request.id, "bob").await.unwrap();

        let resolved = broker.get(&request.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.resolver.as_deref(), Some("alice"));
    }
}
