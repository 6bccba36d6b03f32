//! The persistent store — spec §4.1.
//!
//! A single SQLite database (WAL mode) guarded by a `tokio::sync::Mutex`,
//! grounded on the teacher's `scheduler/job_store.rs::SqliteJobStore`
//! (open/open_in_memory, WAL pragma, schema applied in one batch before
//! the connection is wrapped in the mutex to avoid a blocking lock from
//! async code).

mod schema;

use std::path::Path;

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::Mutex;

pub use schema::KNOWN_SCHEMA_VERSION;

use crate::error::StoreError;

/// The persistent store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path`, applying pending migrations
    /// and running the integrity check.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        Self::set_file_permissions(path);
        Self::init(conn)
    }

    /// Open an in-memory store — used for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn)
    }

    #[cfg(unix)]
    fn set_file_permissions(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }
        if let Some(parent) = path.parent() {
            if let Ok(metadata) = std::fs::metadata(parent) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                let _ = std::fs::set_permissions(parent, perms);
            }
        }
    }

    #[cfg(not(unix))]
    fn set_file_permissions(_path: &Path) {}

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        run_migrations(&conn)?;
        integrity_check(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Default database path: `$XDG_DATA_HOME/guardian/guardian.db`.
    pub fn default_path() -> std::path::PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        base.join("guardian").join("guardian.db")
    }

    /// Run a closure with exclusive access to the raw connection inside an
    /// explicit SQLite transaction. If the closure returns `Err`, every
    /// statement it issued is rolled back. No suspension point (`.await`)
    /// may occur between transaction begin and end, so the closure is
    /// synchronous — matching the "no suspension inside a transaction"
    /// rule in spec §5.
    pub async fn run_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| StoreError::Transaction(e.to_string()))?;
                Ok(value)
            }
            Err(e) => {
                // `tx` drops here and rolls back automatically.
                Err(e)
            }
        }
    }

    /// Alias kept for call sites that read more naturally as
    /// `with_transaction` (spec §4.1 names both forms).
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    {
        self.run_transaction(f).await
    }

    /// Run a read-only closure against the connection without opening an
    /// explicit transaction (SQLite wraps each statement implicitly).
    pub async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Issue a checkpoint of the write-ahead log — spec §4.1 "a periodic
    /// checkpoint operation is exposed".
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }

    /// Set a KV entry.
    pub async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.read(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, created_at = excluded.created_at",
                rusqlite::params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Get a KV entry.
    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
            let value = stmt
                .query_row(rusqlite::params![key], |row| row.get::<_, String>(0))
                .optional()?;
            Ok(value)
        })
        .await
    }

    /// Atomically fetch and delete a single key — used to consume
    /// single-key wakeup signals (spec §4.1 `delete_kv_returning`).
    pub async fn delete_kv_returning(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run_transaction(|tx| {
            let mut stmt = tx.prepare("SELECT value FROM kv WHERE key = ?1")?;
            let value = stmt
                .query_row(rusqlite::params![key], |row| row.get::<_, String>(0))
                .optional()?;
            if value.is_some() {
                tx.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
            }
            Ok(value)
        })
        .await
    }

    /// Prefix-scoped deletion of KV records older than `retention_days`.
    pub async fn prune_kv(&self, prefix: &str, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        self.read(|conn| {
            let pattern = format!("{prefix}%");
            let n = conn.execute(
                "DELETE FROM kv WHERE key LIKE ?1 AND created_at < ?2",
                rusqlite::params![pattern, cutoff.to_rfc3339()],
            )?;
            Ok(n)
        })
        .await
    }
}

use rusqlite::OptionalExtension;

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    // schema_version is guaranteed present after the first migration; on
    // a brand-new database the table doesn't exist yet, so probe safely.
    let current: u32 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or(None)
        .unwrap_or(0);

    if current > KNOWN_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: current,
            known: KNOWN_SCHEMA_VERSION,
        });
    }

    for (version, sql) in schema::migrations() {
        if version <= current {
            continue;
        }
        conn.execute_batch(sql).map_err(|e| {
            tracing::error!(version, error = %e, "migration failed");
            StoreError::Migration {
                version,
                reason: e.to_string(),
            }
        })?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, Utc::now().to_rfc3339()],
        )?;
    }
    Ok(())
}

/// Full structural self-check run on open. Fails closed: any integrity
/// problem yields an error whose message contains "integrity".
fn integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| {
            tracing::error!(error = %e, "integrity check query failed");
            StoreError::Integrity(e.to_string())
        })?;
    if result != "ok" {
        tracing::error!(result = %result, "store integrity check reported corruption");
        return Err(StoreError::Integrity(result));
    }
    Ok(())
}

/// Safely decode a JSON column: malformed content yields the typed
/// default and logs the error rather than propagating a parse failure —
/// spec §4.1 "Safe JSON decode".
pub fn safe_json_decode<T: serde::de::DeserializeOwned + Default>(raw: &str, context: &str) -> T {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(context, error = %e, "malformed JSON column, returning default");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_and_runs_integrity_check() {
        let store = Store::open_in_memory().unwrap();
        store.checkpoint().await.unwrap();
    }

    #[tokio::test]
    async fn kv_roundtrip_and_delete_returning() {
        let store = Store::open_in_memory().unwrap();
        store.kv_set("foo", "bar").await.unwrap();
        assert_eq!(store.kv_get("foo").await.unwrap(), Some("bar".to_string()));
        let taken = store.delete_kv_returning("foo").await.unwrap();
        assert_eq!(taken, Some("bar".to_string()));
        assert_eq!(store.kv_get("foo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn transaction_rolls_back_fully_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store
            .run_transaction(|tx| {
                tx.execute(
                    "INSERT INTO kv (key, value, created_at) VALUES ('x','1','2024-01-01T00:00:00Z')",
                    [],
                )?;
                Err(StoreError::Transaction("forced rollback".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.kv_get("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: u32 = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, KNOWN_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn refuses_to_open_future_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (9999, '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, StoreError::FutureSchema { .. }));
    }

    #[derive(Debug, Default, PartialEq, serde::Deserialize)]
    struct Sample {
        a: u32,
    }

    #[test]
    fn safe_json_decode_returns_default_on_malformed_input() {
        let decoded: Sample = safe_json_decode("not json", "test");
        assert_eq!(decoded, Sample::default());
        let decoded: Sample = safe_json_decode(r#"{"a":5}"#, "test");
        assert_eq!(decoded, Sample { a: 5 });
    }
}
