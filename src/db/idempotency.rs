//! Idempotency ledger repository
//!
//! Each deduplicated command owns exactly one row, keyed by its idempotency
//! key. The row is created `accepted` by the one caller whose insert wins the
//! `UNIQUE(idempotency_key)` constraint and moves once to `completed` or
//! `failed`, carrying the response payload that every later duplicate replays.

use std::fmt;
use std::str::FromStr;

use rusqlite::OptionalExtension;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::{Error, Result};

/// Lifecycle status of a ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    /// Reserved, execution in flight
    Accepted,
    /// Executed successfully; payload is the success response
    Completed,
    /// Execution failed; payload is the failure response
    Failed,
}

impl LedgerStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the status can no longer change
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Accepted)
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status string that does not name a ledger status
#[derive(Debug, thiserror::Error)]
#[error("unknown ledger status: {0}")]
pub struct UnknownStatus(String);

impl FromStr for LedgerStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl ToSql for LedgerStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for LedgerStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: UnknownStatus| FromSqlError::Other(Box::new(e)))
    }
}

/// Status a record may be completed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    /// Command executed
    Completed,
    /// Command failed
    Failed,
}

impl From<TerminalStatus> for LedgerStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => Self::Completed,
            TerminalStatus::Failed => Self::Failed,
        }
    }
}

/// What a duplicate submission needs to know about a key
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub status: LedgerStatus,
    /// Response payload; `None` while `accepted`
    pub result_payload: Option<serde_json::Value>,
}

/// Full ledger row
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub device_id: String,
    pub capability: String,
    pub created_at: String,
    pub status: LedgerStatus,
    pub result_payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Durable reservation ledger for deduplicated commands
///
/// Implementations must make `reserve` atomic in the storage itself: of any
/// number of concurrent callers for one key, exactly one observes `true`,
/// including callers in other processes sharing the same store.
pub trait IdempotencyLedger: Send + Sync {
    /// Create an `accepted` record for `key` if none exists
    ///
    /// Returns `false` when the key is already owned. That is not an error.
    ///
    /// # Errors
    ///
    /// Returns error only for genuine storage failures
    fn reserve(&self, key: &str, device_id: &str, capability: &str) -> Result<bool>;

    /// Record the terminal status and payload of a reservation
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the record is missing or already
    /// terminal, or a storage error
    fn complete(&self, key: &str, payload: &serde_json::Value, status: TerminalStatus)
    -> Result<()>;

    /// Read the status and payload recorded for `key`
    ///
    /// # Errors
    ///
    /// Returns error on storage failure or an unreadable stored payload
    fn lookup(&self, key: &str) -> Result<Option<LedgerEntry>>;
}

/// `SQLite`-backed idempotency ledger
#[derive(Debug, Clone)]
pub struct IdempotencyRepo {
    pool: DbPool,
}

impl IdempotencyRepo {
    /// Create a new repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the full record for a key
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT idempotency_key, device_id, capability, created_at, status, result_json, completed_at
                 FROM idempotency WHERE idempotency_key = ?1",
                [key],
                RawRecord::from_row,
            )
            .optional()?;

        row.map(RawRecord::into_record).transpose()
    }

    /// List records with the given status, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_by_status(&self, status: LedgerStatus) -> Result<Vec<IdempotencyRecord>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT idempotency_key, device_id, capability, created_at, status, result_json, completed_at
             FROM idempotency WHERE status = ?1 ORDER BY id",
        )?;

        let rows = stmt
            .query_map([status], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawRecord::into_record).collect()
    }
}

impl IdempotencyLedger for IdempotencyRepo {
    fn reserve(&self, key: &str, device_id: &str, capability: &str) -> Result<bool> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        // Only a uniqueness conflict is swallowed; NOT NULL or CHECK violations
        // and I/O errors still surface
        let inserted = conn.execute(
            "INSERT INTO idempotency (idempotency_key, device_id, capability, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(idempotency_key) DO NOTHING",
            rusqlite::params![
                key,
                device_id,
                capability,
                chrono::Utc::now().to_rfc3339(),
                LedgerStatus::Accepted,
            ],
        )?;

        Ok(inserted == 1)
    }

    fn complete(
        &self,
        key: &str,
        payload: &serde_json::Value,
        status: TerminalStatus,
    ) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let payload_json = serde_json::to_string(payload)?;

        let updated = conn.execute(
            "UPDATE idempotency SET status = ?1, result_json = ?2, completed_at = ?3
             WHERE idempotency_key = ?4 AND status = 'accepted'",
            rusqlite::params![
                LedgerStatus::from(status),
                payload_json,
                chrono::Utc::now().to_rfc3339(),
                key,
            ],
        )?;

        if updated == 0 {
            return Err(Error::InvalidTransition {
                key: key.to_string(),
            });
        }

        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT status, result_json FROM idempotency WHERE idempotency_key = ?1",
                [key],
                |row| {
                    Ok((
                        row.get::<_, LedgerStatus>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, result_json)) = row else {
            return Ok(None);
        };

        let result_payload = result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Some(LedgerEntry {
            status,
            result_payload,
        }))
    }
}

/// Row as stored, before the payload is parsed
struct RawRecord {
    key: String,
    device_id: String,
    capability: String,
    created_at: String,
    status: LedgerStatus,
    result_json: Option<String>,
    completed_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            device_id: row.get(1)?,
            capability: row.get(2)?,
            created_at: row.get(3)?,
            status: row.get(4)?,
            result_json: row.get(5)?,
            completed_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<IdempotencyRecord> {
        let result_payload = self
            .result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(IdempotencyRecord {
            key: self.key,
            device_id: self.device_id,
            capability: self.capability,
            created_at: self.created_at,
            status: self.status,
            result_payload,
            completed_at: self.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use serde_json::json;

    use super::*;
    use crate::db;

    fn repo() -> IdempotencyRepo {
        IdempotencyRepo::new(db::init_memory().unwrap())
    }

    #[test]
    fn reserve_only_once() {
        let repo = repo();

        assert!(repo.reserve("abcdefgh", "plc-1", "modbus.write_coil@v1").unwrap());
        assert!(!repo.reserve("abcdefgh", "plc-1", "modbus.write_coil@v1").unwrap());
        // A different device does not unlock a taken key
        assert!(!repo.reserve("abcdefgh", "plc-2", "opcua.write@v1").unwrap());
    }

    #[test]
    fn lookup_absent_key() {
        assert!(repo().lookup("missing-key").unwrap().is_none());
    }

    #[test]
    fn accepted_record_has_no_payload() {
        let repo = repo();
        repo.reserve("key-0001", "plc-1", "modbus.read_hr@v1").unwrap();

        let entry = repo.lookup("key-0001").unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Accepted);
        assert!(entry.result_payload.is_none());
    }

    #[test]
    fn complete_records_payload() {
        let repo = repo();
        repo.reserve("key-0002", "plc-1", "modbus.write_hr@v1").unwrap();

        let payload = json!({"ok": true, "result": {"kind": "modbus.write_hr", "value": 456}});
        repo.complete("key-0002", &payload, TerminalStatus::Completed)
            .unwrap();

        let entry = repo.lookup("key-0002").unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Completed);
        assert_eq!(entry.result_payload, Some(payload));

        let record = repo.get("key-0002").unwrap().unwrap();
        assert_eq!(record.device_id, "plc-1");
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn terminal_status_never_reverts() {
        let repo = repo();
        repo.reserve("key-0003", "plc-1", "opcua.write@v1").unwrap();

        let failure = json!({"ok": false, "error": {"code": "execution_failed"}});
        repo.complete("key-0003", &failure, TerminalStatus::Failed)
            .unwrap();

        let err = repo
            .complete("key-0003", &json!({"ok": true}), TerminalStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let entry = repo.lookup("key-0003").unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.result_payload, Some(failure));
    }

    #[test]
    fn complete_without_reservation_fails() {
        let err = repo()
            .complete("never-reserved", &json!({}), TerminalStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn storage_failure_is_not_a_duplicate() {
        let pool = db::init_memory().unwrap();
        pool.get()
            .unwrap()
            .execute_batch("DROP TABLE idempotency")
            .unwrap();
        let repo = IdempotencyRepo::new(pool);

        let result = repo.reserve("abcdefgh", "plc-1", "modbus.write_coil@v1");
        assert!(matches!(result, Err(Error::Sqlite(_))));
    }

    #[test]
    fn corrupt_payload_surfaces_as_error() {
        let pool = db::init_memory().unwrap();
        let repo = IdempotencyRepo::new(pool.clone());
        repo.reserve("key-0004", "plc-1", "opcua.read@v1").unwrap();
        pool.get()
            .unwrap()
            .execute(
                "UPDATE idempotency SET status = 'completed', result_json = '{not json' WHERE idempotency_key = 'key-0004'",
                [],
            )
            .unwrap();

        assert!(matches!(
            repo.lookup("key-0004"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn list_pending_records() {
        let repo = repo();
        repo.reserve("key-a-0001", "plc-1", "opcua.read@v1").unwrap();
        repo.reserve("key-b-0002", "plc-1", "opcua.read@v1").unwrap();
        repo.complete("key-a-0001", &json!({"ok": true}), TerminalStatus::Completed)
            .unwrap();

        let pending = repo.list_by_status(LedgerStatus::Accepted).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "key-b-0002");
    }

    #[test]
    fn concurrent_reservers_yield_one_winner() {
        const CALLERS: usize = 16;

        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(IdempotencyRepo::new(
            db::init(dir.path().join("state.sqlite")).unwrap(),
        ));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    repo.reserve("race-key-01", "plc-1", "modbus.write_coil@v1")
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn separate_pools_share_uniqueness() {
        // Two pools on one file stand in for two gateway processes
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let first = IdempotencyRepo::new(db::init(&path).unwrap());
        let second = IdempotencyRepo::new(db::init(&path).unwrap());

        assert!(first.reserve("shared-key", "plc-1", "opcua.write@v1").unwrap());
        assert!(!second.reserve("shared-key", "plc-1", "opcua.write@v1").unwrap());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            LedgerStatus::Accepted,
            LedgerStatus::Completed,
            LedgerStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<LedgerStatus>().unwrap(), status);
        }
        assert!("pending".parse::<LedgerStatus>().is_err());
        assert!(!LedgerStatus::Accepted.is_terminal());
        assert!(LedgerStatus::Failed.is_terminal());
    }
}
