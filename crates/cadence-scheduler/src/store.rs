//! SQLite-backed persistence and claim coordination for scheduled actions.
//!
//! Every mutating operation is a single status-guarded `UPDATE`; SQLite's
//! serialized writer makes each one atomic, so the store needs no external
//! mutex to coordinate concurrent workers — in-process or across processes.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use cadence_core::config::StoreConfig;
use cadence_core::error::{CadenceError, Result};

use crate::action::{ActionKind, ActionStatus, ScheduledAction};

const ACTION_COLUMNS: &str = "id, owner_key, kind, due_at, status, payload, \
     created_at, updated_at, claimed_at, executed_at, cancelled_at, cancel_reason";

/// SQLite-backed store for all scheduled actions.
pub struct ActionStore {
    conn: Mutex<Connection>,
}

impl ActionStore {
    /// Open or create the action database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(store_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(store_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Open the database at the configured path, expanding a leading `~`.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::open(&config.resolved_db_path())
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduled_actions (
                id TEXT PRIMARY KEY,
                owner_key TEXT NOT NULL,
                kind TEXT NOT NULL,              -- 'follow_up', 'pre_event_reminder'
                due_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                payload TEXT NOT NULL DEFAULT '{}',  -- JSON
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                claimed_at TEXT,
                executed_at TEXT,
                cancelled_at TEXT,
                cancel_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_actions_status_due
                ON scheduled_actions (status, due_at);
            CREATE INDEX IF NOT EXISTS idx_actions_owner
                ON scheduled_actions (owner_key);
            ",
        )
        .map_err(|e| CadenceError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Create and persist a new pending action.
    pub fn create(
        &self,
        owner_key: &str,
        kind: ActionKind,
        due_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<ScheduledAction> {
        let action = match kind {
            ActionKind::FollowUp => ScheduledAction::follow_up(owner_key, due_at, payload),
            ActionKind::PreEventReminder => {
                ScheduledAction::pre_event_reminder(owner_key, due_at, payload)
            }
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduled_actions
             (id, owner_key, kind, due_at, status, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                action.id.to_string(),
                action.owner_key,
                action.kind.as_str(),
                ts(action.due_at),
                action.status.as_str(),
                action.payload.to_string(),
                ts(action.created_at),
                ts(action.updated_at),
            ],
        )
        .map_err(store_err)?;
        tracing::debug!(id = %action.id, owner = %action.owner_key, kind = action.kind.as_str(),
            due_at = %action.due_at, "action created");
        Ok(action)
    }

    /// Fetch a single action by ID.
    pub fn get(&self, id: uuid::Uuid) -> Result<Option<ScheduledAction>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ACTION_COLUMNS} FROM scheduled_actions WHERE id = ?1"
            ))
            .map_err(store_err)?;
        let action = stmt
            .query_row([id.to_string()], row_to_action)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(store_err)?;
        Ok(action)
    }

    /// List pending actions, optionally filtered by owner, due-soonest first.
    pub fn get_pending(&self, owner_key: Option<&str>) -> Result<Vec<ScheduledAction>> {
        let conn = self.lock()?;
        let mut actions = Vec::new();
        match owner_key {
            Some(owner) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {ACTION_COLUMNS} FROM scheduled_actions
                         WHERE status = 'pending' AND owner_key = ?1 ORDER BY due_at"
                    ))
                    .map_err(store_err)?;
                let rows = stmt.query_map([owner], row_to_action).map_err(store_err)?;
                for row in rows {
                    actions.push(row.map_err(store_err)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {ACTION_COLUMNS} FROM scheduled_actions
                         WHERE status = 'pending' ORDER BY due_at"
                    ))
                    .map_err(store_err)?;
                let rows = stmt.query_map([], row_to_action).map_err(store_err)?;
                for row in rows {
                    actions.push(row.map_err(store_err)?);
                }
            }
        }
        Ok(actions)
    }

    /// Atomically claim up to `limit` pending actions due within `lookahead`.
    ///
    /// Selection and the pending→claimed flip happen in one statement, so
    /// under N concurrent callers against M eligible rows the union of all
    /// returned rows has no duplicates.
    pub fn claim_due(
        &self,
        limit: usize,
        lookahead: chrono::Duration,
    ) -> Result<Vec<ScheduledAction>> {
        let now = Utc::now();
        let horizon = ts(now + lookahead);
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "UPDATE scheduled_actions
                 SET status = 'claimed', claimed_at = ?1, updated_at = ?1
                 WHERE id IN (
                     SELECT id FROM scheduled_actions
                     WHERE status = 'pending' AND due_at <= ?2
                     ORDER BY due_at
                     LIMIT ?3
                 )
                 RETURNING {ACTION_COLUMNS}"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![ts(now), horizon, limit as i64],
                row_to_action,
            )
            .map_err(store_err)?;
        let mut claimed = Vec::new();
        for row in rows {
            claimed.push(row.map_err(store_err)?);
        }
        Ok(claimed)
    }

    /// Transition claimed → executed. Returns `false` when the row is not
    /// currently claimed (already resolved elsewhere) — a silent no-op, not
    /// an error.
    pub fn mark_executed(&self, id: uuid::Uuid) -> Result<bool> {
        let now = ts(Utc::now());
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_actions
                 SET status = 'executed', executed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'claimed'",
                rusqlite::params![now, id.to_string()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    /// Cancel a single pending action. Returns `false` when the action is no
    /// longer pending — in-flight work cannot be retracted.
    pub fn cancel(&self, id: uuid::Uuid, reason: &str) -> Result<bool> {
        let now = ts(Utc::now());
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_actions
                 SET status = 'cancelled', cancelled_at = ?1, updated_at = ?1, cancel_reason = ?2
                 WHERE id = ?3 AND status = 'pending'",
                rusqlite::params![now, reason, id.to_string()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    /// Bulk-cancel every pending action for an owner. Claimed and executed
    /// rows are left untouched and not counted.
    pub fn cancel_pending(&self, owner_key: &str, reason: &str) -> Result<usize> {
        let now = ts(Utc::now());
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_actions
                 SET status = 'cancelled', cancelled_at = ?1, updated_at = ?1, cancel_reason = ?2
                 WHERE owner_key = ?3 AND status = 'pending'",
                rusqlite::params![now, reason, owner_key],
            )
            .map_err(store_err)?;
        Ok(changed)
    }

    /// Reset actions stuck in claimed longer than `threshold` back to
    /// pending. Claims are leases: one held past the threshold is evidence
    /// the claiming worker crashed or hung.
    pub fn reset_stale_claims(&self, threshold: chrono::Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = ts(now - threshold);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_actions
                 SET status = 'pending', claimed_at = NULL, updated_at = ?1
                 WHERE status = 'claimed' AND claimed_at <= ?2",
                rusqlite::params![ts(now), cutoff],
            )
            .map_err(store_err)?;
        if changed > 0 {
            tracing::info!(count = changed, "reset stale claims to pending");
        }
        Ok(changed)
    }

    /// Row counts per status, for health reporting.
    pub fn count_by_status(&self) -> Result<Vec<(ActionStatus, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM scheduled_actions GROUP BY status")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(store_err)?;
        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row.map_err(store_err)?;
            if let Some(status) = ActionStatus::parse(&status) {
                counts.push((status, count as usize));
            }
        }
        Ok(counts)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::Store(format!("connection lock poisoned: {e}")))
    }
}

fn store_err<E: std::fmt::Display>(e: E) -> CadenceError {
    CadenceError::Store(e.to_string())
}

/// Fixed-width RFC 3339 (UTC, microseconds) so timestamp strings compare
/// correctly as text in SQL.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledAction> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let payload_str: String = row.get(5)?;

    Ok(ScheduledAction {
        id: uuid::Uuid::parse_str(&id_str)
            .map_err(|e| conversion_err(0, format!("bad uuid: {e}")))?,
        owner_key: row.get(1)?,
        kind: ActionKind::parse(&kind_str)
            .ok_or_else(|| conversion_err(2, format!("unknown kind '{kind_str}'")))?,
        due_at: parse_ts(row, 3)?,
        status: ActionStatus::parse(&status_str)
            .ok_or_else(|| conversion_err(4, format!("unknown status '{status_str}'")))?,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| conversion_err(5, format!("bad payload: {e}")))?,
        created_at: parse_ts(row, 6)?,
        updated_at: parse_ts(row, 7)?,
        claimed_at: parse_ts_opt(row, 8)?,
        executed_at: parse_ts_opt(row, 9)?,
        cancelled_at: parse_ts_opt(row, 10)?,
        cancel_reason: row.get(11)?,
    })
}

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("bad timestamp: {e}")))
}

fn parse_ts_opt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, format!("bad timestamp: {e}"))),
        None => Ok(None),
    }
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn mem_store() -> ActionStore {
        ActionStore::open_in_memory().unwrap()
    }

    fn due_now(store: &ActionStore, owner: &str) -> ScheduledAction {
        store
            .create(
                owner,
                ActionKind::FollowUp,
                Utc::now() - chrono::Duration::seconds(1),
                serde_json::json!({"note": "test"}),
            )
            .unwrap()
    }

    #[test]
    fn test_create_and_get_round_trip() {
        let store = mem_store();
        let created = store
            .create(
                "conv-1",
                ActionKind::PreEventReminder,
                Utc::now() + chrono::Duration::hours(1),
                serde_json::json!({"event_id": "ev-9"}),
            )
            .unwrap();

        let loaded = store.get(created.id).unwrap().unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.kind, ActionKind::PreEventReminder);
        assert_eq!(loaded.status, ActionStatus::Pending);
        assert_eq!(loaded.payload["event_id"], "ev-9");
        assert!(store.get(uuid::Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_get_pending_filters_by_owner() {
        let store = mem_store();
        due_now(&store, "conv-a");
        due_now(&store, "conv-a");
        due_now(&store, "conv-b");

        assert_eq!(store.get_pending(None).unwrap().len(), 3);
        assert_eq!(store.get_pending(Some("conv-a")).unwrap().len(), 2);
        assert_eq!(store.get_pending(Some("conv-c")).unwrap().len(), 0);
    }

    #[test]
    fn test_claim_due_respects_limit_and_horizon() {
        let store = mem_store();
        for _ in 0..3 {
            due_now(&store, "conv-1");
        }
        // Not yet due, beyond any lookahead used below
        store
            .create(
                "conv-1",
                ActionKind::FollowUp,
                Utc::now() + chrono::Duration::hours(2),
                serde_json::json!({}),
            )
            .unwrap();

        let claimed = store.claim_due(2, chrono::Duration::seconds(60)).unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|a| a.status == ActionStatus::Claimed));
        assert!(claimed.iter().all(|a| a.claimed_at.is_some()));

        // One eligible row left; the far-future one stays pending
        let claimed = store.claim_due(10, chrono::Duration::seconds(60)).unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_due(10, chrono::Duration::seconds(60)).unwrap().is_empty());
    }

    #[test]
    fn test_claim_due_lookahead_window() {
        let store = mem_store();
        store
            .create(
                "conv-1",
                ActionKind::FollowUp,
                Utc::now() + chrono::Duration::seconds(30),
                serde_json::json!({}),
            )
            .unwrap();

        assert!(store.claim_due(10, chrono::Duration::zero()).unwrap().is_empty());
        assert_eq!(store.claim_due(10, chrono::Duration::seconds(60)).unwrap().len(), 1);
    }

    #[test]
    fn test_exclusive_claim_under_concurrency() {
        let dir = std::env::temp_dir().join(format!("cadence-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = Arc::new(ActionStore::open(&dir.join("actions.db")).unwrap());

        let mut expected = HashSet::new();
        for _ in 0..10 {
            expected.insert(due_now(&store, "conv-burst").id);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store
                    .claim_due(10, chrono::Duration::seconds(5))
                    .unwrap()
                    .into_iter()
                    .map(|a| a.id)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.extend(handle.join().unwrap());
        }
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), unique.len(), "an action was claimed twice");
        assert_eq!(unique, expected);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_mark_executed_is_idempotent() {
        let store = mem_store();
        let action = due_now(&store, "conv-1");
        let claimed = store.claim_due(1, chrono::Duration::zero()).unwrap();
        assert_eq!(claimed[0].id, action.id);

        assert!(store.mark_executed(action.id).unwrap());
        assert!(!store.mark_executed(action.id).unwrap());

        let loaded = store.get(action.id).unwrap().unwrap();
        assert_eq!(loaded.status, ActionStatus::Executed);
        assert!(loaded.executed_at.is_some());
    }

    #[test]
    fn test_cancel_guard() {
        let store = mem_store();
        let first = due_now(&store, "conv-1");
        assert!(store.cancel(first.id, "prospect replied").unwrap());
        let loaded = store.get(first.id).unwrap().unwrap();
        assert_eq!(loaded.status, ActionStatus::Cancelled);
        assert_eq!(loaded.cancel_reason.as_deref(), Some("prospect replied"));

        // Claimed rows cannot be retracted
        let second = due_now(&store, "conv-1");
        store.claim_due(1, chrono::Duration::zero()).unwrap();
        assert!(!store.cancel(second.id, "too late").unwrap());
        assert_eq!(
            store.get(second.id).unwrap().unwrap().status,
            ActionStatus::Claimed
        );
    }

    #[test]
    fn test_cancel_pending_bulk_skips_claimed() {
        let store = mem_store();
        // Claim the due-soonest conv-x action, leave the rest pending
        let claimed = store
            .create(
                "conv-x",
                ActionKind::FollowUp,
                Utc::now() - chrono::Duration::minutes(5),
                serde_json::json!({}),
            )
            .unwrap();
        due_now(&store, "conv-x");
        due_now(&store, "conv-x");
        due_now(&store, "conv-y");
        let batch = store.claim_due(1, chrono::Duration::zero()).unwrap();
        assert_eq!(batch[0].id, claimed.id);

        assert_eq!(store.cancel_pending("conv-x", "opted out").unwrap(), 2);
        assert!(store.get_pending(Some("conv-x")).unwrap().is_empty());
        assert_eq!(store.get_pending(Some("conv-y")).unwrap().len(), 1);
        // The claimed row was not retracted
        assert_eq!(
            store.get(claimed.id).unwrap().unwrap().status,
            ActionStatus::Claimed
        );
    }

    #[test]
    fn test_reset_stale_claims_threshold() {
        let store = mem_store();
        let action = due_now(&store, "conv-1");
        store.claim_due(1, chrono::Duration::zero()).unwrap();

        // Fresh claim: a generous threshold leaves it alone
        assert_eq!(store.reset_stale_claims(chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(
            store.get(action.id).unwrap().unwrap().status,
            ActionStatus::Claimed
        );

        // Zero threshold treats any claim as stale — simulates elapsed time
        assert_eq!(store.reset_stale_claims(chrono::Duration::zero()).unwrap(), 1);
        let loaded = store.get(action.id).unwrap().unwrap();
        assert_eq!(loaded.status, ActionStatus::Pending);
        assert!(loaded.claimed_at.is_none());

        // Recovered action is claimable again
        assert_eq!(store.claim_due(1, chrono::Duration::zero()).unwrap().len(), 1);
    }

    #[test]
    fn test_terminal_rows_are_not_claimable() {
        let store = mem_store();
        let executed = due_now(&store, "conv-1");
        store.claim_due(1, chrono::Duration::zero()).unwrap();
        store.mark_executed(executed.id).unwrap();

        let cancelled = due_now(&store, "conv-1");
        store.cancel(cancelled.id, "n/a").unwrap();

        assert!(store.claim_due(10, chrono::Duration::seconds(60)).unwrap().is_empty());
    }

    #[test]
    fn test_from_config_resolves_path() {
        let dir = std::env::temp_dir().join(format!("cadence-cfg-{}", uuid::Uuid::new_v4()));
        let config = StoreConfig {
            db_path: dir.join("actions.db").to_string_lossy().into_owned(),
        };
        let store = ActionStore::from_config(&config).unwrap();
        due_now(&store, "conv-1");
        assert_eq!(store.get_pending(None).unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_payload_row_surfaces_an_error() {
        let store = mem_store();
        let action = due_now(&store, "conv-1");
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE scheduled_actions SET payload = 'not json' WHERE id = ?1",
                [action.id.to_string()],
            )
            .unwrap();
        assert!(matches!(store.get(action.id), Err(CadenceError::Store(_))));
    }

    #[test]
    fn test_count_by_status() {
        let store = mem_store();
        due_now(&store, "conv-1");
        due_now(&store, "conv-1");
        let claimed = store.claim_due(1, chrono::Duration::zero()).unwrap();
        store.mark_executed(claimed[0].id).unwrap();

        let counts = store.count_by_status().unwrap();
        let get = |s: ActionStatus| {
            counts
                .iter()
                .find(|(status, _)| *status == s)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };
        assert_eq!(get(ActionStatus::Pending), 1);
        assert_eq!(get(ActionStatus::Executed), 1);
    }
}
