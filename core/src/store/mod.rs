//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Ledgers call store methods: they never execute SQL directly.
//! Every mutating method takes `now` and touches `updated_at` itself.

use crate::{
    error::{LedgerError, LedgerResult},
    event::EventLogEntry,
    types::{Tick, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

mod billing;
mod catalog;
mod notification;
mod risk;
mod schedule;

pub use catalog::CatalogSeed;

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for a private :memory: database
}

impl LedgerStore {
    pub fn open(path: &str) -> LedgerResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open a private in-memory database. `reopen()` on it yields an empty one.
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open a named in-memory database that every `reopen()` shares.
    /// Lives until the last connection to it closes.
    pub fn shared_memory(name: &str) -> LedgerResult<Self> {
        Self::open(&format!("file:{name}?mode=memory&cache=shared"))
    }

    /// Open a new connection to the same database.
    /// Private in-memory databases cannot be shared and come back empty.
    pub fn reopen(&self) -> LedgerResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_subscriptions.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_risk.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_notifications.sql"))?;
        Ok(())
    }

    /// Run `f` as one atomic unit under `BEGIN IMMEDIATE`, so the write lock
    /// is taken before any guard query reads. Nested calls join the outer unit.
    pub fn atomic<T>(&self, f: impl FnOnce(&Self) -> LedgerResult<T>) -> LedgerResult<T> {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(
        &self,
        run_id: &str,
        seed: u64,
        version: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO engine_run (run_id, seed, version, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, seed as i64, version, now],
        )?;
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, tick, subsystem, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.run_id,
                entry.tick as i64,
                entry.subsystem,
                entry.event_type,
                entry.payload,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_tick(&self, run_id: &str, tick: Tick) -> LedgerResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, tick, subsystem, event_type, payload, created_at
             FROM event_log WHERE run_id = ?1 AND tick = ?2
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id, tick as i64], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    tick: row.get::<_, i64>(2)? as u64,
                    subsystem: row.get(3)?,
                    event_type: row.get(4)?,
                    payload: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, run_id: &str, event_type: &str) -> LedgerResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE run_id = ?1 AND event_type = ?2",
            params![run_id, event_type],
            |r| r.get(0),
        )?)
    }

    // ── Users ──────────────────────────────────────────────────

    pub fn insert_user(&self, user_id: UserId, email: &str, now: DateTime<Utc>) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO users (id, email, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, email, now],
            )
            .map_err(|e| LedgerError::from_constraint(e, "user"))?;
        Ok(())
    }

    pub fn user_exists(&self, user_id: UserId) -> LedgerResult<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![user_id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Fails with `NotFound` unless the user row exists.
    pub fn require_user(&self, user_id: UserId) -> LedgerResult<()> {
        if self.user_exists(user_id)? {
            Ok(())
        } else {
            Err(LedgerError::not_found("user", user_id))
        }
    }

    /// Delete a user. Owned rows follow each table's ON DELETE rule.
    pub fn delete_user(&self, user_id: UserId) -> LedgerResult<()> {
        let n = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        if n == 0 {
            return Err(LedgerError::not_found("user", user_id));
        }
        Ok(())
    }

    /// Row count for any table owned by a user. Test and summary helper.
    pub fn owned_row_count(&self, table: OwnedTable, user_id: UserId) -> LedgerResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE user_id = ?1", table.name());
        Ok(self.conn.query_row(&sql, params![user_id], |r| r.get(0))?)
    }

    pub fn user_count(&self) -> LedgerResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
    }
}

/// Tables carrying a `user_id` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnedTable {
    Subscriptions,
    Invoices,
    PaymentMethods,
    UsageLogs,
    Assessments,
    Trends,
    Alerts,
    Thresholds,
    Notifications,
    Preferences,
    Schedules,
}

impl OwnedTable {
    fn name(self) -> &'static str {
        match self {
            Self::Subscriptions => "user_subscriptions",
            Self::Invoices => "invoices",
            Self::PaymentMethods => "payment_methods",
            Self::UsageLogs => "usage_logs",
            Self::Assessments => "risk_assessments",
            Self::Trends => "risk_trends",
            Self::Alerts => "risk_alerts",
            Self::Thresholds => "risk_thresholds",
            Self::Notifications => "notifications",
            Self::Preferences => "notification_preferences",
            Self::Schedules => "notification_schedules",
        }
    }
}

// ── Column helpers ─────────────────────────────────────────────

/// Read a JSON column into its typed document.
pub(crate) fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Serialize a typed document for a JSON column.
pub(crate) fn to_json<T: Serialize>(doc: &T) -> LedgerResult<String> {
    Ok(serde_json::to_string(doc)?)
}
