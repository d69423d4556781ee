//! Notification schedule queries.

use super::{json_at, to_json, LedgerStore};
use crate::{
    error::{LedgerError, LedgerResult},
    schedule_subsystem::ScheduleRow,
    types::{ScheduleId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const SCHEDULE_COLUMNS: &str = "id, user_id, template_id, name, schedule_type, schedule_data,
     template_variables, is_active, run_count, max_runs, last_run_at, next_run_at, version,
     created_at, updated_at";

impl LedgerStore {
    pub fn insert_schedule(&self, s: &ScheduleRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO notification_schedules (
                    id, user_id, template_id, name, schedule_type, schedule_data,
                    template_variables, is_active, run_count, max_runs, last_run_at,
                    next_run_at, version, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    s.id,
                    s.user_id,
                    s.template_id,
                    s.name,
                    s.data.schedule_type(),
                    to_json(&s.data)?,
                    to_json(&s.template_variables)?,
                    s.is_active,
                    s.run_count,
                    s.max_runs,
                    s.last_run_at,
                    s.next_run_at,
                    s.version,
                    s.created_at,
                    s.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "notification schedule"))?;
        Ok(())
    }

    pub fn get_schedule(&self, id: ScheduleId) -> LedgerResult<Option<ScheduleRow>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM notification_schedules WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_schedule_row)
            .optional()?)
    }

    pub fn schedules_for_user(&self, user_id: UserId) -> LedgerResult<Vec<ScheduleRow>> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM notification_schedules
             WHERE user_id = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], map_schedule_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active schedules whose cursor is at or before `now`, earliest first.
    pub fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> LedgerResult<Vec<ScheduleRow>> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM notification_schedules
             WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at ASC, rowid ASC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![now, limit as i64], map_schedule_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Optimistic write: succeeds only if the row is still at `s.version`.
    pub fn update_schedule(&self, s: &ScheduleRow, now: DateTime<Utc>) -> LedgerResult<()> {
        let n = self.conn.execute(
            "UPDATE notification_schedules
             SET is_active = ?1, run_count = ?2, last_run_at = ?3, next_run_at = ?4,
                 template_variables = ?5, version = version + 1, updated_at = ?6
             WHERE id = ?7 AND version = ?8",
            params![
                s.is_active,
                s.run_count,
                s.last_run_at,
                s.next_run_at,
                to_json(&s.template_variables)?,
                now,
                s.id,
                s.version,
            ],
        )?;
        if n == 0 {
            return match self.get_schedule(s.id)? {
                Some(_) => Err(LedgerError::StaleWrite {
                    entity: "notification schedule",
                    id: s.id,
                    expected: s.version,
                }),
                None => Err(LedgerError::not_found("notification schedule", s.id)),
            };
        }
        Ok(())
    }

    pub fn delete_schedule(&self, id: ScheduleId) -> LedgerResult<()> {
        let n = self
            .conn
            .execute("DELETE FROM notification_schedules WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(LedgerError::not_found("notification schedule", id));
        }
        Ok(())
    }
}

fn map_schedule_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        template_id: row.get(2)?,
        name: row.get(3)?,
        schedule_type: row.get(4)?,
        data: json_at(row, 5)?,
        template_variables: json_at(row, 6)?,
        is_active: row.get(7)?,
        run_count: row.get(8)?,
        max_runs: row.get(9)?,
        last_run_at: row.get(10)?,
        next_run_at: row.get(11)?,
        version: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
