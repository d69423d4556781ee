//! Template, notification, preference and delivery log queries.

use super::{json_at, to_json, LedgerStore};
use crate::{
    error::{LedgerError, LedgerResult},
    notification_subsystem::{
        DeliveryLogRow, NotificationRow, PreferenceRow, QuietHours, TemplateRow,
    },
    types::{
        NotificationCategory, NotificationChannel, NotificationId, NotificationStatus, TemplateId,
        UserId,
    },
};
use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const TEMPLATE_COLUMNS: &str =
    "id, name, type, category, subject, body, variables, is_active, created_at, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, template_id, type, category, title, message, data,
     status, priority, scheduled_for, sent_at, delivered_at, failed_at, failure_reason,
     retry_count, max_retries, created_at, updated_at";

const PREFERENCE_COLUMNS: &str = "id, user_id, type, category, enabled, quiet_hours_start,
     quiet_hours_end, frequency, created_at, updated_at";

impl LedgerStore {
    // ── Templates ──────────────────────────────────────────────

    pub fn insert_template(&self, t: &TemplateRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO notification_templates (
                    id, name, type, category, subject, body, variables, is_active, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    t.id,
                    t.name,
                    t.channel,
                    t.category,
                    t.subject,
                    t.body,
                    to_json(&t.variables)?,
                    t.is_active,
                    t.created_at,
                    t.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "notification template"))?;
        Ok(())
    }

    pub fn get_template(&self, id: TemplateId) -> LedgerResult<Option<TemplateRow>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM notification_templates WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_template_row)
            .optional()?)
    }

    pub fn get_template_by_name(&self, name: &str) -> LedgerResult<Option<TemplateRow>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM notification_templates WHERE name = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![name], map_template_row)
            .optional()?)
    }

    pub fn list_templates(&self) -> LedgerResult<Vec<TemplateRow>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM notification_templates ORDER BY name ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_template_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_template_active(&self, id: TemplateId, active: bool, now: DateTime<Utc>) -> LedgerResult<()> {
        let n = self.conn.execute(
            "UPDATE notification_templates SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, now, id],
        )?;
        if n == 0 {
            return Err(LedgerError::not_found("notification template", id));
        }
        Ok(())
    }

    /// Queued notifications keep their rows with `template_id` nulled;
    /// schedules built on the template are removed.
    pub fn delete_template(&self, id: TemplateId) -> LedgerResult<()> {
        let n = self
            .conn
            .execute("DELETE FROM notification_templates WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(LedgerError::not_found("notification template", id));
        }
        Ok(())
    }

    // ── Notifications ──────────────────────────────────────────

    pub fn insert_notification(&self, n: &NotificationRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO notifications (
                    id, user_id, template_id, type, category, title, message, data,
                    status, priority, priority_rank, scheduled_for, sent_at, delivered_at,
                    failed_at, failure_reason, retry_count, max_retries, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                          ?15, ?16, ?17, ?18, ?19, ?20)",
                params![
                    n.id,
                    n.user_id,
                    n.template_id,
                    n.channel,
                    n.category,
                    n.title,
                    n.message,
                    to_json(&n.data)?,
                    n.status,
                    n.priority,
                    n.priority.rank(),
                    n.scheduled_for,
                    n.sent_at,
                    n.delivered_at,
                    n.failed_at,
                    n.failure_reason,
                    n.retry_count,
                    n.max_retries,
                    n.created_at,
                    n.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "notification"))?;
        Ok(())
    }

    pub fn get_notification(&self, id: NotificationId) -> LedgerResult<Option<NotificationRow>> {
        let sql = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_notification_row)
            .optional()?)
    }

    pub fn notifications_for_user(&self, user_id: UserId) -> LedgerResult<Vec<NotificationRow>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE user_id = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], map_notification_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pending notifications whose time has come. Urgent first, then oldest.
    pub fn due_notifications(&self, now: DateTime<Utc>, limit: usize) -> LedgerResult<Vec<NotificationRow>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
             ORDER BY priority_rank DESC, COALESCE(scheduled_for, created_at) ASC, rowid ASC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![now, limit as i64], map_notification_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Write back every mutable column, but only while the row still holds
    /// `expected` status. Returns false if another writer moved it first.
    pub fn update_notification(
        &self,
        n: &NotificationRow,
        expected: NotificationStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let changed = self.conn.execute(
            "UPDATE notifications
             SET status = ?1, scheduled_for = ?2, sent_at = ?3, delivered_at = ?4, failed_at = ?5,
                 failure_reason = ?6, retry_count = ?7, updated_at = ?8
             WHERE id = ?9 AND status = ?10",
            params![
                n.status,
                n.scheduled_for,
                n.sent_at,
                n.delivered_at,
                n.failed_at,
                n.failure_reason,
                n.retry_count,
                now,
                n.id,
                expected,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn notification_count_by_status(&self, status: NotificationStatus) -> LedgerResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?)
    }

    // ── Preferences ────────────────────────────────────────────

    /// Fails with `Conflict` if the `(user, type, category)` row exists.
    pub fn insert_preference(&self, p: &PreferenceRow) -> LedgerResult<()> {
        let (start, end) = quiet_columns(p.quiet_hours);
        self.conn
            .execute(
                "INSERT INTO notification_preferences (
                    id, user_id, type, category, enabled, quiet_hours_start, quiet_hours_end,
                    frequency, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    p.id,
                    p.user_id,
                    p.channel,
                    p.category,
                    p.enabled,
                    start,
                    end,
                    p.frequency,
                    p.created_at,
                    p.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "notification preference"))?;
        Ok(())
    }

    pub fn update_preference(&self, p: &PreferenceRow, now: DateTime<Utc>) -> LedgerResult<()> {
        let (start, end) = quiet_columns(p.quiet_hours);
        let n = self.conn.execute(
            "UPDATE notification_preferences
             SET enabled = ?1, quiet_hours_start = ?2, quiet_hours_end = ?3, frequency = ?4,
                 updated_at = ?5
             WHERE id = ?6",
            params![p.enabled, start, end, p.frequency, now, p.id],
        )?;
        if n == 0 {
            return Err(LedgerError::not_found("notification preference", p.id));
        }
        Ok(())
    }

    pub fn get_preference(
        &self,
        user_id: UserId,
        channel: NotificationChannel,
        category: NotificationCategory,
    ) -> LedgerResult<Option<PreferenceRow>> {
        let sql = format!(
            "SELECT {PREFERENCE_COLUMNS} FROM notification_preferences
             WHERE user_id = ?1 AND type = ?2 AND category = ?3"
        );
        Ok(self
            .conn
            .query_row(&sql, params![user_id, channel, category], map_preference_row)
            .optional()?)
    }

    pub fn preferences_for_user(&self, user_id: UserId) -> LedgerResult<Vec<PreferenceRow>> {
        let sql = format!(
            "SELECT {PREFERENCE_COLUMNS} FROM notification_preferences
             WHERE user_id = ?1 ORDER BY type ASC, category ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], map_preference_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Delivery log ───────────────────────────────────────────

    pub fn insert_delivery_log(&self, log: &DeliveryLogRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO notification_delivery_logs (
                    id, notification_id, attempt_number, status, provider, provider_response,
                    error_message, attempted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    log.id,
                    log.notification_id,
                    log.attempt_number,
                    log.outcome,
                    log.provider,
                    to_json(&log.provider_response)?,
                    log.error_message,
                    log.attempted_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "delivery log"))?;
        Ok(())
    }

    pub fn delivery_logs_for(&self, notification_id: NotificationId) -> LedgerResult<Vec<DeliveryLogRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, notification_id, attempt_number, status, provider, provider_response,
                    error_message, attempted_at
             FROM notification_delivery_logs WHERE notification_id = ?1
             ORDER BY attempt_number ASC",
        )?;
        let rows = stmt
            .query_map(params![notification_id], |row| {
                Ok(DeliveryLogRow {
                    id: row.get(0)?,
                    notification_id: row.get(1)?,
                    attempt_number: row.get(2)?,
                    outcome: row.get(3)?,
                    provider: row.get(4)?,
                    provider_response: json_at(row, 5)?,
                    error_message: row.get(6)?,
                    attempted_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delivery_attempt_count(&self, notification_id: NotificationId) -> LedgerResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM notification_delivery_logs WHERE notification_id = ?1",
            params![notification_id],
            |r| r.get(0),
        )?)
    }
}

fn quiet_columns(window: Option<QuietHours>) -> (Option<NaiveTime>, Option<NaiveTime>) {
    match window {
        Some(w) => (Some(w.start), Some(w.end)),
        None => (None, None),
    }
}

// ── Row mappers ────────────────────────────────────────────────

fn map_template_row(row: &Row<'_>) -> rusqlite::Result<TemplateRow> {
    Ok(TemplateRow {
        id: row.get(0)?,
        name: row.get(1)?,
        channel: row.get(2)?,
        category: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        variables: json_at(row, 6)?,
        is_active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_notification_row(row: &Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        template_id: row.get(2)?,
        channel: row.get(3)?,
        category: row.get(4)?,
        title: row.get(5)?,
        message: row.get(6)?,
        data: json_at(row, 7)?,
        status: row.get(8)?,
        priority: row.get(9)?,
        scheduled_for: row.get(10)?,
        sent_at: row.get(11)?,
        delivered_at: row.get(12)?,
        failed_at: row.get(13)?,
        failure_reason: row.get(14)?,
        retry_count: row.get(15)?,
        max_retries: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

fn map_preference_row(row: &Row<'_>) -> rusqlite::Result<PreferenceRow> {
    let start: Option<NaiveTime> = row.get(5)?;
    let end: Option<NaiveTime> = row.get(6)?;
    Ok(PreferenceRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        channel: row.get(2)?,
        category: row.get(3)?,
        enabled: row.get(4)?,
        quiet_hours: start.zip(end).map(|(start, end)| QuietHours { start, end }),
        frequency: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
