//! Assessment, factor, trend, playbook, alert and threshold queries.

use super::{json_at, to_json, LedgerStore};
use crate::{
    error::{LedgerError, LedgerResult},
    risk_subsystem::{AlertRow, AssessmentRow, FactorRow, PlaybookRow, ThresholdRow, TrendRow},
    types::{AlertId, AssessmentId, RiskCategory, ThresholdId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const ASSESSMENT_COLUMNS: &str = "id, user_id, target, target_type, overall_risk_score, risk_level,
     scan_results, recommendations, thresholds_evaluated_at, created_at, updated_at";

const ALERT_COLUMNS: &str = "id, user_id, assessment_id, threshold_id, alert_type, severity, action,
     title, message, metadata, is_read, is_resolved, resolved_at, created_at, updated_at";

const THRESHOLD_COLUMNS: &str =
    "id, user_id, category, threshold_type, value, action, is_active, created_at, updated_at";

const PLAYBOOK_COLUMNS: &str = "id, name, category, risk_level, description, steps,
     estimated_time_minutes, difficulty, is_active, created_at, updated_at";

impl LedgerStore {
    // ── Assessments ────────────────────────────────────────────

    pub fn insert_assessment(&self, a: &AssessmentRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO risk_assessments (
                    id, user_id, target, target_type, overall_risk_score, risk_level,
                    scan_results, recommendations, thresholds_evaluated_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    a.id,
                    a.user_id,
                    a.target,
                    a.target_type,
                    a.overall_score,
                    a.risk_level,
                    to_json(&a.scan_results)?,
                    to_json(&a.recommendations)?,
                    a.thresholds_evaluated_at,
                    a.created_at,
                    a.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "risk assessment"))?;
        Ok(())
    }

    pub fn get_assessment(&self, id: AssessmentId) -> LedgerResult<Option<AssessmentRow>> {
        let sql = format!("SELECT {ASSESSMENT_COLUMNS} FROM risk_assessments WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_assessment_row)
            .optional()?)
    }

    /// Most recent assessment of `(user, target)`.
    pub fn latest_assessment(&self, user_id: UserId, target: &str) -> LedgerResult<Option<AssessmentRow>> {
        let sql = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_assessments
             WHERE user_id = ?1 AND target = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![user_id, target], map_assessment_row)
            .optional()?)
    }

    /// The assessment of the same `(user, target)` made just before `a`.
    pub fn previous_assessment(&self, a: &AssessmentRow) -> LedgerResult<Option<AssessmentRow>> {
        let sql = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_assessments
             WHERE user_id = ?1 AND target = ?2 AND id != ?3
               AND (created_at, rowid) < (SELECT created_at, rowid FROM risk_assessments WHERE id = ?3)
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![a.user_id, a.target, a.id], map_assessment_row)
            .optional()?)
    }

    pub fn assessments_for_user(&self, user_id: UserId) -> LedgerResult<Vec<AssessmentRow>> {
        let sql = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_assessments
             WHERE user_id = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], map_assessment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Assessments whose thresholds have not been checked yet, oldest first.
    pub fn assessments_pending_evaluation(&self, limit: usize) -> LedgerResult<Vec<AssessmentRow>> {
        let sql = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_assessments
             WHERE thresholds_evaluated_at IS NULL
             ORDER BY created_at ASC, rowid ASC LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], map_assessment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_assessment_evaluated(&self, id: AssessmentId, now: DateTime<Utc>) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE risk_assessments SET thresholds_evaluated_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Factors cascade; alerts keep their rows with `assessment_id` nulled.
    pub fn delete_assessment(&self, id: AssessmentId) -> LedgerResult<()> {
        let n = self
            .conn
            .execute("DELETE FROM risk_assessments WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(LedgerError::not_found("risk assessment", id));
        }
        Ok(())
    }

    // ── Factors ────────────────────────────────────────────────

    pub fn insert_factor(&self, f: &FactorRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO risk_factors (
                    id, assessment_id, category, factor_name, risk_score, weight,
                    description, evidence, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    f.id,
                    f.assessment_id,
                    f.category,
                    f.factor_name,
                    f.risk_score,
                    f.weight,
                    f.description,
                    to_json(&f.evidence)?,
                    f.created_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "risk factor"))?;
        Ok(())
    }

    pub fn factors_for(&self, assessment_id: AssessmentId) -> LedgerResult<Vec<FactorRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, assessment_id, category, factor_name, risk_score, weight,
                    description, evidence, created_at
             FROM risk_factors WHERE assessment_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![assessment_id], |row| {
                Ok(FactorRow {
                    id: row.get(0)?,
                    assessment_id: row.get(1)?,
                    category: row.get(2)?,
                    factor_name: row.get(3)?,
                    risk_score: row.get(4)?,
                    weight: row.get(5)?,
                    description: row.get(6)?,
                    evidence: json_at(row, 7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn factor_count(&self, assessment_id: AssessmentId) -> LedgerResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM risk_factors WHERE assessment_id = ?1",
            params![assessment_id],
            |r| r.get(0),
        )?)
    }

    // ── Trends ─────────────────────────────────────────────────

    /// One row per `(user, target, day)`; a later assessment on the same
    /// day replaces the snapshot.
    pub fn upsert_trend(&self, t: &TrendRow) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO risk_trends (
                id, user_id, target, trend_date, risk_score, score_change, trend_direction, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (user_id, target, trend_date) DO UPDATE SET
                risk_score = excluded.risk_score,
                score_change = excluded.score_change,
                trend_direction = excluded.trend_direction",
            params![
                t.id,
                t.user_id,
                t.target,
                t.trend_date,
                t.risk_score,
                t.score_change,
                t.trend_direction,
                t.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn trends_for(&self, user_id: UserId, target: &str) -> LedgerResult<Vec<TrendRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, target, trend_date, risk_score, score_change, trend_direction, created_at
             FROM risk_trends WHERE user_id = ?1 AND target = ?2
             ORDER BY trend_date ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id, target], |row| {
                Ok(TrendRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    target: row.get(2)?,
                    trend_date: row.get(3)?,
                    risk_score: row.get(4)?,
                    score_change: row.get(5)?,
                    trend_direction: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Playbooks ──────────────────────────────────────────────

    pub fn insert_playbook(&self, p: &PlaybookRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO risk_playbooks (
                    id, name, category, risk_level, description, steps,
                    estimated_time_minutes, difficulty, is_active, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    p.id,
                    p.name,
                    p.category,
                    p.risk_level,
                    p.description,
                    to_json(&p.steps)?,
                    p.estimated_time_minutes,
                    p.difficulty,
                    p.is_active,
                    p.created_at,
                    p.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "risk playbook"))?;
        Ok(())
    }

    pub fn get_playbook_by_name(&self, name: &str) -> LedgerResult<Option<PlaybookRow>> {
        let sql = format!("SELECT {PLAYBOOK_COLUMNS} FROM risk_playbooks WHERE name = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![name], map_playbook_row)
            .optional()?)
    }

    /// Active playbooks for one category, in name order.
    pub fn active_playbooks_in(&self, category: RiskCategory) -> LedgerResult<Vec<PlaybookRow>> {
        let sql = format!(
            "SELECT {PLAYBOOK_COLUMNS} FROM risk_playbooks
             WHERE category = ?1 AND is_active = 1 ORDER BY name ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![category], map_playbook_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn playbook_count(&self) -> LedgerResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM risk_playbooks", [], |r| r.get(0))?)
    }

    // ── Alerts ─────────────────────────────────────────────────

    pub fn insert_alert(&self, a: &AlertRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO risk_alerts (
                    id, user_id, assessment_id, threshold_id, alert_type, severity, action,
                    title, message, metadata, is_read, is_resolved, resolved_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    a.id,
                    a.user_id,
                    a.assessment_id,
                    a.threshold_id,
                    a.alert_type,
                    a.severity,
                    a.action,
                    a.title,
                    a.message,
                    to_json(&a.metadata)?,
                    a.is_read,
                    a.is_resolved,
                    a.resolved_at,
                    a.created_at,
                    a.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "risk alert"))?;
        Ok(())
    }

    pub fn get_alert(&self, id: AlertId) -> LedgerResult<Option<AlertRow>> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM risk_alerts WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_alert_row)
            .optional()?)
    }

    pub fn alerts_for_user(&self, user_id: UserId, unresolved_only: bool) -> LedgerResult<Vec<AlertRow>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM risk_alerts
             WHERE user_id = ?1 AND (?2 = 0 OR is_resolved = 0)
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, unresolved_only], map_alert_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_alert_flags(&self, alert: &AlertRow, now: DateTime<Utc>) -> LedgerResult<()> {
        let n = self.conn.execute(
            "UPDATE risk_alerts SET is_read = ?1, is_resolved = ?2, resolved_at = ?3, updated_at = ?4
             WHERE id = ?5",
            params![alert.is_read, alert.is_resolved, alert.resolved_at, now, alert.id],
        )?;
        if n == 0 {
            return Err(LedgerError::not_found("risk alert", alert.id));
        }
        Ok(())
    }

    // ── Thresholds ─────────────────────────────────────────────

    pub fn insert_threshold(&self, t: &ThresholdRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO risk_thresholds (
                    id, user_id, category, threshold_type, value, action, is_active, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    t.id,
                    t.user_id,
                    t.scope,
                    t.threshold_type,
                    t.value,
                    t.action,
                    t.is_active,
                    t.created_at,
                    t.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "risk threshold"))?;
        Ok(())
    }

    pub fn get_threshold(&self, id: ThresholdId) -> LedgerResult<Option<ThresholdRow>> {
        let sql = format!("SELECT {THRESHOLD_COLUMNS} FROM risk_thresholds WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_threshold_row)
            .optional()?)
    }

    pub fn thresholds_for_user(&self, user_id: UserId, active_only: bool) -> LedgerResult<Vec<ThresholdRow>> {
        let sql = format!(
            "SELECT {THRESHOLD_COLUMNS} FROM risk_thresholds
             WHERE user_id = ?1 AND (?2 = 0 OR is_active = 1)
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, active_only], map_threshold_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_threshold_active(&self, id: ThresholdId, active: bool, now: DateTime<Utc>) -> LedgerResult<()> {
        let n = self.conn.execute(
            "UPDATE risk_thresholds SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, now, id],
        )?;
        if n == 0 {
            return Err(LedgerError::not_found("risk threshold", id));
        }
        Ok(())
    }
}

// ── Row mappers ────────────────────────────────────────────────

fn map_assessment_row(row: &Row<'_>) -> rusqlite::Result<AssessmentRow> {
    Ok(AssessmentRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        target: row.get(2)?,
        target_type: row.get(3)?,
        overall_score: row.get(4)?,
        risk_level: row.get(5)?,
        scan_results: json_at(row, 6)?,
        recommendations: json_at(row, 7)?,
        thresholds_evaluated_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn map_alert_row(row: &Row<'_>) -> rusqlite::Result<AlertRow> {
    Ok(AlertRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        assessment_id: row.get(2)?,
        threshold_id: row.get(3)?,
        alert_type: row.get(4)?,
        severity: row.get(5)?,
        action: row.get(6)?,
        title: row.get(7)?,
        message: row.get(8)?,
        metadata: json_at(row, 9)?,
        is_read: row.get(10)?,
        is_resolved: row.get(11)?,
        resolved_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn map_threshold_row(row: &Row<'_>) -> rusqlite::Result<ThresholdRow> {
    Ok(ThresholdRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scope: row.get(2)?,
        threshold_type: row.get(3)?,
        value: row.get(4)?,
        action: row.get(5)?,
        is_active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn map_playbook_row(row: &Row<'_>) -> rusqlite::Result<PlaybookRow> {
    Ok(PlaybookRow {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        risk_level: row.get(3)?,
        description: row.get(4)?,
        steps: json_at(row, 5)?,
        estimated_time_minutes: row.get(6)?,
        difficulty: row.get(7)?,
        is_active: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
