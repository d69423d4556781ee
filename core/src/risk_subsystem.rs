//! Risk subsystem: weighted scoring, trend tracking, threshold alerts
//! and remediation playbooks.
//!
//! Scoring model:
//!   overall = round(Σ(score × weight) / Σ(weight)), clamped to [0, 100]
//!   level   = fixed bucket of the overall score (see `RiskLevel`)
//!   trend   = sign of (overall − previous overall) beyond `trend_epsilon`
//!
//! An assessment, its factors and the day's trend snapshot are written as
//! one unit. Thresholds are checked afterwards by the tick worker (or on
//! demand), exactly once per assessment.

use crate::{
    config::RiskConfig,
    documents::{
        AlertMetadata, FactorEvidence, PlaybookSteps, Recommendations, ScanResults,
    },
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    rng::SubsystemRng,
    store::LedgerStore,
    subsystem::LedgerSubsystem,
    types::{
        new_id, AlertId, AlertType, AssessmentId, PlaybookDifficulty, PlaybookId, RiskCategory,
        RiskLevel, Score, TargetType, ThresholdAction, ThresholdId, ThresholdScope, ThresholdType,
        TrendDirection, UserId, Weight,
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRow {
    pub id: AssessmentId,
    pub user_id: UserId,
    pub target: String,
    pub target_type: TargetType,
    pub overall_score: Score,
    pub risk_level: RiskLevel,
    pub scan_results: ScanResults,
    pub recommendations: Recommendations,
    pub thresholds_evaluated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorRow {
    pub id: Uuid,
    pub assessment_id: AssessmentId,
    pub category: RiskCategory,
    pub factor_name: String,
    pub risk_score: Score,
    pub weight: Weight,
    pub description: Option<String>,
    pub evidence: FactorEvidence,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRow {
    pub id: Uuid,
    pub user_id: UserId,
    pub target: String,
    pub trend_date: NaiveDate,
    pub risk_score: Score,
    pub score_change: i64,
    pub trend_direction: TrendDirection,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookRow {
    pub id: PlaybookId,
    pub name: String,
    pub category: RiskCategory,
    pub risk_level: RiskLevel,
    pub description: String,
    pub steps: PlaybookSteps,
    pub estimated_time_minutes: i64,
    pub difficulty: PlaybookDifficulty,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRow {
    pub id: AlertId,
    pub user_id: UserId,
    pub assessment_id: Option<AssessmentId>,
    pub threshold_id: Option<ThresholdId>,
    pub alert_type: AlertType,
    pub severity: RiskLevel,
    pub action: ThresholdAction,
    pub title: String,
    pub message: String,
    pub metadata: AlertMetadata,
    pub is_read: bool,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRow {
    pub id: ThresholdId,
    pub user_id: UserId,
    pub scope: ThresholdScope,
    pub threshold_type: ThresholdType,
    pub value: Score,
    pub action: ThresholdAction,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One raw finding handed to `assess`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFactor {
    pub category: RiskCategory,
    pub factor_name: String,
    pub risk_score: i64,
    #[serde(default = "unit_weight")]
    pub weight: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub evidence: FactorEvidence,
}

fn unit_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAssessment {
    pub user_id: UserId,
    pub target: String,
    pub target_type: TargetType,
    pub factors: Vec<NewFactor>,
    #[serde(default)]
    pub scan_results: ScanResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlaybook {
    pub name: String,
    pub category: RiskCategory,
    pub risk_level: RiskLevel,
    pub description: String,
    #[serde(default)]
    pub steps: PlaybookSteps,
    #[serde(default = "default_minutes")]
    pub estimated_time_minutes: i64,
    pub difficulty: PlaybookDifficulty,
}

fn default_minutes() -> i64 {
    15
}

impl NewPlaybook {
    pub fn into_row(self, now: DateTime<Utc>) -> LedgerResult<PlaybookRow> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::validation("playbook name", "must not be empty"));
        }
        if self.estimated_time_minutes <= 0 {
            return Err(LedgerError::validation("estimated_time_minutes", "must be positive"));
        }
        Ok(PlaybookRow {
            id: new_id(),
            name: self.name,
            category: self.category,
            risk_level: self.risk_level,
            description: self.description,
            steps: self.steps,
            estimated_time_minutes: self.estimated_time_minutes,
            difficulty: self.difficulty,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AssessmentOutcome {
    pub assessment: AssessmentRow,
    pub factors: Vec<FactorRow>,
    pub trend: TrendRow,
    pub previous_score: Option<Score>,
}

/// Weighted mean of `(score, weight)` pairs, rounded half away from zero.
pub fn aggregate_score(factors: &[(Score, Weight)]) -> LedgerResult<Score> {
    if factors.is_empty() {
        return Err(LedgerError::validation("factors", "an assessment needs at least one factor"));
    }
    let (weighted, total) = factors.iter().fold((0.0_f64, 0.0_f64), |(sum, w), (s, wt)| {
        (sum + s.value() as f64 * wt.value(), w + wt.value())
    });
    if total <= 0.0 {
        return Err(LedgerError::validation("weight", "factor weights sum to zero"));
    }
    Ok(Score::clamped(weighted / total))
}

/// Per-category aggregate, in category declaration order.
fn category_scores(factors: &[FactorRow]) -> Vec<(RiskCategory, Score)> {
    RiskCategory::iter()
        .filter_map(|category| {
            let members: Vec<(Score, Weight)> = factors
                .iter()
                .filter(|f| f.category == category)
                .map(|f| (f.risk_score, f.weight))
                .collect();
            if members.is_empty() {
                return None;
            }
            // Zero-weight categories still count; fall back to their peak.
            let score = aggregate_score(&members).unwrap_or_else(|_| {
                members.iter().map(|(s, _)| *s).max().unwrap_or(Score::clamped(0.0))
            });
            Some((category, score))
        })
        .collect()
}

fn lookup(scores: &[(RiskCategory, Score)], category: RiskCategory) -> Option<Score> {
    scores.iter().find(|(c, _)| *c == category).map(|(_, s)| *s)
}

pub struct RiskSubsystem {
    config: RiskConfig,
    store: LedgerStore,
}

impl RiskSubsystem {
    pub fn new(config: RiskConfig, store: LedgerStore) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    // ── Assessment ─────────────────────────────────────────────

    /// Score the findings, persist assessment + factors + trend snapshot,
    /// and attach matching playbook recommendations.
    pub fn assess(&self, input: NewAssessment, now: DateTime<Utc>) -> LedgerResult<AssessmentOutcome> {
        if input.target.trim().is_empty() {
            return Err(LedgerError::validation("target", "must not be empty"));
        }
        let mut scored = Vec::with_capacity(input.factors.len());
        for f in &input.factors {
            if f.factor_name.trim().is_empty() {
                return Err(LedgerError::validation("factor_name", "must not be empty"));
            }
            scored.push((Score::new(f.risk_score)?, Weight::new(f.weight)?));
        }
        let overall = aggregate_score(&scored)?;
        let level = RiskLevel::from_score(overall);
        let assessment_id = new_id();

        let factors: Vec<FactorRow> = input
            .factors
            .into_iter()
            .zip(scored)
            .map(|(f, (risk_score, weight))| FactorRow {
                id: new_id(),
                assessment_id,
                category: f.category,
                factor_name: f.factor_name,
                risk_score,
                weight,
                description: f.description,
                evidence: f.evidence,
                created_at: now,
            })
            .collect();

        self.store.atomic(|store| {
            store.require_user(input.user_id)?;
            let previous = store.latest_assessment(input.user_id, &input.target)?;
            let recommendations = recommend(store, &category_scores(&factors))?;

            let assessment = AssessmentRow {
                id: assessment_id,
                user_id: input.user_id,
                target: input.target.clone(),
                target_type: input.target_type,
                overall_score: overall,
                risk_level: level,
                scan_results: input.scan_results.clone(),
                recommendations,
                thresholds_evaluated_at: None,
                created_at: now,
                updated_at: now,
            };
            store.insert_assessment(&assessment)?;
            for factor in &factors {
                store.insert_factor(factor)?;
            }

            let previous_score = previous.map(|p| p.overall_score);
            let change = previous_score.map_or(0, |p| overall.value() - p.value());
            let trend = TrendRow {
                id: new_id(),
                user_id: input.user_id,
                target: input.target.clone(),
                trend_date: now.date_naive(),
                risk_score: overall,
                score_change: change,
                trend_direction: TrendDirection::from_delta(change, self.config.trend_epsilon),
                created_at: now,
            };
            store.upsert_trend(&trend)?;

            log::info!(
                "assessed '{}' for user {}: {overall} ({level}), {}",
                assessment.target,
                assessment.user_id,
                trend.trend_direction
            );
            Ok(AssessmentOutcome {
                assessment,
                factors: factors.clone(),
                trend,
                previous_score,
            })
        })
    }

    pub fn assessment(&self, id: AssessmentId) -> LedgerResult<AssessmentRow> {
        self.store
            .get_assessment(id)?
            .ok_or_else(|| LedgerError::not_found("risk assessment", id))
    }

    pub fn factors(&self, id: AssessmentId) -> LedgerResult<Vec<FactorRow>> {
        self.store.factors_for(id)
    }

    /// Recompute the overall score from the stored factors.
    pub fn rescore(&self, id: AssessmentId) -> LedgerResult<Score> {
        let factors = self.store.factors_for(id)?;
        let pairs: Vec<(Score, Weight)> = factors.iter().map(|f| (f.risk_score, f.weight)).collect();
        aggregate_score(&pairs)
    }

    pub fn delete_assessment(&self, id: AssessmentId) -> LedgerResult<()> {
        self.store.delete_assessment(id)
    }

    pub fn trend_history(&self, user_id: UserId, target: &str) -> LedgerResult<Vec<TrendRow>> {
        self.store.trends_for(user_id, target)
    }

    // ── Thresholds ─────────────────────────────────────────────

    pub fn create_threshold(
        &self,
        user_id: UserId,
        scope: ThresholdScope,
        threshold_type: ThresholdType,
        value: i64,
        action: ThresholdAction,
        now: DateTime<Utc>,
    ) -> LedgerResult<ThresholdRow> {
        let row = ThresholdRow {
            id: new_id(),
            user_id,
            scope,
            threshold_type,
            value: Score::new(value)?,
            action,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.atomic(|store| {
            store.require_user(user_id)?;
            store.insert_threshold(&row)
        })?;
        Ok(row)
    }

    pub fn set_threshold_active(&self, id: ThresholdId, active: bool, now: DateTime<Utc>) -> LedgerResult<()> {
        self.store.set_threshold_active(id, active, now)
    }

    pub fn thresholds_for(&self, user_id: UserId) -> LedgerResult<Vec<ThresholdRow>> {
        self.store.thresholds_for_user(user_id, false)
    }

    /// Check the user's active thresholds against one assessment and raise
    /// alerts for every breach. Returns nothing on a second call.
    pub fn evaluate_thresholds(&self, assessment_id: AssessmentId, now: DateTime<Utc>) -> LedgerResult<Vec<AlertRow>> {
        self.store.atomic(|store| {
            let assessment = store
                .get_assessment(assessment_id)?
                .ok_or_else(|| LedgerError::not_found("risk assessment", assessment_id))?;
            if assessment.thresholds_evaluated_at.is_some() {
                return Ok(Vec::new());
            }
            let current = category_scores(&store.factors_for(assessment.id)?);
            let previous = store.previous_assessment(&assessment)?;
            let prior = match &previous {
                Some(p) => Some(category_scores(&store.factors_for(p.id)?)),
                None => None,
            };

            let mut alerts = Vec::new();
            for threshold in store.thresholds_for_user(assessment.user_id, true)? {
                let (observed, before) = match threshold.scope {
                    ThresholdScope::Overall => (
                        Some(assessment.overall_score),
                        previous.as_ref().map(|p| p.overall_score),
                    ),
                    ThresholdScope::Category(c) => (
                        lookup(&current, c),
                        prior.as_ref().and_then(|p| lookup(p, c)),
                    ),
                };
                let Some(observed) = observed else { continue };
                if let Some(alert) = breach(&assessment, &threshold, observed, before, now) {
                    store.insert_alert(&alert)?;
                    alerts.push(alert);
                }
            }

            if let Some(prior) = &prior {
                for (category, score) in &current {
                    let level = RiskLevel::from_score(*score);
                    if level >= RiskLevel::High && lookup(prior, *category).is_none() {
                        let alert = AlertRow {
                            id: new_id(),
                            user_id: assessment.user_id,
                            assessment_id: Some(assessment.id),
                            threshold_id: None,
                            alert_type: AlertType::NewExposure,
                            severity: level,
                            action: ThresholdAction::Alert,
                            title: format!("New {category} exposure on {}", assessment.target),
                            message: format!(
                                "{category} findings appeared for {} scoring {score} ({level})",
                                assessment.target
                            ),
                            metadata: AlertMetadata {
                                scope: category.to_string(),
                                observed: score.value(),
                                threshold_value: None,
                                previous: None,
                            },
                            is_read: false,
                            is_resolved: false,
                            resolved_at: None,
                            created_at: now,
                            updated_at: now,
                        };
                        store.insert_alert(&alert)?;
                        alerts.push(alert);
                    }
                }
            }

            store.mark_assessment_evaluated(assessment.id, now)?;
            Ok(alerts)
        })
    }

    // ── Alerts ─────────────────────────────────────────────────

    pub fn alerts_for(&self, user_id: UserId, unresolved_only: bool) -> LedgerResult<Vec<AlertRow>> {
        self.store.alerts_for_user(user_id, unresolved_only)
    }

    pub fn mark_alert_read(&self, id: AlertId, now: DateTime<Utc>) -> LedgerResult<AlertRow> {
        self.store.atomic(|store| {
            let mut alert = store
                .get_alert(id)?
                .ok_or_else(|| LedgerError::not_found("risk alert", id))?;
            alert.is_read = true;
            store.update_alert_flags(&alert, now)?;
            alert.updated_at = now;
            Ok(alert)
        })
    }

    /// Resolving implies read. A resolved alert stays resolved.
    pub fn resolve_alert(&self, id: AlertId, now: DateTime<Utc>) -> LedgerResult<AlertRow> {
        self.store.atomic(|store| {
            let mut alert = store
                .get_alert(id)?
                .ok_or_else(|| LedgerError::not_found("risk alert", id))?;
            if alert.is_resolved {
                return Err(LedgerError::StateTransition {
                    entity: "risk alert",
                    from: "resolved".into(),
                    to: "resolved".into(),
                });
            }
            alert.is_read = true;
            alert.is_resolved = true;
            alert.resolved_at = Some(now);
            store.update_alert_flags(&alert, now)?;
            alert.updated_at = now;
            Ok(alert)
        })
    }

    // ── Playbooks ──────────────────────────────────────────────

    pub fn create_playbook(&self, playbook: NewPlaybook, now: DateTime<Utc>) -> LedgerResult<PlaybookRow> {
        let row = playbook.into_row(now)?;
        self.store.insert_playbook(&row)?;
        Ok(row)
    }

    /// Active playbooks for `category` that apply at `level` or below.
    pub fn playbooks_for(&self, category: RiskCategory, level: RiskLevel) -> LedgerResult<Vec<PlaybookRow>> {
        Ok(self
            .store
            .active_playbooks_in(category)?
            .into_iter()
            .filter(|p| p.risk_level <= level)
            .collect())
    }

    // ── Tick worker ────────────────────────────────────────────

    fn evaluate_pending(&self, now: DateTime<Utc>) -> LedgerResult<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        for assessment in self.store.assessments_pending_evaluation(self.config.evaluation_batch)? {
            let alerts = self.evaluate_thresholds(assessment.id, now)?;
            events.push(LedgerEvent::AssessmentEvaluated {
                assessment_id: assessment.id,
                user_id: assessment.user_id,
                alerts_raised: alerts.len(),
            });
            events.extend(alerts.iter().map(|a| LedgerEvent::AlertRaised {
                alert_id: a.id,
                user_id: a.user_id,
                alert_type: a.alert_type,
                severity: a.severity,
                action: a.action,
            }));
        }
        Ok(events)
    }
}

/// Playbook names for each category present, most severe category first.
fn recommend(store: &LedgerStore, scores: &[(RiskCategory, Score)]) -> LedgerResult<Recommendations> {
    let mut ranked: Vec<(RiskLevel, RiskCategory)> = scores
        .iter()
        .map(|(c, s)| (RiskLevel::from_score(*s), *c))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    let mut names = Vec::new();
    for (level, category) in ranked {
        for playbook in store.active_playbooks_in(category)? {
            if playbook.risk_level <= level {
                names.push(playbook.name);
            }
        }
    }
    Ok(Recommendations(names))
}

/// `score` thresholds trip at or above `value`; `change` thresholds trip
/// when the rise since the previous assessment is positive and reaches `value`.
fn breach(
    assessment: &AssessmentRow,
    threshold: &ThresholdRow,
    observed: Score,
    before: Option<Score>,
    now: DateTime<Utc>,
) -> Option<AlertRow> {
    let limit = threshold.value.value();
    let (alert_type, title, message) = match threshold.threshold_type {
        ThresholdType::Score => {
            if observed.value() < limit {
                return None;
            }
            (
                AlertType::ThresholdExceeded,
                format!("{} risk on {} reached {observed}", threshold.scope, assessment.target),
                format!(
                    "{} score {observed} is at or above your threshold of {limit}",
                    threshold.scope
                ),
            )
        }
        ThresholdType::Change => {
            let delta = observed.value() - before?.value();
            if delta <= 0 || delta < limit {
                return None;
            }
            (
                AlertType::RiskIncrease,
                format!("{} risk on {} rose by {delta}", threshold.scope, assessment.target),
                format!(
                    "{} score moved from {} to {observed}, above your change limit of {limit}",
                    threshold.scope,
                    before?.value()
                ),
            )
        }
    };
    Some(AlertRow {
        id: new_id(),
        user_id: assessment.user_id,
        assessment_id: Some(assessment.id),
        threshold_id: Some(threshold.id),
        alert_type,
        severity: RiskLevel::from_score(observed),
        action: threshold.action,
        title,
        message,
        metadata: AlertMetadata {
            scope: threshold.scope.to_string(),
            observed: observed.value(),
            threshold_value: Some(limit),
            previous: before.map(Score::value),
        },
        is_read: false,
        is_resolved: false,
        resolved_at: None,
        created_at: now,
        updated_at: now,
    })
}

impl LedgerSubsystem for RiskSubsystem {
    fn name(&self) -> &'static str {
        "risk"
    }

    fn update(
        &mut self,
        now: DateTime<Utc>,
        _events_in: &[LedgerEvent],
        _rng: &mut SubsystemRng,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let events = self.evaluate_pending(now)?;
        log::debug!("{now} risk: {} events", events.len());
        Ok(events)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
