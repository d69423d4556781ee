//! Domain events emitted by the periodic workers.
//!
//! RULE: Workers communicate ONLY through events and shared rows.
//! A worker may never call another worker's functions directly.
//! Every event a worker returns is persisted to `event_log`.

use crate::types::{
    AlertId, AlertType, AssessmentId, InvoiceId, Money, NotificationChannel, NotificationId,
    RiskLevel, ScheduleId, SubscriptionId, ThresholdAction, Tick, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Variants are appended over time: never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    // ── Engine ─────────────────────────────────────
    TickStarted {
        tick: Tick,
        now: DateTime<Utc>,
    },
    TickCompleted {
        tick: Tick,
    },
    RunInitialized {
        run_id: String,
        seed: u64,
    },

    // ── Billing ────────────────────────────────────
    SubscriptionRenewed {
        subscription_id: SubscriptionId,
        user_id: UserId,
        period_end: DateTime<Utc>,
    },
    SubscriptionCancelled {
        subscription_id: SubscriptionId,
        user_id: UserId,
        at_period_end: bool,
    },
    SubscriptionExpired {
        subscription_id: SubscriptionId,
        user_id: UserId,
    },
    InvoiceIssued {
        invoice_id: InvoiceId,
        user_id: UserId,
        total: Money,
    },
    UsageLimitHit {
        user_id: UserId,
        used: i64,
        requested: i64,
        cap: i64,
    },

    // ── Risk ───────────────────────────────────────
    AssessmentEvaluated {
        assessment_id: AssessmentId,
        user_id: UserId,
        alerts_raised: usize,
    },
    AlertRaised {
        alert_id: AlertId,
        user_id: UserId,
        alert_type: AlertType,
        severity: RiskLevel,
        action: ThresholdAction,
    },

    // ── Schedules ──────────────────────────────────
    ScheduleRan {
        schedule_id: ScheduleId,
        user_id: UserId,
        notification_id: NotificationId,
        run_count: i64,
    },
    ScheduleDeactivated {
        schedule_id: ScheduleId,
        run_count: i64,
    },

    // ── Notifications ──────────────────────────────
    NotificationSent {
        notification_id: NotificationId,
        user_id: UserId,
        channel: NotificationChannel,
        attempt: i64,
    },
    NotificationDeferred {
        notification_id: NotificationId,
        until: DateTime<Utc>,
        reason: DeferralReason,
    },
    NotificationSuppressed {
        notification_id: NotificationId,
        user_id: UserId,
    },
    NotificationRetryScheduled {
        notification_id: NotificationId,
        attempt: i64,
        retry_at: DateTime<Utc>,
    },
    NotificationFailed {
        notification_id: NotificationId,
        user_id: UserId,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferralReason {
    QuietHours,
    Digest,
}

impl LedgerEvent {
    /// Stable name for the `event_type` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TickStarted { .. }                => "tick_started",
            Self::TickCompleted { .. }              => "tick_completed",
            Self::RunInitialized { .. }             => "run_initialized",
            Self::SubscriptionRenewed { .. }        => "subscription_renewed",
            Self::SubscriptionCancelled { .. }      => "subscription_cancelled",
            Self::SubscriptionExpired { .. }        => "subscription_expired",
            Self::InvoiceIssued { .. }              => "invoice_issued",
            Self::UsageLimitHit { .. }              => "usage_limit_hit",
            Self::AssessmentEvaluated { .. }        => "assessment_evaluated",
            Self::AlertRaised { .. }                => "alert_raised",
            Self::ScheduleRan { .. }                => "schedule_ran",
            Self::ScheduleDeactivated { .. }        => "schedule_deactivated",
            Self::NotificationSent { .. }           => "notification_sent",
            Self::NotificationDeferred { .. }       => "notification_deferred",
            Self::NotificationSuppressed { .. }     => "notification_suppressed",
            Self::NotificationRetryScheduled { .. } => "notification_retry_scheduled",
            Self::NotificationFailed { .. }         => "notification_failed",
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub run_id: String,
    pub tick: Tick,
    pub subsystem: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized LedgerEvent
    pub created_at: DateTime<Utc>,
}
