//! Typed shapes for the JSON columns.
//!
//! RULE: one struct per use site. The storage layer never validates these;
//! the ledgers construct them and serde enforces the shape on read.

use crate::types::{Money, ScheduleType};
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// `subscription_plans.features`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanFeatures(pub Vec<String>);

/// `subscription_plans.limits`. `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    pub scans_per_month: i64,
    #[serde(default = "unlimited")]
    pub monitored_targets: i64,
    #[serde(default = "unlimited")]
    pub alerts_per_month: i64,
}

pub const UNLIMITED: i64 = -1;

fn unlimited() -> i64 {
    UNLIMITED
}

impl UsageLimits {
    pub fn unlimited() -> Self {
        Self {
            scans_per_month: UNLIMITED,
            monitored_targets: UNLIMITED,
            alerts_per_month: UNLIMITED,
        }
    }

    pub fn with_scans(scans_per_month: i64) -> Self {
        Self {
            scans_per_month,
            ..Self::unlimited()
        }
    }
}

/// `usage_logs.metadata`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetadata {
    pub target: Option<String>,
    pub source: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// `invoices.line_items`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceLineItems(pub Vec<LineItem>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price: Money,
}

/// `risk_assessments.scan_results`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanResults {
    pub sources: Vec<String>,
    pub breaches_found: u32,
    pub exposed_accounts: u32,
    pub summary: Option<String>,
}

/// `risk_assessments.recommendations`: playbook names, most severe first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recommendations(pub Vec<String>);

/// `risk_factors.evidence`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorEvidence {
    pub sources: Vec<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub details: BTreeMap<String, String>,
}

/// `risk_playbooks.steps`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaybookSteps(pub Vec<PlaybookStep>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub title: String,
    pub detail: String,
}

/// `risk_alerts.metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    pub scope: String,
    pub observed: i64,
    pub threshold_value: Option<i64>,
    pub previous: Option<i64>,
}

/// `notifications.data`: links back to whatever produced the notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationData {
    pub assessment_id: Option<Uuid>,
    pub alert_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub schedule_id: Option<Uuid>,
    pub link: Option<String>,
}

/// `notification_templates.variables`: the names a render must supply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeclaredVariables(pub BTreeSet<String>);

/// `notification_schedules.template_variables` and render input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateVariables(pub BTreeMap<String, String>);

impl TemplateVariables {
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }
}

/// `notification_delivery_logs.provider_response`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderResponse {
    pub provider_message_id: Option<String>,
    pub code: Option<String>,
    pub detail: Option<String>,
}

/// `notification_schedules.schedule_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleData {
    OneTime {
        run_at: DateTime<Utc>,
    },
    Recurring {
        cadence: Cadence,
        at: NaiveTime,
    },
    Interval {
        every_secs: i64,
        #[serde(default)]
        starts_at: Option<DateTime<Utc>>,
    },
}

impl ScheduleData {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Self::OneTime { .. } => ScheduleType::OneTime,
            Self::Recurring { .. } => ScheduleType::Recurring,
            Self::Interval { .. } => ScheduleType::Interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekly { weekday: Weekday },
    /// Days past the end of a short month fire on its last day.
    Monthly { day: u32 },
}
