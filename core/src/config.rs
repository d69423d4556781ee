use crate::{
    billing_subsystem::NewPlan,
    clock::ClockStep,
    documents::{PlanFeatures, PlaybookStep, PlaybookSteps, UsageLimits},
    notification_subsystem::{NewTemplate, MAX_RETRY_DELAY_SECS},
    risk_subsystem::NewPlaybook,
    types::{
        BillingCycle, Money, NotificationCategory, NotificationChannel, PlaybookDifficulty,
        RiskCategory, RiskLevel,
    },
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;

// ── Policy ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// At most one `active` subscription per user.
    pub single_active_subscription: bool,
    /// Invoice tax in basis points (825 = 8.25%).
    pub tax_rate_bps: i64,
    pub invoice_prefix: String,
    pub invoice_due_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Score changes within ±epsilon count as stable.
    pub trend_epsilon: i64,
    /// Assessments checked against thresholds per tick.
    pub evaluation_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub default_max_retries: i64,
    pub retry_base_secs: i64,
    pub retry_jitter_secs: i64,
    /// Notifications attempted per tick.
    pub dispatch_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Due schedules run per tick.
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub start: DateTime<Utc>,
    pub step: ClockStep,
}

#[derive(Debug, Clone, Deserialize)]
struct PolicyFile {
    billing: BillingConfig,
    risk: RiskConfig,
    notification: NotificationConfig,
    schedule: ScheduleConfig,
    engine: EngineConfig,
}

// ── Catalog files ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct PlansFile {
    plans: Vec<NewPlan>,
}

#[derive(Debug, Clone, Deserialize)]
struct PlaybooksFile {
    playbooks: Vec<NewPlaybook>,
}

#[derive(Debug, Clone, Deserialize)]
struct TemplatesFile {
    templates: Vec<NewTemplate>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub billing: BillingConfig,
    pub risk: RiskConfig,
    pub notification: NotificationConfig,
    pub schedule: ScheduleConfig,
    pub engine: EngineConfig,
    pub plans: Vec<NewPlan>,
    pub playbooks: Vec<NewPlaybook>,
    pub templates: Vec<NewTemplate>,
}

fn read_json<T: DeserializeOwned>(data_dir: &str, file: &str) -> anyhow::Result<T> {
    let path = format!("{data_dir}/{file}");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))
}

impl LedgerConfig {
    /// Load from the data/ directory.
    /// In tests, use LedgerConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let policy: PolicyFile = read_json(data_dir, "policy.json")?;
        let plans: PlansFile = read_json(data_dir, "plans.json")?;
        let playbooks: PlaybooksFile = read_json(data_dir, "playbooks.json")?;
        let templates: TemplatesFile = read_json(data_dir, "templates.json")?;

        let config = Self {
            billing: policy.billing,
            risk: policy.risk,
            notification: policy.notification,
            schedule: policy.schedule,
            engine: policy.engine,
            plans: plans.plans,
            playbooks: playbooks.playbooks,
            templates: templates.templates,
        };
        config.validate()?;
        log::info!(
            "config loaded from {data_dir}: {} plans, {} playbooks, {} templates",
            config.plans.len(),
            config.playbooks.len(),
            config.templates.len()
        );
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0..=10_000).contains(&self.billing.tax_rate_bps) {
            anyhow::bail!("billing.tax_rate_bps must be within 0..=10000");
        }
        if self.risk.trend_epsilon < 0 {
            anyhow::bail!("risk.trend_epsilon must not be negative");
        }
        if self.notification.default_max_retries < 0
            || self.notification.retry_base_secs <= 0
            || self.notification.retry_jitter_secs < 0
        {
            anyhow::bail!("notification retry policy must be non-negative with a positive base");
        }
        if self.notification.retry_base_secs > MAX_RETRY_DELAY_SECS
            || self.notification.retry_jitter_secs > MAX_RETRY_DELAY_SECS
        {
            anyhow::bail!("notification retry base and jitter must not exceed {MAX_RETRY_DELAY_SECS} seconds");
        }
        if self.notification.dispatch_batch == 0
            || self.schedule.batch_size == 0
            || self.risk.evaluation_batch == 0
        {
            anyhow::bail!("worker batch sizes must be positive");
        }
        let mut names = BTreeSet::new();
        for plan in &self.plans {
            if !names.insert(plan.name.as_str()) {
                anyhow::bail!("duplicate plan '{}'", plan.name);
            }
        }
        Ok(())
    }

    /// Hardcoded config for tests. Catalog mirrors data/ in miniature.
    pub fn default_test() -> Self {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default();
        Self {
            billing: BillingConfig {
                single_active_subscription: true,
                tax_rate_bps: 0,
                invoice_prefix: "INV".into(),
                invoice_due_days: 14,
            },
            risk: RiskConfig {
                trend_epsilon: 0,
                evaluation_batch: 100,
            },
            notification: NotificationConfig {
                default_max_retries: 3,
                retry_base_secs: 60,
                retry_jitter_secs: 0,
                dispatch_batch: 100,
            },
            schedule: ScheduleConfig { batch_size: 100 },
            engine: EngineConfig {
                start: now,
                step: ClockStep::Hour,
            },
            plans: vec![
                NewPlan {
                    name: "free".into(),
                    description: Some("Five scans a month".into()),
                    price: Money::ZERO,
                    currency: "USD".into(),
                    billing_cycle: BillingCycle::Monthly,
                    features: PlanFeatures(vec!["email_scan".into()]),
                    limits: UsageLimits::with_scans(5),
                },
                NewPlan {
                    name: "pro".into(),
                    description: Some("Unlimited scans".into()),
                    price: Money::from_cents(1999),
                    currency: "USD".into(),
                    billing_cycle: BillingCycle::Monthly,
                    features: PlanFeatures(vec!["email_scan".into(), "dark_web_monitor".into()]),
                    limits: UsageLimits::unlimited(),
                },
            ],
            playbooks: vec![
                NewPlaybook {
                    name: "Rotate breached passwords".into(),
                    category: RiskCategory::DataBreach,
                    risk_level: RiskLevel::Medium,
                    description: "Change every password exposed in a known breach.".into(),
                    steps: PlaybookSteps(vec![PlaybookStep {
                        title: "Change passwords".into(),
                        detail: "Start with email and banking accounts.".into(),
                    }]),
                    estimated_time_minutes: 30,
                    difficulty: PlaybookDifficulty::Easy,
                },
                NewPlaybook {
                    name: "Freeze credit".into(),
                    category: RiskCategory::IdentityTheft,
                    risk_level: RiskLevel::High,
                    description: "Place a freeze with each credit bureau.".into(),
                    steps: PlaybookSteps::default(),
                    estimated_time_minutes: 45,
                    difficulty: PlaybookDifficulty::Medium,
                },
            ],
            templates: vec![NewTemplate {
                name: "weekly_digest".into(),
                channel: NotificationChannel::Email,
                category: NotificationCategory::Report,
                subject: "Your weekly report, {{name}}".into(),
                body: "{{count}} new findings this week.".into(),
                variables: crate::documents::DeclaredVariables(
                    ["name".to_string(), "count".to_string()].into_iter().collect(),
                ),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_valid() {
        LedgerConfig::default_test().validate().unwrap();
    }

    #[test]
    fn retry_delays_are_bounded() {
        let mut config = LedgerConfig::default_test();
        config.notification.retry_base_secs = i64::MAX;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default_test();
        config.notification.retry_jitter_secs = MAX_RETRY_DELAY_SECS + 1;
        assert!(config.validate().is_err());
    }
}
