//! Shared primitive types used across every ledger.
//!
//! RULE: every closed string set in the schema is an enum here.
//! Parsing an out-of-set value is a validation error, never a coercion.

use crate::error::{LedgerError, LedgerResult};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

/// One engine step. Ticks are counted from engine start.
pub type Tick = u64;

pub type UserId = Uuid;
pub type PlanId = Uuid;
pub type SubscriptionId = Uuid;
pub type InvoiceId = Uuid;
pub type PaymentMethodId = Uuid;
pub type AssessmentId = Uuid;
pub type AlertId = Uuid;
pub type ThresholdId = Uuid;
pub type PlaybookId = Uuid;
pub type NotificationId = Uuid;
pub type TemplateId = Uuid;
pub type ScheduleId = Uuid;

/// Fresh primary key. All rows get a v4 id at insert time.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Wires a strum-derived enum into SQLite columns and gives it a
/// validating constructor for raw caller input.
macro_rules! sql_enum {
    ($($ty:ident => $field:literal),+ $(,)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_ref()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    let raw = value.as_str()?;
                    raw.parse().map_err(|_| {
                        FromSqlError::Other(format!("invalid {} '{}'", $field, raw).into())
                    })
                }
            }

            impl $ty {
                /// Parse caller input, rejecting anything outside the closed set.
                pub fn parse_field(raw: &str) -> LedgerResult<Self> {
                    raw.parse().map_err(|_| {
                        let allowed: Vec<String> =
                            Self::iter().map(|v| v.as_ref().to_string()).collect();
                        LedgerError::validation(
                            $field,
                            format!("'{raw}' is not one of {}", allowed.join("|")),
                        )
                    })
                }
            }
        )+
    };
}

// ── Money ──────────────────────────────────────────────────────

/// Fixed-point amount with two fraction digits, held as integer cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    /// Apply a rate in basis points, rounding half away from zero.
    pub fn apply_bps(self, bps: i64) -> Money {
        let scaled = self.0 * bps;
        let rounded = if scaled >= 0 {
            (scaled + 5_000) / 10_000
        } else {
            (scaled - 5_000) / 10_000
        };
        Money(rounded)
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Money {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(Money)
    }
}

// ── Scores and weights ─────────────────────────────────────────

/// Integer risk score in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Score(u8);

impl Score {
    pub const MAX: Score = Score(100);

    pub fn new(value: i64) -> LedgerResult<Self> {
        if (0..=100).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(LedgerError::validation("risk_score", format!("{value} is outside [0, 100]")))
        }
    }

    /// Round and clamp a computed value into range.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self(0);
        }
        Self(value.round().clamp(0.0, 100.0) as u8)
    }

    pub fn value(self) -> i64 {
        self.0 as i64
    }
}

impl TryFrom<i64> for Score {
    type Error = LedgerError;
    fn try_from(value: i64) -> LedgerResult<Self> {
        Score::new(value)
    }
}

impl From<Score> for i64 {
    fn from(score: Score) -> i64 {
        score.value()
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Score {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64))
    }
}

impl FromSql for Score {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        Score::new(raw).map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

/// Factor weight in [0, 2].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Weight(f64);

impl Weight {
    pub fn new(value: f64) -> LedgerResult<Self> {
        if value.is_finite() && (0.0..=2.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(LedgerError::validation("weight", format!("{value} is outside [0, 2]")))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Weight {
    type Error = LedgerError;
    fn try_from(value: f64) -> LedgerResult<Self> {
        Weight::new(value)
    }
}

impl From<Weight> for f64 {
    fn from(weight: Weight) -> f64 {
        weight.0
    }
}

impl ToSql for Weight {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Weight {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Weight::new(value.as_f64()?)
            .map_err(|e| FromSqlError::Other(e.to_string().into()))
    }
}

// ── Subscription domain ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    Annual,
}

impl BillingCycle {
    pub fn months(self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Annual => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Suspended,
    Expired,
}

impl SubscriptionStatus {
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Active, Cancelled | Suspended | Expired) | (Suspended, Active | Cancelled | Expired)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
}

impl InvoiceStatus {
    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Pending, Paid | Failed | Cancelled) | (Failed, Pending | Paid | Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    BankAccount,
    Paypal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceType {
    EmailScan,
    PhoneScan,
    DomainScan,
    UsernameSearch,
    BreachCheck,
    DarkWebMonitor,
    ReportExport,
    ApiCall,
}

impl ServiceType {
    /// Scan services draw down the plan's `scansPerMonth` allowance.
    pub fn is_scan(self) -> bool {
        matches!(
            self,
            Self::EmailScan | Self::PhoneScan | Self::DomainScan | Self::UsernameSearch | Self::BreachCheck
        )
    }

    pub fn scan_types() -> Vec<ServiceType> {
        Self::iter().filter(|s| s.is_scan()).collect()
    }
}

// ── Risk domain ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetType {
    Email,
    Phone,
    Domain,
    IpAddress,
    Username,
    FullName,
}

/// Risk buckets. The partition of [0, 100] is fixed:
///
/// | level    | scores  |
/// |----------|---------|
/// | low      | 0–39    |
/// | medium   | 40–69   |
/// | high     | 70–89   |
/// | critical | 90–100  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const MEDIUM_FLOOR: i64 = 40;
    pub const HIGH_FLOOR: i64 = 70;
    pub const CRITICAL_FLOOR: i64 = 90;

    pub fn from_score(score: Score) -> Self {
        match score.value() {
            s if s >= Self::CRITICAL_FLOOR => Self::Critical,
            s if s >= Self::HIGH_FLOOR => Self::High,
            s if s >= Self::MEDIUM_FLOOR => Self::Medium,
            _ => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskCategory {
    DataBreach,
    SocialExposure,
    DarkWeb,
    PasswordSecurity,
    IdentityTheft,
    Financial,
    Reputation,
    Infrastructure,
}

/// What a threshold watches: the overall score, or one factor category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ThresholdScope {
    Overall,
    Category(RiskCategory),
}

impl ThresholdScope {
    pub fn parse_field(raw: &str) -> LedgerResult<Self> {
        if raw == "overall" {
            return Ok(Self::Overall);
        }
        RiskCategory::parse_field(raw)
            .map(Self::Category)
            .map_err(|_| LedgerError::validation("threshold category", format!("'{raw}' is neither 'overall' nor a risk category")))
    }
}

impl fmt::Display for ThresholdScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overall => f.write_str("overall"),
            Self::Category(c) => f.write_str(c.as_ref()),
        }
    }
}

impl TryFrom<String> for ThresholdScope {
    type Error = LedgerError;
    fn try_from(raw: String) -> LedgerResult<Self> {
        Self::parse_field(&raw)
    }
}

impl From<ThresholdScope> for String {
    fn from(scope: ThresholdScope) -> String {
        scope.to_string()
    }
}

impl ToSql for ThresholdScope {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for ThresholdScope {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Self::parse_field(raw).map_err(|e| FromSqlError::Other(e.to_string().into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Worsening,
}

impl TrendDirection {
    /// Changes within `epsilon` points either way count as stable.
    pub fn from_delta(delta: i64, epsilon: i64) -> Self {
        if delta.abs() <= epsilon {
            Self::Stable
        } else if delta < 0 {
            Self::Improving
        } else {
            Self::Worsening
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThresholdType {
    Score,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThresholdAction {
    Notify,
    Alert,
    Block,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertType {
    ThresholdExceeded,
    RiskIncrease,
    NewExposure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlaybookDifficulty {
    Easy,
    Medium,
    Hard,
}

// ── Notification domain ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    InApp,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationCategory {
    SecurityAlert,
    RiskChange,
    Billing,
    System,
    Report,
    Marketing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent | Failed | Cancelled) | (Sent, Delivered)
        )
    }
}

/// Declaration order is dispatch order: urgent drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn rank(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationFrequency {
    Immediate,
    Hourly,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         EnumString, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScheduleType {
    OneTime,
    Recurring,
    Interval,
}

sql_enum! {
    BillingCycle => "billing_cycle",
    SubscriptionStatus => "subscription status",
    InvoiceStatus => "invoice status",
    PaymentMethodKind => "payment method type",
    ServiceType => "service_type",
    TargetType => "target_type",
    RiskLevel => "risk_level",
    RiskCategory => "risk category",
    TrendDirection => "trend_direction",
    ThresholdType => "threshold_type",
    ThresholdAction => "threshold action",
    AlertType => "alert_type",
    PlaybookDifficulty => "difficulty",
    NotificationChannel => "notification type",
    NotificationCategory => "notification category",
    NotificationStatus => "notification status",
    NotificationPriority => "priority",
    NotificationFrequency => "frequency",
    DeliveryOutcome => "delivery status",
    ScheduleType => "schedule_type",
}
