//! Billing subsystem: plan catalog, subscriptions, invoices, payment
//! methods and metered usage.
//!
//! This subsystem:
//!   1. Creates and transitions subscriptions (singleton-active guard)
//!   2. Issues invoices and walks them through their state machine
//!   3. Keeps at most one default payment method per user
//!   4. Appends usage and enforces the plan's `scansPerMonth` cap
//!   5. On each tick, closes billing periods that have ended
//!
//! Every multi-row write runs inside `LedgerStore::atomic`.

use crate::{
    config::BillingConfig,
    documents::{InvoiceLineItems, LineItem, PlanFeatures, UsageLimits, UsageMetadata, UNLIMITED},
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    rng::SubsystemRng,
    store::LedgerStore,
    subsystem::LedgerSubsystem,
    types::{
        new_id, BillingCycle, InvoiceId, InvoiceStatus, Money, PaymentMethodId, PaymentMethodKind,
        PlanId, ServiceType, SubscriptionId, SubscriptionStatus, UserId,
    },
};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRow {
    pub id: PlanId,
    pub name: String,
    pub description: Option<String>,
    pub price: Money,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub features: PlanFeatures,
    pub limits: UsageLimits,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlan {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Money,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub billing_cycle: BillingCycle,
    #[serde(default)]
    pub features: PlanFeatures,
    pub limits: UsageLimits,
}

fn default_currency() -> String {
    "USD".into()
}

impl NewPlan {
    /// Validate and stamp a catalog entry. New plans start active.
    pub fn into_row(self, now: DateTime<Utc>) -> LedgerResult<PlanRow> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::validation("plan name", "must not be empty"));
        }
        if self.price < Money::ZERO {
            return Err(LedgerError::validation("price", "must not be negative"));
        }
        validate_limits(&self.limits)?;
        Ok(PlanRow {
            id: new_id(),
            name: self.name,
            description: self.description,
            price: self.price,
            currency: self.currency,
            billing_cycle: self.billing_cycle,
            features: self.features,
            limits: self.limits,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Administrative plan edit. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct PlanUpdate {
    pub description: Option<String>,
    pub price: Option<Money>,
    pub features: Option<PlanFeatures>,
    pub limits: Option<UsageLimits>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRow {
    pub id: InvoiceId,
    pub user_id: UserId,
    pub subscription_id: Option<SubscriptionId>,
    pub invoice_number: String,
    pub amount: Money,
    pub tax: Money,
    pub total: Money,
    pub currency: String,
    pub status: InvoiceStatus,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub line_items: InvoiceLineItems,
    pub stripe_invoice_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodRow {
    pub id: PaymentMethodId,
    pub user_id: UserId,
    pub kind: PaymentMethodKind,
    pub last_four: Option<String>,
    pub brand: Option<String>,
    pub exp_month: Option<u32>,
    pub exp_year: Option<i32>,
    pub is_default: bool,
    pub stripe_payment_method_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPaymentMethod {
    pub kind: PaymentMethodKind,
    #[serde(default)]
    pub last_four: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub exp_month: Option<u32>,
    #[serde(default)]
    pub exp_year: Option<i32>,
    #[serde(default)]
    pub make_default: bool,
    #[serde(default)]
    pub stripe_payment_method_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub subscription_id: Option<SubscriptionId>,
    pub service_type: ServiceType,
    pub action: String,
    pub quantity: i64,
    pub metadata: UsageMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUsage {
    pub user_id: UserId,
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
    pub service_type: ServiceType,
    pub action: String,
    #[serde(default = "one")]
    pub quantity: i64,
    #[serde(default)]
    pub metadata: UsageMetadata,
}

fn one() -> i64 {
    1
}

/// End of a billing period that starts at `start`.
pub fn period_end(start: DateTime<Utc>, cycle: BillingCycle) -> LedgerResult<DateTime<Utc>> {
    start
        .checked_add_months(Months::new(cycle.months()))
        .ok_or_else(|| LedgerError::validation("billing_period", format!("{start} cannot be extended")))
}

pub struct BillingSubsystem {
    config: BillingConfig,
    store: LedgerStore,
}

impl BillingSubsystem {
    pub fn new(config: BillingConfig, store: LedgerStore) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    // ── Plan catalog ───────────────────────────────────────────

    pub fn create_plan(&self, plan: NewPlan, now: DateTime<Utc>) -> LedgerResult<PlanRow> {
        let row = plan.into_row(now)?;
        self.store.insert_plan(&row)?;
        log::info!("plan '{}' created at {}", row.name, row.price);
        Ok(row)
    }

    pub fn update_plan(&self, plan_id: PlanId, update: PlanUpdate, now: DateTime<Utc>) -> LedgerResult<PlanRow> {
        let mut plan = self.plan(plan_id)?;
        if let Some(description) = update.description {
            plan.description = Some(description);
        }
        if let Some(price) = update.price {
            if price < Money::ZERO {
                return Err(LedgerError::validation("price", "must not be negative"));
            }
            plan.price = price;
        }
        if let Some(features) = update.features {
            plan.features = features;
        }
        if let Some(limits) = update.limits {
            validate_limits(&limits)?;
            plan.limits = limits;
        }
        self.store.update_plan(&plan, now)?;
        plan.updated_at = now;
        Ok(plan)
    }

    pub fn set_plan_active(&self, plan_id: PlanId, active: bool, now: DateTime<Utc>) -> LedgerResult<PlanRow> {
        let mut plan = self.plan(plan_id)?;
        plan.is_active = active;
        self.store.update_plan(&plan, now)?;
        plan.updated_at = now;
        Ok(plan)
    }

    pub fn plan(&self, plan_id: PlanId) -> LedgerResult<PlanRow> {
        self.store
            .get_plan(plan_id)?
            .ok_or_else(|| LedgerError::not_found("subscription plan", plan_id))
    }

    pub fn plan_by_name(&self, name: &str) -> LedgerResult<PlanRow> {
        self.store
            .get_plan_by_name(name)?
            .ok_or_else(|| LedgerError::not_found("subscription plan", name))
    }

    pub fn list_plans(&self, active_only: bool) -> LedgerResult<Vec<PlanRow>> {
        self.store.list_plans(active_only)
    }

    // ── Subscriptions ──────────────────────────────────────────

    /// Start a subscription whose first period begins at `period_start`.
    pub fn create_subscription(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LedgerResult<SubscriptionRow> {
        self.store.atomic(|store| {
            store.require_user(user_id)?;
            let plan = store
                .get_plan(plan_id)?
                .ok_or_else(|| LedgerError::not_found("subscription plan", plan_id))?;
            if !plan.is_active {
                return Err(LedgerError::InvalidPlan { plan_id });
            }
            if self.config.single_active_subscription
                && !store
                    .subscriptions_for_user(user_id, Some(SubscriptionStatus::Active))?
                    .is_empty()
            {
                return Err(LedgerError::DuplicateActiveSubscription { user_id });
            }
            let sub = SubscriptionRow {
                id: new_id(),
                user_id,
                plan_id,
                status: SubscriptionStatus::Active,
                current_period_start: period_start,
                current_period_end: period_end(period_start, plan.billing_cycle)?,
                cancel_at_period_end: false,
                cancelled_at: None,
                stripe_subscription_id: None,
                stripe_customer_id: None,
                version: 0,
                created_at: now,
                updated_at: now,
            };
            store.insert_subscription(&sub)?;
            log::info!("user {user_id} subscribed to '{}'", plan.name);
            Ok(sub)
        })
    }

    pub fn subscription(&self, id: SubscriptionId) -> LedgerResult<SubscriptionRow> {
        self.store
            .get_subscription(id)?
            .ok_or_else(|| LedgerError::not_found("subscription", id))
    }

    /// The authoritative subscription for entitlement checks.
    pub fn active_subscription(&self, user_id: UserId) -> LedgerResult<Option<SubscriptionRow>> {
        Ok(self
            .store
            .subscriptions_for_user(user_id, Some(SubscriptionStatus::Active))?
            .into_iter()
            .next())
    }

    pub fn transition_subscription(
        &self,
        id: SubscriptionId,
        next: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<SubscriptionRow> {
        self.store.atomic(|store| {
            let mut sub = store
                .get_subscription(id)?
                .ok_or_else(|| LedgerError::not_found("subscription", id))?;
            apply_subscription_transition(&mut sub, next, now)?;
            if next == SubscriptionStatus::Active
                && self.config.single_active_subscription
                && !store
                    .subscriptions_for_user(sub.user_id, Some(SubscriptionStatus::Active))?
                    .is_empty()
            {
                return Err(LedgerError::DuplicateActiveSubscription { user_id: sub.user_id });
            }
            store.update_subscription(&sub, now)?;
            sub.version += 1;
            sub.updated_at = now;
            Ok(sub)
        })
    }

    /// Cancel now, or flag the subscription to lapse at its period boundary.
    pub fn cancel_subscription(
        &self,
        id: SubscriptionId,
        at_period_end: bool,
        now: DateTime<Utc>,
    ) -> LedgerResult<SubscriptionRow> {
        if !at_period_end {
            return self.transition_subscription(id, SubscriptionStatus::Cancelled, now);
        }
        self.store.atomic(|store| {
            let mut sub = store
                .get_subscription(id)?
                .ok_or_else(|| LedgerError::not_found("subscription", id))?;
            if sub.status != SubscriptionStatus::Active {
                return Err(LedgerError::StateTransition {
                    entity: "subscription",
                    from: sub.status.to_string(),
                    to: "cancel_at_period_end".into(),
                });
            }
            sub.cancel_at_period_end = true;
            store.update_subscription(&sub, now)?;
            sub.version += 1;
            sub.updated_at = now;
            Ok(sub)
        })
    }

    /// Hard delete. Invoices and usage keep their rows with the link nulled.
    pub fn delete_subscription(&self, id: SubscriptionId) -> LedgerResult<()> {
        self.store.delete_subscription(id)
    }

    // ── Invoices ───────────────────────────────────────────────

    /// Bill the subscription's current period at the plan price.
    pub fn issue_invoice(&self, subscription_id: SubscriptionId, now: DateTime<Utc>) -> LedgerResult<InvoiceRow> {
        self.store.atomic(|store| {
            let sub = store
                .get_subscription(subscription_id)?
                .ok_or_else(|| LedgerError::not_found("subscription", subscription_id))?;
            let plan = store
                .get_plan(sub.plan_id)?
                .ok_or_else(|| LedgerError::not_found("subscription plan", sub.plan_id))?;
            let invoice = self.build_invoice(&sub, &plan, now)?;
            store.insert_invoice(&invoice)?;
            Ok(invoice)
        })
    }

    fn build_invoice(&self, sub: &SubscriptionRow, plan: &PlanRow, now: DateTime<Utc>) -> LedgerResult<InvoiceRow> {
        let id = new_id();
        let amount = plan.price;
        let tax = amount.apply_bps(self.config.tax_rate_bps);
        let total = amount
            .checked_add(tax)
            .ok_or_else(|| LedgerError::validation("amount", "invoice total overflows"))?;
        let short = id.simple().to_string()[..8].to_uppercase();
        Ok(InvoiceRow {
            id,
            user_id: sub.user_id,
            subscription_id: Some(sub.id),
            invoice_number: format!("{}-{}-{short}", self.config.invoice_prefix, now.format("%Y%m%d")),
            amount,
            tax,
            total,
            currency: plan.currency.clone(),
            status: InvoiceStatus::Pending,
            due_date: now + Duration::days(self.config.invoice_due_days),
            paid_at: None,
            line_items: InvoiceLineItems(vec![LineItem {
                description: format!(
                    "{} ({} to {})",
                    plan.name,
                    sub.current_period_start.format("%Y-%m-%d"),
                    sub.current_period_end.format("%Y-%m-%d")
                ),
                quantity: 1,
                unit_price: plan.price,
            }]),
            stripe_invoice_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn invoice(&self, id: InvoiceId) -> LedgerResult<InvoiceRow> {
        self.store
            .get_invoice(id)?
            .ok_or_else(|| LedgerError::not_found("invoice", id))
    }

    pub fn invoices_for(&self, user_id: UserId) -> LedgerResult<Vec<InvoiceRow>> {
        self.store.invoices_for_user(user_id)
    }

    /// One-way invoice state machine. Nothing leaves `paid` or `cancelled`.
    pub fn transition_invoice_status(
        &self,
        id: InvoiceId,
        next: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<InvoiceRow> {
        self.store.atomic(|store| {
            let mut invoice = store
                .get_invoice(id)?
                .ok_or_else(|| LedgerError::not_found("invoice", id))?;
            if !invoice.status.can_transition_to(next) {
                return Err(LedgerError::StateTransition {
                    entity: "invoice",
                    from: invoice.status.to_string(),
                    to: next.to_string(),
                });
            }
            let paid_at = (next == InvoiceStatus::Paid).then_some(now);
            store.update_invoice_status(id, next, paid_at, now)?;
            invoice.status = next;
            invoice.paid_at = paid_at.or(invoice.paid_at);
            invoice.updated_at = now;
            Ok(invoice)
        })
    }

    // ── Payment methods ────────────────────────────────────────

    /// A user's first payment method always becomes the default.
    pub fn add_payment_method(
        &self,
        user_id: UserId,
        method: NewPaymentMethod,
        now: DateTime<Utc>,
    ) -> LedgerResult<PaymentMethodRow> {
        if let Some(month) = method.exp_month {
            if !(1..=12).contains(&month) {
                return Err(LedgerError::validation("exp_month", format!("{month} is not a month")));
            }
        }
        if let Some(last_four) = &method.last_four {
            if last_four.len() != 4 || !last_four.chars().all(|c| c.is_ascii_digit()) {
                return Err(LedgerError::validation("last_four", "must be exactly four digits"));
            }
        }
        self.store.atomic(|store| {
            store.require_user(user_id)?;
            let is_default =
                method.make_default || store.payment_methods_for_user(user_id)?.is_empty();
            if is_default {
                store.clear_default_payment_methods(user_id, now)?;
            }
            let row = PaymentMethodRow {
                id: new_id(),
                user_id,
                kind: method.kind,
                last_four: method.last_four,
                brand: method.brand,
                exp_month: method.exp_month,
                exp_year: method.exp_year,
                is_default,
                stripe_payment_method_id: method.stripe_payment_method_id,
                created_at: now,
                updated_at: now,
            };
            store.insert_payment_method(&row)?;
            Ok(row)
        })
    }

    pub fn set_default_payment_method(
        &self,
        user_id: UserId,
        method_id: PaymentMethodId,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.store.atomic(|store| {
            let method = owned_payment_method(store, user_id, method_id)?;
            if method.is_default {
                return Ok(());
            }
            store.clear_default_payment_methods(user_id, now)?;
            store.mark_payment_method_default(method_id, now)?;
            Ok(())
        })
    }

    /// Removing the default promotes the oldest remaining method.
    pub fn remove_payment_method(
        &self,
        user_id: UserId,
        method_id: PaymentMethodId,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.store.atomic(|store| {
            let method = owned_payment_method(store, user_id, method_id)?;
            store.delete_payment_method(method_id)?;
            if method.is_default {
                if let Some(next) = store.payment_methods_for_user(user_id)?.first() {
                    store.mark_payment_method_default(next.id, now)?;
                }
            }
            Ok(())
        })
    }

    pub fn payment_methods(&self, user_id: UserId) -> LedgerResult<Vec<PaymentMethodRow>> {
        self.store.payment_methods_for_user(user_id)
    }

    // ── Usage ──────────────────────────────────────────────────

    /// Append a usage record. Scan usage is checked against the plan cap
    /// inside the same unit as the insert.
    pub fn record_usage(&self, usage: NewUsage, now: DateTime<Utc>) -> LedgerResult<UsageRow> {
        if usage.quantity <= 0 {
            return Err(LedgerError::validation("quantity", "must be positive"));
        }
        if usage.action.trim().is_empty() {
            return Err(LedgerError::validation("action", "must not be empty"));
        }
        self.store.atomic(|store| {
            store.require_user(usage.user_id)?;
            let sub = store
                .subscriptions_for_user(usage.user_id, Some(SubscriptionStatus::Active))?
                .into_iter()
                .next();

            // Usage bills only against the active subscription.
            if let Some(id) = usage.subscription_id {
                let named = store
                    .get_subscription(id)?
                    .filter(|s| s.user_id == usage.user_id)
                    .ok_or_else(|| LedgerError::not_found("subscription", id))?;
                if sub.as_ref().map(|s| s.id) != Some(named.id) {
                    return Err(LedgerError::validation(
                        "subscription_id",
                        format!("subscription {id} is {}, not the user's active subscription", named.status),
                    ));
                }
            }

            if let Some(sub) = &sub {
                if now < sub.current_period_start || now >= sub.current_period_end {
                    return Err(LedgerError::Conflict {
                        reason: format!(
                            "subscription {} bills {} to {}; usage at {now} waits for the period to roll",
                            sub.id, sub.current_period_start, sub.current_period_end
                        ),
                    });
                }
            }

            if let (Some(sub), true) = (&sub, usage.service_type.is_scan()) {
                let plan = store
                    .get_plan(sub.plan_id)?
                    .ok_or_else(|| LedgerError::not_found("subscription plan", sub.plan_id))?;
                let cap = plan.limits.scans_per_month;
                if cap != UNLIMITED {
                    let used = store.scan_usage_in_window(
                        usage.user_id,
                        sub.current_period_start,
                        sub.current_period_end,
                    )?;
                    if used + usage.quantity > cap {
                        log::warn!(
                            "user {} hit scan cap {cap} on '{}' ({used} used)",
                            usage.user_id,
                            plan.name
                        );
                        return Err(LedgerError::LimitExceeded {
                            limit: "scansPerMonth",
                            used,
                            requested: usage.quantity,
                            cap,
                        });
                    }
                }
            }

            let row = UsageRow {
                id: new_id(),
                user_id: usage.user_id,
                subscription_id: sub.as_ref().map(|s| s.id),
                service_type: usage.service_type,
                action: usage.action,
                quantity: usage.quantity,
                metadata: usage.metadata,
                created_at: now,
            };
            store.insert_usage(&row)?;
            Ok(row)
        })
    }

    /// Scans left in the active subscription's current period.
    /// `None` when unlimited or when the user holds no active subscription.
    pub fn remaining_scans(&self, user_id: UserId) -> LedgerResult<Option<i64>> {
        let Some(sub) = self.active_subscription(user_id)? else {
            return Ok(None);
        };
        let plan = self.plan(sub.plan_id)?;
        if plan.limits.scans_per_month == UNLIMITED {
            return Ok(None);
        }
        let used = self.store.scan_usage_in_window(
            user_id,
            sub.current_period_start,
            sub.current_period_end,
        )?;
        Ok(Some((plan.limits.scans_per_month - used).max(0)))
    }

    /// Scan quantity consumed in the active subscription's current period.
    pub fn usage_in_period(&self, user_id: UserId) -> LedgerResult<i64> {
        match self.active_subscription(user_id)? {
            Some(sub) => self.store.scan_usage_in_window(
                user_id,
                sub.current_period_start,
                sub.current_period_end,
            ),
            None => Ok(0),
        }
    }

    pub fn usage_for(&self, user_id: UserId) -> LedgerResult<Vec<UsageRow>> {
        self.store.usage_for_user(user_id)
    }

    // ── Period rollover ────────────────────────────────────────

    /// Close every period that ended by `now`. One period per subscription
    /// per call; a subscription further behind catches up on later ticks.
    fn close_ended_periods(&self, now: DateTime<Utc>) -> LedgerResult<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        for sub in self.store.subscriptions_past_period_end(now)? {
            match self.close_period(sub, now) {
                Ok(closed) => events.extend(closed),
                Err(LedgerError::StaleWrite { id, .. }) => {
                    // A user write won the race; the next tick sees fresh state.
                    log::warn!("renewal skipped for subscription {id}: stale version");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    fn close_period(&self, mut sub: SubscriptionRow, now: DateTime<Utc>) -> LedgerResult<Vec<LedgerEvent>> {
        self.store.atomic(|store| {
            let ended_at = sub.current_period_end;
            let mut events = Vec::new();
            match sub.status {
                SubscriptionStatus::Suspended => {
                    apply_subscription_transition(&mut sub, SubscriptionStatus::Expired, now)?;
                    store.update_subscription(&sub, now)?;
                    events.push(LedgerEvent::SubscriptionExpired {
                        subscription_id: sub.id,
                        user_id: sub.user_id,
                    });
                }
                SubscriptionStatus::Active if sub.cancel_at_period_end => {
                    apply_subscription_transition(&mut sub, SubscriptionStatus::Cancelled, now)?;
                    sub.cancelled_at = Some(ended_at);
                    store.update_subscription(&sub, now)?;
                    events.push(LedgerEvent::SubscriptionCancelled {
                        subscription_id: sub.id,
                        user_id: sub.user_id,
                        at_period_end: true,
                    });
                }
                SubscriptionStatus::Active => {
                    let plan = store
                        .get_plan(sub.plan_id)?
                        .ok_or_else(|| LedgerError::not_found("subscription plan", sub.plan_id))?;
                    sub.current_period_start = ended_at;
                    sub.current_period_end = period_end(ended_at, plan.billing_cycle)?;
                    store.update_subscription(&sub, now)?;
                    events.push(LedgerEvent::SubscriptionRenewed {
                        subscription_id: sub.id,
                        user_id: sub.user_id,
                        period_end: sub.current_period_end,
                    });
                    if plan.price > Money::ZERO {
                        let invoice = self.build_invoice(&sub, &plan, now)?;
                        store.insert_invoice(&invoice)?;
                        events.push(LedgerEvent::InvoiceIssued {
                            invoice_id: invoice.id,
                            user_id: invoice.user_id,
                            total: invoice.total,
                        });
                    }
                }
                SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {}
            }
            Ok(events)
        })
    }
}

fn validate_limits(limits: &UsageLimits) -> LedgerResult<()> {
    for (name, value) in [
        ("scansPerMonth", limits.scans_per_month),
        ("monitoredTargets", limits.monitored_targets),
        ("alertsPerMonth", limits.alerts_per_month),
    ] {
        if value < UNLIMITED {
            return Err(LedgerError::validation("limits", format!("{name} = {value}; use -1 for unlimited")));
        }
    }
    Ok(())
}

fn apply_subscription_transition(
    sub: &mut SubscriptionRow,
    next: SubscriptionStatus,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    if !sub.status.can_transition_to(next) {
        return Err(LedgerError::StateTransition {
            entity: "subscription",
            from: sub.status.to_string(),
            to: next.to_string(),
        });
    }
    if next == SubscriptionStatus::Cancelled {
        sub.cancelled_at = Some(now);
    }
    sub.status = next;
    Ok(())
}

fn owned_payment_method(
    store: &LedgerStore,
    user_id: UserId,
    method_id: PaymentMethodId,
) -> LedgerResult<PaymentMethodRow> {
    match store.get_payment_method(method_id)? {
        Some(method) if method.user_id == user_id => Ok(method),
        _ => Err(LedgerError::not_found("payment method", method_id)),
    }
}

impl LedgerSubsystem for BillingSubsystem {
    fn name(&self) -> &'static str {
        "billing"
    }

    fn update(
        &mut self,
        now: DateTime<Utc>,
        _events_in: &[LedgerEvent],
        _rng: &mut SubsystemRng,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let events = self.close_ended_periods(now)?;
        log::debug!("{now} billing: {} periods closed", events.len());
        Ok(events)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
