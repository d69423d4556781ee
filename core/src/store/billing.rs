//! Subscription, invoice, payment method and usage queries.

use super::{json_at, to_json, LedgerStore};
use crate::{
    billing_subsystem::{InvoiceRow, PaymentMethodRow, PlanRow, SubscriptionRow, UsageRow},
    error::{LedgerError, LedgerResult},
    types::{
        InvoiceId, InvoiceStatus, PaymentMethodId, PlanId, ServiceType, SubscriptionId,
        SubscriptionStatus, UserId,
    },
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const PLAN_COLUMNS: &str = "id, name, description, price_cents, currency, billing_cycle,
     features, limits, is_active, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, current_period_start,
     current_period_end, cancel_at_period_end, cancelled_at, stripe_subscription_id,
     stripe_customer_id, version, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, user_id, subscription_id, invoice_number, amount_cents,
     tax_cents, total_cents, currency, status, due_date, paid_at, line_items,
     stripe_invoice_id, created_at, updated_at";

const PAYMENT_METHOD_COLUMNS: &str = "id, user_id, kind, last_four, brand, exp_month, exp_year,
     is_default, stripe_payment_method_id, created_at, updated_at";

impl LedgerStore {
    // ── Plans ──────────────────────────────────────────────────

    pub fn insert_plan(&self, plan: &PlanRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO subscription_plans (
                    id, name, description, price_cents, currency, billing_cycle,
                    features, limits, is_active, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    plan.id,
                    plan.name,
                    plan.description,
                    plan.price,
                    plan.currency,
                    plan.billing_cycle,
                    to_json(&plan.features)?,
                    to_json(&plan.limits)?,
                    plan.is_active,
                    plan.created_at,
                    plan.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "subscription plan"))?;
        Ok(())
    }

    /// Administrative update of the mutable plan columns.
    pub fn update_plan(&self, plan: &PlanRow, now: DateTime<Utc>) -> LedgerResult<()> {
        let n = self.conn.execute(
            "UPDATE subscription_plans
             SET description = ?1, price_cents = ?2, features = ?3, limits = ?4,
                 is_active = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                plan.description,
                plan.price,
                to_json(&plan.features)?,
                to_json(&plan.limits)?,
                plan.is_active,
                now,
                plan.id,
            ],
        )?;
        if n == 0 {
            return Err(LedgerError::not_found("subscription plan", plan.id));
        }
        Ok(())
    }

    pub fn get_plan(&self, plan_id: PlanId) -> LedgerResult<Option<PlanRow>> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![plan_id], map_plan_row)
            .optional()?)
    }

    pub fn get_plan_by_name(&self, name: &str) -> LedgerResult<Option<PlanRow>> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE name = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![name], map_plan_row)
            .optional()?)
    }

    pub fn list_plans(&self, active_only: bool) -> LedgerResult<Vec<PlanRow>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans
             WHERE (?1 = 0 OR is_active = 1)
             ORDER BY price_cents ASC, name ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![active_only], map_plan_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Subscriptions ──────────────────────────────────────────

    pub fn insert_subscription(&self, sub: &SubscriptionRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO user_subscriptions (
                    id, user_id, plan_id, status, current_period_start, current_period_end,
                    cancel_at_period_end, cancelled_at, stripe_subscription_id,
                    stripe_customer_id, version, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    sub.id,
                    sub.user_id,
                    sub.plan_id,
                    sub.status,
                    sub.current_period_start,
                    sub.current_period_end,
                    sub.cancel_at_period_end,
                    sub.cancelled_at,
                    sub.stripe_subscription_id,
                    sub.stripe_customer_id,
                    sub.version,
                    sub.created_at,
                    sub.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "subscription"))?;
        Ok(())
    }

    pub fn get_subscription(&self, id: SubscriptionId) -> LedgerResult<Option<SubscriptionRow>> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM user_subscriptions WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_subscription_row)
            .optional()?)
    }

    pub fn subscriptions_for_user(
        &self,
        user_id: UserId,
        status: Option<SubscriptionStatus>,
    ) -> LedgerResult<Vec<SubscriptionRow>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM user_subscriptions
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, status], map_subscription_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Write the mutable subscription columns if nobody else has since
    /// `sub.version` was read. Bumps the stored version on success.
    pub fn update_subscription(&self, sub: &SubscriptionRow, now: DateTime<Utc>) -> LedgerResult<()> {
        let n = self.conn.execute(
            "UPDATE user_subscriptions
             SET status = ?1, current_period_start = ?2, current_period_end = ?3,
                 cancel_at_period_end = ?4, cancelled_at = ?5,
                 version = version + 1, updated_at = ?6
             WHERE id = ?7 AND version = ?8",
            params![
                sub.status,
                sub.current_period_start,
                sub.current_period_end,
                sub.cancel_at_period_end,
                sub.cancelled_at,
                now,
                sub.id,
                sub.version,
            ],
        )?;
        if n == 0 {
            return match self.get_subscription(sub.id)? {
                Some(_) => Err(LedgerError::StaleWrite {
                    entity: "subscription",
                    id: sub.id,
                    expected: sub.version,
                }),
                None => Err(LedgerError::not_found("subscription", sub.id)),
            };
        }
        Ok(())
    }

    /// Active or suspended subscriptions whose period has closed by `now`.
    pub fn subscriptions_past_period_end(&self, now: DateTime<Utc>) -> LedgerResult<Vec<SubscriptionRow>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM user_subscriptions
             WHERE status IN ('active', 'suspended') AND current_period_end <= ?1
             ORDER BY current_period_end ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now], map_subscription_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn delete_subscription(&self, id: SubscriptionId) -> LedgerResult<()> {
        let n = self
            .conn
            .execute("DELETE FROM user_subscriptions WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(LedgerError::not_found("subscription", id));
        }
        Ok(())
    }

    // ── Invoices ───────────────────────────────────────────────

    pub fn insert_invoice(&self, inv: &InvoiceRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO invoices (
                    id, user_id, subscription_id, invoice_number, amount_cents, tax_cents,
                    total_cents, currency, status, due_date, paid_at, line_items,
                    stripe_invoice_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    inv.id,
                    inv.user_id,
                    inv.subscription_id,
                    inv.invoice_number,
                    inv.amount,
                    inv.tax,
                    inv.total,
                    inv.currency,
                    inv.status,
                    inv.due_date,
                    inv.paid_at,
                    to_json(&inv.line_items)?,
                    inv.stripe_invoice_id,
                    inv.created_at,
                    inv.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "invoice"))?;
        Ok(())
    }

    pub fn get_invoice(&self, id: InvoiceId) -> LedgerResult<Option<InvoiceRow>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_invoice_row)
            .optional()?)
    }

    pub fn invoices_for_user(&self, user_id: UserId) -> LedgerResult<Vec<InvoiceRow>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE user_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], map_invoice_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Status is the only invoice column that ever changes after issue.
    pub fn update_invoice_status(
        &self,
        id: InvoiceId,
        status: InvoiceStatus,
        paid_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let n = self.conn.execute(
            "UPDATE invoices SET status = ?1, paid_at = COALESCE(?2, paid_at), updated_at = ?3
             WHERE id = ?4",
            params![status, paid_at, now, id],
        )?;
        if n == 0 {
            return Err(LedgerError::not_found("invoice", id));
        }
        Ok(())
    }

    // ── Payment methods ────────────────────────────────────────

    pub fn insert_payment_method(&self, pm: &PaymentMethodRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO payment_methods (
                    id, user_id, kind, last_four, brand, exp_month, exp_year, is_default,
                    stripe_payment_method_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    pm.id,
                    pm.user_id,
                    pm.kind,
                    pm.last_four,
                    pm.brand,
                    pm.exp_month,
                    pm.exp_year,
                    pm.is_default,
                    pm.stripe_payment_method_id,
                    pm.created_at,
                    pm.updated_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "payment method"))?;
        Ok(())
    }

    pub fn get_payment_method(&self, id: PaymentMethodId) -> LedgerResult<Option<PaymentMethodRow>> {
        let sql = format!("SELECT {PAYMENT_METHOD_COLUMNS} FROM payment_methods WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_payment_method_row)
            .optional()?)
    }

    pub fn payment_methods_for_user(&self, user_id: UserId) -> LedgerResult<Vec<PaymentMethodRow>> {
        let sql = format!(
            "SELECT {PAYMENT_METHOD_COLUMNS} FROM payment_methods WHERE user_id = ?1
             ORDER BY is_default DESC, created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], map_payment_method_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn clear_default_payment_methods(&self, user_id: UserId, now: DateTime<Utc>) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE payment_methods SET is_default = 0, updated_at = ?1
             WHERE user_id = ?2 AND is_default = 1",
            params![now, user_id],
        )?;
        Ok(())
    }

    pub fn mark_payment_method_default(&self, id: PaymentMethodId, now: DateTime<Utc>) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE payment_methods SET is_default = 1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn default_payment_method_count(&self, user_id: UserId) -> LedgerResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM payment_methods WHERE user_id = ?1 AND is_default = 1",
            params![user_id],
            |r| r.get(0),
        )?)
    }

    pub fn delete_payment_method(&self, id: PaymentMethodId) -> LedgerResult<()> {
        self.conn
            .execute("DELETE FROM payment_methods WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Usage ──────────────────────────────────────────────────

    pub fn insert_usage(&self, usage: &UsageRow) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO usage_logs (
                    id, user_id, subscription_id, service_type, action, quantity, metadata, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    usage.id,
                    usage.user_id,
                    usage.subscription_id,
                    usage.service_type,
                    usage.action,
                    usage.quantity,
                    to_json(&usage.metadata)?,
                    usage.created_at,
                ],
            )
            .map_err(|e| LedgerError::from_constraint(e, "usage log"))?;
        Ok(())
    }

    /// Total scan quantity a user logged in `[start, end)`.
    pub fn scan_usage_in_window(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        let scan_set = ServiceType::scan_types()
            .iter()
            .map(|s| format!("'{}'", s.as_ref()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT COALESCE(SUM(quantity), 0) FROM usage_logs
             WHERE user_id = ?1 AND service_type IN ({scan_set})
               AND created_at >= ?2 AND created_at < ?3"
        );
        Ok(self
            .conn
            .query_row(&sql, params![user_id, start, end], |r| r.get(0))?)
    }

    pub fn usage_for_user(&self, user_id: UserId) -> LedgerResult<Vec<UsageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, subscription_id, service_type, action, quantity, metadata, created_at
             FROM usage_logs WHERE user_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |r| {
            Ok(UsageRow {
                id: r.get(0)?,
                user_id: r.get(1)?,
                subscription_id: r.get(2)?,
                service_type: r.get(3)?,
                action: r.get(4)?,
                quantity: r.get(5)?,
                metadata: json_at(r, 6)?,
                created_at: r.get(7)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

// ── Row mappers ────────────────────────────────────────────────

fn map_plan_row(row: &Row<'_>) -> rusqlite::Result<PlanRow> {
    Ok(PlanRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        price: row.get(3)?,
        currency: row.get(4)?,
        billing_cycle: row.get(5)?,
        features: json_at(row, 6)?,
        limits: json_at(row, 7)?,
        is_active: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn map_subscription_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        status: row.get(3)?,
        current_period_start: row.get(4)?,
        current_period_end: row.get(5)?,
        cancel_at_period_end: row.get(6)?,
        cancelled_at: row.get(7)?,
        stripe_subscription_id: row.get(8)?,
        stripe_customer_id: row.get(9)?,
        version: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn map_invoice_row(row: &Row<'_>) -> rusqlite::Result<InvoiceRow> {
    Ok(InvoiceRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subscription_id: row.get(2)?,
        invoice_number: row.get(3)?,
        amount: row.get(4)?,
        tax: row.get(5)?,
        total: row.get(6)?,
        currency: row.get(7)?,
        status: row.get(8)?,
        due_date: row.get(9)?,
        paid_at: row.get(10)?,
        line_items: json_at(row, 11)?,
        stripe_invoice_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn map_payment_method_row(row: &Row<'_>) -> rusqlite::Result<PaymentMethodRow> {
    Ok(PaymentMethodRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        last_four: row.get(3)?,
        brand: row.get(4)?,
        exp_month: row.get(5)?,
        exp_year: row.get(6)?,
        is_default: row.get::<_, i32>(7)? != 0,
        stripe_payment_method_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
