//! Subscription & billing ledger tests.

use chrono::Duration;
use riskledger_core::{
    billing_subsystem::{NewPaymentMethod, NewPlan, NewUsage},
    documents::{PlanFeatures, UsageLimits},
    engine::LedgerEngine,
    error::{ErrorKind, LedgerError},
    event::LedgerEvent,
    store::OwnedTable,
    types::{BillingCycle, InvoiceStatus, Money, PaymentMethodKind, ServiceType, SubscriptionStatus},
};

fn scan(user_id: uuid::Uuid) -> NewUsage {
    NewUsage {
        user_id,
        subscription_id: None,
        service_type: ServiceType::EmailScan,
        action: "scan".into(),
        quantity: 1,
        metadata: Default::default(),
    }
}

fn card(make_default: bool) -> NewPaymentMethod {
    NewPaymentMethod {
        kind: PaymentMethodKind::Card,
        last_four: Some("4242".into()),
        brand: Some("visa".into()),
        exp_month: Some(12),
        exp_year: Some(2030),
        make_default,
        stripe_payment_method_id: None,
    }
}

/// The free plan allows five scans a month; the sixth is refused and
/// nothing is written for it.
#[test]
fn sixth_scan_on_free_plan_is_refused() {
    let engine = LedgerEngine::build_test("billing-cap", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("cap@example.com").unwrap();
    let free = billing.plan_by_name("free").unwrap();
    billing.create_subscription(user, free.id, now, now).unwrap();

    for _ in 0..5 {
        billing.record_usage(scan(user), now).unwrap();
    }
    assert_eq!(billing.remaining_scans(user).unwrap(), Some(0));

    let err = billing.record_usage(scan(user), now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
    match err {
        LedgerError::LimitExceeded { used, cap, .. } => {
            assert_eq!(used, 5);
            assert_eq!(cap, 5);
        }
        other => panic!("expected LimitExceeded, got {other:?}"),
    }
    assert_eq!(billing.usage_for(user).unwrap().len(), 5);
}

/// Naming an old subscription must not measure the cap against its
/// long-gone period.
#[test]
fn usage_against_a_past_subscription_is_refused() {
    let engine = LedgerEngine::build_test("billing-old-sub", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("old@example.com").unwrap();
    let free = billing.plan_by_name("free").unwrap();

    let last_year = "2025-01-01T00:00:00Z".parse().unwrap();
    let old = billing.create_subscription(user, free.id, last_year, last_year).unwrap();
    billing.cancel_subscription(old.id, false, now).unwrap();
    let current = billing.create_subscription(user, free.id, now, now).unwrap();

    for _ in 0..5 {
        billing.record_usage(scan(user), now).unwrap();
    }
    let mut sixth = scan(user);
    sixth.subscription_id = Some(old.id);
    let err = billing.record_usage(sixth, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(billing.usage_in_period(user).unwrap(), 5);

    // Naming the active subscription explicitly is still capped.
    let mut explicit = scan(user);
    explicit.subscription_id = Some(current.id);
    let err = billing.record_usage(explicit, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
}

#[test]
fn usage_against_another_users_subscription_is_not_found() {
    let engine = LedgerEngine::build_test("billing-foreign-sub", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let owner = engine.create_user("owner@example.com").unwrap();
    let other = engine.create_user("other@example.com").unwrap();
    let free = billing.plan_by_name("free").unwrap();
    let theirs = billing.create_subscription(owner, free.id, now, now).unwrap();
    billing.create_subscription(other, free.id, now, now).unwrap();

    let mut usage = scan(other);
    usage.subscription_id = Some(theirs.id);
    let err = billing.record_usage(usage, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(billing.usage_for(other).unwrap().is_empty());
}

/// Once the renewal worker rolls the period, the allowance starts over.
#[test]
fn scan_allowance_resets_after_rollover() {
    let mut engine = LedgerEngine::build_test("billing-reset", 1).unwrap();
    let now = engine.now();
    let user = engine.create_user("reset@example.com").unwrap();
    let end = {
        let billing = engine.billing().unwrap();
        let free = billing.plan_by_name("free").unwrap();
        let sub = billing.create_subscription(user, free.id, now, now).unwrap();
        for _ in 0..5 {
            billing.record_usage(scan(user), now).unwrap();
        }
        assert_eq!(billing.remaining_scans(user).unwrap(), Some(0));
        sub.current_period_end
    };

    engine.clock.skip(end - now);
    engine.tick().unwrap();

    let later = engine.now();
    let billing = engine.billing().unwrap();
    assert_eq!(billing.remaining_scans(user).unwrap(), Some(5));
    billing.record_usage(scan(user), later).unwrap();
    assert_eq!(billing.remaining_scans(user).unwrap(), Some(4));
    assert_eq!(billing.usage_for(user).unwrap().len(), 6);
}

/// Usage past the period end is held back until renewal rolls the window,
/// so no row lands outside the window its cap was checked against.
#[test]
fn usage_after_period_end_waits_for_renewal() {
    let mut engine = LedgerEngine::build_test("billing-stale-period", 1).unwrap();
    let now = engine.now();
    let user = engine.create_user("late@example.com").unwrap();
    let end = {
        let billing = engine.billing().unwrap();
        let free = billing.plan_by_name("free").unwrap();
        billing.create_subscription(user, free.id, now, now).unwrap().current_period_end
    };

    engine.clock.skip(end - now + Duration::minutes(5));
    let late = engine.now();
    let billing = engine.billing().unwrap();
    let err = billing.record_usage(scan(user), late).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(billing.usage_for(user).unwrap().is_empty());
}

/// Non-scan services never draw down the scan allowance.
#[test]
fn report_export_does_not_count_as_scan() {
    let engine = LedgerEngine::build_test("billing-nonscan", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("export@example.com").unwrap();
    let free = billing.plan_by_name("free").unwrap();
    billing.create_subscription(user, free.id, now, now).unwrap();

    for _ in 0..8 {
        let mut usage = scan(user);
        usage.service_type = ServiceType::ReportExport;
        billing.record_usage(usage, now).unwrap();
    }
    assert_eq!(billing.usage_in_period(user).unwrap(), 0);
}

#[test]
fn unlimited_plan_never_hits_the_cap() {
    let engine = LedgerEngine::build_test("billing-unlimited", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("pro@example.com").unwrap();
    let pro = billing.plan_by_name("pro").unwrap();
    billing.create_subscription(user, pro.id, now, now).unwrap();

    for _ in 0..50 {
        billing.record_usage(scan(user), now).unwrap();
    }
    assert_eq!(billing.remaining_scans(user).unwrap(), None);
    assert_eq!(billing.usage_in_period(user).unwrap(), 50);
}

#[test]
fn inactive_plan_rejects_new_subscriptions() {
    let engine = LedgerEngine::build_test("billing-inactive", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("late@example.com").unwrap();
    let plan = billing
        .create_plan(
            NewPlan {
                name: "legacy".into(),
                description: None,
                price: Money::from_cents(500),
                currency: "USD".into(),
                billing_cycle: BillingCycle::Monthly,
                features: PlanFeatures::default(),
                limits: UsageLimits::with_scans(10),
            },
            now,
        )
        .unwrap();
    billing.set_plan_active(plan.id, false, now).unwrap();

    let err = billing.create_subscription(user, plan.id, now, now).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidPlan { .. }), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn duplicate_plan_name_is_a_conflict() {
    let engine = LedgerEngine::build_test("billing-dup-plan", 1).unwrap();
    let billing = engine.billing().unwrap();
    let err = billing
        .create_plan(
            NewPlan {
                name: "free".into(),
                description: None,
                price: Money::ZERO,
                currency: "USD".into(),
                billing_cycle: BillingCycle::Monthly,
                features: PlanFeatures::default(),
                limits: UsageLimits::unlimited(),
            },
            engine.now(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn second_active_subscription_is_refused() {
    let engine = LedgerEngine::build_test("billing-dup-sub", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("twice@example.com").unwrap();
    let free = billing.plan_by_name("free").unwrap();
    let pro = billing.plan_by_name("pro").unwrap();

    let first = billing.create_subscription(user, free.id, now, now).unwrap();
    let err = billing.create_subscription(user, pro.id, now, now).unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateActiveSubscription { .. }));

    // Cancelling frees the slot.
    billing.cancel_subscription(first.id, false, now).unwrap();
    let second = billing.create_subscription(user, pro.id, now, now).unwrap();
    assert_eq!(billing.active_subscription(user).unwrap().unwrap().id, second.id);
}

#[test]
fn subscription_states_only_move_forward() {
    let engine = LedgerEngine::build_test("billing-sub-states", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("states@example.com").unwrap();
    let free = billing.plan_by_name("free").unwrap();
    let sub = billing.create_subscription(user, free.id, now, now).unwrap();

    let cancelled = billing
        .transition_subscription(sub.id, SubscriptionStatus::Cancelled, now)
        .unwrap();
    assert_eq!(cancelled.cancelled_at, Some(now));

    let err = billing
        .transition_subscription(sub.id, SubscriptionStatus::Active, now)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateTransition);
}

#[test]
fn invoice_transitions_follow_the_state_machine() {
    let engine = LedgerEngine::build_test("billing-invoice", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("invoice@example.com").unwrap();
    let pro = billing.plan_by_name("pro").unwrap();
    let sub = billing.create_subscription(user, pro.id, now, now).unwrap();

    let invoice = billing.issue_invoice(sub.id, now).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert_eq!(invoice.total, Money::from_cents(1999));
    assert!(invoice.invoice_number.starts_with("INV-20260101-"));
    assert_eq!(invoice.due_date, now + Duration::days(14));

    billing
        .transition_invoice_status(invoice.id, InvoiceStatus::Failed, now)
        .unwrap();
    let paid = billing
        .transition_invoice_status(invoice.id, InvoiceStatus::Paid, now)
        .unwrap();
    assert_eq!(paid.paid_at, Some(now));

    let err = billing
        .transition_invoice_status(invoice.id, InvoiceStatus::Pending, now)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateTransition);
    assert_eq!(billing.invoice(invoice.id).unwrap().status, InvoiceStatus::Paid);
}

#[test]
fn one_default_payment_method_per_user() {
    let engine = LedgerEngine::build_test("billing-default-pm", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("cards@example.com").unwrap();

    let first = billing.add_payment_method(user, card(false), now).unwrap();
    assert!(first.is_default, "first method becomes the default");
    let second = billing.add_payment_method(user, card(false), now).unwrap();
    assert!(!second.is_default);
    let third = billing.add_payment_method(user, card(true), now).unwrap();
    assert!(third.is_default);

    let defaults = |b: &riskledger_core::billing_subsystem::BillingSubsystem| {
        b.payment_methods(user)
            .unwrap()
            .into_iter()
            .filter(|m| m.is_default)
            .map(|m| m.id)
            .collect::<Vec<_>>()
    };
    assert_eq!(defaults(billing), vec![third.id]);

    billing.set_default_payment_method(user, second.id, now).unwrap();
    assert_eq!(defaults(billing), vec![second.id]);

    assert_eq!(engine.store.default_payment_method_count(user).unwrap(), 1);

    // Removing the default promotes the oldest survivor.
    billing.remove_payment_method(user, second.id, now).unwrap();
    assert_eq!(defaults(billing), vec![first.id]);
    assert_eq!(engine.store.default_payment_method_count(user).unwrap(), 1);
}

#[test]
fn malformed_card_details_are_rejected() {
    let engine = LedgerEngine::build_test("billing-bad-card", 1).unwrap();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("bad@example.com").unwrap();

    let mut bad_month = card(false);
    bad_month.exp_month = Some(13);
    let err = billing.add_payment_method(user, bad_month, engine.now()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut bad_digits = card(false);
    bad_digits.last_four = Some("42a2".into());
    let err = billing.add_payment_method(user, bad_digits, engine.now()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

/// Deleting a subscription keeps its invoices and usage with the link nulled.
#[test]
fn invoice_survives_subscription_delete() {
    let engine = LedgerEngine::build_test("billing-set-null", 1).unwrap();
    let now = engine.now();
    let billing = engine.billing().unwrap();
    let user = engine.create_user("keep@example.com").unwrap();
    let pro = billing.plan_by_name("pro").unwrap();
    let sub = billing.create_subscription(user, pro.id, now, now).unwrap();
    let invoice = billing.issue_invoice(sub.id, now).unwrap();
    billing.record_usage(scan(user), now).unwrap();

    billing.delete_subscription(sub.id).unwrap();

    let kept = billing.invoice(invoice.id).unwrap();
    assert_eq!(kept.subscription_id, None);
    let usage = billing.usage_for(user).unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].subscription_id, None);
    assert_eq!(engine.store.owned_row_count(OwnedTable::Subscriptions, user).unwrap(), 0);
}

#[test]
fn usage_for_unknown_user_is_not_found() {
    let engine = LedgerEngine::build_test("billing-unknown-user", 1).unwrap();
    let err = engine
        .billing()
        .unwrap()
        .record_usage(scan(uuid::Uuid::new_v4()), engine.now())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// A paid period that ends rolls forward and issues the next invoice.
#[test]
fn renewal_worker_rolls_period_and_invoices() {
    let mut engine = LedgerEngine::build_test("billing-renewal", 1).unwrap();
    let now = engine.now();
    let user = engine.create_user("renew@example.com").unwrap();
    let (sub, first_end) = {
        let billing = engine.billing().unwrap();
        let pro = billing.plan_by_name("pro").unwrap();
        let sub = billing.create_subscription(user, pro.id, now, now).unwrap();
        (sub.id, sub.current_period_end)
    };

    engine.clock.skip(first_end - now);
    let events = engine.tick().unwrap();

    assert!(events
        .iter()
        .any(|e| matches!(e, LedgerEvent::SubscriptionRenewed { subscription_id, .. } if *subscription_id == sub)));
    assert!(events.iter().any(|e| matches!(e, LedgerEvent::InvoiceIssued { .. })));

    let billing = engine.billing().unwrap();
    let renewed = billing.subscription(sub).unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.current_period_start, first_end);
    assert!(renewed.current_period_end > first_end);
    assert_eq!(billing.invoices_for(user).unwrap().len(), 1);

    // Events land in the log at the tick that produced them.
    let logged = engine.store_events_for_tick(engine.clock.current_tick).unwrap();
    assert!(logged.iter().any(|e| e.event_type == "subscription_renewed"));
}

#[test]
fn cancel_at_period_end_lapses_on_rollover() {
    let mut engine = LedgerEngine::build_test("billing-lapse", 1).unwrap();
    let now = engine.now();
    let user = engine.create_user("lapse@example.com").unwrap();
    let (sub, end) = {
        let billing = engine.billing().unwrap();
        let free = billing.plan_by_name("free").unwrap();
        let sub = billing.create_subscription(user, free.id, now, now).unwrap();
        let flagged = billing.cancel_subscription(sub.id, true, now).unwrap();
        assert!(flagged.cancel_at_period_end);
        assert_eq!(flagged.status, SubscriptionStatus::Active);
        (sub.id, sub.current_period_end)
    };

    engine.clock.skip(end - now);
    let events = engine.tick().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        LedgerEvent::SubscriptionCancelled { at_period_end: true, .. }
    )));

    let billing = engine.billing().unwrap();
    let lapsed = billing.subscription(sub).unwrap();
    assert_eq!(lapsed.status, SubscriptionStatus::Cancelled);
    assert_eq!(lapsed.cancelled_at, Some(end));
    assert!(billing.invoices_for(user).unwrap().is_empty());
}
