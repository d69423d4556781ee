//! Deleting a user removes everything they own and nothing shared.

use riskledger_core::{
    billing_subsystem::{NewPaymentMethod, NewUsage},
    documents::{ScheduleData, TemplateVariables},
    engine::LedgerEngine,
    error::ErrorKind,
    notification_subsystem::{NewNotification, PreferenceSettings},
    risk_subsystem::{NewAssessment, NewFactor},
    schedule_subsystem::NewSchedule,
    store::OwnedTable,
    types::{
        NotificationCategory, NotificationChannel, PaymentMethodKind, RiskCategory, ServiceType,
        TargetType, ThresholdAction, ThresholdScope, ThresholdType,
    },
};

const OWNED: [OwnedTable; 11] = [
    OwnedTable::Subscriptions,
    OwnedTable::Invoices,
    OwnedTable::PaymentMethods,
    OwnedTable::UsageLogs,
    OwnedTable::Assessments,
    OwnedTable::Trends,
    OwnedTable::Alerts,
    OwnedTable::Thresholds,
    OwnedTable::Notifications,
    OwnedTable::Preferences,
    OwnedTable::Schedules,
];

#[test]
fn user_delete_cascades_to_owned_rows() {
    let engine = LedgerEngine::build_test("cascade", 1).unwrap();
    let now = engine.now();
    let user = engine.create_user("gone@example.com").unwrap();
    let bystander = engine.create_user("stays@example.com").unwrap();

    let billing = engine.billing().unwrap();
    let risk = engine.risk().unwrap();
    let notifications = engine.notifications().unwrap();
    let schedules = engine.schedules().unwrap();

    for owner in [user, bystander] {
        let pro = billing.plan_by_name("pro").unwrap();
        let sub = billing.create_subscription(owner, pro.id, now, now).unwrap();
        billing.issue_invoice(sub.id, now).unwrap();
        billing
            .add_payment_method(
                owner,
                NewPaymentMethod {
                    kind: PaymentMethodKind::Paypal,
                    last_four: None,
                    brand: None,
                    exp_month: None,
                    exp_year: None,
                    make_default: false,
                    stripe_payment_method_id: None,
                },
                now,
            )
            .unwrap();
        billing
            .record_usage(
                NewUsage {
                    user_id: owner,
                    subscription_id: None,
                    service_type: ServiceType::BreachCheck,
                    action: "check".into(),
                    quantity: 1,
                    metadata: Default::default(),
                },
                now,
            )
            .unwrap();

        risk.create_threshold(owner, ThresholdScope::Overall, ThresholdType::Score, 10, ThresholdAction::Notify, now)
            .unwrap();
        let outcome = risk
            .assess(
                NewAssessment {
                    user_id: owner,
                    target: "example.com".into(),
                    target_type: TargetType::Domain,
                    factors: vec![NewFactor {
                        category: RiskCategory::Infrastructure,
                        factor_name: "open port".into(),
                        risk_score: 50,
                        weight: 1.0,
                        description: None,
                        evidence: Default::default(),
                    }],
                    scan_results: Default::default(),
                },
                now,
            )
            .unwrap();
        risk.evaluate_thresholds(outcome.assessment.id, now).unwrap();

        notifications
            .queue_notification(
                NewNotification::new(
                    owner,
                    NotificationChannel::InApp,
                    NotificationCategory::RiskChange,
                    "Score changed",
                    "Your score is 50.",
                ),
                now,
            )
            .unwrap();
        notifications
            .set_preference(owner, NotificationChannel::Sms, NotificationCategory::Marketing, PreferenceSettings::default(), now)
            .unwrap();
        let template = notifications.template_by_name("weekly_digest").unwrap();
        schedules
            .create_schedule(
                NewSchedule {
                    user_id: owner,
                    template_id: template.id,
                    name: "weekly".into(),
                    data: ScheduleData::Interval {
                        every_secs: 604_800,
                        starts_at: None,
                    },
                    template_variables: TemplateVariables::default().with("name", "x").with("count", "0"),
                    max_runs: None,
                },
                now,
            )
            .unwrap();
    }

    for table in OWNED {
        assert!(
            engine.store.owned_row_count(table, user).unwrap() > 0,
            "{table:?} should hold a row before delete"
        );
    }

    engine.delete_user(user).unwrap();

    for table in OWNED {
        assert_eq!(engine.store.owned_row_count(table, user).unwrap(), 0, "{table:?} kept rows");
        assert!(engine.store.owned_row_count(table, bystander).unwrap() > 0, "{table:?} lost bystander rows");
    }
    assert_eq!(engine.store.user_count().unwrap(), 1);
    // Shared catalog rows survive.
    assert!(billing.plan_by_name("pro").is_ok());
    assert!(notifications.template_by_name("weekly_digest").is_ok());

    assert_eq!(engine.delete_user(user).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn rows_for_unknown_user_are_rejected() {
    let engine = LedgerEngine::build_test("cascade-orphan", 1).unwrap();
    let ghost = uuid::Uuid::new_v4();
    let err = engine
        .notifications()
        .unwrap()
        .queue_notification(
            NewNotification::new(ghost, NotificationChannel::Email, NotificationCategory::System, "hi", "there"),
            engine.now(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn duplicate_email_is_a_conflict() {
    let engine = LedgerEngine::build_test("cascade-dup-email", 1).unwrap();
    engine.create_user("same@example.com").unwrap();
    assert_eq!(
        engine.create_user("same@example.com").unwrap_err().kind(),
        ErrorKind::Conflict
    );
}
