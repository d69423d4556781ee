//! Notification dispatch ledger tests.

use chrono::{Duration, NaiveTime, TimeZone, Utc};
use riskledger_core::{
    delivery::{DeliveryFailure, DeliveryReceipt, DeliveryTransport},
    documents::{DeclaredVariables, NotificationData, ProviderResponse, TemplateVariables},
    config::LedgerConfig,
    engine::LedgerEngine,
    error::ErrorKind,
    event::{DeferralReason, LedgerEvent},
    notification_subsystem::{
        NewNotification, NewTemplate, NotificationRow, PreferenceSettings, QuietHours, MAX_RETRY_DELAY_SECS,
    },
    store::LedgerStore,
    types::{
        DeliveryOutcome, NotificationCategory, NotificationChannel, NotificationFrequency,
        NotificationPriority, NotificationStatus, UserId,
    },
};
use std::collections::VecDeque;

/// Fails with the queued failures in order, then accepts everything.
struct ScriptedTransport {
    failures: VecDeque<DeliveryFailure>,
}

impl ScriptedTransport {
    fn failing(failures: Vec<DeliveryFailure>) -> Box<Self> {
        Box::new(Self {
            failures: failures.into(),
        })
    }
}

impl DeliveryTransport for ScriptedTransport {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn deliver(&mut self, _n: &NotificationRow) -> Result<DeliveryReceipt, DeliveryFailure> {
        match self.failures.pop_front() {
            Some(failure) => Err(failure),
            None => Ok(DeliveryReceipt {
                response: ProviderResponse {
                    provider_message_id: Some("msg-1".into()),
                    code: Some("250".into()),
                    detail: None,
                },
            }),
        }
    }
}

fn alert_for(user_id: UserId) -> NewNotification {
    NewNotification::new(
        user_id,
        NotificationChannel::Email,
        NotificationCategory::SecurityAlert,
        "New breach found",
        "Your address appeared in a new breach.",
    )
}

fn status_of(engine: &LedgerEngine, id: uuid::Uuid) -> NotificationStatus {
    engine.notifications().unwrap().notification(id).unwrap().status
}

#[test]
fn due_notification_is_sent_then_acknowledged() {
    let mut engine = LedgerEngine::build_test("notif-send", 1).unwrap();
    let user = engine.create_user("send@example.com").unwrap();
    let queued = engine
        .notifications()
        .unwrap()
        .queue_notification(alert_for(user), engine.now())
        .unwrap();
    assert_eq!(queued.status, NotificationStatus::Pending);
    assert_eq!(queued.max_retries, 3);

    let events = engine.tick().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        LedgerEvent::NotificationSent { attempt: 1, .. }
    )));

    let notifications = engine.notifications().unwrap();
    let sent = notifications.notification(queued.id).unwrap();
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert_eq!(sent.sent_at, Some(engine.now()));

    let log = notifications.delivery_log(queued.id).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, DeliveryOutcome::Success);
    assert_eq!(log[0].provider, "log");

    let delivered = notifications.acknowledge_delivery(queued.id, engine.now()).unwrap();
    assert_eq!(delivered.status, NotificationStatus::Delivered);
    assert!(delivered.delivered_at.is_some());
}

#[test]
fn status_never_moves_backwards() {
    let engine = LedgerEngine::build_test("notif-states", 1).unwrap();
    let now = engine.now();
    let notifications = engine.notifications().unwrap();
    let user = engine.create_user("states@example.com").unwrap();
    let n = notifications.queue_notification(alert_for(user), now).unwrap();

    // Acknowledging an unsent notification is illegal.
    let err = notifications.acknowledge_delivery(n.id, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateTransition);

    notifications
        .transition_notification(n.id, NotificationStatus::Sent, None, now)
        .unwrap();
    notifications.acknowledge_delivery(n.id, now).unwrap();
    for next in [
        NotificationStatus::Pending,
        NotificationStatus::Sent,
        NotificationStatus::Failed,
        NotificationStatus::Cancelled,
    ] {
        let err = notifications
            .transition_notification(n.id, next, None, now)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateTransition, "delivered -> {next}");
    }

    let other = notifications.queue_notification(alert_for(user), now).unwrap();
    let cancelled = notifications.cancel_notification(other.id, now).unwrap();
    assert_eq!(cancelled.status, NotificationStatus::Cancelled);
    assert_eq!(
        notifications.cancel_notification(other.id, now).unwrap_err().kind(),
        ErrorKind::StateTransition
    );
}

/// Transient failures retry with exponential backoff until the budget
/// runs out; the last failure is terminal.
#[test]
fn transient_failures_retry_then_fail() {
    let failures = (0..4)
        .map(|_| DeliveryFailure::transient("421", "mailbox busy"))
        .collect();
    let mut engine =
        LedgerEngine::build_test_with_transport("notif-retry", 1, ScriptedTransport::failing(failures)).unwrap();
    let user = engine.create_user("retry@example.com").unwrap();
    let n = engine
        .notifications()
        .unwrap()
        .queue_notification(alert_for(user), engine.now())
        .unwrap();

    let events = engine.tick().unwrap();
    let first_try = engine.now();
    let retry_at = events.iter().find_map(|e| match e {
        LedgerEvent::NotificationRetryScheduled { retry_at, attempt: 1, .. } => Some(*retry_at),
        _ => None,
    });
    assert_eq!(retry_at, Some(first_try + Duration::seconds(60)));

    // Hourly ticks clear every backoff (60s, 120s, 240s).
    engine.run_ticks(3).unwrap();

    let row = engine.notifications().unwrap().notification(n.id).unwrap();
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert!(row.failed_at.is_some());
    assert!(row.failure_reason.unwrap().contains("mailbox busy"));

    let log = engine.notifications().unwrap().delivery_log(n.id).unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(
        log.iter().map(|l| l.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert!(log.iter().all(|l| l.outcome == DeliveryOutcome::Failure));
}

/// A retry base far beyond any sane policy waits the capped delay instead
/// of overflowing the clock.
#[test]
fn oversized_backoff_is_capped() {
    let mut config = LedgerConfig::default_test();
    config.notification.retry_base_secs = i64::MAX;
    let store = LedgerStore::shared_memory(&format!("notif-cap-{}", uuid::Uuid::new_v4().simple())).unwrap();
    let failures = vec![DeliveryFailure::transient("421", "mailbox busy")];
    let mut engine = LedgerEngine::build_with_transport(
        "notif-cap".into(),
        1,
        config,
        store,
        ScriptedTransport::failing(failures),
    )
    .unwrap();
    let user = engine.create_user("cap@example.com").unwrap();
    let n = engine
        .notifications()
        .unwrap()
        .queue_notification(alert_for(user), engine.now())
        .unwrap();

    engine.tick().unwrap();
    let row = engine.notifications().unwrap().notification(n.id).unwrap();
    assert_eq!(row.status, NotificationStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(
        row.scheduled_for,
        Some(engine.now() + Duration::seconds(MAX_RETRY_DELAY_SECS))
    );
}

#[test]
fn transient_failure_then_success_is_sent() {
    let mut engine = LedgerEngine::build_test_with_transport(
        "notif-recover",
        1,
        ScriptedTransport::failing(vec![DeliveryFailure::transient("503", "try later")]),
    )
    .unwrap();
    let user = engine.create_user("recover@example.com").unwrap();
    let n = engine
        .notifications()
        .unwrap()
        .queue_notification(alert_for(user), engine.now())
        .unwrap();

    engine.run_ticks(2).unwrap();
    let row = engine.notifications().unwrap().notification(n.id).unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.retry_count, 1);
}

#[test]
fn permanent_failure_is_terminal() {
    let mut engine = LedgerEngine::build_test_with_transport(
        "notif-permanent",
        1,
        ScriptedTransport::failing(vec![DeliveryFailure::permanent("550", "no such mailbox")]),
    )
    .unwrap();
    let user = engine.create_user("gone@example.com").unwrap();
    let n = engine
        .notifications()
        .unwrap()
        .queue_notification(alert_for(user), engine.now())
        .unwrap();

    let events = engine.tick().unwrap();
    assert!(events.iter().any(|e| matches!(e, LedgerEvent::NotificationFailed { .. })));
    let row = engine.notifications().unwrap().notification(n.id).unwrap();
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.retry_count, 0);
}

#[test]
fn future_schedule_waits_until_due() {
    let mut engine = LedgerEngine::build_test("notif-future", 1).unwrap();
    let user = engine.create_user("later@example.com").unwrap();
    let at = engine.now() + Duration::hours(3);
    let n = engine
        .notifications()
        .unwrap()
        .queue_notification(alert_for(user).scheduled_for(at), engine.now())
        .unwrap();

    engine.run_ticks(2).unwrap();
    assert_eq!(status_of(&engine, n.id), NotificationStatus::Pending);
    engine.tick().unwrap();
    assert_eq!(status_of(&engine, n.id), NotificationStatus::Sent);
}

#[test]
fn disabled_preference_cancels_delivery() {
    let mut engine = LedgerEngine::build_test("notif-disabled", 1).unwrap();
    let user = engine.create_user("quiet@example.com").unwrap();
    let n = {
        let notifications = engine.notifications().unwrap();
        notifications
            .set_preference(
                user,
                NotificationChannel::Email,
                NotificationCategory::SecurityAlert,
                PreferenceSettings {
                    enabled: false,
                    ..Default::default()
                },
                engine.now(),
            )
            .unwrap();
        notifications.queue_notification(alert_for(user), engine.now()).unwrap()
    };

    let events = engine.tick().unwrap();
    assert!(events.iter().any(|e| matches!(e, LedgerEvent::NotificationSuppressed { .. })));
    assert_eq!(status_of(&engine, n.id), NotificationStatus::Cancelled);
    assert!(engine.notifications().unwrap().delivery_log(n.id).unwrap().is_empty());
}

#[test]
fn quiet_hours_defer_all_but_urgent() {
    let mut engine = LedgerEngine::build_test("notif-quiet", 1).unwrap();
    let user = engine.create_user("night@example.com").unwrap();
    let now = engine.now();
    let (normal, urgent) = {
        let notifications = engine.notifications().unwrap();
        notifications
            .set_preference(
                user,
                NotificationChannel::Email,
                NotificationCategory::SecurityAlert,
                PreferenceSettings {
                    enabled: true,
                    quiet_hours: Some(
                        QuietHours::new(
                            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                        )
                        .unwrap(),
                    ),
                    frequency: NotificationFrequency::Immediate,
                },
                now,
            )
            .unwrap();
        (
            notifications.queue_notification(alert_for(user), now).unwrap(),
            notifications
                .queue_notification(alert_for(user).with_priority(NotificationPriority::Urgent), now)
                .unwrap(),
        )
    };

    let events = engine.tick().unwrap();
    let six_am = Utc.with_ymd_and_hms(2026, 1, 1, 6, 0, 0).unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        LedgerEvent::NotificationDeferred { until, reason: DeferralReason::QuietHours, .. } if *until == six_am
    )));
    assert_eq!(status_of(&engine, urgent.id), NotificationStatus::Sent);
    assert_eq!(status_of(&engine, normal.id), NotificationStatus::Pending);

    // 06:00 is the first tick outside the window.
    engine.run_ticks(5).unwrap();
    assert_eq!(status_of(&engine, normal.id), NotificationStatus::Sent);
}

#[test]
fn daily_digest_holds_low_priority_until_midnight() {
    let mut engine = LedgerEngine::build_test("notif-digest", 1).unwrap();
    let user = engine.create_user("digest@example.com").unwrap();
    let now = engine.now();
    let (normal, high) = {
        let notifications = engine.notifications().unwrap();
        notifications
            .set_preference(
                user,
                NotificationChannel::Email,
                NotificationCategory::SecurityAlert,
                PreferenceSettings {
                    enabled: true,
                    quiet_hours: None,
                    frequency: NotificationFrequency::Daily,
                },
                now,
            )
            .unwrap();
        (
            notifications.queue_notification(alert_for(user), now).unwrap(),
            notifications
                .queue_notification(alert_for(user).with_priority(NotificationPriority::High), now)
                .unwrap(),
        )
    };

    let events = engine.tick().unwrap();
    let midnight = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        LedgerEvent::NotificationDeferred { until, reason: DeferralReason::Digest, .. } if *until == midnight
    )));
    assert_eq!(status_of(&engine, high.id), NotificationStatus::Sent);

    engine.run_ticks(23).unwrap();
    assert_eq!(status_of(&engine, normal.id), NotificationStatus::Sent);
}

#[test]
fn preference_pair_is_unique() {
    let engine = LedgerEngine::build_test("notif-pref-unique", 1).unwrap();
    let now = engine.now();
    let notifications = engine.notifications().unwrap();
    let user = engine.create_user("pref@example.com").unwrap();

    notifications
        .create_preference(user, NotificationChannel::Sms, NotificationCategory::Billing, Default::default(), now)
        .unwrap();
    let err = notifications
        .create_preference(user, NotificationChannel::Sms, NotificationCategory::Billing, Default::default(), now)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Upsert replaces in place.
    let updated = notifications
        .set_preference(
            user,
            NotificationChannel::Sms,
            NotificationCategory::Billing,
            PreferenceSettings {
                enabled: false,
                ..Default::default()
            },
            now,
        )
        .unwrap();
    assert!(!updated.enabled);
    assert_eq!(notifications.preferences_for(user).unwrap().len(), 1);
}

#[test]
fn templates_render_and_validate() {
    let engine = LedgerEngine::build_test("notif-templates", 1).unwrap();
    let now = engine.now();
    let notifications = engine.notifications().unwrap();
    let user = engine.create_user("tmpl@example.com").unwrap();

    let vars = TemplateVariables::default().with("name", "Ada").with("count", "3");
    let (subject, body) = notifications.render_template("weekly_digest", &vars).unwrap();
    assert_eq!(subject, "Your weekly report, Ada");
    assert_eq!(body, "3 new findings this week.");

    let missing = TemplateVariables::default().with("name", "Ada");
    let err = notifications.render_template("weekly_digest", &missing).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let queued = notifications
        .queue_from_template(user, "weekly_digest", &vars, NotificationPriority::Low, NotificationData::default(), now)
        .unwrap();
    assert_eq!(queued.title, "Your weekly report, Ada");
    assert_eq!(queued.channel, NotificationChannel::Email);
    assert!(queued.template_id.is_some());

    let undeclared = NewTemplate {
        name: "broken".into(),
        channel: NotificationChannel::Push,
        category: NotificationCategory::System,
        subject: "Hi {{name}}".into(),
        body: "{{surprise}}".into(),
        variables: DeclaredVariables(["name".to_string()].into_iter().collect()),
    };
    assert_eq!(
        notifications.create_template(undeclared, now).unwrap_err().kind(),
        ErrorKind::Validation
    );

    let duplicate = NewTemplate {
        name: "weekly_digest".into(),
        channel: NotificationChannel::Email,
        category: NotificationCategory::Report,
        subject: "dup".into(),
        body: "dup".into(),
        variables: DeclaredVariables::default(),
    };
    assert_eq!(
        notifications.create_template(duplicate, now).unwrap_err().kind(),
        ErrorKind::Conflict
    );
}

#[test]
fn inactive_template_cannot_queue() {
    let engine = LedgerEngine::build_test("notif-inactive-template", 1).unwrap();
    let now = engine.now();
    let notifications = engine.notifications().unwrap();
    let user = engine.create_user("inactive@example.com").unwrap();
    let template = notifications.template_by_name("weekly_digest").unwrap();
    notifications.set_template_active(template.id, false, now).unwrap();

    let vars = TemplateVariables::default().with("name", "Ada").with("count", "1");
    let err = notifications
        .queue_from_template(user, "weekly_digest", &vars, NotificationPriority::Normal, NotificationData::default(), now)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn higher_priority_dispatches_first() {
    let mut engine = LedgerEngine::build_test("notif-priority", 1).unwrap();
    let user = engine.create_user("order@example.com").unwrap();
    let now = engine.now();
    let (low, urgent) = {
        let notifications = engine.notifications().unwrap();
        (
            notifications
                .queue_notification(alert_for(user).with_priority(NotificationPriority::Low), now)
                .unwrap(),
            notifications
                .queue_notification(alert_for(user).with_priority(NotificationPriority::Urgent), now)
                .unwrap(),
        )
    };

    let events = engine.tick().unwrap();
    let order: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LedgerEvent::NotificationSent { notification_id, .. } => Some(*notification_id),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![urgent.id, low.id]);
}
