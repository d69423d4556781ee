//! Notification schedule runner tests.

use chrono::{Duration, NaiveTime};
use riskledger_core::{
    documents::{Cadence, ScheduleData, TemplateVariables},
    engine::LedgerEngine,
    error::ErrorKind,
    event::LedgerEvent,
    schedule_subsystem::NewSchedule,
    types::{NotificationStatus, UserId},
};

fn digest_vars() -> TemplateVariables {
    TemplateVariables::default().with("name", "Ada").with("count", "4")
}

fn new_schedule(engine: &LedgerEngine, user_id: UserId, data: ScheduleData) -> NewSchedule {
    let template = engine
        .notifications()
        .unwrap()
        .template_by_name("weekly_digest")
        .unwrap();
    NewSchedule {
        user_id,
        template_id: template.id,
        name: "digest".into(),
        data,
        template_variables: digest_vars(),
        max_runs: None,
    }
}

#[test]
fn one_time_schedule_runs_once_then_deactivates() {
    let mut engine = LedgerEngine::build_test("sched-one-time", 1).unwrap();
    let user = engine.create_user("once@example.com").unwrap();
    let run_at = engine.now() + Duration::minutes(30);
    let schedule = {
        let request = new_schedule(&engine, user, ScheduleData::OneTime { run_at });
        engine.schedules().unwrap().create_schedule(request, engine.now()).unwrap()
    };
    assert_eq!(schedule.next_run_at, Some(run_at));

    let events = engine.tick().unwrap();
    assert!(events.iter().any(|e| matches!(e, LedgerEvent::ScheduleRan { run_count: 1, .. })));
    assert!(events.iter().any(|e| matches!(e, LedgerEvent::ScheduleDeactivated { .. })));

    let done = engine.schedules().unwrap().schedule(schedule.id).unwrap();
    assert!(!done.is_active);
    assert_eq!(done.run_count, 1);
    assert_eq!(done.next_run_at, None);
    assert_eq!(done.last_run_at, Some(engine.now()));

    // The rendered notification went out in the same tick.
    let sent = engine.notifications().unwrap().notifications_for(user).unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Your weekly report, Ada");
    assert_eq!(sent[0].status, NotificationStatus::Sent);
    assert_eq!(sent[0].data.schedule_id, Some(schedule.id));

    engine.run_ticks(5).unwrap();
    assert_eq!(engine.notifications().unwrap().notifications_for(user).unwrap().len(), 1);
}

#[test]
fn interval_schedule_advances_by_its_period() {
    let mut engine = LedgerEngine::build_test("sched-interval", 1).unwrap();
    let user = engine.create_user("daily@example.com").unwrap();
    let start = engine.now() + Duration::hours(1);
    let schedule = {
        let request = new_schedule(
            &engine,
            user,
            ScheduleData::Interval {
                every_secs: 86_400,
                starts_at: Some(start),
            },
        );
        engine.schedules().unwrap().create_schedule(request, engine.now()).unwrap()
    };

    engine.tick().unwrap();
    let ran_at = engine.now();
    assert_eq!(ran_at, start);

    let after = engine.schedules().unwrap().schedule(schedule.id).unwrap();
    assert_eq!(after.run_count, 1);
    assert_eq!(after.last_run_at, Some(ran_at));
    assert_eq!(after.next_run_at, Some(ran_at + Duration::hours(24)));
    assert!(after.is_active);
    assert_eq!(after.version, schedule.version + 1);

    // Not due again until a day later.
    engine.run_ticks(23).unwrap();
    assert_eq!(engine.schedules().unwrap().schedule(schedule.id).unwrap().run_count, 1);
    engine.tick().unwrap();
    assert_eq!(engine.schedules().unwrap().schedule(schedule.id).unwrap().run_count, 2);
}

#[test]
fn max_runs_caps_a_recurring_schedule() {
    let mut engine = LedgerEngine::build_test("sched-max-runs", 1).unwrap();
    let user = engine.create_user("capped@example.com").unwrap();
    let schedule = {
        let mut request = new_schedule(
            &engine,
            user,
            ScheduleData::Recurring {
                cadence: Cadence::Daily,
                at: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            },
        );
        request.max_runs = Some(2);
        engine.schedules().unwrap().create_schedule(request, engine.now()).unwrap()
    };

    engine.run_ticks(72).unwrap();
    let done = engine.schedules().unwrap().schedule(schedule.id).unwrap();
    assert_eq!(done.run_count, 2);
    assert!(!done.is_active);

    let err = engine
        .schedules()
        .unwrap()
        .set_schedule_active(schedule.id, true, engine.now())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateTransition);
}

#[test]
fn missing_variables_are_rejected_at_creation() {
    let engine = LedgerEngine::build_test("sched-bad-vars", 1).unwrap();
    let user = engine.create_user("vars@example.com").unwrap();
    let mut request = new_schedule(
        &engine,
        user,
        ScheduleData::Interval {
            every_secs: 3_600,
            starts_at: None,
        },
    );
    request.template_variables = TemplateVariables::default().with("name", "Ada");
    let err = engine
        .schedules()
        .unwrap()
        .create_schedule(request, engine.now())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn non_positive_interval_is_rejected() {
    let engine = LedgerEngine::build_test("sched-bad-interval", 1).unwrap();
    let user = engine.create_user("zero@example.com").unwrap();
    let request = new_schedule(
        &engine,
        user,
        ScheduleData::Interval {
            every_secs: 0,
            starts_at: None,
        },
    );
    let err = engine
        .schedules()
        .unwrap()
        .create_schedule(request, engine.now())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

/// An interval too large to add to a timestamp is refused up front, so the
/// worker never has to advance it.
#[test]
fn oversized_interval_is_rejected() {
    let mut engine = LedgerEngine::build_test("sched-huge-interval", 1).unwrap();
    let user = engine.create_user("huge@example.com").unwrap();
    let request = new_schedule(
        &engine,
        user,
        ScheduleData::Interval {
            every_secs: i64::MAX,
            starts_at: None,
        },
    );
    let err = engine
        .schedules()
        .unwrap()
        .create_schedule(request, engine.now())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    engine.run_ticks(2).unwrap();
    assert!(engine.notifications().unwrap().notifications_for(user).unwrap().is_empty());
}

/// A schedule whose template was switched off stops itself on its next run.
#[test]
fn inactive_template_deactivates_schedule() {
    let mut engine = LedgerEngine::build_test("sched-template-off", 1).unwrap();
    let user = engine.create_user("off@example.com").unwrap();
    let schedule = {
        let request = new_schedule(
            &engine,
            user,
            ScheduleData::Interval {
                every_secs: 3_600,
                starts_at: None,
            },
        );
        let schedule = engine.schedules().unwrap().create_schedule(request, engine.now()).unwrap();
        let notifications = engine.notifications().unwrap();
        notifications
            .set_template_active(schedule.template_id, false, engine.now())
            .unwrap();
        schedule
    };

    let events = engine.tick().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        LedgerEvent::ScheduleDeactivated { run_count: 0, .. }
    )));
    let stopped = engine.schedules().unwrap().schedule(schedule.id).unwrap();
    assert!(!stopped.is_active);
    assert!(engine.notifications().unwrap().notifications_for(user).unwrap().is_empty());
}

#[test]
fn paused_schedule_does_not_run() {
    let mut engine = LedgerEngine::build_test("sched-paused", 1).unwrap();
    let user = engine.create_user("paused@example.com").unwrap();
    let schedule = {
        let request = new_schedule(
            &engine,
            user,
            ScheduleData::Interval {
                every_secs: 3_600,
                starts_at: None,
            },
        );
        let schedules = engine.schedules().unwrap();
        let schedule = schedules.create_schedule(request, engine.now()).unwrap();
        schedules.set_schedule_active(schedule.id, false, engine.now()).unwrap();
        schedule
    };

    engine.run_ticks(3).unwrap();
    assert_eq!(engine.schedules().unwrap().schedule(schedule.id).unwrap().run_count, 0);
}
