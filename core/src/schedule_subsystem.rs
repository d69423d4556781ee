//! Schedule subsystem: one-time, recurring and interval notification jobs.
//!
//! Each schedule carries a cursor (`next_run_at`). When the cursor comes
//! due the runner renders the schedule's template, queues the resulting
//! notification and advances the cursor, all in one unit:
//!
//!   one_time  → deactivates after its single run
//!   interval  → next = ran_at + every_secs
//!   recurring → next = first cadence occurrence strictly after ran_at
//!
//! `run_count` increments on every run; reaching `max_runs` deactivates.

use crate::{
    config::ScheduleConfig,
    documents::{Cadence, NotificationData, ScheduleData, TemplateVariables},
    error::{ErrorKind, LedgerError, LedgerResult},
    event::LedgerEvent,
    notification_subsystem::{queue_rendered, render},
    rng::SubsystemRng,
    store::LedgerStore,
    subsystem::LedgerSubsystem,
    types::{new_id, NotificationPriority, ScheduleId, ScheduleType, TemplateId, UserId},
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub id: ScheduleId,
    pub user_id: UserId,
    pub template_id: TemplateId,
    pub name: String,
    pub schedule_type: ScheduleType,
    pub data: ScheduleData,
    pub template_variables: TemplateVariables,
    pub is_active: bool,
    pub run_count: i64,
    pub max_runs: Option<i64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub user_id: UserId,
    pub template_id: TemplateId,
    pub name: String,
    pub data: ScheduleData,
    #[serde(default)]
    pub template_variables: TemplateVariables,
    #[serde(default)]
    pub max_runs: Option<i64>,
}

// ── Cursor arithmetic ──────────────────────────────────────────

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |last| last.day())
}

fn on_cadence(cadence: Cadence, date: NaiveDate) -> bool {
    match cadence {
        Cadence::Daily => true,
        Cadence::Weekly { weekday } => date.weekday() == weekday,
        Cadence::Monthly { day } => date.day() == day.min(last_day_of_month(date)),
    }
}

/// First cadence instant after `from` (or at it, when `inclusive`).
fn next_occurrence(
    cadence: Cadence,
    at: NaiveTime,
    from: DateTime<Utc>,
    inclusive: bool,
) -> LedgerResult<DateTime<Utc>> {
    let mut date = from.date_naive();
    // A monthly cadence always matches within two calendar months.
    for _ in 0..=62 {
        if on_cadence(cadence, date) {
            let candidate = date.and_time(at).and_utc();
            if candidate > from || (inclusive && candidate == from) {
                return Ok(candidate);
            }
        }
        date = date
            .succ_opt()
            .ok_or_else(|| LedgerError::validation("schedule_data", "date out of range"))?;
    }
    Err(LedgerError::validation("schedule_data", "cadence never fires"))
}

/// Longest interval a schedule may repeat on: one leap year.
pub const MAX_INTERVAL_SECS: i64 = 366 * 86_400;

fn validate_data(data: &ScheduleData) -> LedgerResult<()> {
    match data {
        ScheduleData::Interval { every_secs, .. } if !(1..=MAX_INTERVAL_SECS).contains(every_secs) => {
            Err(LedgerError::validation(
                "schedule_data",
                format!("interval must be between 1 and {MAX_INTERVAL_SECS} seconds, got {every_secs}"),
            ))
        }
        ScheduleData::Recurring {
            cadence: Cadence::Monthly { day },
            ..
        } if !(1..=31).contains(day) => Err(LedgerError::validation(
            "schedule_data",
            format!("day {day} is not a day of the month"),
        )),
        _ => Ok(()),
    }
}

/// Where the cursor starts for a freshly created schedule.
pub fn first_run(data: &ScheduleData, now: DateTime<Utc>) -> LedgerResult<DateTime<Utc>> {
    validate_data(data)?;
    match data {
        ScheduleData::OneTime { run_at } => Ok(*run_at),
        ScheduleData::Interval { starts_at, .. } => Ok(starts_at.unwrap_or(now)),
        ScheduleData::Recurring { cadence, at } => next_occurrence(*cadence, *at, now, true),
    }
}

/// Where the cursor goes after a run at `ran_at`. `None` means no further runs.
pub fn next_run_after(data: &ScheduleData, ran_at: DateTime<Utc>) -> LedgerResult<Option<DateTime<Utc>>> {
    validate_data(data)?;
    match data {
        ScheduleData::OneTime { .. } => Ok(None),
        ScheduleData::Interval { every_secs, .. } => Duration::try_seconds(*every_secs)
            .and_then(|step| ran_at.checked_add_signed(step))
            .map(Some)
            .ok_or_else(|| LedgerError::validation("schedule_data", format!("{ran_at} + {every_secs}s is out of range"))),
        ScheduleData::Recurring { cadence, at } => next_occurrence(*cadence, *at, ran_at, false).map(Some),
    }
}

/// Apply one run to the row in memory.
fn record_run(schedule: &mut ScheduleRow, ran_at: DateTime<Utc>) -> LedgerResult<()> {
    if !schedule.is_active {
        return Err(LedgerError::StateTransition {
            entity: "notification schedule",
            from: "inactive".into(),
            to: "run".into(),
        });
    }
    schedule.run_count += 1;
    schedule.last_run_at = Some(ran_at);
    schedule.next_run_at = next_run_after(&schedule.data, ran_at)?;
    let exhausted = schedule.max_runs.is_some_and(|max| schedule.run_count >= max);
    if exhausted || schedule.next_run_at.is_none() {
        schedule.is_active = false;
        schedule.next_run_at = None;
    }
    Ok(())
}

pub struct ScheduleSubsystem {
    config: ScheduleConfig,
    max_retries: i64,
    store: LedgerStore,
}

impl ScheduleSubsystem {
    /// `max_retries` is stamped on every notification the runner queues.
    pub fn new(config: ScheduleConfig, max_retries: i64, store: LedgerStore) -> Self {
        Self {
            config,
            max_retries,
            store,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn create_schedule(&self, new: NewSchedule, now: DateTime<Utc>) -> LedgerResult<ScheduleRow> {
        if new.name.trim().is_empty() {
            return Err(LedgerError::validation("schedule name", "must not be empty"));
        }
        if let Some(max) = new.max_runs {
            if max <= 0 {
                return Err(LedgerError::validation("max_runs", "must be positive"));
            }
        }
        let next_run_at = first_run(&new.data, now)?;
        self.store.atomic(|store| {
            store.require_user(new.user_id)?;
            let template = store
                .get_template(new.template_id)?
                .ok_or_else(|| LedgerError::not_found("notification template", new.template_id))?;
            // Fail now rather than on the first run.
            render(&template, &new.template_variables)?;

            let row = ScheduleRow {
                id: new_id(),
                user_id: new.user_id,
                template_id: new.template_id,
                name: new.name.clone(),
                schedule_type: new.data.schedule_type(),
                data: new.data.clone(),
                template_variables: new.template_variables.clone(),
                is_active: true,
                run_count: 0,
                max_runs: new.max_runs,
                last_run_at: None,
                next_run_at: Some(next_run_at),
                version: 0,
                created_at: now,
                updated_at: now,
            };
            store.insert_schedule(&row)?;
            log::info!("schedule '{}' created, first run {next_run_at}", row.name);
            Ok(row)
        })
    }

    pub fn schedule(&self, id: ScheduleId) -> LedgerResult<ScheduleRow> {
        self.store
            .get_schedule(id)?
            .ok_or_else(|| LedgerError::not_found("notification schedule", id))
    }

    pub fn schedules_for(&self, user_id: UserId) -> LedgerResult<Vec<ScheduleRow>> {
        self.store.schedules_for_user(user_id)
    }

    pub fn due_schedules(&self, now: DateTime<Utc>) -> LedgerResult<Vec<ScheduleRow>> {
        self.store.due_schedules(now, self.config.batch_size)
    }

    /// Record a run at `ran_at` and move the cursor.
    pub fn advance_schedule(&self, id: ScheduleId, ran_at: DateTime<Utc>, now: DateTime<Utc>) -> LedgerResult<ScheduleRow> {
        self.store.atomic(|store| {
            let mut schedule = store
                .get_schedule(id)?
                .ok_or_else(|| LedgerError::not_found("notification schedule", id))?;
            record_run(&mut schedule, ran_at)?;
            store.update_schedule(&schedule, now)?;
            schedule.version += 1;
            schedule.updated_at = now;
            Ok(schedule)
        })
    }

    /// Pause or resume. A resumed schedule with no cursor restarts from `now`.
    pub fn set_schedule_active(&self, id: ScheduleId, active: bool, now: DateTime<Utc>) -> LedgerResult<ScheduleRow> {
        self.store.atomic(|store| {
            let mut schedule = store
                .get_schedule(id)?
                .ok_or_else(|| LedgerError::not_found("notification schedule", id))?;
            if active && schedule.max_runs.is_some_and(|max| schedule.run_count >= max) {
                return Err(LedgerError::StateTransition {
                    entity: "notification schedule",
                    from: "exhausted".into(),
                    to: "active".into(),
                });
            }
            if active && schedule.next_run_at.is_none() {
                schedule.next_run_at = match &schedule.data {
                    ScheduleData::OneTime { .. } if schedule.run_count > 0 => {
                        return Err(LedgerError::StateTransition {
                            entity: "notification schedule",
                            from: "completed".into(),
                            to: "active".into(),
                        });
                    }
                    data => Some(first_run(data, now)?),
                };
            }
            schedule.is_active = active;
            store.update_schedule(&schedule, now)?;
            schedule.version += 1;
            schedule.updated_at = now;
            Ok(schedule)
        })
    }

    pub fn delete_schedule(&self, id: ScheduleId) -> LedgerResult<()> {
        self.store.delete_schedule(id)
    }

    // ── Tick worker ────────────────────────────────────────────

    /// Run every due schedule once.
    pub fn run_due(&self, now: DateTime<Utc>) -> LedgerResult<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        for schedule in self.due_schedules(now)? {
            match self.run_one(schedule.clone(), now) {
                Ok(ran) => events.extend(ran),
                Err(LedgerError::StaleWrite { id, .. }) => {
                    log::warn!("schedule {id} changed during its run; retrying next tick");
                }
                Err(e) if e.kind() == ErrorKind::Validation => {
                    // Template went inactive or lost a variable; stop firing.
                    log::warn!("schedule '{}' disabled: {e}", schedule.name);
                    let mut disabled = schedule;
                    disabled.is_active = false;
                    self.store.update_schedule(&disabled, now)?;
                    events.push(LedgerEvent::ScheduleDeactivated {
                        schedule_id: disabled.id,
                        run_count: disabled.run_count,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    fn run_one(&self, mut schedule: ScheduleRow, now: DateTime<Utc>) -> LedgerResult<Vec<LedgerEvent>> {
        self.store.atomic(|store| {
            let template = store
                .get_template(schedule.template_id)?
                .ok_or_else(|| LedgerError::not_found("notification template", schedule.template_id))?;
            let data = NotificationData {
                schedule_id: Some(schedule.id),
                ..NotificationData::default()
            };
            let notification = queue_rendered(
                store,
                &template,
                schedule.user_id,
                &schedule.template_variables,
                NotificationPriority::Normal,
                data,
                self.max_retries,
                now,
            )?;
            record_run(&mut schedule, now)?;
            store.update_schedule(&schedule, now)?;

            let mut events = vec![LedgerEvent::ScheduleRan {
                schedule_id: schedule.id,
                user_id: schedule.user_id,
                notification_id: notification.id,
                run_count: schedule.run_count,
            }];
            if !schedule.is_active {
                events.push(LedgerEvent::ScheduleDeactivated {
                    schedule_id: schedule.id,
                    run_count: schedule.run_count,
                });
            }
            Ok(events)
        })
    }
}

impl LedgerSubsystem for ScheduleSubsystem {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn update(
        &mut self,
        now: DateTime<Utc>,
        _events_in: &[LedgerEvent],
        _rng: &mut SubsystemRng,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let events = self.run_due(now)?;
        log::debug!("{now} schedule: {} events", events.len());
        Ok(events)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn interval_adds_fixed_delta() {
        let data = ScheduleData::Interval { every_secs: 86_400, starts_at: None };
        let t = at(2026, 5, 1, 12);
        assert_eq!(next_run_after(&data, t).unwrap(), Some(at(2026, 5, 2, 12)));
        assert_eq!(first_run(&data, t).unwrap(), t);
    }

    #[test]
    fn one_time_has_no_successor() {
        let data = ScheduleData::OneTime { run_at: at(2026, 5, 1, 12) };
        assert_eq!(next_run_after(&data, at(2026, 5, 1, 12)).unwrap(), None);
    }

    #[test]
    fn daily_rolls_to_tomorrow_once_past() {
        let data = ScheduleData::Recurring { cadence: Cadence::Daily, at: nine() };
        assert_eq!(first_run(&data, at(2026, 5, 1, 8)).unwrap(), at(2026, 5, 1, 9));
        assert_eq!(first_run(&data, at(2026, 5, 1, 9)).unwrap(), at(2026, 5, 1, 9));
        assert_eq!(next_run_after(&data, at(2026, 5, 1, 9)).unwrap(), Some(at(2026, 5, 2, 9)));
    }

    #[test]
    fn weekly_finds_the_weekday() {
        // 2026-05-01 is a Friday.
        let data = ScheduleData::Recurring {
            cadence: Cadence::Weekly { weekday: Weekday::Mon },
            at: nine(),
        };
        assert_eq!(next_run_after(&data, at(2026, 5, 1, 12)).unwrap(), Some(at(2026, 5, 4, 9)));
    }

    #[test]
    fn monthly_clamps_to_short_months() {
        let data = ScheduleData::Recurring {
            cadence: Cadence::Monthly { day: 31 },
            at: nine(),
        };
        assert_eq!(next_run_after(&data, at(2026, 1, 31, 9)).unwrap(), Some(at(2026, 2, 28, 9)));
        assert_eq!(next_run_after(&data, at(2026, 2, 28, 9)).unwrap(), Some(at(2026, 3, 31, 9)));
        assert_eq!(next_run_after(&data, at(2026, 3, 31, 9)).unwrap(), Some(at(2026, 4, 30, 9)));
    }

    #[test]
    fn bad_schedule_data_is_rejected() {
        let zero = ScheduleData::Interval { every_secs: 0, starts_at: None };
        assert!(first_run(&zero, at(2026, 1, 1, 0)).is_err());
        let day_zero = ScheduleData::Recurring {
            cadence: Cadence::Monthly { day: 0 },
            at: nine(),
        };
        assert!(first_run(&day_zero, at(2026, 1, 1, 0)).is_err());
    }

    #[test]
    fn oversized_interval_is_an_error_not_a_panic() {
        let huge = ScheduleData::Interval { every_secs: i64::MAX, starts_at: None };
        let err = first_run(&huge, at(2026, 1, 1, 0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(next_run_after(&huge, at(2026, 1, 1, 0)).is_err());

        let yearly = ScheduleData::Interval { every_secs: MAX_INTERVAL_SECS, starts_at: None };
        assert_eq!(next_run_after(&yearly, at(2026, 1, 1, 0)).unwrap(), Some(at(2027, 1, 2, 0)));
        let err = next_run_after(&yearly, DateTime::<Utc>::MAX_UTC).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
