//! Notification subsystem: templates, queueing, preferences and the
//! delivery dispatcher.
//!
//! State machine (forward only):
//!   pending ──send──▶ sent ──ack──▶ delivered
//!      │
//!      ├──give up──▶ failed
//!      └──cancel───▶ cancelled
//!
//! A failed attempt leaves the row `pending` with `retry_count + 1` and a
//! backoff `scheduled_for` until `max_retries` is spent. Every attempt,
//! successful or not, appends one delivery log row.

use crate::{
    config::NotificationConfig,
    delivery::{DeliveryFailure, DeliveryTransport, LogTransport},
    documents::{DeclaredVariables, NotificationData, ProviderResponse, TemplateVariables},
    error::{LedgerError, LedgerResult},
    event::{DeferralReason, LedgerEvent},
    rng::SubsystemRng,
    store::LedgerStore,
    subsystem::LedgerSubsystem,
    types::{
        new_id, DeliveryOutcome, NotificationCategory, NotificationChannel, NotificationFrequency,
        NotificationId, NotificationPriority, NotificationStatus, TemplateId, UserId,
    },
};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest a failed delivery waits before its next attempt: one week.
pub const MAX_RETRY_DELAY_SECS: i64 = 7 * 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRow {
    pub id: TemplateId,
    pub name: String,
    pub channel: NotificationChannel,
    pub category: NotificationCategory,
    pub subject: String,
    pub body: String,
    pub variables: DeclaredVariables,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub channel: NotificationChannel,
    pub category: NotificationCategory,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub variables: DeclaredVariables,
}

impl NewTemplate {
    /// Every `{{name}}` in the subject and body must be declared.
    pub fn into_row(self, now: DateTime<Utc>) -> LedgerResult<TemplateRow> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::validation("template name", "must not be empty"));
        }
        for text in [&self.subject, &self.body] {
            for name in placeholders(text)? {
                if !self.variables.0.contains(&name) {
                    return Err(LedgerError::validation(
                        "template variables",
                        format!("'{name}' is used but not declared"),
                    ));
                }
            }
        }
        Ok(TemplateRow {
            id: new_id(),
            name: self.name,
            channel: self.channel,
            category: self.category,
            subject: self.subject,
            body: self.body,
            variables: self.variables,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRow {
    pub id: NotificationId,
    pub user_id: UserId,
    pub template_id: Option<TemplateId>,
    pub channel: NotificationChannel,
    pub category: NotificationCategory,
    pub title: String,
    pub message: String,
    pub data: NotificationData,
    pub status: NotificationStatus,
    pub priority: NotificationPriority,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: UserId,
    pub channel: NotificationChannel,
    pub category: NotificationCategory,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: NotificationData,
    #[serde(default = "normal_priority")]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Falls back to the configured default.
    #[serde(default)]
    pub max_retries: Option<i64>,
}

fn normal_priority() -> NotificationPriority {
    NotificationPriority::Normal
}

impl NewNotification {
    pub fn new(
        user_id: UserId,
        channel: NotificationChannel,
        category: NotificationCategory,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            channel,
            category,
            title: title.into(),
            message: message.into(),
            data: NotificationData::default(),
            priority: NotificationPriority::Normal,
            scheduled_for: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub(crate) fn into_row(
        self,
        template_id: Option<TemplateId>,
        default_max_retries: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<NotificationRow> {
        if self.title.trim().is_empty() {
            return Err(LedgerError::validation("title", "must not be empty"));
        }
        let max_retries = self.max_retries.unwrap_or(default_max_retries);
        if max_retries < 0 {
            return Err(LedgerError::validation("max_retries", "must not be negative"));
        }
        Ok(NotificationRow {
            id: new_id(),
            user_id: self.user_id,
            template_id,
            channel: self.channel,
            category: self.category,
            title: self.title,
            message: self.message,
            data: self.data,
            status: NotificationStatus::Pending,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            failure_reason: None,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A daily UTC window. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> LedgerResult<Self> {
        if start == end {
            return Err(LedgerError::validation("quiet_hours", "start and end must differ"));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// The first instant after `now` at which the window closes.
    pub fn next_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.end).and_utc();
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRow {
    pub id: Uuid,
    pub user_id: UserId,
    pub channel: NotificationChannel,
    pub category: NotificationCategory,
    pub enabled: bool,
    pub quiet_hours: Option<QuietHours>,
    pub frequency: NotificationFrequency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceSettings {
    pub enabled: bool,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default = "immediate")]
    pub frequency: NotificationFrequency,
}

fn immediate() -> NotificationFrequency {
    NotificationFrequency::Immediate
}

impl Default for PreferenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet_hours: None,
            frequency: NotificationFrequency::Immediate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogRow {
    pub id: Uuid,
    pub notification_id: NotificationId,
    pub attempt_number: i64,
    pub outcome: DeliveryOutcome,
    pub provider: String,
    pub provider_response: ProviderResponse,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

// ── Template rendering ─────────────────────────────────────────

/// Names referenced as `{{name}}` in `text`, in order of appearance.
pub fn placeholders(text: &str) -> LedgerResult<Vec<String>> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| LedgerError::validation("template", "unclosed '{{' placeholder"))?;
        let name = after[..close].trim();
        if name.is_empty() {
            return Err(LedgerError::validation("template", "empty '{{}}' placeholder"));
        }
        names.push(name.to_string());
        rest = &after[close + 2..];
    }
    Ok(names)
}

fn substitute(text: &str, vars: &TemplateVariables) -> LedgerResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| LedgerError::validation("template", "unclosed '{{' placeholder"))?;
        let name = after[..close].trim();
        let value = vars
            .0
            .get(name)
            .ok_or_else(|| LedgerError::validation("template variables", format!("'{name}' was not supplied")))?;
        out.push_str(value);
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Render `(subject, body)`. Every declared variable must be supplied.
pub fn render(template: &TemplateRow, vars: &TemplateVariables) -> LedgerResult<(String, String)> {
    if let Some(missing) = template.variables.0.iter().find(|v| !vars.0.contains_key(*v)) {
        return Err(LedgerError::validation(
            "template variables",
            format!("'{missing}' is required by template '{}'", template.name),
        ));
    }
    Ok((substitute(&template.subject, vars)?, substitute(&template.body, vars)?))
}

/// Start of the next digest window strictly after `now`.
fn next_digest_boundary(now: DateTime<Utc>, frequency: NotificationFrequency) -> Option<DateTime<Utc>> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    match frequency {
        NotificationFrequency::Immediate => None,
        NotificationFrequency::Hourly => {
            let hour = midnight + Duration::hours(now.hour() as i64);
            Some(hour + Duration::hours(1))
        }
        NotificationFrequency::Daily => Some(midnight + Duration::days(1)),
        NotificationFrequency::Weekly => {
            let days = 7 - now.weekday().num_days_from_monday() as i64;
            Some(midnight + Duration::days(days))
        }
    }
}

pub struct NotificationSubsystem {
    config: NotificationConfig,
    store: LedgerStore,
    transport: Box<dyn DeliveryTransport>,
}

impl NotificationSubsystem {
    pub fn new(config: NotificationConfig, store: LedgerStore) -> Self {
        Self::with_transport(config, store, Box::new(LogTransport::default()))
    }

    pub fn with_transport(
        config: NotificationConfig,
        store: LedgerStore,
        transport: Box<dyn DeliveryTransport>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    // ── Templates ──────────────────────────────────────────────

    /// Fails with `Conflict` on a duplicate name.
    pub fn create_template(&self, template: NewTemplate, now: DateTime<Utc>) -> LedgerResult<TemplateRow> {
        let row = template.into_row(now)?;
        self.store.insert_template(&row)?;
        Ok(row)
    }

    pub fn template(&self, id: TemplateId) -> LedgerResult<TemplateRow> {
        self.store
            .get_template(id)?
            .ok_or_else(|| LedgerError::not_found("notification template", id))
    }

    pub fn template_by_name(&self, name: &str) -> LedgerResult<TemplateRow> {
        self.store
            .get_template_by_name(name)?
            .ok_or_else(|| LedgerError::not_found("notification template", name))
    }

    pub fn render_template(&self, name: &str, vars: &TemplateVariables) -> LedgerResult<(String, String)> {
        render(&self.template_by_name(name)?, vars)
    }

    pub fn set_template_active(&self, id: TemplateId, active: bool, now: DateTime<Utc>) -> LedgerResult<()> {
        self.store.set_template_active(id, active, now)
    }

    pub fn delete_template(&self, id: TemplateId) -> LedgerResult<()> {
        self.store.delete_template(id)
    }

    // ── Queueing ───────────────────────────────────────────────

    pub fn queue_notification(&self, n: NewNotification, now: DateTime<Utc>) -> LedgerResult<NotificationRow> {
        let row = n.into_row(None, self.config.default_max_retries, now)?;
        self.store.atomic(|store| {
            store.require_user(row.user_id)?;
            store.insert_notification(&row)
        })?;
        Ok(row)
    }

    /// Render a named template and queue the result on the template's channel.
    pub fn queue_from_template(
        &self,
        user_id: UserId,
        template_name: &str,
        vars: &TemplateVariables,
        priority: NotificationPriority,
        data: NotificationData,
        now: DateTime<Utc>,
    ) -> LedgerResult<NotificationRow> {
        let template = self.template_by_name(template_name)?;
        let row = queue_rendered(
            &self.store,
            &template,
            user_id,
            vars,
            priority,
            data,
            self.config.default_max_retries,
            now,
        )?;
        Ok(row)
    }

    pub fn notification(&self, id: NotificationId) -> LedgerResult<NotificationRow> {
        self.store
            .get_notification(id)?
            .ok_or_else(|| LedgerError::not_found("notification", id))
    }

    pub fn notifications_for(&self, user_id: UserId) -> LedgerResult<Vec<NotificationRow>> {
        self.store.notifications_for_user(user_id)
    }

    /// Move a notification along its state machine. Timestamps for the
    /// target state are stamped with `now`.
    pub fn transition_notification(
        &self,
        id: NotificationId,
        next: NotificationStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<NotificationRow> {
        self.store.atomic(|store| {
            let mut n = store
                .get_notification(id)?
                .ok_or_else(|| LedgerError::not_found("notification", id))?;
            let from = n.status;
            if !from.can_transition_to(next) {
                return Err(LedgerError::StateTransition {
                    entity: "notification",
                    from: from.to_string(),
                    to: next.to_string(),
                });
            }
            n.status = next;
            match next {
                NotificationStatus::Sent => n.sent_at = Some(now),
                NotificationStatus::Delivered => n.delivered_at = Some(now),
                NotificationStatus::Failed => {
                    n.failed_at = Some(now);
                    n.failure_reason = reason.map(str::to_string);
                }
                NotificationStatus::Cancelled => n.failure_reason = reason.map(str::to_string),
                NotificationStatus::Pending => {}
            }
            if !store.update_notification(&n, from, now)? {
                return Err(LedgerError::Conflict {
                    reason: format!("notification {id} changed concurrently"),
                });
            }
            n.updated_at = now;
            Ok(n)
        })
    }

    /// Out-of-band cancel. Only a pending notification can be cancelled.
    pub fn cancel_notification(&self, id: NotificationId, now: DateTime<Utc>) -> LedgerResult<NotificationRow> {
        self.transition_notification(id, NotificationStatus::Cancelled, Some("cancelled by request"), now)
    }

    /// Provider acknowledgement: `sent → delivered`.
    pub fn acknowledge_delivery(&self, id: NotificationId, now: DateTime<Utc>) -> LedgerResult<NotificationRow> {
        self.transition_notification(id, NotificationStatus::Delivered, None, now)
    }

    pub fn delivery_log(&self, id: NotificationId) -> LedgerResult<Vec<DeliveryLogRow>> {
        self.store.delivery_logs_for(id)
    }

    // ── Preferences ────────────────────────────────────────────

    /// Fails with `Conflict` if the user already has a row for the pair.
    pub fn create_preference(
        &self,
        user_id: UserId,
        channel: NotificationChannel,
        category: NotificationCategory,
        settings: PreferenceSettings,
        now: DateTime<Utc>,
    ) -> LedgerResult<PreferenceRow> {
        let row = PreferenceRow {
            id: new_id(),
            user_id,
            channel,
            category,
            enabled: settings.enabled,
            quiet_hours: settings.quiet_hours,
            frequency: settings.frequency,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_preference(&row)?;
        Ok(row)
    }

    /// Create or replace the preference for `(user, channel, category)`.
    pub fn set_preference(
        &self,
        user_id: UserId,
        channel: NotificationChannel,
        category: NotificationCategory,
        settings: PreferenceSettings,
        now: DateTime<Utc>,
    ) -> LedgerResult<PreferenceRow> {
        self.store.atomic(|store| match store.get_preference(user_id, channel, category)? {
            Some(mut existing) => {
                existing.enabled = settings.enabled;
                existing.quiet_hours = settings.quiet_hours;
                existing.frequency = settings.frequency;
                store.update_preference(&existing, now)?;
                existing.updated_at = now;
                Ok(existing)
            }
            None => self.create_preference(user_id, channel, category, settings, now),
        })
    }

    pub fn preference_for(
        &self,
        user_id: UserId,
        channel: NotificationChannel,
        category: NotificationCategory,
    ) -> LedgerResult<Option<PreferenceRow>> {
        self.store.get_preference(user_id, channel, category)
    }

    pub fn preferences_for(&self, user_id: UserId) -> LedgerResult<Vec<PreferenceRow>> {
        self.store.preferences_for_user(user_id)
    }

    // ── Dispatch ───────────────────────────────────────────────

    /// Attempt every due pending notification, up to the batch size.
    pub fn dispatch_due(&mut self, now: DateTime<Utc>, rng: &mut SubsystemRng) -> LedgerResult<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        for n in self.store.due_notifications(now, self.config.dispatch_batch)? {
            if let Some(event) = self.dispatch_one(n, now, rng)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn dispatch_one(
        &mut self,
        mut n: NotificationRow,
        now: DateTime<Utc>,
        rng: &mut SubsystemRng,
    ) -> LedgerResult<Option<LedgerEvent>> {
        let pref = self.store.get_preference(n.user_id, n.channel, n.category)?;

        if let Some(pref) = &pref {
            if !pref.enabled {
                n.status = NotificationStatus::Cancelled;
                n.failure_reason = Some(format!("{} {} disabled by user", n.channel, n.category));
                if !self.store.update_notification(&n, NotificationStatus::Pending, now)? {
                    return Ok(None);
                }
                log::debug!("notification {} suppressed by preference", n.id);
                return Ok(Some(LedgerEvent::NotificationSuppressed {
                    notification_id: n.id,
                    user_id: n.user_id,
                }));
            }
            if n.priority < NotificationPriority::Urgent {
                if let Some(window) = pref.quiet_hours.filter(|w| w.contains(now.time())) {
                    let until = window.next_end(now);
                    return self.defer(n, until, DeferralReason::QuietHours, now);
                }
            }
            if n.priority < NotificationPriority::High && n.scheduled_for.is_none() {
                if let Some(until) = next_digest_boundary(now, pref.frequency) {
                    return self.defer(n, until, DeferralReason::Digest, now);
                }
            }
        }

        let attempt = self.store.delivery_attempt_count(n.id)? + 1;
        let provider = self.transport.provider().to_string();
        let outcome = self.transport.deliver(&n);

        self.store.atomic(|store| {
            let event = match outcome {
                Ok(receipt) => {
                    store.insert_delivery_log(&DeliveryLogRow {
                        id: new_id(),
                        notification_id: n.id,
                        attempt_number: attempt,
                        outcome: DeliveryOutcome::Success,
                        provider: provider.clone(),
                        provider_response: receipt.response,
                        error_message: None,
                        attempted_at: now,
                    })?;
                    n.status = NotificationStatus::Sent;
                    n.sent_at = Some(now);
                    LedgerEvent::NotificationSent {
                        notification_id: n.id,
                        user_id: n.user_id,
                        channel: n.channel,
                        attempt,
                    }
                }
                Err(failure) => {
                    store.insert_delivery_log(&DeliveryLogRow {
                        id: new_id(),
                        notification_id: n.id,
                        attempt_number: attempt,
                        outcome: DeliveryOutcome::Failure,
                        provider: provider.clone(),
                        provider_response: failure.response(),
                        error_message: Some(failure.message.clone()),
                        attempted_at: now,
                    })?;
                    log::warn!(
                        "delivery of {} via {provider} failed (attempt {attempt}): {} {}",
                        n.id,
                        failure.code,
                        failure.message
                    );
                    self.after_failure(&mut n, &failure, attempt, now, rng)
                }
            };
            if !store.update_notification(&n, NotificationStatus::Pending, now)? {
                // Cancelled while the transport was busy; the attempt stays logged.
                return Ok(None);
            }
            Ok(Some(event))
        })
    }

    fn after_failure(
        &self,
        n: &mut NotificationRow,
        failure: &DeliveryFailure,
        attempt: i64,
        now: DateTime<Utc>,
        rng: &mut SubsystemRng,
    ) -> LedgerEvent {
        let retry_at = if failure.retryable && n.retry_count < n.max_retries {
            now.checked_add_signed(self.backoff(n.retry_count + 1, rng))
        } else {
            None
        };
        if let Some(retry_at) = retry_at {
            n.retry_count += 1;
            n.scheduled_for = Some(retry_at);
            LedgerEvent::NotificationRetryScheduled {
                notification_id: n.id,
                attempt,
                retry_at,
            }
        } else {
            n.status = NotificationStatus::Failed;
            n.failed_at = Some(now);
            n.failure_reason = Some(format!("{}: {}", failure.code, failure.message));
            LedgerEvent::NotificationFailed {
                notification_id: n.id,
                user_id: n.user_id,
                reason: failure.message.clone(),
            }
        }
    }

    /// `base · 2^(retry − 1)` seconds plus up to `jitter` seconds, capped at
    /// `MAX_RETRY_DELAY_SECS`.
    fn backoff(&self, retry: i64, rng: &mut SubsystemRng) -> Duration {
        let exp = (retry - 1).clamp(0, 16) as u32;
        let base = self.config.retry_base_secs.saturating_mul(1_i64 << exp);
        let delay = base
            .saturating_add(rng.up_to(self.config.retry_jitter_secs))
            .clamp(0, MAX_RETRY_DELAY_SECS);
        Duration::seconds(delay)
    }

    fn defer(
        &self,
        mut n: NotificationRow,
        until: DateTime<Utc>,
        reason: DeferralReason,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEvent>> {
        n.scheduled_for = Some(until);
        if !self.store.update_notification(&n, NotificationStatus::Pending, now)? {
            return Ok(None);
        }
        Ok(Some(LedgerEvent::NotificationDeferred {
            notification_id: n.id,
            until,
            reason,
        }))
    }
}

/// Render `template` and insert the notification it produces.
/// Shared with the schedule runner, which calls it inside its own unit.
#[allow(clippy::too_many_arguments)]
pub(crate) fn queue_rendered(
    store: &LedgerStore,
    template: &TemplateRow,
    user_id: UserId,
    vars: &TemplateVariables,
    priority: NotificationPriority,
    data: NotificationData,
    default_max_retries: i64,
    now: DateTime<Utc>,
) -> LedgerResult<NotificationRow> {
    if !template.is_active {
        return Err(LedgerError::validation(
            "template",
            format!("'{}' is inactive", template.name),
        ));
    }
    let (title, message) = render(template, vars)?;
    let mut request = NewNotification::new(user_id, template.channel, template.category, title, message)
        .with_priority(priority);
    request.data = data;
    let row = request.into_row(Some(template.id), default_max_retries, now)?;
    store.atomic(|store| {
        store.require_user(user_id)?;
        store.insert_notification(&row)
    })?;
    Ok(row)
}

impl LedgerSubsystem for NotificationSubsystem {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn update(
        &mut self,
        now: DateTime<Utc>,
        _events_in: &[LedgerEvent],
        rng: &mut SubsystemRng,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let events = self.dispatch_due(now, rng)?;
        log::debug!("{now} notification: {} dispatched", events.len());
        Ok(events)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
