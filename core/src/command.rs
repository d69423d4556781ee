use crate::{
    billing_subsystem::{NewUsage, SubscriptionRow, UsageRow},
    documents::{NotificationData, TemplateVariables},
    engine::LedgerEngine,
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    notification_subsystem::{NewNotification, NotificationRow},
    risk_subsystem::{AlertRow, AssessmentRow, NewAssessment},
    types::{NotificationId, NotificationPriority, NotificationStatus, Tick, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Commands accepted by the runner, one JSON object per line.
/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum LedgerCommand {
    CreateUser {
        email: String,
    },
    Subscribe {
        user_id: UserId,
        plan: String,
    },
    RecordUsage {
        #[serde(flatten)]
        usage: NewUsage,
    },
    Assess {
        #[serde(flatten)]
        assessment: NewAssessment,
    },
    /// Either a literal notification or a template render.
    QueueNotification {
        #[serde(flatten)]
        source: NotificationSource,
    },
    Acknowledge {
        notification_id: NotificationId,
    },
    Tick {
        #[serde(default = "one_tick")]
        count: u64,
    },
    Summary,
    Quit,
}

fn one_tick() -> u64 {
    1
}

impl LedgerCommand {
    /// Decode one runner line. Well-formed JSON that names an unknown
    /// command, a value outside a closed set or a mistyped field is a
    /// validation error; malformed JSON stays a serialization error.
    pub fn parse_line(line: &str) -> LedgerResult<Self> {
        serde_json::from_str(line).map_err(|e| match e.classify() {
            serde_json::error::Category::Data => LedgerError::validation("command", e.to_string()),
            _ => LedgerError::Serialization(e),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationSource {
    Template {
        user_id: UserId,
        template: String,
        #[serde(default)]
        variables: TemplateVariables,
        #[serde(default = "normal_priority")]
        priority: NotificationPriority,
        #[serde(default)]
        data: NotificationData,
    },
    Literal(NewNotification),
}

fn normal_priority() -> NotificationPriority {
    NotificationPriority::Normal
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResponse {
    UserCreated { user_id: UserId },
    Subscribed { subscription: SubscriptionRow },
    UsageRecorded { usage: UsageRow, remaining_scans: Option<i64> },
    Assessed {
        assessment: AssessmentRow,
        previous_score: Option<i64>,
        alerts: Vec<AlertRow>,
    },
    Notification { notification: NotificationRow },
    Ticked { tick: Tick, now: DateTime<Utc>, events: Vec<LedgerEvent> },
    Summary(LedgerSummary),
    Bye,
    Error { kind: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub run_id: String,
    pub tick: Tick,
    pub now: DateTime<Utc>,
    pub users: i64,
    pub notifications: Vec<(NotificationStatus, i64)>,
    pub alerts_raised: i64,
    pub invoices_issued: i64,
}

impl LedgerEngine {
    /// Apply one command against the engine.
    /// Domain failures come back as `CommandResponse::Error`; storage
    /// failures propagate.
    pub fn execute(&mut self, cmd: LedgerCommand) -> LedgerResult<CommandResponse> {
        match self.apply(cmd) {
            Ok(response) => Ok(response),
            Err(e) if e.kind() != crate::error::ErrorKind::Storage => {
                log::warn!("command rejected: {e}");
                Ok(CommandResponse::Error {
                    kind: format!("{:?}", e.kind()),
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn apply(&mut self, cmd: LedgerCommand) -> LedgerResult<CommandResponse> {
        let now = self.now();
        match cmd {
            LedgerCommand::CreateUser { email } => {
                let user_id = self.create_user(&email)?;
                Ok(CommandResponse::UserCreated { user_id })
            }
            LedgerCommand::Subscribe { user_id, plan } => {
                let billing = self.billing()?;
                let plan = billing.plan_by_name(&plan)?;
                let subscription = billing.create_subscription(user_id, plan.id, now, now)?;
                Ok(CommandResponse::Subscribed { subscription })
            }
            LedgerCommand::RecordUsage { usage } => {
                let user_id = usage.user_id;
                match self.billing()?.record_usage(usage, now) {
                    Ok(usage) => {
                        let remaining_scans = self.billing()?.remaining_scans(user_id)?;
                        Ok(CommandResponse::UsageRecorded {
                            usage,
                            remaining_scans,
                        })
                    }
                    Err(LedgerError::LimitExceeded {
                        limit,
                        used,
                        requested,
                        cap,
                    }) => {
                        self.log_event(
                            "billing",
                            &LedgerEvent::UsageLimitHit {
                                user_id,
                                used,
                                requested,
                                cap,
                            },
                        )?;
                        Err(LedgerError::LimitExceeded {
                            limit,
                            used,
                            requested,
                            cap,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            LedgerCommand::Assess { assessment } => {
                let risk = self.risk()?;
                let outcome = risk.assess(assessment, now)?;
                let alerts = risk.evaluate_thresholds(outcome.assessment.id, now)?;
                let assessment = risk.assessment(outcome.assessment.id)?;
                Ok(CommandResponse::Assessed {
                    assessment,
                    previous_score: outcome.previous_score.map(|s| s.value()),
                    alerts,
                })
            }
            LedgerCommand::QueueNotification { source } => {
                let notifications = self.notifications()?;
                let notification = match source {
                    NotificationSource::Template {
                        user_id,
                        template,
                        variables,
                        priority,
                        data,
                    } => notifications
                        .queue_from_template(user_id, &template, &variables, priority, data, now)?,
                    NotificationSource::Literal(n) => notifications.queue_notification(n, now)?,
                };
                Ok(CommandResponse::Notification { notification })
            }
            LedgerCommand::Acknowledge { notification_id } => {
                let notification = self
                    .notifications()?
                    .acknowledge_delivery(notification_id, now)?;
                Ok(CommandResponse::Notification { notification })
            }
            LedgerCommand::Tick { count } => {
                let events = self.run_ticks(count)?;
                Ok(CommandResponse::Ticked {
                    tick: self.clock.current_tick,
                    now: self.now(),
                    events,
                })
            }
            LedgerCommand::Summary => Ok(CommandResponse::Summary(self.summary()?)),
            LedgerCommand::Quit => Ok(CommandResponse::Bye),
        }
    }

    pub fn summary(&self) -> LedgerResult<LedgerSummary> {
        let notifications = NotificationStatus::iter()
            .map(|s| Ok((s, self.store.notification_count_by_status(s)?)))
            .collect::<LedgerResult<Vec<_>>>()?;
        Ok(LedgerSummary {
            run_id: self.run_id.clone(),
            tick: self.clock.current_tick,
            now: self.now(),
            users: self.store.user_count()?,
            notifications,
            alerts_raised: self.store.event_count(&self.run_id, "alert_raised")?,
            invoices_issued: self.store.event_count(&self.run_id, "invoice_issued")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn commands_parse_from_json_lines() {
        let cmd: LedgerCommand =
            serde_json::from_str(r#"{"cmd":"create_user","email":"a@b.io"}"#).unwrap();
        assert!(matches!(cmd, LedgerCommand::CreateUser { .. }));

        let cmd: LedgerCommand = serde_json::from_str(r#"{"cmd":"tick"}"#).unwrap();
        assert!(matches!(cmd, LedgerCommand::Tick { count: 1 }));

        let cmd: LedgerCommand = serde_json::from_str(
            r#"{"cmd":"queue_notification","user_id":"6f1c8f3e-1f7a-4a43-9a53-0e6d1d7b0c11",
                "template":"weekly_digest","variables":{"name":"Ada","count":"2"}}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            LedgerCommand::QueueNotification {
                source: NotificationSource::Template { .. }
            }
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = LedgerCommand::parse_line(r#"{"cmd":"launch"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn out_of_set_values_are_validation_errors() {
        let user = "6f1c8f3e-1f7a-4a43-9a53-0e6d1d7b0c11";
        let usage = format!(
            r#"{{"cmd":"record_usage","user_id":"{user}","service_type":"foo","action":"scan"}}"#
        );
        let err = LedgerCommand::parse_line(&usage).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let literal = format!(
            r#"{{"cmd":"queue_notification","user_id":"{user}","channel":"fax",
                "category":"security_alert","title":"t","message":"m"}}"#
        );
        let err = LedgerCommand::parse_line(&literal).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let ok = format!(
            r#"{{"cmd":"record_usage","user_id":"{user}","service_type":"email_scan","action":"scan"}}"#
        );
        assert!(matches!(
            LedgerCommand::parse_line(&ok).unwrap(),
            LedgerCommand::RecordUsage { .. }
        ));
    }

    #[test]
    fn malformed_json_is_not_a_validation_error() {
        let err = LedgerCommand::parse_line(r#"{"cmd":"tick""#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn domain_errors_become_responses() {
        let mut engine = LedgerEngine::build_test("cmd-test", 1).unwrap();
        let response = engine
            .execute(LedgerCommand::CreateUser {
                email: "not-an-address".into(),
            })
            .unwrap();
        assert!(matches!(response, CommandResponse::Error { .. }));
    }
}
