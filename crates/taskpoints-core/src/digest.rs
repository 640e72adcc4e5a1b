//! Daily settlement sweep.
//!
//! For a target day, every approved task whose approval falls on or before
//! that day (in the engine's offset) is removed and its points are added to
//! the owner's daily record for the day it was approved. Each (user, day)
//! settles in its own transaction. Notifications go out only after the
//! settlement they describe has committed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::audit::{append_audit_event, AuditEvent};
use crate::config::TaskpointsConfig;
use crate::error::EngineError;
use crate::lifecycle::Engine;
use crate::model::{Task, User};
use crate::notify::{Notification, Notifier};
use crate::store::format_timestamp;
use taskpoints_render::{render_admin_digest, render_user_digest, DigestLine, PendingLine};

#[derive(Debug, Clone, Default)]
pub struct DigestOptions {
    /// `From` address on outgoing digests.
    pub sender: String,
    pub audit_log: Option<PathBuf>,
}

impl DigestOptions {
    pub fn from_config(config: &TaskpointsConfig) -> Self {
        Self {
            sender: config.sender(),
            audit_log: config.audit_log_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledDay {
    pub username: String,
    pub date: NaiveDate,
    pub tasks: usize,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestFailure {
    pub username: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestReport {
    pub day: NaiveDate,
    pub settled: Vec<SettledDay>,
    pub notifications_sent: usize,
    pub notification_failures: Vec<DigestFailure>,
    pub settlement_failures: Vec<DigestFailure>,
    pub admin_notifications: usize,
}

impl DigestReport {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            settled: Vec::new(),
            notifications_sent: 0,
            notification_failures: Vec::new(),
            settlement_failures: Vec::new(),
            admin_notifications: 0,
        }
    }

    pub fn records_written(&self) -> usize {
        self.settled.len()
    }

    pub fn points_settled(&self) -> i64 {
        self.settled.iter().map(|day| day.points).sum()
    }
}

/// Runs the sweep for `day`. Only a failure to read the approved set or the
/// user list aborts the run; per-user failures are recorded in the report.
pub fn run_digest(
    engine: &Engine,
    notifier: &dyn Notifier,
    options: &DigestOptions,
    day: NaiveDate,
) -> Result<DigestReport, EngineError> {
    let offset = engine.offset();
    let cutoff = end_of_day(day, offset)?;
    let approved = engine.store().approved_tasks_before(cutoff)?;
    let users: BTreeMap<String, User> = engine
        .store()
        .list_all_users()?
        .into_iter()
        .map(|user| (user.username.to_lowercase(), user))
        .collect();

    let mut by_user: BTreeMap<String, BTreeMap<NaiveDate, Vec<Task>>> = BTreeMap::new();
    for task in approved {
        let Some(approved_at) = task.approved_at else {
            continue;
        };
        let date = approved_at.with_timezone(&offset).date_naive();
        by_user
            .entry(task.assigned_to.to_lowercase())
            .or_default()
            .entry(date)
            .or_default()
            .push(task);
    }

    let mut report = DigestReport::new(day);
    info!(%day, users = by_user.len(), "digest started");

    for (username, days) in by_user {
        let mut lines = Vec::new();
        for (date, tasks) in days {
            let ids: Vec<i64> = tasks.iter().map(|task| task.id).collect();
            match engine.store().settle_day(&username, date, &ids) {
                Ok(settlement) => {
                    if settlement.tasks.is_empty() {
                        continue;
                    }
                    info!(
                        username = %username,
                        %date,
                        tasks = settlement.tasks.len(),
                        points = settlement.points,
                        "day settled"
                    );
                    audit(
                        options,
                        engine.now(),
                        "settled",
                        &username,
                        json!({
                            "date": date.to_string(),
                            "taskIds": settlement.tasks.iter().map(|t| t.id).collect::<Vec<_>>(),
                            "points": settlement.points,
                        }),
                    );
                    report.settled.push(SettledDay {
                        username: username.clone(),
                        date,
                        tasks: settlement.tasks.len(),
                        points: settlement.points,
                    });
                    lines.extend(settlement.tasks.into_iter().map(|task| DigestLine {
                        date,
                        title: task.title,
                        points: task.points,
                    }));
                }
                Err(err) => {
                    error!(username = %username, %date, error = %err, "settlement failed");
                    audit(
                        options,
                        engine.now(),
                        "settlement_failed",
                        &username,
                        json!({ "date": date.to_string(), "error": err.to_string() }),
                    );
                    report.settlement_failures.push(DigestFailure {
                        username: username.clone(),
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }

        if lines.is_empty() {
            continue;
        }
        let (full_name, email) = users
            .get(&username)
            .map(|user| (user.full_name.as_str(), user.email.as_str()))
            .unwrap_or(("", ""));
        let message = render_user_digest(full_name, day, &lines);
        let notification = Notification {
            from: options.sender.clone(),
            to: email.to_string(),
            subject: message.subject,
            body: message.body,
        };
        match notifier.send(&notification) {
            Ok(()) => report.notifications_sent += 1,
            Err(err) => {
                warn!(username = %username, error = %err, "digest notification failed");
                audit(
                    options,
                    engine.now(),
                    "notification_failed",
                    &username,
                    json!({ "error": err.to_string() }),
                );
                report.notification_failures.push(DigestFailure {
                    username: username.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    if let Err(err) = notify_admins(engine, notifier, options, day, &mut report) {
        warn!(error = %err, "admin digest skipped");
    }

    info!(
        %day,
        records = report.records_written(),
        points = report.points_settled(),
        sent = report.notifications_sent,
        failed = report.notification_failures.len() + report.settlement_failures.len(),
        "digest finished"
    );
    Ok(report)
}

/// One message per admin listing everything still awaiting approval.
/// Nothing is sent when nothing is pending.
fn notify_admins(
    engine: &Engine,
    notifier: &dyn Notifier,
    options: &DigestOptions,
    day: NaiveDate,
    report: &mut DigestReport,
) -> Result<(), EngineError> {
    let tasks: Vec<PendingLine> = engine
        .pending_tasks()?
        .into_iter()
        .map(|task| PendingLine {
            username: task.assigned_to,
            title: task.title,
            points: task.points,
        })
        .collect();
    let goals: Vec<PendingLine> = engine
        .pending_goals()?
        .into_iter()
        .map(|goal| PendingLine {
            username: goal.username,
            title: goal.label,
            points: goal.points,
        })
        .collect();
    if tasks.is_empty() && goals.is_empty() {
        return Ok(());
    }

    let message = render_admin_digest(day, &tasks, &goals);
    for admin in engine.store().list_admins()? {
        let notification = Notification {
            from: options.sender.clone(),
            to: admin.email.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        };
        match notifier.send(&notification) {
            Ok(()) => report.admin_notifications += 1,
            Err(err) => {
                warn!(username = %admin.username, error = %err, "admin digest failed");
                report.notification_failures.push(DigestFailure {
                    username: admin.username,
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// First instant after `day` in `offset`, as UTC.
fn end_of_day<Tz: TimeZone>(day: NaiveDate, offset: Tz) -> Result<DateTime<Utc>, EngineError> {
    let next = day
        .succ_opt()
        .and_then(|next| next.and_hms_opt(0, 0, 0))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .ok_or_else(|| EngineError::Validation(format!("no end of day for {}", day)))?;
    Ok(next.with_timezone(&Utc))
}

fn audit(
    options: &DigestOptions,
    at: DateTime<Utc>,
    action: &str,
    username: &str,
    details: serde_json::Value,
) {
    let Some(path) = options.audit_log.as_ref() else {
        return;
    };
    let event = AuditEvent {
        timestamp: format_timestamp(at),
        action: action.to_string(),
        username: Some(username.to_string()),
        details,
    };
    if let Err(err) = append_audit_event(path, &event) {
        warn!(path = %path.display(), error = %err, "audit append failed");
    }
}
