use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use taskpoints_core::digest::{run_digest, DigestOptions};
use taskpoints_core::lifecycle::Engine;
use taskpoints_core::model::NewUser;
use taskpoints_core::notify::{Notification, Notifier, NotifyError};
use taskpoints_core::store::SqliteStore;

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Notification>>,
    fail_for: Option<String>,
}

impl Recorder {
    fn failing_for(address: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_for: Some(address.to_string()),
        }
    }

    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("lock").clone()
    }
}

impl Notifier for Recorder {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.fail_for.as_deref() == Some(notification.to.as_str()) {
            return Err(NotifyError::Rejected("mailbox unavailable".to_string()));
        }
        self.sent.lock().expect("lock").push(notification.clone());
        Ok(())
    }
}

fn istanbul() -> FixedOffset {
    FixedOffset::east_opt(3 * 3600).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
}

/// Engine whose clock can be moved between calls.
fn engine() -> (Engine, Arc<Mutex<DateTime<Utc>>>) {
    engine_on(SqliteStore::open_in_memory().expect("store"))
}

fn engine_on(store: SqliteStore) -> (Engine, Arc<Mutex<DateTime<Utc>>>) {
    let store = Arc::new(store);
    let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()));
    let clock = Arc::clone(&now);
    let engine = Engine::new(store)
        .with_clock(Arc::new(move || *clock.lock().expect("clock")))
        .with_utc_offset(istanbul());
    for (name, admin) in [("alice", false), ("bob", false), ("root", true)] {
        engine
            .create_user(&NewUser {
                username: name.to_string(),
                full_name: format!("{}{}", name[..1].to_uppercase(), &name[1..]),
                password: "pw".to_string(),
                email: format!("{}@example.com", name),
                is_admin: admin,
            })
            .expect("user");
    }
    (engine, now)
}

fn complete(engine: &Engine, title: &str, username: &str, points: i64) -> i64 {
    let task = engine.assign(title, points, username).expect("assign");
    engine.start(task.id, username).expect("start");
    engine.finish(task.id, username).expect("finish");
    engine.approve(task.id, username, points).expect("approve");
    task.id
}

fn options() -> DigestOptions {
    DigestOptions {
        sender: "Taskpoints <noreply@example.com>".to_string(),
        audit_log: None,
    }
}

#[test]
fn empty_run_writes_nothing_and_sends_nothing() {
    let (engine, _) = engine();
    let notifier = Recorder::default();
    let report = run_digest(&engine, &notifier, &options(), day(19)).expect("digest");
    assert_eq!(report.records_written(), 0);
    assert_eq!(report.notifications_sent, 0);
    assert_eq!(report.admin_notifications, 0);
    assert!(notifier.sent().is_empty());
}

#[test]
fn settles_per_user_and_notifies_after_commit() {
    let (engine, _) = engine();
    complete(&engine, "Write report", "alice", 25);
    complete(&engine, "Fix bug", "alice", 10);
    complete(&engine, "Review", "bob", 5);
    let notifier = Recorder::default();

    let report = run_digest(&engine, &notifier, &options(), day(19)).expect("digest");

    assert_eq!(report.records_written(), 2);
    assert_eq!(report.points_settled(), 40);
    assert_eq!(report.notifications_sent, 2);
    let alice = engine.weekly_stats("alice", None).expect("stats");
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].date, day(19));
    assert_eq!(alice[0].points_earned, 35);
    assert!(engine.tasks_for("alice").expect("tasks").is_empty());
    // Balances were credited at approval, not at settlement.
    assert_eq!(engine.user("alice").expect("alice").points, 35);

    let sent = notifier.sent();
    let to_alice = sent
        .iter()
        .find(|n| n.to == "alice@example.com")
        .expect("alice mail");
    assert_eq!(to_alice.subject, "2026-10-19 daily task summary");
    assert!(to_alice.body.contains("Write report"));
    assert!(to_alice.body.contains("Total: 35 points"));
    assert_eq!(to_alice.from, "Taskpoints <noreply@example.com>");
}

#[test]
fn second_run_does_not_resum() {
    let (engine, _) = engine();
    complete(&engine, "Write report", "alice", 25);
    let notifier = Recorder::default();
    run_digest(&engine, &notifier, &options(), day(19)).expect("first");
    let report = run_digest(&engine, &notifier, &options(), day(19)).expect("second");
    assert_eq!(report.records_written(), 0);
    let stats = engine.weekly_stats("alice", None).expect("stats");
    assert_eq!(stats[0].points_earned, 25);
}

#[test]
fn late_run_files_points_under_the_approval_day() {
    let (engine, now) = engine();
    complete(&engine, "Monday work", "alice", 12);
    // Approved 21:30 UTC on the 19th is 00:30 local on the 20th.
    *now.lock().expect("clock") = Utc.with_ymd_and_hms(2026, 10, 19, 21, 30, 0).unwrap();
    complete(&engine, "After midnight", "alice", 8);

    let notifier = Recorder::default();
    // The run for the 19th leaves the 20th's approval alone.
    let report = run_digest(&engine, &notifier, &options(), day(19)).expect("digest");
    assert_eq!(report.points_settled(), 12);
    assert_eq!(engine.completed_for("alice").expect("completed").len(), 1);

    // A delayed run two days later still dates the record by approval.
    let report = run_digest(&engine, &notifier, &options(), day(22)).expect("digest");
    assert_eq!(report.points_settled(), 8);
    let stats: Vec<(NaiveDate, i64)> = engine
        .weekly_stats("alice", None)
        .expect("stats")
        .into_iter()
        .map(|record| (record.date, record.points_earned))
        .collect();
    assert_eq!(stats, vec![(day(19), 12), (day(20), 8)]);

    let sent = notifier.sent();
    let catch_up = sent.last().expect("catch-up mail");
    assert_eq!(catch_up.subject, "2026-10-22 daily task summary");
    assert!(catch_up.body.contains("Tasks you completed on 2026-10-20:"));
    assert!(!catch_up.body.contains("Tasks you completed on 2026-10-22:"));
}

#[test]
fn catch_up_mail_has_one_section_per_approval_day() {
    let (engine, now) = engine();
    complete(&engine, "First", "alice", 2);
    *now.lock().expect("clock") = Utc.with_ymd_and_hms(2026, 10, 20, 9, 0, 0).unwrap();
    complete(&engine, "Second", "alice", 3);

    let notifier = Recorder::default();
    let report = run_digest(&engine, &notifier, &options(), day(20)).expect("digest");
    assert_eq!(report.records_written(), 2);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    let body = &sent[0].body;
    let first = body.find("Tasks you completed on 2026-10-19:").expect("19th");
    let second = body.find("Tasks you completed on 2026-10-20:").expect("20th");
    assert!(first < second);
    assert!(body[first..second].contains("First"));
    assert!(body[second..].contains("Second"));
    assert!(body.contains("Total: 5 points"));
}

#[test]
fn failed_settlement_keeps_tasks_and_other_users_settle() {
    let temp = TempDir::new().expect("tempdir");
    let db = temp.path().join("taskpoints.db");
    let (engine, _) = engine_on(SqliteStore::open(&db).expect("store"));
    complete(&engine, "A", "alice", 3);
    complete(&engine, "B", "bob", 4);

    let conn = rusqlite::Connection::open(&db).expect("open");
    conn.execute_batch(
        "CREATE TRIGGER keep_alice BEFORE DELETE ON tasks WHEN OLD.assigned_to = 'alice' \
         BEGIN SELECT RAISE(ABORT, 'tasks locked'); END;",
    )
    .expect("trigger");
    drop(conn);

    let audit_log = temp.path().join("audit.jsonl");
    let notifier = Recorder::default();
    let report = run_digest(
        &engine,
        &notifier,
        &DigestOptions {
            audit_log: Some(audit_log.clone()),
            ..options()
        },
        day(19),
    )
    .expect("digest");

    assert_eq!(report.settlement_failures.len(), 1);
    assert_eq!(report.settlement_failures[0].username, "alice");
    assert!(report.settlement_failures[0].error.contains("tasks locked"));
    assert_eq!(report.records_written(), 1);
    assert_eq!(report.settled[0].username, "bob");
    assert_eq!(report.points_settled(), 4);

    // Alice's work is untouched and waits for the next run.
    assert_eq!(engine.completed_for("alice").expect("completed").len(), 1);
    assert!(engine.weekly_stats("alice", None).expect("stats").is_empty());
    assert_eq!(engine.weekly_stats("bob", None).expect("stats").len(), 1);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "bob@example.com");

    let audit = std::fs::read_to_string(&audit_log).expect("audit");
    assert_eq!(audit.matches("\"action\":\"settlement_failed\"").count(), 1);
    assert_eq!(audit.matches("\"action\":\"settled\"").count(), 1);
}

#[test]
fn one_failed_notification_does_not_stop_others() {
    let (engine, _) = engine();
    complete(&engine, "A", "alice", 3);
    complete(&engine, "B", "bob", 4);
    let notifier = Recorder::failing_for("alice@example.com");
    let temp = TempDir::new().expect("tempdir");
    let audit_log = temp.path().join("audit.jsonl");

    let report = run_digest(
        &engine,
        &notifier,
        &DigestOptions {
            audit_log: Some(audit_log.clone()),
            ..options()
        },
        day(19),
    )
    .expect("digest");

    assert_eq!(report.records_written(), 2);
    assert_eq!(report.notifications_sent, 1);
    assert_eq!(report.notification_failures.len(), 1);
    assert_eq!(report.notification_failures[0].username, "alice");
    // Settlement stands even though the mail failed.
    assert_eq!(engine.weekly_stats("alice", None).expect("stats").len(), 1);

    let audit = std::fs::read_to_string(&audit_log).expect("audit");
    assert!(audit.contains("\"action\":\"notification_failed\""));
    assert_eq!(audit.matches("\"action\":\"settled\"").count(), 2);
}

#[test]
fn admins_hear_about_pending_work() {
    let (engine, _) = engine();
    let task = engine.assign("Waiting", 9, "alice").expect("assign");
    engine.start(task.id, "alice").expect("start");
    engine.finish(task.id, "alice").expect("finish");
    let goal = engine.create_goal("Certification", 30).expect("goal");
    engine.select_goal("bob", goal.id).expect("select");
    engine.start_goal("bob", goal.id).expect("start");
    engine.finish_goal("bob", goal.id).expect("finish");

    let notifier = Recorder::default();
    let report = run_digest(&engine, &notifier, &options(), day(19)).expect("digest");
    assert_eq!(report.admin_notifications, 1);
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "root@example.com");
    assert!(sent[0].body.contains("Waiting"));
    assert!(sent[0].body.contains("Certification"));
}
