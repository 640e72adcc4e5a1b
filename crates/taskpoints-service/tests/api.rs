use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use taskpoints_core::digest::DigestOptions;
use taskpoints_core::lifecycle::Engine;
use taskpoints_core::model::NewUser;
use taskpoints_core::notify::{LogNotifier, OutboxNotifier};
use taskpoints_core::store::SqliteStore;
use taskpoints_service::{router, AppState};

fn engine() -> Engine {
    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
    let engine = Engine::new(store).with_clock(Arc::new(move || at));
    for (name, admin) in [("alice", false), ("admin", true)] {
        engine
            .create_user(&NewUser {
                username: name.to_string(),
                full_name: format!("{} user", name),
                password: format!("{}-pw", name),
                email: format!("{}@example.com", name),
                is_admin: admin,
            })
            .expect("user");
    }
    engine
}

fn app(engine: Engine) -> Router {
    router(
        AppState::new(engine, Arc::new(LogNotifier), DigestOptions::default()),
        None,
    )
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn write_report_scenario() {
    let app = app(engine());

    let (status, body) = send(
        &app,
        "POST",
        "/assignTask",
        Some(json!({ "title": "Write report", "points": 20, "assignedTo": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["task"]["id"].as_i64().expect("task id");

    let (status, tasks) = send(&app, "GET", "/tasks/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks.as_array().expect("array").len(), 1);
    assert_eq!(tasks[0]["status"], "available");
    assert_eq!(tasks[0]["points"], 20);
    assert_eq!(tasks[0]["assignedTo"], "alice");

    let action = json!({ "taskId": task_id, "username": "alice" });
    let (status, body) = send(&app, "POST", "/startTask", Some(action.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], "in-progress");
    let (status, body) = send(&app, "POST", "/finishTask", Some(action)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], "pending");

    let (_, pending) = send(&app, "GET", "/pendingTasks", None).await;
    assert_eq!(pending.as_array().expect("array").len(), 1);

    let approve = json!({ "taskId": task_id, "username": "alice", "points": 25 });
    let (status, body) = send(&app, "POST", "/approveTask", Some(approve.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["record"]["status"], "approved");
    assert!(body["record"]["approvedAt"].is_string());
    assert_eq!(body["user"]["points"], 25);
    assert_eq!(body["user"]["level"], 1);
    assert!(body["user"].get("passwordHash").is_none());

    let (status, body) = send(&app, "POST", "/approveTask", Some(approve)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].is_string());

    let (_, completed) = send(&app, "GET", "/completed/alice", None).await;
    assert_eq!(completed.as_array().expect("array").len(), 1);
}

#[tokio::test]
async fn login_returns_user_or_401() {
    let app = app(engine());
    let (status, body) = send(
        &app,
        "POST",
        "/login",
        Some(json!({ "username": "Alice", "password": "alice-pw" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["username"], "alice");
    assert_eq!(body["user"]["fullName"], "alice user");
    assert_eq!(body["user"]["isAdmin"], false);

    let (status, body) = send(
        &app,
        "POST",
        "/login",
        Some(json!({ "username": "alice", "password": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn validation_and_ownership_errors() {
    let app = app(engine());
    let (status, _) = send(
        &app,
        "POST",
        "/assignTask",
        Some(json!({ "title": "", "points": 5, "assignedTo": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/assignTask",
        Some(json!({ "title": "Ghost work", "points": 5, "assignedTo": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "POST", "/startTask", Some(json!({ "username": "alice" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let (status, _) = send(
        &app,
        "POST",
        "/startTask",
        Some(json!({ "taskId": 404, "username": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn goal_flow_credits_catalog_points() {
    let engine = engine();
    let goal = engine.create_goal("Learn Rust", 40).expect("goal");
    let app = app(engine);

    let (_, goals) = send(&app, "GET", "/goals", None).await;
    assert_eq!(goals[0]["goal"], "Learn Rust");
    assert_eq!(goals[0]["points"], 40);

    let action = json!({ "username": "alice", "goalId": goal.id });
    for uri in ["/addGoal", "/startGoal", "/finishGoal"] {
        let (status, _) = send(&app, "POST", uri, Some(action.clone())).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
    }
    let (_, pending) = send(&app, "GET", "/pendingGoals", None).await;
    assert_eq!(pending[0]["goalId"], goal.id);
    assert_eq!(pending[0]["status"], "pending");

    let (status, body) = send(
        &app,
        "POST",
        "/approveGoal",
        Some(json!({ "username": "alice", "goalId": goal.id, "points": 999 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["credited"], 40);
    assert_eq!(body["user"]["points"], 40);

    let (_, selected) = send(&app, "GET", "/selectedGoals", None).await;
    assert_eq!(selected[0]["status"], "approved");
}

#[tokio::test]
async fn leaderboard_and_stats_after_digest() {
    let temp = TempDir::new().expect("tempdir");
    let outbox = temp.path().join("outbox.jsonl");
    let engine = engine();
    let task = engine.assign("Ship", 60, "alice").expect("assign");
    engine.start(task.id, "alice").expect("start");
    engine.finish(task.id, "alice").expect("finish");
    engine.approve(task.id, "alice", 60).expect("approve");
    let app = router(
        AppState::new(
            engine,
            Arc::new(OutboxNotifier::new(&outbox)),
            DigestOptions {
                sender: "noreply@example.com".to_string(),
                audit_log: None,
            },
        ),
        None,
    );

    let (_, board) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(board[0]["username"], "alice");
    assert_eq!(board[0]["points"], 60);
    assert_eq!(board[0]["level"], 2);
    assert_eq!(board[1]["username"], "admin");

    let (status, report) = send(
        &app,
        "POST",
        "/runDigest",
        Some(json!({ "date": "2026-10-19" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["day"], "2026-10-19");
    assert_eq!(report["settled"][0]["points"], 60);
    assert_eq!(report["notificationsSent"], 1);

    let (_, stats) = send(&app, "GET", "/weeklyStats/alice", None).await;
    assert_eq!(stats, json!([{ "username": "alice", "date": "2026-10-19", "pointsEarned": 60 }]));
    let (_, tasks) = send(&app, "GET", "/tasks/alice", None).await;
    assert_eq!(tasks, json!([]));

    let mail = std::fs::read_to_string(&outbox).expect("outbox");
    assert!(mail.contains("alice@example.com"));
}

#[tokio::test]
async fn health_reports_version() {
    let app = app(engine());
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn weekly_stats_window_out_of_range_is_400() {
    let app = app(engine());
    let (status, body) = send(&app, "GET", "/weeklyStats/alice?days=4294967295", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let (status, _) = send(&app, "GET", "/weeklyStats/alice?days=7", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn approval_overflowing_the_balance_is_409_and_leaderboard_survives() {
    let engine = engine();
    for points in [i64::MAX, 1] {
        let task = engine.assign("Huge", points, "alice").expect("assign");
        engine.start(task.id, "alice").expect("start");
        engine.finish(task.id, "alice").expect("finish");
    }
    let app = app(engine);

    let (status, _) = send(
        &app,
        "POST",
        "/approveTask",
        Some(json!({ "taskId": 1, "username": "alice", "points": i64::MAX })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        "POST",
        "/approveTask",
        Some(json!({ "taskId": 2, "username": "alice", "points": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, board) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(board[0]["points"], i64::MAX);
}
