//! Route handlers. Request and response bodies use camelCase keys.

use std::sync::Arc;

use axum::extract::{FromRequest, Path, Query, State};
use axum::Json;
use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize};

use taskpoints_core::digest::{run_digest, DigestReport};
use taskpoints_core::model::{
    DailyPoints, Goal, LeaderboardEntry, Task, User, UserGoal, UserSummary,
};

use crate::error::ApiError;
use crate::AppState;

/// JSON body extractor whose rejections render as `{ "message": … }`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

type ApiResult<T> = Result<Json<T>, ApiError>;

// -- request bodies ----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTaskRequest {
    pub title: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub points: i64,
    pub assigned_to: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskActionRequest {
    #[serde(deserialize_with = "lenient_i64")]
    pub task_id: i64,
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveTaskRequest {
    #[serde(deserialize_with = "lenient_i64")]
    pub task_id: i64,
    pub username: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub points: i64,
}

/// Shared by every goal action. A `points` field sent with `/approveGoal`
/// is ignored; goals always credit their catalog value.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalActionRequest {
    pub username: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub goal_id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunDigestRequest {
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub days: Option<u32>,
}

/// Browser forms send numbers as strings; fractional input is truncated.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    let truncate = |value: f64| {
        if value.is_finite() && value.abs() < i64::MAX as f64 {
            Some(value.trunc() as i64)
        } else {
            None
        }
    };
    match Raw::deserialize(deserializer)? {
        Raw::Int(value) => Ok(value),
        Raw::Float(value) => {
            truncate(value).ok_or_else(|| de::Error::custom("expected a finite number"))
        }
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(truncate)
            .ok_or_else(|| de::Error::custom(format!("expected a number, got {:?}", text))),
    }
}

// -- response bodies ---------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct TaskOutcome {
    pub message: &'static str,
    pub task: Task,
}

#[derive(Debug, Serialize)]
pub struct GoalOutcome {
    pub message: &'static str,
    pub goal: UserGoal,
}

#[derive(Debug, Serialize)]
pub struct ApprovalOutcome<T> {
    pub message: &'static str,
    pub record: T,
    pub credited: i64,
    pub user: User,
}

// -- handlers ----------------------------------------------------------------

pub async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: taskpoints_core::version(),
    })
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let user = state
        .run(move |engine| engine.login(&req.username, &req.password))
        .await?;
    Ok(Json(LoginResponse { user }))
}

pub async fn users(State(state): State<AppState>) -> ApiResult<Vec<UserSummary>> {
    Ok(Json(state.run(|engine| engine.users()).await?))
}

pub async fn leaderboard(State(state): State<AppState>) -> ApiResult<Vec<LeaderboardEntry>> {
    Ok(Json(state.run(|engine| engine.leaderboard()).await?))
}

pub async fn goals(State(state): State<AppState>) -> ApiResult<Vec<Goal>> {
    Ok(Json(state.run(|engine| engine.goals()).await?))
}

pub async fn selected_goals(State(state): State<AppState>) -> ApiResult<Vec<UserGoal>> {
    Ok(Json(state.run(|engine| engine.selected_goals()).await?))
}

pub async fn pending_goals(State(state): State<AppState>) -> ApiResult<Vec<UserGoal>> {
    Ok(Json(state.run(|engine| engine.pending_goals()).await?))
}

pub async fn add_goal(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GoalActionRequest>,
) -> ApiResult<GoalOutcome> {
    let goal = state
        .run(move |engine| engine.select_goal(&req.username, req.goal_id))
        .await?;
    Ok(Json(GoalOutcome {
        message: "Goal selected",
        goal,
    }))
}

pub async fn start_goal(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GoalActionRequest>,
) -> ApiResult<GoalOutcome> {
    let goal = state
        .run(move |engine| engine.start_goal(&req.username, req.goal_id))
        .await?;
    Ok(Json(GoalOutcome {
        message: "Goal started",
        goal,
    }))
}

pub async fn finish_goal(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GoalActionRequest>,
) -> ApiResult<GoalOutcome> {
    let goal = state
        .run(move |engine| engine.finish_goal(&req.username, req.goal_id))
        .await?;
    Ok(Json(GoalOutcome {
        message: "Goal sent for approval",
        goal,
    }))
}

pub async fn approve_goal(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GoalActionRequest>,
) -> ApiResult<ApprovalOutcome<UserGoal>> {
    let approval = state
        .run(move |engine| engine.approve_goal(&req.username, req.goal_id))
        .await?;
    Ok(Json(ApprovalOutcome {
        message: "Goal approved",
        record: approval.record,
        credited: approval.credited,
        user: approval.user,
    }))
}

pub async fn assign_task(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AssignTaskRequest>,
) -> ApiResult<TaskOutcome> {
    let task = state
        .run(move |engine| engine.assign(&req.title, req.points, &req.assigned_to))
        .await?;
    Ok(Json(TaskOutcome {
        message: "Task assigned",
        task,
    }))
}

pub async fn tasks(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<Vec<Task>> {
    Ok(Json(state.run(move |engine| engine.tasks_for(&username)).await?))
}

pub async fn start_task(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<TaskActionRequest>,
) -> ApiResult<TaskOutcome> {
    let task = state
        .run(move |engine| engine.start(req.task_id, &req.username))
        .await?;
    Ok(Json(TaskOutcome {
        message: "Task started",
        task,
    }))
}

pub async fn finish_task(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<TaskActionRequest>,
) -> ApiResult<TaskOutcome> {
    let task = state
        .run(move |engine| engine.finish(req.task_id, &req.username))
        .await?;
    Ok(Json(TaskOutcome {
        message: "Task sent for approval",
        task,
    }))
}

pub async fn pending_tasks(State(state): State<AppState>) -> ApiResult<Vec<Task>> {
    Ok(Json(state.run(|engine| engine.pending_tasks()).await?))
}

pub async fn approve_task(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ApproveTaskRequest>,
) -> ApiResult<ApprovalOutcome<Task>> {
    let approval = state
        .run(move |engine| engine.approve(req.task_id, &req.username, req.points))
        .await?;
    Ok(Json(ApprovalOutcome {
        message: "Task approved",
        record: approval.record,
        credited: approval.credited,
        user: approval.user,
    }))
}

pub async fn completed(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<Vec<Task>> {
    Ok(Json(
        state.run(move |engine| engine.completed_for(&username)).await?,
    ))
}

pub async fn weekly_stats(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Vec<DailyPoints>> {
    Ok(Json(
        state
            .run(move |engine| engine.weekly_stats(&username, query.days))
            .await?,
    ))
}

/// Runs the digest now, for `date` or the engine's current day.
pub async fn run_digest_now(
    State(state): State<AppState>,
    body: Option<ApiJson<RunDigestRequest>>,
) -> ApiResult<DigestReport> {
    let date = body.and_then(|ApiJson(req)| req.date);
    let notifier = Arc::clone(&state.notifier);
    let options = Arc::clone(&state.digest);
    let report = state
        .run(move |engine| {
            let day = date.unwrap_or_else(|| engine.today());
            run_digest(engine, notifier.as_ref(), &options, day)
        })
        .await?;
    Ok(Json(report))
}
