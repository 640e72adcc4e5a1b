use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const POINTS_PER_LEVEL: i64 = 50;

/// Level for a point balance: one level per 50 points, starting at 1.
pub fn level_for_points(points: i64) -> i64 {
    points.max(0) / POINTS_PER_LEVEL + 1
}

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Available,
    InProgress,
    Pending,
    Approved,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Available,
        Status::InProgress,
        Status::Pending,
        Status::Approved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Available => "available",
            Status::InProgress => "in-progress",
            Status::Pending => "pending",
            Status::Approved => "approved",
        }
    }

    /// The only state a record may move to from `self`.
    pub fn next(self) -> Option<Status> {
        match self {
            Status::Available => Some(Status::InProgress),
            Status::InProgress => Some(Status::Pending),
            Status::Pending => Some(Status::Approved),
            Status::Approved => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub full_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email: String,
    pub points: i64,
    pub level: i64,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub full_name: String,
    pub password: String,
    pub email: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub username: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub username: String,
    pub full_name: String,
    pub points: i64,
    pub level: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub points: i64,
    pub assigned_to: String,
    pub status: Status,
    pub assigned_at: NaiveDate,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: i64,
    #[serde(rename = "goal")]
    pub label: String,
    pub points: i64,
}

/// A user's selection of a catalog goal, joined with the catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGoal {
    pub username: String,
    pub goal_id: i64,
    #[serde(rename = "goal")]
    pub label: String,
    pub points: i64,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPoints {
    pub username: String,
    pub date: NaiveDate,
    pub points_earned: i64,
}
