//! SQLite-backed ledger store.
//!
//! Every lifecycle transition is a single conditional `UPDATE` guarded by the
//! record's owner and its expected status, so two callers racing on the same
//! record cannot both win. Settlement (task approval plus the owner's credit)
//! runs inside one transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::model::{
    DailyPoints, Goal, LeaderboardEntry, Status, Task, User, UserGoal,
    UserSummary, POINTS_PER_LEVEL,
};
use crate::schema::{apply_schema, read_schema_version};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// Row shape for inserting a user; the password is already hashed.
#[derive(Debug, Clone)]
pub struct UserRow<'a> {
    pub username: &'a str,
    pub full_name: &'a str,
    pub password_hash: &'a str,
    pub email: &'a str,
    pub is_admin: bool,
}

/// Result of an approval write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalWrite {
    /// Record approved and owner credited with this many points.
    Credited(i64),
    /// Nothing pending matched; nothing was written.
    NotPending,
    /// The credit would push the owner's balance past `i64::MAX`; rolled back.
    BalanceOverflow,
}

/// Outcome of settling one user's approved tasks for one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySettlement {
    pub username: String,
    pub date: NaiveDate,
    pub tasks: Vec<Task>,
    pub points: i64,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn schema_version(&self) -> Result<Option<u32>, StoreError> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    // -- users ---------------------------------------------------------------

    /// Returns `None` when the username is already taken.
    pub fn insert_user(&self, row: &UserRow<'_>) -> Result<Option<User>, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, full_name, password_hash, email, points, level, is_admin) \
             VALUES (?1, ?2, ?3, ?4, 0, 1, ?5)",
            params![
                row.username,
                row.full_name,
                row.password_hash,
                row.email,
                row.is_admin
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(select_user(&conn, row.username)?)
    }

    pub fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        let conn = self.lock()?;
        Ok(select_user(&conn, username)?)
    }

    pub fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT username, full_name FROM users ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserSummary {
                username: row.get(0)?,
                full_name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_admins(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE is_admin = 1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map([], row_to_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_all_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY rowid"))?;
        let rows = stmt.query_map([], row_to_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Points descending; equal balances keep insertion order.
    pub fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT username, full_name, points, level FROM users ORDER BY points DESC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LeaderboardEntry {
                username: row.get(0)?,
                full_name: row.get(1)?,
                points: row.get(2)?,
                level: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- goals ---------------------------------------------------------------

    pub fn insert_goal(&self, label: &str, points: i64) -> Result<Goal, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO goals (label, points) VALUES (?1, ?2)",
            params![label, points],
        )?;
        Ok(Goal {
            id: conn.last_insert_rowid(),
            label: label.to_string(),
            points,
        })
    }

    pub fn find_goal(&self, goal_id: i64) -> Result<Option<Goal>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, label, points FROM goals WHERE id = ?1",
                params![goal_id],
                row_to_goal,
            )
            .optional()?)
    }

    pub fn list_goals(&self) -> Result<Vec<Goal>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, label, points FROM goals ORDER BY id")?;
        let rows = stmt.query_map([], row_to_goal)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes a catalog goal nobody has selected. Returns the rows removed.
    pub fn delete_unreferenced_goal(&self, goal_id: i64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM goals WHERE id = ?1 \
             AND NOT EXISTS (SELECT 1 FROM user_goals WHERE goal_id = ?1)",
            params![goal_id],
        )?)
    }

    /// Returns `false` when the association already existed.
    pub fn insert_user_goal(&self, username: &str, goal_id: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO user_goals (username, goal_id, status) VALUES (?1, ?2, 'available')",
            params![username, goal_id],
        )?;
        Ok(inserted > 0)
    }

    pub fn find_user_goal(
        &self,
        username: &str,
        goal_id: i64,
    ) -> Result<Option<UserGoal>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!("{USER_GOAL_SELECT} WHERE ug.username = ?1 AND ug.goal_id = ?2"),
                params![username, goal_id],
                row_to_user_goal,
            )
            .optional()?)
    }

    pub fn list_user_goals(&self, status: Option<Status>) -> Result<Vec<UserGoal>, StoreError> {
        let conn = self.lock()?;
        let order = "ORDER BY ug.username, ug.goal_id";
        let goals = match status {
            Some(status) => {
                let mut stmt =
                    conn.prepare(&format!("{USER_GOAL_SELECT} WHERE ug.status = ?1 {order}"))?;
                let rows = stmt.query_map(params![status.as_str()], row_to_user_goal)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{USER_GOAL_SELECT} {order}"))?;
                let rows = stmt.query_map([], row_to_user_goal)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(goals)
    }

    /// Conditional `from -> to` move for a non-terminal goal transition.
    pub fn advance_user_goal(
        &self,
        username: &str,
        goal_id: i64,
        from: Status,
        to: Status,
    ) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE user_goals SET status = ?1 WHERE username = ?2 AND goal_id = ?3 AND status = ?4",
            params![to.as_str(), username, goal_id, from.as_str()],
        )?)
    }

    /// Approves a pending goal and credits the catalog value in one
    /// transaction.
    pub fn approve_user_goal(
        &self,
        username: &str,
        goal_id: i64,
        at: DateTime<Utc>,
    ) -> Result<ApprovalWrite, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE user_goals SET status = 'approved', approved_at = ?1 \
             WHERE username = ?2 AND goal_id = ?3 AND status = 'pending'",
            params![format_timestamp(at), username, goal_id],
        )?;
        if updated == 0 {
            return Ok(ApprovalWrite::NotPending);
        }
        let points: i64 = tx.query_row(
            "SELECT points FROM goals WHERE id = ?1",
            params![goal_id],
            |row| row.get(0),
        )?;
        let outcome = credit_user(&tx, username, points)?;
        if outcome == ApprovalWrite::Credited(points) {
            tx.commit()?;
        }
        Ok(outcome)
    }

    // -- tasks ---------------------------------------------------------------

    pub fn insert_task(
        &self,
        title: &str,
        points: i64,
        assigned_to: &str,
        assigned_at: NaiveDate,
    ) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (title, points, assigned_to, status, assigned_at) \
             VALUES (?1, ?2, ?3, 'available', ?4)",
            params![title, points, assigned_to, format_date(assigned_at)],
        )?;
        let id = conn.last_insert_rowid();
        Ok(select_task(&conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?)
    }

    pub fn find_task(&self, task_id: i64) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        Ok(select_task(&conn, task_id)?)
    }

    pub fn tasks_for(&self, username: &str, statuses: &[Status]) -> Result<Vec<Task>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = (2..statuses.len() + 2)
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE assigned_to = ?1 AND status IN ({placeholders}) ORDER BY id"
        ))?;
        let names: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&username];
        values.extend(names.iter().map(|name| name as &dyn rusqlite::ToSql));
        let rows = stmt.query_map(values.as_slice(), row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tasks_with_status(&self, status: Status) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Conditional `from -> to` move for a non-terminal task transition.
    pub fn advance_task(
        &self,
        task_id: i64,
        username: &str,
        from: Status,
        to: Status,
    ) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2 AND assigned_to = ?3 AND status = ?4",
            params![to.as_str(), task_id, username, from.as_str()],
        )?)
    }

    /// Approves a pending task with the admin's point value and credits the
    /// owner in one transaction.
    pub fn approve_task(
        &self,
        task_id: i64,
        username: &str,
        points: i64,
        at: DateTime<Utc>,
    ) -> Result<ApprovalWrite, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE tasks SET status = 'approved', points = ?1, approved_at = ?2 \
             WHERE id = ?3 AND assigned_to = ?4 AND status = 'pending'",
            params![points, format_timestamp(at), task_id, username],
        )?;
        if updated == 0 {
            return Ok(ApprovalWrite::NotPending);
        }
        let outcome = credit_user(&tx, username, points)?;
        if outcome == ApprovalWrite::Credited(points) {
            tx.commit()?;
        }
        Ok(outcome)
    }

    // -- digest --------------------------------------------------------------

    /// Approved tasks settled strictly before `cutoff`.
    pub fn approved_tasks_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'approved' AND approved_at < ?1 \
             ORDER BY assigned_to, approved_at, id"
        ))?;
        let rows = stmt.query_map(params![format_timestamp(cutoff)], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes the given approved tasks and adds their points to the user's
    /// row for `date`, all or nothing. Tasks already removed by another sweep
    /// are skipped, so a settled task is never summed twice.
    pub fn settle_day(
        &self,
        username: &str,
        date: NaiveDate,
        task_ids: &[i64],
    ) -> Result<DaySettlement, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut settled = Vec::new();
        for task_id in task_ids {
            let task = tx
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks \
                         WHERE id = ?1 AND assigned_to = ?2 AND status = 'approved'"
                    ),
                    params![task_id, username],
                    row_to_task,
                )
                .optional()?;
            let Some(task) = task else {
                continue;
            };
            tx.execute(
                "DELETE FROM tasks WHERE id = ?1 AND status = 'approved'",
                params![task_id],
            )?;
            settled.push(task);
        }

        let points: i64 = settled.iter().map(|task| task.points).sum();
        if !settled.is_empty() {
            tx.execute(
                "INSERT INTO daily_points (username, date, points_earned) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(username, date) DO UPDATE \
                 SET points_earned = points_earned + excluded.points_earned",
                params![username, format_date(date), points],
            )?;
            tx.commit()?;
        }

        Ok(DaySettlement {
            username: username.to_string(),
            date,
            tasks: settled,
            points,
        })
    }

    pub fn daily_points_for(
        &self,
        username: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<DailyPoints>, StoreError> {
        let conn = self.lock()?;
        let since = since.map(format_date).unwrap_or_default();
        let mut stmt = conn.prepare(
            "SELECT username, date, points_earned FROM daily_points \
             WHERE username = ?1 AND date >= ?2 ORDER BY date ASC",
        )?;
        let rows = stmt.query_map(params![username, since], |row| {
            Ok(DailyPoints {
                username: row.get(0)?,
                date: parse_date(1, row.get(1)?)?,
                points_earned: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|err| StoreError::Lock(err.to_string()))
    }
}

/// Adds `points` to the user's balance and recomputes the level in the same
/// statement. SQLite widens an overflowing integer sum to REAL, so the update
/// only matches while the new balance still fits in an `i64`.
fn credit_user(
    conn: &Connection,
    username: &str,
    points: i64,
) -> rusqlite::Result<ApprovalWrite> {
    let updated = conn.execute(
        "UPDATE users SET points = points + ?1, level = (points + ?1) / ?2 + 1 \
         WHERE username = ?3 AND points <= ?4 - ?1",
        params![points, POINTS_PER_LEVEL, username, i64::MAX],
    )?;
    if updated > 0 {
        return Ok(ApprovalWrite::Credited(points));
    }
    let exists = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ?1",
            params![username],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(if exists {
        ApprovalWrite::BalanceOverflow
    } else {
        ApprovalWrite::NotPending
    })
}

const USER_COLUMNS: &str = "username, full_name, password_hash, email, points, level, is_admin";
const TASK_COLUMNS: &str = "id, title, points, assigned_to, status, assigned_at, approved_at";
const USER_GOAL_SELECT: &str = "SELECT ug.username, ug.goal_id, \
     COALESCE(g.label, '(missing goal)'), COALESCE(g.points, 0), ug.status \
     FROM user_goals ug LEFT JOIN goals g ON ug.goal_id = g.id";

fn select_user(conn: &Connection, username: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
        params![username],
        row_to_user,
    )
    .optional()
}

fn select_task(conn: &Connection, task_id: i64) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![task_id],
        row_to_task,
    )
    .optional()
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        username: row.get(0)?,
        full_name: row.get(1)?,
        password_hash: row.get(2)?,
        email: row.get(3)?,
        points: row.get(4)?,
        level: row.get(5)?,
        is_admin: row.get(6)?,
    })
}

fn row_to_goal(row: &Row<'_>) -> rusqlite::Result<Goal> {
    Ok(Goal {
        id: row.get(0)?,
        label: row.get(1)?,
        points: row.get(2)?,
    })
}

fn row_to_user_goal(row: &Row<'_>) -> rusqlite::Result<UserGoal> {
    Ok(UserGoal {
        username: row.get(0)?,
        goal_id: row.get(1)?,
        label: row.get(2)?,
        points: row.get(3)?,
        status: parse_status(4, row.get(4)?)?,
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let approved_at: Option<String> = row.get(6)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        points: row.get(2)?,
        assigned_to: row.get(3)?,
        status: parse_status(4, row.get(4)?)?,
        assigned_at: parse_date(5, row.get(5)?)?,
        approved_at: approved_at
            .map(|value| parse_timestamp(6, value))
            .transpose()?,
    })
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_status(idx: usize, value: String) -> rusqlite::Result<Status> {
    value.parse::<Status>().map_err(|err| conversion_error(idx, err))
}

fn parse_date(idx: usize, value: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&value, DATE_FORMAT).map_err(|err| conversion_error(idx, err))
}

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}
