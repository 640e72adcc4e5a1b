//! Task and goal lifecycle with point settlement.
//!
//! Both record kinds share one forward-only state machine:
//!
//! ```text
//! available --start--> in-progress --finish--> pending --approve--> approved
//! ```
//!
//! Nothing leaves `approved` through this module; the daily digest is the only
//! code that removes settled tasks.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use tracing::info;

use crate::error::EngineError;
use crate::model::{
    normalize_username, DailyPoints, Goal, LeaderboardEntry, NewUser, Status, Task, User,
    UserGoal, UserSummary,
};
use crate::password::{hash_password, verify_password};
use crate::store::{ApprovalWrite, SqliteStore, UserRow};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A settled record together with the owner's balance after the credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval<T> {
    pub record: T,
    pub credited: i64,
    pub user: User,
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<SqliteStore>,
    clock: Clock,
    offset: FixedOffset,
}

impl Engine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            clock: Arc::new(Utc::now),
            offset: Utc.fix(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Offset used to turn timestamps into calendar days.
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.offset).date_naive()
    }

    // -- users ---------------------------------------------------------------

    pub fn create_user(&self, new_user: &NewUser) -> Result<User, EngineError> {
        let username = normalize_username(&new_user.username);
        if username.is_empty() {
            return Err(EngineError::Validation("username is required".to_string()));
        }
        if new_user.password.is_empty() {
            return Err(EngineError::Validation("password is required".to_string()));
        }
        let password_hash = hash_password(&new_user.password)?;
        let user = self
            .store
            .insert_user(&UserRow {
                username: &username,
                full_name: new_user.full_name.trim(),
                password_hash: &password_hash,
                email: new_user.email.trim(),
                is_admin: new_user.is_admin,
            })?
            .ok_or_else(|| EngineError::Conflict(format!("user {} already exists", username)))?;
        info!(username = %user.username, is_admin = user.is_admin, "user created");
        Ok(user)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<User, EngineError> {
        let username = normalize_username(username);
        let user = self
            .store
            .find_user(&username)?
            .ok_or(EngineError::Unauthorized)?;
        if !verify_password(password, &user.password_hash)? {
            return Err(EngineError::Unauthorized);
        }
        Ok(user)
    }

    pub fn user(&self, username: &str) -> Result<User, EngineError> {
        let username = normalize_username(username);
        self.store
            .find_user(&username)?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", username)))
    }

    pub fn users(&self) -> Result<Vec<UserSummary>, EngineError> {
        Ok(self.store.list_users()?)
    }

    pub fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>, EngineError> {
        Ok(self.store.leaderboard()?)
    }

    // -- tasks ---------------------------------------------------------------

    pub fn assign(&self, title: &str, points: i64, assigned_to: &str) -> Result<Task, EngineError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("title is required".to_string()));
        }
        ensure_points(points)?;
        let username = normalize_username(assigned_to);
        let user = self
            .store
            .find_user(&username)?
            .ok_or_else(|| EngineError::Validation(format!("unknown user {}", username)))?;
        let task = self
            .store
            .insert_task(title, points, &user.username, self.today())?;
        info!(task_id = task.id, username = %task.assigned_to, points, "task assigned");
        Ok(task)
    }

    pub fn start(&self, task_id: i64, username: &str) -> Result<Task, EngineError> {
        self.advance_task(task_id, username, Status::Available)
    }

    pub fn finish(&self, task_id: i64, username: &str) -> Result<Task, EngineError> {
        self.advance_task(task_id, username, Status::InProgress)
    }

    /// Settles a pending task with the admin-supplied point value, which
    /// replaces the value set at assignment.
    pub fn approve(
        &self,
        task_id: i64,
        username: &str,
        points: i64,
    ) -> Result<Approval<Task>, EngineError> {
        ensure_points(points)?;
        let username = normalize_username(username);
        match self
            .store
            .approve_task(task_id, &username, points, self.now())?
        {
            ApprovalWrite::Credited(_) => {}
            ApprovalWrite::NotPending => {
                return Err(self.task_transition_error(task_id, &username, Status::Pending)?);
            }
            ApprovalWrite::BalanceOverflow => return Err(balance_overflow(&username, points)),
        }
        let record = self.owned_task(task_id, &username)?;
        let user = self.user(&username)?;
        info!(
            task_id,
            username = %user.username,
            credited = points,
            balance = user.points,
            level = user.level,
            "task approved"
        );
        Ok(Approval {
            record,
            credited: points,
            user,
        })
    }

    /// All live tasks for a user, approved ones included until the digest
    /// sweeps them.
    pub fn tasks_for(&self, username: &str) -> Result<Vec<Task>, EngineError> {
        Ok(self
            .store
            .tasks_for(&normalize_username(username), &Status::ALL)?)
    }

    pub fn completed_for(&self, username: &str) -> Result<Vec<Task>, EngineError> {
        Ok(self
            .store
            .tasks_for(&normalize_username(username), &[Status::Approved])?)
    }

    pub fn pending_tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.store.tasks_with_status(Status::Pending)?)
    }

    fn advance_task(&self, task_id: i64, username: &str, from: Status) -> Result<Task, EngineError> {
        let username = normalize_username(username);
        let to = from.next().ok_or_else(|| {
            EngineError::Validation(format!("{} has no next state", from))
        })?;
        let updated = self.store.advance_task(task_id, &username, from, to)?;
        if updated == 0 {
            return Err(self.task_transition_error(task_id, &username, from)?);
        }
        info!(task_id, username = %username, status = %to, "task moved");
        self.owned_task(task_id, &username)
    }

    fn owned_task(&self, task_id: i64, username: &str) -> Result<Task, EngineError> {
        self.store
            .find_task(task_id)?
            .filter(|task| task.assigned_to.eq_ignore_ascii_case(username))
            .ok_or_else(|| EngineError::NotFound(format!("task {} for {}", task_id, username)))
    }

    /// Explains why a guarded task update touched no rows.
    fn task_transition_error(
        &self,
        task_id: i64,
        username: &str,
        expected: Status,
    ) -> Result<EngineError, EngineError> {
        Ok(match self.owned_task(task_id, username) {
            Ok(task) => EngineError::InvalidTransition {
                what: format!("task {}", task_id),
                actual: task.status,
                expected,
            },
            Err(EngineError::NotFound(what)) => EngineError::NotFound(what),
            Err(err) => return Err(err),
        })
    }

    // -- goals ---------------------------------------------------------------

    pub fn create_goal(&self, label: &str, points: i64) -> Result<Goal, EngineError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(EngineError::Validation("goal label is required".to_string()));
        }
        ensure_points(points)?;
        let goal = self.store.insert_goal(label, points)?;
        info!(goal_id = goal.id, points, "goal created");
        Ok(goal)
    }

    /// Catalog goals are immutable once a user has selected them.
    pub fn remove_goal(&self, goal_id: i64) -> Result<(), EngineError> {
        if self.store.delete_unreferenced_goal(goal_id)? > 0 {
            info!(goal_id, "goal removed");
            return Ok(());
        }
        match self.store.find_goal(goal_id)? {
            Some(_) => Err(EngineError::Conflict(format!(
                "goal {} is selected by users and cannot be removed",
                goal_id
            ))),
            None => Err(EngineError::NotFound(format!("goal {}", goal_id))),
        }
    }

    pub fn goals(&self) -> Result<Vec<Goal>, EngineError> {
        Ok(self.store.list_goals()?)
    }

    pub fn selected_goals(&self) -> Result<Vec<UserGoal>, EngineError> {
        Ok(self.store.list_user_goals(None)?)
    }

    pub fn pending_goals(&self) -> Result<Vec<UserGoal>, EngineError> {
        Ok(self.store.list_user_goals(Some(Status::Pending))?)
    }

    /// Re-selecting a goal returns the existing association unchanged.
    pub fn select_goal(&self, username: &str, goal_id: i64) -> Result<UserGoal, EngineError> {
        let username = normalize_username(username);
        if self.store.find_user(&username)?.is_none() {
            return Err(EngineError::Validation(format!("unknown user {}", username)));
        }
        if self.store.find_goal(goal_id)?.is_none() {
            return Err(EngineError::NotFound(format!("goal {}", goal_id)));
        }
        if self.store.insert_user_goal(&username, goal_id)? {
            info!(goal_id, username = %username, "goal selected");
        }
        self.owned_goal(&username, goal_id)
    }

    pub fn start_goal(&self, username: &str, goal_id: i64) -> Result<UserGoal, EngineError> {
        self.advance_goal(username, goal_id, Status::Available)
    }

    pub fn finish_goal(&self, username: &str, goal_id: i64) -> Result<UserGoal, EngineError> {
        self.advance_goal(username, goal_id, Status::InProgress)
    }

    /// Credits the catalog's fixed point value; goal points are not
    /// adjustable at approval time.
    pub fn approve_goal(
        &self,
        username: &str,
        goal_id: i64,
    ) -> Result<Approval<UserGoal>, EngineError> {
        let username = normalize_username(username);
        let credited = match self
            .store
            .approve_user_goal(&username, goal_id, self.now())?
        {
            ApprovalWrite::Credited(points) => points,
            ApprovalWrite::NotPending => {
                return Err(self.goal_transition_error(&username, goal_id, Status::Pending)?);
            }
            ApprovalWrite::BalanceOverflow => {
                let points = self.store.find_goal(goal_id)?.map_or(0, |goal| goal.points);
                return Err(balance_overflow(&username, points));
            }
        };
        let record = self.owned_goal(&username, goal_id)?;
        let user = self.user(&username)?;
        info!(
            goal_id,
            username = %user.username,
            credited,
            balance = user.points,
            level = user.level,
            "goal approved"
        );
        Ok(Approval {
            record,
            credited,
            user,
        })
    }

    fn advance_goal(
        &self,
        username: &str,
        goal_id: i64,
        from: Status,
    ) -> Result<UserGoal, EngineError> {
        let username = normalize_username(username);
        let to = from.next().ok_or_else(|| {
            EngineError::Validation(format!("{} has no next state", from))
        })?;
        let updated = self
            .store
            .advance_user_goal(&username, goal_id, from, to)?;
        if updated == 0 {
            return Err(self.goal_transition_error(&username, goal_id, from)?);
        }
        info!(goal_id, username = %username, status = %to, "goal moved");
        self.owned_goal(&username, goal_id)
    }

    fn owned_goal(&self, username: &str, goal_id: i64) -> Result<UserGoal, EngineError> {
        self.store
            .find_user_goal(username, goal_id)?
            .ok_or_else(|| EngineError::NotFound(format!("goal {} for {}", goal_id, username)))
    }

    fn goal_transition_error(
        &self,
        username: &str,
        goal_id: i64,
        expected: Status,
    ) -> Result<EngineError, EngineError> {
        Ok(match self.owned_goal(username, goal_id) {
            Ok(goal) => EngineError::InvalidTransition {
                what: format!("goal {}", goal_id),
                actual: goal.status,
                expected,
            },
            Err(EngineError::NotFound(what)) => EngineError::NotFound(what),
            Err(err) => return Err(err),
        })
    }

    // -- stats ---------------------------------------------------------------

    /// Daily settled points in date order, limited to the last `days` days
    /// when given.
    pub fn weekly_stats(
        &self,
        username: &str,
        days: Option<u32>,
    ) -> Result<Vec<DailyPoints>, EngineError> {
        let since = match days.filter(|days| *days > 0) {
            Some(days) => Some(
                self.today()
                    .checked_sub_signed(Duration::days(i64::from(days) - 1))
                    .ok_or_else(|| {
                        EngineError::Validation(format!("days out of range: {}", days))
                    })?,
            ),
            None => None,
        };
        Ok(self
            .store
            .daily_points_for(&normalize_username(username), since)?)
    }
}

fn balance_overflow(username: &str, points: i64) -> EngineError {
    EngineError::Conflict(format!(
        "crediting {} points would overflow the balance of {}",
        points, username
    ))
}

fn ensure_points(points: i64) -> Result<(), EngineError> {
    if points < 0 {
        return Err(EngineError::Validation(format!(
            "points must be zero or more, got {}",
            points
        )));
    }
    Ok(())
}
