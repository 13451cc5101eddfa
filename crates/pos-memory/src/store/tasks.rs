//! Task CRUD and the completion transition.

use super::{db_error, Store};
use pos_core::error::PosError;
use pos_core::ledger::validate_avatar_name;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// XP credited for a task created without an explicit reward.
pub const DEFAULT_XP_REWARD: i64 = 10;

/// Longest accepted `paei_tag`.
const MAX_PAEI_TAG_LEN: usize = 10;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(PosError::InvalidInput(format!("unknown priority {other:?}"))),
        }
    }
}

/// Lifecycle of a task. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PosError::InvalidInput(format!("unknown status {other:?}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub avatar_name: Option<String>,
    pub xp_reward: i64,
    pub estimated_minutes: Option<i64>,
    pub due_date: Option<String>,
    pub source: Option<String>,
    /// Id of the item in `source` this task was imported from.
    pub source_id: Option<String>,
    pub actual_minutes: Option<i64>,
    pub scheduled_time: Option<String>,
    pub is_recurring: bool,
    pub is_quest: bool,
    pub paei_tag: Option<String>,
    pub goal_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TryFrom<SqliteRow> for Task {
    type Error = PosError;

    fn try_from(row: SqliteRow) -> Result<Self, Self::Error> {
        let get = |e: sqlx::Error| PosError::Memory(format!("bad task row: {e}"));
        let priority: String = row.try_get("priority").map_err(get)?;
        let status: String = row.try_get("status").map_err(get)?;
        Ok(Self {
            id: row.try_get("id").map_err(get)?,
            user_id: row.try_get("user_id").map_err(get)?,
            title: row.try_get("title").map_err(get)?,
            description: row.try_get("description").map_err(get)?,
            priority: priority.parse()?,
            status: status.parse()?,
            avatar_name: row.try_get("avatar_name").map_err(get)?,
            xp_reward: row.try_get("xp_reward").map_err(get)?,
            estimated_minutes: row.try_get("estimated_minutes").map_err(get)?,
            due_date: row.try_get("due_date").map_err(get)?,
            source: row.try_get("source").map_err(get)?,
            source_id: row.try_get("source_id").map_err(get)?,
            actual_minutes: row.try_get("actual_minutes").map_err(get)?,
            scheduled_time: row.try_get("scheduled_time").map_err(get)?,
            is_recurring: row.try_get("is_recurring").map_err(get)?,
            is_quest: row.try_get("is_quest").map_err(get)?,
            paei_tag: row.try_get("paei_tag").map_err(get)?,
            goal_id: row.try_get("goal_id").map_err(get)?,
            created_at: row.try_get("created_at").map_err(get)?,
            updated_at: row.try_get("updated_at").map_err(get)?,
            completed_at: row.try_get("completed_at").map_err(get)?,
        })
    }
}

/// Fields accepted when creating a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub avatar_name: Option<String>,
    #[serde(default)]
    pub xp_reward: Option<i64>,
    #[serde(default)]
    pub estimated_minutes: Option<i64>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub actual_minutes: Option<i64>,
    #[serde(default)]
    pub scheduled_time: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub is_quest: bool,
    #[serde(default)]
    pub paei_tag: Option<String>,
    #[serde(default)]
    pub goal_id: Option<String>,
}

impl Store {
    /// Create a task for an existing user.
    pub async fn create_task(&self, new: &NewTask) -> Result<Task, PosError> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(PosError::InvalidInput("title must not be empty".into()));
        }
        let xp_reward = new.xp_reward.unwrap_or(DEFAULT_XP_REWARD);
        if xp_reward < 0 {
            return Err(PosError::InvalidInput(format!(
                "xp_reward must not be negative, got {xp_reward}"
            )));
        }
        if let Some(ref avatar) = new.avatar_name {
            validate_avatar_name(avatar)?;
        }
        for (field, minutes) in [
            ("estimated_minutes", new.estimated_minutes),
            ("actual_minutes", new.actual_minutes),
        ] {
            if minutes.is_some_and(|m| m < 0) {
                return Err(PosError::InvalidInput(format!("{field} must not be negative")));
            }
        }
        if new
            .paei_tag
            .as_ref()
            .is_some_and(|t| t.chars().count() > MAX_PAEI_TAG_LEN)
        {
            return Err(PosError::InvalidInput(format!(
                "paei_tag must be at most {MAX_PAEI_TAG_LEN} characters"
            )));
        }
        if !self.user_exists(&new.user_id).await? {
            return Err(PosError::NotFound(format!("user {}", new.user_id)));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO tasks (id, user_id, title, description, priority, avatar_name, \
             xp_reward, estimated_minutes, due_date, source, source_id, actual_minutes, \
             scheduled_time, is_recurring, is_quest, paei_tag, goal_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.user_id)
        .bind(title)
        .bind(&new.description)
        .bind(new.priority.as_str())
        .bind(&new.avatar_name)
        .bind(xp_reward)
        .bind(new.estimated_minutes)
        .bind(&new.due_date)
        .bind(&new.source)
        .bind(&new.source_id)
        .bind(new.actual_minutes)
        .bind(&new.scheduled_time)
        .bind(new.is_recurring)
        .bind(new.is_quest)
        .bind(&new.paei_tag)
        .bind(&new.goal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create task failed", e))?;

        self.get_task(&id).await
    }

    /// Fetch a task by id.
    pub async fn get_task(&self, id: &str) -> Result<Task, PosError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PosError::Memory(format!("get task failed: {e}")))?
            .ok_or_else(|| PosError::NotFound(format!("task {id}")))?;
        Task::try_from(row)
    }

    /// A user's tasks, newest first, optionally filtered by status.
    pub async fn list_tasks(
        &self,
        user_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, PosError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE user_id = ? AND status = ? \
                     ORDER BY created_at DESC, rowid DESC",
                )
                .bind(user_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| PosError::Memory(format!("list tasks failed: {e}")))?;

        rows.into_iter().map(Task::try_from).collect()
    }

    /// Move an open task to `pending`, `in_progress` or `cancelled`.
    ///
    /// Completion goes through [`mark_task_completed`](Self::mark_task_completed)
    /// so it can be paired with the XP award.
    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<Task, PosError> {
        if status == TaskStatus::Completed {
            return Err(PosError::InvalidInput(
                "use the completion endpoint to complete a task".into(),
            ));
        }
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, updated_at = datetime('now') \
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PosError::Memory(format!("set task status failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id).await);
        }
        self.get_task(id).await
    }

    /// Mark an open task completed. Only one caller can win this transition,
    /// so the XP for a task is awarded at most once.
    pub async fn mark_task_completed(&self, id: &str) -> Result<Task, PosError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'completed', completed_at = datetime('now'), \
             updated_at = datetime('now') \
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PosError::Memory(format!("complete task failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id).await);
        }
        self.get_task(id).await
    }

    /// Put a completed task back to `in_progress`, used when the XP award
    /// that should accompany completion fails.
    pub async fn reopen_task(&self, id: &str) -> Result<(), PosError> {
        sqlx::query(
            "UPDATE tasks SET status = 'in_progress', completed_at = NULL, \
             updated_at = datetime('now') WHERE id = ? AND status = 'completed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PosError::Memory(format!("reopen task failed: {e}")))?;
        Ok(())
    }

    async fn transition_error(&self, id: &str) -> PosError {
        match self.get_task(id).await {
            Ok(task) => PosError::Conflict(format!("task {id} is already {}", task.status)),
            Err(e) => e,
        }
    }
}
