//! User records.

use super::{db_error, Store};
use pos_core::error::PosError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user row. `avatar_stats` holds the serialized avatar ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub timezone: String,
    pub llm_provider: String,
    #[serde(skip)]
    pub avatar_stats: Option<String>,
    #[serde(skip)]
    pub avatar_revision: i64,
    pub total_tasks_completed: i64,
    pub total_xp_earned: i64,
    pub created_at: String,
    pub updated_at: String,
    pub last_active_at: Option<String>,
    pub is_active: bool,
    pub current_streak_days: i64,
    pub longest_streak_days: i64,
    /// Free-form JSON object, stored as text.
    #[serde(serialize_with = "settings_as_json")]
    pub settings: Option<String>,
}

fn settings_as_json<S: serde::Serializer>(
    settings: &Option<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let value = settings
        .as_deref()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());
    value.serialize(serializer)
}

/// Fields accepted when creating a user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

const USER_COLUMNS: &str = "id, email, username, full_name, timezone, llm_provider, \
     avatar_stats, avatar_revision, total_tasks_completed, total_xp_earned, \
     created_at, updated_at, last_active_at, is_active, \
     current_streak_days, longest_streak_days, settings";

impl Store {
    /// Create a user. `default_timezone` applies when none is given.
    pub async fn create_user(
        &self,
        new: &NewUser,
        default_timezone: &str,
    ) -> Result<User, PosError> {
        let email = new.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(PosError::InvalidInput(format!(
                "invalid email {:?}",
                new.email
            )));
        }
        let username = new
            .username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        let timezone = new
            .timezone
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(default_timezone);
        let llm_provider = new.llm_provider.as_deref().unwrap_or("openai");
        let settings = match &new.settings {
            None | Some(serde_json::Value::Null) => None,
            Some(v @ serde_json::Value::Object(_)) => Some(v.to_string()),
            Some(_) => {
                return Err(PosError::InvalidInput(
                    "settings must be a JSON object".into(),
                ))
            }
        };

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, email, username, full_name, timezone, llm_provider, settings) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(username)
        .bind(&new.full_name)
        .bind(timezone)
        .bind(llm_provider)
        .bind(settings)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create user failed", e))?;

        tracing::debug!("created user {id} <{email}>");
        self.get_user(&id).await
    }

    /// Fetch a user by id.
    pub async fn get_user(&self, id: &str) -> Result<User, PosError> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PosError::Memory(format!("get user failed: {e}")))?
            .ok_or_else(|| PosError::NotFound(format!("user {id}")))
    }

    /// Fetch a user by email, if one exists.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, PosError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PosError::Memory(format!("get user by email failed: {e}")))
    }

    /// All active users, oldest first.
    pub async fn list_users(&self) -> Result<Vec<User>, PosError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE is_active = 1 ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PosError::Memory(format!("list users failed: {e}")))
    }

    pub(super) async fn user_exists(&self, id: &str) -> Result<bool, PosError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PosError::Memory(format!("user lookup failed: {e}")))?;
        Ok(row.is_some())
    }
}
