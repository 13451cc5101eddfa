//! Avatar ledger snapshots stored on the user record.

use super::Store;
use async_trait::async_trait;
use pos_core::error::PosError;
use pos_core::ledger::LedgerSnapshot;
use pos_core::traits::{SnapshotStore, StoredSnapshot};
use tracing::debug;

#[async_trait]
impl SnapshotStore for Store {
    async fn load_snapshot(&self, user_id: &str) -> Result<StoredSnapshot, PosError> {
        let row: Option<(Option<String>, i64)> =
            sqlx::query_as("SELECT avatar_stats, avatar_revision FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| PosError::Memory(format!("load avatar stats failed: {e}")))?;

        let (json, revision) = row.ok_or_else(|| PosError::NotFound(format!("user {user_id}")))?;

        let accounts = match json.as_deref().map(str::trim) {
            None | Some("") | Some("null") => None,
            Some(json) => Some(LedgerSnapshot::from_json(json)?),
        };

        Ok(StoredSnapshot {
            accounts,
            revision: u64::try_from(revision).unwrap_or(0),
        })
    }

    async fn save_snapshot(
        &self,
        user_id: &str,
        snapshot: &LedgerSnapshot,
        expected: u64,
        revision: u64,
    ) -> Result<bool, PosError> {
        let json = snapshot.to_json()?;
        let to_db = |r: u64| {
            i64::try_from(r).map_err(|_| PosError::InvalidInput(format!("revision {r} out of range")))
        };
        let (expected, revision) = (to_db(expected)?, to_db(revision)?);
        let (total_xp, total_tasks) = snapshot.accounts.values().fold((0i64, 0i64), |acc, a| {
            (
                acc.0.saturating_add(a.xp),
                acc.1.saturating_add(a.tasks_completed),
            )
        });

        // Compare-and-set on the revision the caller started from.
        let result = sqlx::query(
            "UPDATE users SET avatar_stats = ?, avatar_revision = ?, \
             total_xp_earned = ?, total_tasks_completed = ?, \
             last_active_at = datetime('now'), updated_at = datetime('now') \
             WHERE id = ? AND avatar_revision = ?",
        )
        .bind(&json)
        .bind(revision)
        .bind(total_xp)
        .bind(total_tasks)
        .bind(user_id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| PosError::Memory(format!("save avatar stats failed: {e}")))?;

        if result.rows_affected() == 1 {
            debug!("saved avatar stats for {user_id} at revision {revision}");
            return Ok(true);
        }

        if self.user_exists(user_id).await? {
            Ok(false)
        } else {
            Err(PosError::NotFound(format!("user {user_id}")))
        }
    }
}
