//! Task completion and XP awards.
//!
//! Glues the task store to the ledger registry: completing a task that names
//! an avatar credits its reward to that avatar.

use pos_core::config::AvatarConfig;
use pos_core::error::PosError;
use pos_core::ledger::{AvatarAccount, AvatarLedger, LedgerStats, LevelProgress, XpAward};
use pos_core::registry::LedgerRegistry;
use pos_memory::{Store, Task};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of completing a task.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub task: Task,
    /// `None` when the task has no avatar attached.
    pub award: Option<XpAward>,
}

/// One avatar as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct AvatarView {
    pub name: String,
    pub level: u64,
    pub xp: u64,
    pub tasks_completed: u64,
    pub balance: f64,
    pub progress: LevelProgress,
}

/// Stats plus a per-avatar breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct AvatarOverview {
    pub user_id: String,
    pub total_xp: u64,
    pub total_tasks_completed: u64,
    pub balance: BTreeMap<String, f64>,
    pub avatars: Vec<AvatarView>,
}

impl AvatarOverview {
    fn from_ledger(ledger: &AvatarLedger) -> Self {
        let LedgerStats {
            total_xp,
            total_tasks_completed,
            balance,
        } = ledger.get_stats();
        let avatars = ledger
            .accounts()
            .map(|a: &AvatarAccount| AvatarView {
                name: a.name().to_string(),
                level: a.level(),
                xp: a.xp(),
                tasks_completed: a.tasks_completed(),
                balance: balance.get(a.name()).copied().unwrap_or(0.0),
                progress: a.progress(),
            })
            .collect();
        Self {
            user_id: ledger.user_id().to_string(),
            total_xp,
            total_tasks_completed,
            balance,
            avatars,
        }
    }
}

pub struct AvatarService {
    store: Store,
    registry: LedgerRegistry,
}

impl AvatarService {
    pub fn new(store: Store, config: AvatarConfig) -> Self {
        let registry = LedgerRegistry::new(Arc::new(store.clone()), config);
        Self::with_registry(store, registry)
    }

    pub fn with_registry(store: Store, registry: LedgerRegistry) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Complete a task and credit its reward to the task's avatar.
    ///
    /// A task completes at most once. If the award fails the task is put back
    /// to `in_progress` and the award error is returned.
    pub async fn complete_task(&self, task_id: &str) -> Result<Completion, PosError> {
        let task = self.store.mark_task_completed(task_id).await?;

        let Some(avatar) = task.avatar_name.as_deref() else {
            info!("task {task_id} completed (no avatar)");
            return Ok(Completion { task, award: None });
        };

        match self.registry.award(&task.user_id, avatar, task.xp_reward).await {
            Ok(award) => {
                info!("task {task_id} completed: +{} xp to {avatar}", award.amount);
                Ok(Completion {
                    task,
                    award: Some(award),
                })
            }
            Err(e) => {
                warn!("task {task_id}: xp award failed, reopening: {e}");
                if let Err(reopen) = self.store.reopen_task(task_id).await {
                    error!("task {task_id}: reopen failed: {reopen}");
                }
                Err(e)
            }
        }
    }

    /// Award XP directly, outside any task.
    pub async fn award(
        &self,
        user_id: &str,
        avatar: &str,
        amount: i64,
    ) -> Result<XpAward, PosError> {
        self.registry.award(user_id, avatar, amount).await
    }

    pub async fn stats(&self, user_id: &str) -> Result<LedgerStats, PosError> {
        self.registry.stats(user_id).await
    }

    pub async fn overview(&self, user_id: &str) -> Result<AvatarOverview, PosError> {
        self.registry
            .read(user_id, AvatarOverview::from_ledger)
            .await
    }
}
