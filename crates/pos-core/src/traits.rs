use crate::{error::PosError, ledger::LedgerSnapshot};
use async_trait::async_trait;

/// A ledger snapshot as it sits in the user record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSnapshot {
    /// `None` when the user has never been awarded XP.
    pub accounts: Option<LedgerSnapshot>,
    pub revision: u64,
}

/// Durable home for per-user ledger snapshots.
///
/// The SQLite store implements this; tests use in-memory fakes.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fetch the stored snapshot. Fails with `PosError::NotFound` when the
    /// user does not exist.
    async fn load_snapshot(&self, user_id: &str) -> Result<StoredSnapshot, PosError>;

    /// Replace the stored snapshot with `snapshot` at `revision`, but only if
    /// the stored revision is still `expected`.
    ///
    /// Returns `false` when another writer got there first. The caller's
    /// snapshot was built on state that is no longer current.
    async fn save_snapshot(
        &self,
        user_id: &str,
        snapshot: &LedgerSnapshot,
        expected: u64,
        revision: u64,
    ) -> Result<bool, PosError>;
}
