//! Avatar XP ledger.
//!
//! Each user owns one ledger holding a set of named avatar accounts. Completed
//! tasks credit XP to an avatar; levels and the percentage balance across
//! avatars are derived from the XP counters. The ledger does no I/O: callers
//! load it from a [`LedgerSnapshot`] and persist [`AvatarLedger::snapshot`]
//! after each award.

mod account;
mod snapshot;


pub use account::{level_for_xp, AvatarAccount, LevelProgress, MAX_COUNTER, XP_PER_LEVEL};
pub use snapshot::{AccountSnapshot, LedgerSnapshot, SnapshotPolicy};

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Longest accepted avatar name, in characters.
pub const MAX_AVATAR_NAME_LEN: usize = 100;

/// Rejected ledger operation. A failed call never changes ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("invalid XP amount {0}: must not be negative")]
    InvalidAmount(i64),

    #[error("invalid avatar name {0:?}")]
    InvalidName(String),

    #[error("corrupt snapshot for avatar {avatar:?}: {reason}")]
    CorruptSnapshot { avatar: String, reason: String },

    #[error("XP counter overflow for avatar {avatar:?}")]
    Overflow { avatar: String },
}

/// Check an avatar name: non-empty, no surrounding whitespace, no control
/// characters, at most [`MAX_AVATAR_NAME_LEN`] characters.
pub fn validate_avatar_name(name: &str) -> Result<(), LedgerError> {
    let ok = !name.is_empty()
        && name.trim() == name
        && name.chars().count() <= MAX_AVATAR_NAME_LEN
        && !name.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(LedgerError::InvalidName(name.to_string()))
    }
}

/// An avatar crossed one or more level thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelUp {
    pub old_level: u64,
    pub new_level: u64,
}

/// Receipt for a successful [`AvatarLedger::award_xp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XpAward {
    pub avatar: String,
    pub amount: u64,
    pub xp: u64,
    pub level: u64,
    pub tasks_completed: u64,
    pub total_xp: u64,
    pub level_up: Option<LevelUp>,
}

/// Read-only summary returned by [`AvatarLedger::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total_xp: u64,
    pub total_tasks_completed: u64,
    /// Avatar name -> share of `total_xp` in percent, rounded to 2 decimals.
    pub balance: BTreeMap<String, f64>,
}

/// One user's avatar accounts.
#[derive(Debug, Clone)]
pub struct AvatarLedger {
    user_id: String,
    accounts: BTreeMap<String, AvatarAccount>,
    total_xp: u64,
    revision: u64,
}

impl AvatarLedger {
    /// New ledger holding one fresh account per default avatar name.
    ///
    /// Names are expected to be validated up front (see `Config::validate`).
    pub fn new<S: AsRef<str>>(user_id: impl Into<String>, defaults: &[S]) -> Self {
        let accounts = defaults
            .iter()
            .map(|n| {
                let name = n.as_ref().to_string();
                (name.clone(), AvatarAccount::new(name))
            })
            .collect();
        Self {
            user_id: user_id.into(),
            accounts,
            total_xp: 0,
            revision: 0,
        }
    }

    /// Rebuild a ledger from its stored form.
    ///
    /// Valid accounts are restored exactly. Accounts that break an invariant
    /// are fixed and logged under [`SnapshotPolicy::Heal`], or rejected with
    /// [`LedgerError::CorruptSnapshot`] under [`SnapshotPolicy::Strict`].
    pub fn from_snapshot(
        user_id: impl Into<String>,
        snapshot: &LedgerSnapshot,
        policy: SnapshotPolicy,
    ) -> Result<Self, LedgerError> {
        let user_id = user_id.into();
        let mut accounts = BTreeMap::new();
        let mut total_xp: u64 = 0;

        for (name, reason) in &snapshot.rejected {
            if policy == SnapshotPolicy::Strict {
                return Err(LedgerError::CorruptSnapshot {
                    avatar: name.clone(),
                    reason: format!("unreadable counters: {reason}"),
                });
            }
            warn!("ledger {user_id}: dropping unreadable snapshot account {name:?}: {reason}");
        }

        for (name, stored) in &snapshot.accounts {
            let corrupt = |reason: String| LedgerError::CorruptSnapshot {
                avatar: name.clone(),
                reason,
            };

            if validate_avatar_name(name).is_err() {
                if policy == SnapshotPolicy::Strict {
                    return Err(corrupt("malformed avatar name".into()));
                }
                warn!("ledger {user_id}: dropping snapshot account with malformed name {name:?}");
                continue;
            }

            let xp = heal_counter(&user_id, name, "xp", stored.xp, policy).map_err(corrupt)?;
            let tasks = heal_counter(
                &user_id,
                name,
                "tasks_completed",
                stored.tasks_completed,
                policy,
            )
            .map_err(corrupt)?;

            let expected = level_for_xp(xp);
            if i64::try_from(expected).ok() != Some(stored.level) {
                let reason = format!(
                    "level {} does not match xp {xp} (expected {expected})",
                    stored.level
                );
                if policy == SnapshotPolicy::Strict {
                    return Err(corrupt(reason));
                }
                warn!("ledger {user_id}: {name}: {reason}; recomputing level");
            }

            total_xp = total_xp
                .checked_add(xp)
                .filter(|&t| t <= MAX_COUNTER)
                .ok_or_else(|| corrupt("total xp overflows".into()))?;
            accounts.insert(name.clone(), AvatarAccount::restore(name.clone(), xp, tasks));
        }

        Ok(Self {
            user_id,
            accounts,
            total_xp,
            revision: 0,
        })
    }

    /// Set the persisted revision this ledger was loaded at.
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn total_xp(&self) -> u64 {
        self.total_xp
    }

    /// Count of successful awards, including those made before the last load.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn account(&self, name: &str) -> Option<&AvatarAccount> {
        self.accounts.get(name)
    }

    /// Where `name` sits inside its current level, if the avatar exists.
    pub fn level_progress(&self, name: &str) -> Option<LevelProgress> {
        self.accounts.get(name).map(AvatarAccount::progress)
    }

    /// All accounts, ordered by name.
    pub fn accounts(&self) -> impl Iterator<Item = &AvatarAccount> {
        self.accounts.values()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Get the account for `name`, creating a fresh one if it does not exist.
    ///
    /// This is the only place new avatars enter a ledger after construction.
    pub fn entry_or_default(&mut self, name: &str) -> Result<&mut AvatarAccount, LedgerError> {
        validate_avatar_name(name)?;
        Ok(self
            .accounts
            .entry(name.to_string())
            .or_insert_with(|| AvatarAccount::new(name)))
    }

    /// Credit `amount` XP and one completed task to avatar `name`.
    ///
    /// Unknown avatars are created first. All checks run before anything is
    /// written, so an error leaves the ledger untouched.
    pub fn award_xp(&mut self, name: &str, amount: i64) -> Result<XpAward, LedgerError> {
        validate_avatar_name(name)?;
        let amount = u64::try_from(amount).map_err(|_| LedgerError::InvalidAmount(amount))?;

        let new_total = self
            .total_xp
            .checked_add(amount)
            .filter(|&t| t <= MAX_COUNTER)
            .ok_or(LedgerError::Overflow {
                avatar: name.to_string(),
            })?;
        if let Some(existing) = self.accounts.get(name) {
            existing.check_credit(amount)?;
        }

        let account = self.entry_or_default(name)?;
        let old_level = account.level();
        account.credit(amount);

        let award = XpAward {
            avatar: name.to_string(),
            amount,
            xp: account.xp(),
            level: account.level(),
            tasks_completed: account.tasks_completed(),
            total_xp: new_total,
            level_up: (account.level() > old_level).then(|| LevelUp {
                old_level,
                new_level: account.level(),
            }),
        };

        self.total_xp = new_total;
        self.revision = self.revision.saturating_add(1);
        Ok(award)
    }

    /// Totals and the percentage balance across avatars.
    ///
    /// With no XP awarded yet every balance is `0.0`.
    pub fn get_stats(&self) -> LedgerStats {
        let balance = self
            .accounts
            .values()
            .map(|a| (a.name().to_string(), balance_percent(a.xp(), self.total_xp)))
            .collect();
        LedgerStats {
            total_xp: self.total_xp,
            total_tasks_completed: self.accounts.values().map(|a| a.tasks_completed()).sum(),
            balance,
        }
    }

    /// Serialized form for the user record.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let accounts = self
            .accounts
            .values()
            .map(|a| {
                (
                    a.name().to_string(),
                    AccountSnapshot {
                        level: to_stored(a.level()),
                        xp: to_stored(a.xp()),
                        tasks_completed: to_stored(a.tasks_completed()),
                    },
                )
            })
            .collect();
        LedgerSnapshot {
            accounts,
            rejected: BTreeMap::new(),
        }
    }
}

fn balance_percent(xp: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = xp as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

fn heal_counter(
    user_id: &str,
    name: &str,
    field: &str,
    value: i64,
    policy: SnapshotPolicy,
) -> Result<u64, String> {
    match u64::try_from(value) {
        Ok(v) => Ok(v),
        Err(_) if policy == SnapshotPolicy::Strict => Err(format!("negative {field} {value}")),
        Err(_) => {
            warn!("ledger {user_id}: {name}: negative {field} {value}; clamping to 0");
            Ok(0)
        }
    }
}

/// Counters never exceed [`MAX_COUNTER`], so the conversion is lossless.
fn to_stored(v: u64) -> i64 {
    debug_assert!(v <= MAX_COUNTER);
    v as i64
}
