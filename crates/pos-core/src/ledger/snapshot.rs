//! Serialized ledger form, as stored in `users.avatar_stats`.
//!
//! The JSON shape is a plain map keyed by avatar name:
//!
//! ```json
//! {"Warrior": {"level": 1, "xp": 50, "tasks_completed": 1}}
//! ```
//!
//! Counters are signed on the wire so that a corrupted negative value can be
//! detected and reported instead of failing deserialization outright.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do with a snapshot account that breaks a ledger invariant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPolicy {
    /// Recompute levels, clamp negative counters, drop bad names, log each fix.
    #[default]
    Heal,
    /// Refuse to load the snapshot.
    Strict,
}

/// Stored counters for one avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    #[serde(default = "default_level")]
    pub level: i64,
    #[serde(default)]
    pub xp: i64,
    #[serde(default)]
    pub tasks_completed: i64,
}

fn default_level() -> i64 {
    1
}

/// Every account of one ledger, keyed by avatar name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerSnapshot {
    pub accounts: BTreeMap<String, AccountSnapshot>,
    /// Entries whose counters could not be read, with the parse error.
    /// Never written back.
    #[serde(skip)]
    pub rejected: BTreeMap<String, String>,
}

impl LedgerSnapshot {
    /// Parse the stored JSON form.
    ///
    /// The top level must be an object. Each entry is parsed on its own; one
    /// that does not fit [`AccountSnapshot`] lands in `rejected` instead of
    /// failing the whole snapshot.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut snapshot = Self::default();
        for (name, value) in raw {
            match serde_json::from_value::<AccountSnapshot>(value) {
                Ok(account) => {
                    snapshot.accounts.insert(name, account);
                }
                Err(e) => {
                    snapshot.rejected.insert(name, e.to_string());
                }
            }
        }
        Ok(snapshot)
    }

    /// Render the stored JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.rejected.is_empty()
    }
}
