//! Per-avatar account and level math.

use serde::Serialize;

use super::LedgerError;

/// XP needed to advance one level.
pub const XP_PER_LEVEL: u64 = 100;

/// Largest value any ledger counter may reach. Snapshots store counters as
/// signed 64-bit integers, so this is `i64::MAX`.
pub const MAX_COUNTER: u64 = i64::MAX as u64;

/// Level for a given XP total: `floor(xp / 100) + 1`.
pub fn level_for_xp(xp: u64) -> u64 {
    xp / XP_PER_LEVEL + 1
}

/// One avatar's running totals.
///
/// `level` is always derived from `xp`; there is no setter for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvatarAccount {
    name: String,
    level: u64,
    xp: u64,
    tasks_completed: u64,
}

impl AvatarAccount {
    /// A fresh account at level 1 with no XP.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level: 1,
            xp: 0,
            tasks_completed: 0,
        }
    }

    /// Rebuild an account from stored counters, deriving the level.
    pub(super) fn restore(name: impl Into<String>, xp: u64, tasks_completed: u64) -> Self {
        Self {
            name: name.into(),
            level: level_for_xp(xp),
            xp,
            tasks_completed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn xp(&self) -> u64 {
        self.xp
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed
    }

    /// Check that crediting `amount` keeps both counters within [`MAX_COUNTER`].
    pub(super) fn check_credit(&self, amount: u64) -> Result<(), LedgerError> {
        let fits = |current: u64, add: u64| {
            current
                .checked_add(add)
                .is_some_and(|v| v <= MAX_COUNTER)
        };
        if fits(self.xp, amount) && fits(self.tasks_completed, 1) {
            Ok(())
        } else {
            Err(LedgerError::Overflow {
                avatar: self.name.clone(),
            })
        }
    }

    /// Apply a checked credit. Callers must run [`check_credit`](Self::check_credit) first.
    pub(super) fn credit(&mut self, amount: u64) {
        self.xp += amount;
        self.tasks_completed += 1;
        self.level = level_for_xp(self.xp);
    }

    /// Progress through the current level.
    pub fn progress(&self) -> LevelProgress {
        let floor = (self.level - 1) * XP_PER_LEVEL;
        let xp_into_level = self.xp - floor;
        LevelProgress {
            level: self.level,
            xp_into_level,
            xp_to_next_level: XP_PER_LEVEL - xp_into_level,
            fraction: xp_into_level as f64 / XP_PER_LEVEL as f64,
        }
    }
}

/// Where an account sits inside its current level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelProgress {
    pub level: u64,
    /// XP earned since reaching `level`.
    pub xp_into_level: u64,
    /// XP still needed to reach `level + 1`.
    pub xp_to_next_level: u64,
    /// 0.0 - 1.0
    pub fraction: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_xp() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(250), 3);
        assert_eq!(level_for_xp(u64::MAX), u64::MAX / 100 + 1);
    }

    #[test]
    fn test_credit_recomputes_level() {
        let mut acct = AvatarAccount::new("Warrior");
        acct.check_credit(120).unwrap();
        acct.credit(120);
        assert_eq!(acct.xp(), 120);
        assert_eq!(acct.level(), 2);
        assert_eq!(acct.tasks_completed(), 1);
    }

    #[test]
    fn test_check_credit_overflow() {
        let acct = AvatarAccount::restore("Monk", MAX_COUNTER - 5, 0);
        assert_eq!(
            acct.check_credit(10),
            Err(LedgerError::Overflow {
                avatar: "Monk".to_string()
            })
        );
        assert!(acct.check_credit(5).is_ok());

        let busy = AvatarAccount::restore("Monk", 0, MAX_COUNTER);
        assert!(busy.check_credit(0).is_err());
    }

    #[test]
    fn test_progress() {
        let acct = AvatarAccount::restore("Scholar", 175, 3);
        let p = acct.progress();
        assert_eq!(p.level, 2);
        assert_eq!(p.xp_into_level, 75);
        assert_eq!(p.xp_to_next_level, 25);
        assert!((p.fraction - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_fresh_account() {
        let p = AvatarAccount::new("Artist").progress();
        assert_eq!(p.level, 1);
        assert_eq!(p.xp_into_level, 0);
        assert_eq!(p.xp_to_next_level, 100);
        assert_eq!(p.fraction, 0.0);
    }
}
