//! Per-user ledger cache with reader/writer locking.
//!
//! Each user's ledger lives behind its own `RwLock`: awards take the write
//! lock, stats take the read lock. Snapshots are written after the write lock
//! is released, as a compare-and-set on the revision the award started from.
//! When that write loses to another one, the cached ledger is dropped and the
//! award is replayed on a fresh load.
//!
//! At most `cache_capacity` ledgers stay in memory; loading one more drops the
//! least recently used.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::AvatarConfig;
use crate::error::PosError;
use crate::ledger::{AvatarLedger, LedgerStats, XpAward};
use crate::traits::SnapshotStore;

/// How many times an award is replayed after losing a write race.
const MAX_AWARD_ATTEMPTS: usize = 3;

/// One cached ledger.
struct LedgerSlot {
    ledger: RwLock<AvatarLedger>,
    /// Held for the duration of a save so saves leave in revision order.
    /// Set to `true` once a save failed; the ledger no longer matches the
    /// store and must not be written again.
    saves: Mutex<bool>,
    /// A snapshot from this slot has reached the store.
    saved: AtomicBool,
    last_used: AtomicU64,
}

impl LedgerSlot {
    fn new(ledger: AvatarLedger, tick: u64) -> Self {
        Self {
            ledger: RwLock::new(ledger),
            saves: Mutex::new(false),
            saved: AtomicBool::new(false),
            last_used: AtomicU64::new(tick),
        }
    }
}

type Slots = HashMap<String, Arc<LedgerSlot>>;

/// Lazily loaded ledgers, one per user.
pub struct LedgerRegistry {
    store: Arc<dyn SnapshotStore>,
    config: AvatarConfig,
    ledgers: Mutex<Slots>,
    /// Logical clock for least-recently-used ordering.
    clock: AtomicU64,
    /// Bumped whenever a write lands that a load running concurrently may
    /// have missed. A load that sees it move starts over.
    generation: AtomicU64,
}

impl LedgerRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: AvatarConfig) -> Self {
        Self {
            store,
            config,
            ledgers: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Award XP to one of the user's avatars and persist the new snapshot.
    ///
    /// If the snapshot cannot be written the cached ledger is dropped, so the
    /// next access reloads the last durable state. If another writer moved
    /// the stored revision first, the award is replayed on a fresh load; after
    /// [`MAX_AWARD_ATTEMPTS`] lost races it fails with `PosError::Conflict`.
    pub async fn award(
        &self,
        user_id: &str,
        avatar: &str,
        amount: i64,
    ) -> Result<XpAward, PosError> {
        for attempt in 1..=MAX_AWARD_ATTEMPTS {
            let slot = self.slot(user_id).await?;

            let mut ledger = slot.ledger.write().await;
            let expected = ledger.revision();
            let award = ledger.award_xp(avatar, amount)?;
            let snapshot = ledger.snapshot();
            let revision = ledger.revision();
            // Take the save lock before letting the next award in.
            let mut broken = slot.saves.lock().await;
            drop(ledger);

            if *broken {
                drop(broken);
                debug!("ledger {user_id}: cached ledger is stale, reloading (attempt {attempt})");
                self.evict_if_same(user_id, &slot).await;
                continue;
            }

            match self
                .store
                .save_snapshot(user_id, &snapshot, expected, revision)
                .await
            {
                Ok(true) => {
                    slot.saved.store(true, Ordering::SeqCst);
                    drop(broken);
                    self.settle(user_id, &slot).await;
                    log_award(user_id, &award);
                    return Ok(award);
                }
                Ok(false) => {
                    *broken = true;
                    drop(broken);
                    warn!(
                        "ledger {user_id}: revision {expected} was superseded, \
                         replaying award (attempt {attempt})"
                    );
                    self.evict_if_same(user_id, &slot).await;
                }
                Err(e) => {
                    *broken = true;
                    drop(broken);
                    error!("ledger {user_id}: failed to persist revision {revision}: {e}");
                    self.evict_if_same(user_id, &slot).await;
                    return Err(e);
                }
            }
        }

        Err(PosError::Conflict(format!(
            "avatar ledger for user {user_id} changed {MAX_AWARD_ATTEMPTS} times during the award"
        )))
    }

    /// Run `f` against the user's ledger under the shared read lock.
    pub async fn read<R>(
        &self,
        user_id: &str,
        f: impl FnOnce(&AvatarLedger) -> R,
    ) -> Result<R, PosError> {
        let slot = self.slot(user_id).await?;
        let guard = slot.ledger.read().await;
        Ok(f(&guard))
    }

    pub async fn stats(&self, user_id: &str) -> Result<LedgerStats, PosError> {
        self.read(user_id, AvatarLedger::get_stats).await
    }

    /// Drop the cached ledger for `user_id`. Returns whether one was cached.
    pub async fn evict(&self, user_id: &str) -> bool {
        let mut ledgers = self.ledgers.lock().await;
        self.remove_locked(&mut ledgers, user_id)
    }

    /// Number of ledgers currently held in memory.
    pub async fn cached(&self) -> usize {
        self.ledgers.lock().await.len()
    }

    /// Get the user's ledger, loading it from the store on first access.
    ///
    /// The store is read without holding the cache lock.
    async fn slot(&self, user_id: &str) -> Result<Arc<LedgerSlot>, PosError> {
        loop {
            let generation = {
                let ledgers = self.ledgers.lock().await;
                if let Some(slot) = ledgers.get(user_id) {
                    self.touch(slot);
                    return Ok(Arc::clone(slot));
                }
                self.generation.load(Ordering::SeqCst)
            };

            let ledger = self.load(user_id).await?;

            let mut ledgers = self.ledgers.lock().await;
            if let Some(slot) = ledgers.get(user_id) {
                self.touch(slot);
                return Ok(Arc::clone(slot));
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("ledger {user_id}: store changed during load, loading again");
                continue;
            }
            if ledgers.len() >= self.config.cache_capacity.max(1) {
                self.evict_lru(&mut ledgers);
            }
            let slot = Arc::new(LedgerSlot::new(ledger, self.tick()));
            ledgers.insert(user_id.to_string(), Arc::clone(&slot));
            return Ok(slot);
        }
    }

    async fn load(&self, user_id: &str) -> Result<AvatarLedger, PosError> {
        let stored = self.store.load_snapshot(user_id).await?;
        let ledger = match stored.accounts {
            Some(ref snapshot) if !snapshot.is_empty() => {
                AvatarLedger::from_snapshot(user_id, snapshot, self.config.snapshot_policy)?
            }
            _ => AvatarLedger::new(user_id, &self.config.defaults),
        }
        .with_revision(stored.revision);

        debug!(
            "ledger {user_id}: loaded {} avatars at revision {}",
            ledger.len(),
            stored.revision
        );
        Ok(ledger)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn touch(&self, slot: &LedgerSlot) {
        slot.last_used.store(self.tick(), Ordering::Relaxed);
    }

    fn evict_lru(&self, ledgers: &mut Slots) {
        let oldest = ledgers
            .iter()
            .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
            .map(|(user_id, _)| user_id.clone());
        if let Some(user_id) = oldest {
            debug!("ledger cache full, dropping {user_id}");
            self.remove_locked(ledgers, &user_id);
        }
    }

    fn remove_locked(&self, ledgers: &mut Slots, user_id: &str) -> bool {
        match ledgers.remove(user_id) {
            Some(slot) => {
                if slot.saved.load(Ordering::SeqCst) {
                    self.generation.fetch_add(1, Ordering::SeqCst);
                }
                true
            }
            None => false,
        }
    }

    async fn evict_if_same(&self, user_id: &str, slot: &Arc<LedgerSlot>) {
        let mut ledgers = self.ledgers.lock().await;
        if ledgers
            .get(user_id)
            .is_some_and(|cached| Arc::ptr_eq(cached, slot))
        {
            self.remove_locked(&mut ledgers, user_id);
        }
    }

    /// After a save from `slot` landed: any other cached ledger for the user,
    /// or one still loading, may predate it.
    async fn settle(&self, user_id: &str, slot: &Arc<LedgerSlot>) {
        let mut ledgers = self.ledgers.lock().await;
        match ledgers.get(user_id) {
            Some(cached) if Arc::ptr_eq(cached, slot) => {}
            Some(_) => {
                ledgers.remove(user_id);
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn log_award(user_id: &str, award: &XpAward) {
    info!(
        "ledger {user_id}: +{} xp to {} (xp {}, level {})",
        award.amount, award.avatar, award.xp, award.level
    );
    if let Some(up) = &award.level_up {
        info!(
            "ledger {user_id}: {} reached level {} (was {})",
            award.avatar, up.new_level, up.old_level
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerError, LedgerSnapshot, SnapshotPolicy};
    use crate::traits::StoredSnapshot;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// In-memory snapshot store with compare-and-set saves.
    #[derive(Default)]
    struct MemoryStore {
        rows: std::sync::Mutex<HashMap<String, StoredSnapshot>>,
        loads: AtomicUsize,
        fail_saves: AtomicBool,
        /// Every save reports a lost race.
        always_stale: AtomicBool,
        /// Park the next save until `release` is notified.
        hold_next_save: AtomicBool,
        /// Park loads for this user until `release` is notified.
        hold_load_for: std::sync::Mutex<Option<String>>,
        entered: Notify,
        release: Notify,
    }

    impl MemoryStore {
        fn with_users(user_ids: &[&str]) -> Self {
            let store = Self::default();
            {
                let mut rows = store.rows.lock().unwrap();
                for user_id in user_ids {
                    rows.insert(user_id.to_string(), StoredSnapshot::default());
                }
            }
            store
        }

        fn with_user(user_id: &str) -> Self {
            Self::with_users(&[user_id])
        }

        fn stored(&self, user_id: &str) -> StoredSnapshot {
            self.rows.lock().unwrap()[user_id].clone()
        }

        async fn park(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        async fn load_snapshot(&self, user_id: &str) -> Result<StoredSnapshot, PosError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let hold = self.hold_load_for.lock().unwrap().as_deref() == Some(user_id);
            if hold {
                self.park().await;
            }
            self.rows
                .lock()
                .unwrap()
                .get(user_id)
                .cloned()
                .ok_or_else(|| PosError::NotFound(format!("user {user_id}")))
        }

        async fn save_snapshot(
            &self,
            user_id: &str,
            snapshot: &LedgerSnapshot,
            expected: u64,
            revision: u64,
        ) -> Result<bool, PosError> {
            if self.hold_next_save.swap(false, Ordering::SeqCst) {
                self.park().await;
            }
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(PosError::Memory("disk full".into()));
            }
            if self.always_stale.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(user_id)
                .ok_or_else(|| PosError::NotFound(format!("user {user_id}")))?;
            if row.revision != expected {
                return Ok(false);
            }
            row.accounts = Some(snapshot.clone());
            row.revision = revision;
            Ok(true)
        }
    }

    fn registry(store: Arc<MemoryStore>) -> LedgerRegistry {
        LedgerRegistry::new(store, AvatarConfig::default())
    }

    #[tokio::test]
    async fn test_fresh_user_gets_default_avatars() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        let reg = registry(store);
        let stats = reg.stats("u1").await.unwrap();
        assert_eq!(stats.total_xp, 0);
        assert_eq!(stats.balance.len(), 5);
        assert_eq!(stats.balance["Warrior"], 0.0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let reg = registry(Arc::new(MemoryStore::default()));
        assert!(matches!(reg.stats("ghost").await, Err(PosError::NotFound(_))));
        assert_eq!(reg.cached().await, 0);
    }

    #[tokio::test]
    async fn test_award_persists_snapshot() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        let reg = registry(Arc::clone(&store));

        let award = reg.award("u1", "Warrior", 50).await.unwrap();
        assert_eq!(award.xp, 50);

        let stored = store.stored("u1");
        assert_eq!(stored.revision, 1);
        let accounts = stored.accounts.unwrap();
        assert_eq!(accounts.accounts["Warrior"].xp, 50);
        assert_eq!(accounts.accounts.len(), 5);
    }

    #[tokio::test]
    async fn test_ledger_loaded_once() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        let reg = registry(Arc::clone(&store));
        reg.award("u1", "Monk", 5).await.unwrap();
        reg.stats("u1").await.unwrap();
        reg.award("u1", "Monk", 5).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(reg.cached().await, 1);
    }

    #[tokio::test]
    async fn test_reload_after_evict_restores_state() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        let reg = registry(Arc::clone(&store));
        reg.award("u1", "Scholar", 120).await.unwrap();
        assert!(reg.evict("u1").await);

        let (xp, level, revision) = reg
            .read("u1", |l| {
                let acct = l.account("Scholar").unwrap();
                (acct.xp(), acct.level(), l.revision())
            })
            .await
            .unwrap();
        assert_eq!((xp, level, revision), (120, 2, 1));
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_award_is_not_persisted() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        let reg = registry(Arc::clone(&store));
        let err = reg.award("u1", "Warrior", -5).await.unwrap_err();
        assert!(matches!(
            err,
            PosError::Ledger(LedgerError::InvalidAmount(-5))
        ));
        assert_eq!(store.stored("u1").revision, 0);
        assert!(store.stored("u1").accounts.is_none());
    }

    #[tokio::test]
    async fn test_failed_save_evicts_ledger() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        let reg = registry(Arc::clone(&store));
        reg.award("u1", "Warrior", 10).await.unwrap();

        store.fail_saves.store(true, Ordering::SeqCst);
        assert!(reg.award("u1", "Warrior", 10).await.is_err());
        assert_eq!(reg.cached().await, 0);

        store.fail_saves.store(false, Ordering::SeqCst);
        let stats = reg.stats("u1").await.unwrap();
        assert_eq!(stats.total_xp, 10);
    }

    #[tokio::test]
    async fn test_strict_policy_surfaces_corrupt_snapshot() {
        let store = MemoryStore::default();
        store.rows.lock().unwrap().insert(
            "u1".into(),
            StoredSnapshot {
                accounts: Some(
                    LedgerSnapshot::from_json(r#"{"Warrior": {"level": 9, "xp": 10}}"#).unwrap(),
                ),
                revision: 1,
            },
        );
        let config = AvatarConfig {
            snapshot_policy: SnapshotPolicy::Strict,
            ..AvatarConfig::default()
        };
        let reg = LedgerRegistry::new(Arc::new(store), config);
        assert!(matches!(
            reg.stats("u1").await,
            Err(PosError::Ledger(LedgerError::CorruptSnapshot { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_awards_do_not_lose_updates() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        let reg = Arc::new(registry(Arc::clone(&store)));

        let mut handles = Vec::new();
        for i in 0..50 {
            let reg = Arc::clone(&reg);
            let avatar = if i % 2 == 0 { "Warrior" } else { "Scholar" };
            handles.push(tokio::spawn(async move {
                reg.award("u1", avatar, 10).await.unwrap();
                reg.stats("u1").await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stats = reg.stats("u1").await.unwrap();
        assert_eq!(stats.total_xp, 500);
        assert_eq!(stats.total_tasks_completed, 50);
        assert_eq!(stats.balance["Warrior"], 50.0);

        let stored = store.stored("u1");
        assert_eq!(stored.revision, 50);
        let accounts = stored.accounts.unwrap();
        assert_eq!(accounts.accounts["Warrior"].xp, 250);
        assert_eq!(accounts.accounts["Scholar"].xp, 250);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_award_survives_eviction_during_save() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        store.hold_next_save.store(true, Ordering::SeqCst);
        let reg = Arc::new(registry(Arc::clone(&store)));

        let first = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.award("u1", "Warrior", 10).await })
        };
        store.entered.notified().await;

        // The first award is mid-save. Drop its ledger and land a second
        // award on a fresh load.
        assert!(reg.evict("u1").await);
        reg.award("u1", "Scholar", 20).await.unwrap();
        store.release.notify_one();

        let award = first.await.unwrap().unwrap();
        assert_eq!(award.xp, 10);

        let stored = store.stored("u1");
        assert_eq!(stored.revision, 2);
        let accounts = stored.accounts.unwrap();
        assert_eq!(accounts.accounts["Warrior"].xp, 10);
        assert_eq!(accounts.accounts["Scholar"].xp, 20);

        reg.evict("u1").await;
        let stats = reg.stats("u1").await.unwrap();
        assert_eq!(stats.total_xp, 30);
        assert_eq!(stats.total_tasks_completed, 2);
    }

    #[tokio::test]
    async fn test_award_gives_up_after_repeated_lost_races() {
        let store = Arc::new(MemoryStore::with_user("u1"));
        store.always_stale.store(true, Ordering::SeqCst);
        let reg = registry(Arc::clone(&store));

        let err = reg.award("u1", "Monk", 10).await.unwrap_err();
        assert!(matches!(err, PosError::Conflict(_)));
        assert_eq!(store.loads.load(Ordering::SeqCst), MAX_AWARD_ATTEMPTS);
        assert_eq!(reg.cached().await, 0);
        assert!(store.stored("u1").accounts.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_load_does_not_block_other_users() {
        let store = Arc::new(MemoryStore::with_users(&["slow", "fast"]));
        *store.hold_load_for.lock().unwrap() = Some("slow".into());
        let reg = Arc::new(registry(Arc::clone(&store)));

        let slow = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.stats("slow").await })
        };
        store.entered.notified().await;

        let fast = tokio::time::timeout(Duration::from_secs(5), reg.stats("fast")).await;
        assert_eq!(fast.expect("fast user waited").unwrap().total_xp, 0);

        store.release.notify_one();
        slow.await.unwrap().unwrap();
        assert_eq!(reg.cached().await, 2);
    }

    #[tokio::test]
    async fn test_cache_drops_least_recently_used() {
        let store = Arc::new(MemoryStore::with_users(&["u1", "u2", "u3"]));
        let config = AvatarConfig {
            cache_capacity: 2,
            ..AvatarConfig::default()
        };
        let reg = LedgerRegistry::new(Arc::clone(&store) as Arc<dyn SnapshotStore>, config);
        let loads = || store.loads.load(Ordering::SeqCst);

        reg.award("u1", "Warrior", 10).await.unwrap();
        reg.stats("u2").await.unwrap();
        reg.stats("u1").await.unwrap();
        reg.stats("u3").await.unwrap();
        assert_eq!(reg.cached().await, 2);
        assert_eq!(loads(), 3);

        // u2 was the least recently used.
        reg.stats("u1").await.unwrap();
        assert_eq!(loads(), 3);
        reg.stats("u2").await.unwrap();
        assert_eq!(loads(), 4);

        // u1 survives being dropped and reloaded.
        reg.stats("u3").await.unwrap();
        reg.stats("u2").await.unwrap();
        assert_eq!(reg.stats("u1").await.unwrap().total_xp, 10);
        assert_eq!(reg.cached().await, 2);
    }
}
