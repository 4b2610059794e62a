//! Per-key serialization and cached sequence numbers.
//!
//! The ledger accepts exactly one transaction per account sequence number, so
//! everything that shares a source account queues behind one async mutex.
//! Unrelated keys never contend.

use crate::error::SettlementError;
use crate::keys::AccountId;
use crate::ledger::LedgerClient;
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Map of per-key async mutexes.
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: &K) -> Result<OwnedMutexGuard<()>, SettlementError> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| SettlementError::Store("lock table poisoned".into()))?;
            // Guards and waiters each hold a clone of the slot.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        Ok(slot.lock_owned().await)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// True when no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last known sequence number per account, plus the per-account submit queue.
#[derive(Default)]
pub struct SequenceCache {
    locks: KeyedLocks<AccountId>,
    known: Mutex<HashMap<AccountId, i64>>,
}

impl SequenceCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues for `account`, then returns a lease holding the account exclusively.
    pub async fn lease(self: &Arc<Self>, account: &AccountId) -> Result<SequenceLease, SettlementError> {
        let guard = self.locks.lock(account).await?;
        Ok(SequenceLease {
            cache: Arc::clone(self),
            account: account.clone(),
            _guard: guard,
        })
    }

    fn cached(&self, account: &AccountId) -> Option<i64> {
        self.known.lock().ok()?.get(account).copied()
    }

    fn store(&self, account: &AccountId, sequence: i64) {
        if let Ok(mut known) = self.known.lock() {
            known.insert(account.clone(), sequence);
        }
    }

    fn forget(&self, account: &AccountId) {
        if let Ok(mut known) = self.known.lock() {
            known.remove(account);
        }
    }
}

/// Exclusive use of one account's sequence numbers.
pub struct SequenceLease {
    cache: Arc<SequenceCache>,
    account: AccountId,
    _guard: OwnedMutexGuard<()>,
}

impl SequenceLease {
    /// Account held by this lease.
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Current sequence, from cache or loaded from the ledger.
    pub async fn current(&self, client: &LedgerClient) -> Result<i64, SettlementError> {
        if let Some(sequence) = self.cache.cached(&self.account) {
            return Ok(sequence);
        }
        self.refresh(client).await
    }

    /// Reloads the sequence from the ledger.
    pub async fn refresh(&self, client: &LedgerClient) -> Result<i64, SettlementError> {
        let account = client.load_account(&self.account).await?;
        debug!(evt = "SEQ_REFRESH", account = %self.account, sequence = account.sequence, "sequence loaded");
        self.cache.store(&self.account, account.sequence);
        Ok(account.sequence)
    }

    /// Records that `sequence` was consumed.
    pub fn commit(&self, sequence: i64) {
        self.cache.store(&self.account, sequence);
    }

    /// Drops the cached value; the next lease reloads it.
    pub fn invalidate(&self) {
        self.cache.forget(&self.account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(&7).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(&1).await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(&2)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn idle_slots_are_pruned() {
        let locks = KeyedLocks::<u32>::new();
        for key in 0..100 {
            drop(locks.lock(&key).await.unwrap());
        }
        assert!(locks.len() <= 1);
    }
}
