use camper_core::AccountId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

pub type EntityGuard = OwnedMutexGuard<()>;

const PRUNE_THRESHOLD: usize = 1024;

/// Per-entity async locks. Mutations of one order, contract or account are
/// serialized; different entities proceed in parallel.
///
/// Acquisition order when several are needed: order, then contract, then
/// account.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: String) -> EntityGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots.len() > PRUNE_THRESHOLD {
                // Only the map holds these: nobody is waiting or locked.
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(key).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub async fn order(&self, id: Uuid) -> EntityGuard {
        self.lock(format!("order:{}", id)).await
    }

    pub async fn contract(&self, id: Uuid) -> EntityGuard {
        self.lock(format!("contract:{}", id)).await
    }

    pub async fn account(&self, id: &AccountId) -> EntityGuard {
        self.lock(format!("account:{}", id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.order(id).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.order(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.order(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }
}
