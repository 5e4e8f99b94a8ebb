//! Subtree locking for tree mutations
//!
//! Mutations that share a top-level folder are serialized: a lock is held
//! from the disk step through the index step and the activity write, so two
//! requests can never interleave their disk and index halves inside one
//! subtree. Operations spanning two subtrees (moves) take both locks in
//! sorted order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::paths;

/// Lock key for entries directly under the root
const ROOT_KEY: &str = "";

/// Per-top-level-folder exclusive locks
#[derive(Default)]
pub struct SubtreeLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held locks; released on drop
pub struct SubtreeGuard {
    keys: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl SubtreeGuard {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl SubtreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock key governing a canonical path
    pub fn key_for(path: &str) -> String {
        paths::top_segment(path).unwrap_or(ROOT_KEY).to_string()
    }

    /// Lock every subtree touched by `targets`
    pub async fn acquire<'a, I>(&self, targets: I) -> SubtreeGuard
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keys: BTreeSet<String> = targets.into_iter().map(Self::key_for).collect();

        let slots: Vec<Arc<Mutex<()>>> = {
            let mut map = self.slots.lock().await;
            // Holders and waiters keep a clone; a slot only the map owns is idle
            map.retain(|_, slot| Arc::strong_count(slot) > 1);
            keys.iter()
                .map(|key| {
                    Arc::clone(
                        map.entry(key.clone())
                            .or_insert_with(|| Arc::new(Mutex::new(()))),
                    )
                })
                .collect()
        };

        let mut guards = Vec::with_capacity(slots.len());
        for (slot, key) in slots.into_iter().zip(keys.iter()) {
            debug!(subtree = %key, "Waiting for subtree lock");
            guards.push(slot.lock_owned().await);
        }

        SubtreeGuard {
            keys: keys.into_iter().collect(),
            _guards: guards,
        }
    }

    /// Lock for a single path
    pub async fn acquire_one(&self, path: &str) -> SubtreeGuard {
        self.acquire([path]).await
    }

    /// Number of lock slots currently allocated
    pub async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}
