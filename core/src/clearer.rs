//! Clear-holddown bookkeeping: one cancellation token per alert with a
//! pending clear. Reactivation cancels the token; the holddown task
//! removes its own entry on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Entry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct ClearHolddown {
    active: RwLock<HashMap<i64, Entry>>,
    next_generation: AtomicU64,
}

impl ClearHolddown {
    pub fn new() -> Self {
        ClearHolddown::default()
    }

    /// Register a fresh token for `id`, derived from `parent` so a
    /// shutdown cancels every pending clear. Any prior entry for the
    /// same id is cancelled and replaced; the generation ties the entry
    /// to the task that owns it.
    pub fn add(&self, id: i64, parent: &CancellationToken) -> (CancellationToken, u64) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        let mut active = self.write();
        if let Some(prev) = active.insert(id, Entry { generation, token: token.clone() }) {
            prev.token.cancel();
        }
        (token, generation)
    }

    pub fn get(&self, id: i64) -> Option<CancellationToken> {
        self.read().get(&id).map(|e| e.token.clone())
    }

    /// Remove the entry for `id`, but only if it still belongs to
    /// `generation`; a newer holddown may have replaced it.
    pub fn remove(&self, id: i64, generation: u64) {
        let mut active = self.write();
        if active.get(&id).is_some_and(|e| e.generation == generation) {
            active.remove(&id);
        }
    }

    pub fn pending(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<i64, Entry>> {
        self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, Entry>> {
        self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_overwrites_and_cancels_prior() {
        let clearer = ClearHolddown::new();
        let root = CancellationToken::new();
        let (first, _) = clearer.add(42, &root);
        let (second, _) = clearer.add(42, &root);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(clearer.pending(), 1);
    }

    #[test]
    fn stale_generation_does_not_remove_newer_entry() {
        let clearer = ClearHolddown::new();
        let root = CancellationToken::new();
        let (_, old_generation) = clearer.add(42, &root);
        clearer.add(42, &root);
        clearer.remove(42, old_generation);
        assert_eq!(clearer.pending(), 1);
        let (_, current) = clearer.add(7, &root);
        clearer.remove(7, current);
        assert!(clearer.get(7).is_none());
    }

    #[test]
    fn tokens_inherit_parent_cancellation() {
        let clearer = ClearHolddown::new();
        let root = CancellationToken::new();
        let (token, _) = clearer.add(1, &root);
        root.cancel();
        assert!(token.is_cancelled());
    }
}
