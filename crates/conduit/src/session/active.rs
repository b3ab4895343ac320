use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::SessionKey;

/// Registry of sessions that currently have a run in flight.
///
/// Acquisition is a compare-and-set on one shard; sessions never wait on each
/// other.
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
    runs: Arc<DashMap<SessionKey, Uuid>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` busy for `run_id`, or returns `None` if another run holds it.
    pub fn try_acquire(&self, key: &SessionKey, run_id: Uuid) -> Option<ActiveRunGuard> {
        match self.runs.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(run_id);
                Some(ActiveRunGuard {
                    runs: Arc::clone(&self.runs),
                    key: key.clone(),
                    run_id,
                })
            }
        }
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.runs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Releases the session when dropped, on every exit path of the run.
#[derive(Debug)]
pub struct ActiveRunGuard {
    runs: Arc<DashMap<SessionKey, Uuid>>,
    key: SessionKey,
    run_id: Uuid,
}

impl ActiveRunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        let run_id = self.run_id;
        self.runs.remove_if(&self.key, |_, holder| *holder == run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused_until_release() {
        let active = ActiveRuns::new();
        let key = SessionKey::new("u", "/d");

        let guard = active.try_acquire(&key, Uuid::new_v4()).unwrap();
        assert!(active.is_active(&key));
        assert!(active.try_acquire(&key, Uuid::new_v4()).is_none());

        drop(guard);
        assert!(!active.is_active(&key));
        assert!(active.try_acquire(&key, Uuid::new_v4()).is_some());
    }

    #[test]
    fn test_other_sessions_are_unaffected() {
        let active = ActiveRuns::new();
        let _a = active.try_acquire(&SessionKey::new("u", "/a"), Uuid::new_v4()).unwrap();
        let _b = active.try_acquire(&SessionKey::new("u", "/b"), Uuid::new_v4()).unwrap();
        assert_eq!(active.len(), 2);
    }
}
