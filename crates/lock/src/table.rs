// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::state::ServerLock;
use crate::types::LockId;

type Entry = Arc<Mutex<ServerLock>>;

/// Registry of live locks, one mutex per lock id.
///
/// Entries are created on first use and evicted once clear. Eviction retires the
/// removed entry under the shard lock, so a caller that raced with it retries the lookup.
/// Callbacks run with the lock's mutex held and must not re-enter the table.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: DashMap<LockId, Entry>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `f` inside the critical section of `lock_id`, creating the lock if needed
    pub(crate) fn with_lock<R>(&self, lock_id: &LockId, f: impl FnOnce(&mut ServerLock) -> R) -> R {
        let mut f = Some(f);
        loop {
            let entry = self
                .locks
                .entry(lock_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ServerLock::new(lock_id.clone()))))
                .value()
                .clone();

            if let Some(result) = self.run(lock_id, &entry, &mut f) {
                return result;
            }
        }
    }

    /// Run `f` inside the critical section of `lock_id` if the lock exists
    pub(crate) fn with_existing<R>(&self, lock_id: &LockId, f: impl FnOnce(&mut ServerLock) -> R) -> Option<R> {
        let mut f = Some(f);
        loop {
            let entry = self.locks.get(lock_id)?.value().clone();
            if let Some(result) = self.run(lock_id, &entry, &mut f) {
                return Some(result);
            }
        }
    }

    /// `None` when the entry was retired and the lookup must be retried
    fn run<R, F: FnOnce(&mut ServerLock) -> R>(&self, lock_id: &LockId, entry: &Entry, f: &mut Option<F>) -> Option<R> {
        let mut lock = entry.lock();
        if lock.is_retired() {
            return None;
        }
        lock.ensure_usable();

        let result = f.take().map(|f| f(&mut *lock))?;
        let clear = lock.is_clear();
        drop(lock);

        if clear {
            self.evict_if_clear(lock_id);
        }
        Some(result)
    }

    fn evict_if_clear(&self, lock_id: &LockId) {
        let removed = self.locks.remove_if(lock_id, |_, entry| {
            let mut lock = entry.lock();
            if lock.is_clear() {
                lock.retire();
                true
            } else {
                false
            }
        });
        if removed.is_some() {
            debug!("Evicted lock '{}'", lock_id);
        }
    }

    /// Snapshot of live lock ids in ascending order
    pub(crate) fn sorted_ids(&self) -> Vec<LockId> {
        let mut ids: Vec<LockId> = self.locks.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Apply `f` to every live lock, one critical section at a time, in ascending id order
    pub(crate) fn map_each<R>(&self, mut f: impl FnMut(&ServerLock) -> R) -> Vec<R> {
        let mut entries: Vec<(LockId, Entry)> = self
            .locks
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        entries
            .into_iter()
            .filter_map(|(_, entry)| {
                let lock = entry.lock();
                if lock.is_retired() {
                    return None;
                }
                lock.ensure_usable();
                Some(f(&*lock))
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    /// Retire and drop every entry; dropping waiters aborts their timers
    pub(crate) fn clear(&self) {
        let entries: Vec<Entry> = self.locks.iter().map(|e| e.value().clone()).collect();
        self.locks.clear();
        for entry in entries {
            let mut lock = entry.lock();
            // Replace the state so waiter records (and their timers) are dropped now.
            let lock_id = lock.lock_id().clone();
            *lock = ServerLock::new(lock_id);
            lock.retire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_lock_is_evicted() {
        let table = LockTable::new();
        let id = LockId::new("l");

        let level = table.with_lock(&id, |lock| lock.level());
        assert!(level.is_none());
        // the lock stayed clear, so it was evicted on the way out
        assert_eq!(table.len(), 0);
        assert!(table.with_existing(&id, |lock| lock.has_pending()).is_none());
    }

    #[test]
    fn test_sorted_ids_and_map_each() {
        let table = LockTable::new();
        for id in ["c", "a", "b"] {
            table
                .locks
                .insert(LockId::new(id), Arc::new(Mutex::new(ServerLock::new(LockId::new(id)))));
        }

        let ids = table.sorted_ids();
        assert_eq!(ids, vec![LockId::new("a"), LockId::new("b"), LockId::new("c")]);

        let visited = table.map_each(|lock| lock.lock_id().clone());
        assert_eq!(visited, ids);

        table.clear();
        assert_eq!(table.len(), 0);
    }
}
