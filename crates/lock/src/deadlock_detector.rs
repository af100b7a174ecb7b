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

use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

use crate::types::{DeadlockChain, DeadlockLink, DeadlockResults, LockId, Requester};

/// Holder identities and blocked requesters of one lock, copied out of its critical section
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LockSnapshot {
    pub(crate) lock_id: LockId,
    pub(crate) holders: Vec<Requester>,
    /// Notified, upgrade and pending requesters followed by waiters
    pub(crate) blocked: Vec<Requester>,
}

/// Deadlock detector over a wait-for graph
///
/// An edge `waiter -> holder` labelled with a lock exists when `waiter` is queued or
/// waiting on that lock while `holder` holds it.
#[derive(Debug, Default)]
pub struct DeadlockDetector {
    /// Wait graph: waiter -> (holder, lock) edges
    wait_graph: BTreeMap<Requester, BTreeSet<(Requester, LockId)>>,
    /// Detection statistics
    detection_count: usize,
}

impl DeadlockDetector {
    /// Create new deadlock detector
    pub fn new() -> Self {
        Self::default()
    }

    /// Add wait relationship
    pub fn add_wait_relationship(&mut self, waiter: Requester, lock_id: &LockId, holder: Requester) {
        if waiter == holder {
            return;
        }
        self.wait_graph
            .entry(waiter)
            .or_default()
            .insert((holder, lock_id.clone()));
    }

    /// Add every edge contributed by one lock
    pub fn add_lock(&mut self, lock_id: &LockId, holders: &[Requester], blocked: &[Requester]) {
        for waiter in blocked {
            for holder in holders {
                self.add_wait_relationship(*waiter, lock_id, *holder);
            }
        }
    }

    pub(crate) fn add_snapshot(&mut self, snapshot: &LockSnapshot) {
        self.add_lock(&snapshot.lock_id, &snapshot.holders, &snapshot.blocked);
    }

    pub fn edge_count(&self) -> usize {
        self.wait_graph.values().map(BTreeSet::len).sum()
    }

    /// Detect deadlock
    ///
    /// Reports every elementary cycle once, starting from its smallest requester.
    pub fn detect(&mut self, results: &mut impl DeadlockResults) -> usize {
        self.detection_count += 1;

        let mut reported: HashSet<Vec<Requester>> = HashSet::new();
        let mut found = 0;

        for start in self.wait_graph.keys() {
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            on_path.insert(*start);

            let mut cycles = Vec::new();
            self.dfs_cycles(start, start, &mut path, &mut on_path, &mut cycles);

            for links in cycles {
                let key: Vec<Requester> = links.iter().map(|l| l.waiter).collect();
                if reported.insert(key) {
                    found += 1;
                    results.found_deadlock(DeadlockChain { links });
                }
            }
        }

        debug!(
            "Deadlock scan #{} over {} requesters found {} cycle(s)",
            self.detection_count,
            self.wait_graph.len(),
            found
        );
        found
    }

    /// Depth-first search for cycles back to `start` through nodes ordered after it
    fn dfs_cycles(
        &self,
        start: &Requester,
        node: &Requester,
        path: &mut Vec<DeadlockLink>,
        on_path: &mut HashSet<Requester>,
        cycles: &mut Vec<Vec<DeadlockLink>>,
    ) {
        let Some(edges) = self.wait_graph.get(node) else {
            return;
        };

        for (holder, lock_id) in edges {
            let link = DeadlockLink {
                waiter: *node,
                waiting_on: lock_id.clone(),
                blocked_by: *holder,
            };

            if holder == start {
                let mut cycle = path.clone();
                cycle.push(link);
                cycles.push(cycle);
            } else if holder > start && !on_path.contains(holder) {
                path.push(link);
                on_path.insert(*holder);
                self.dfs_cycles(start, holder, path, on_path, cycles);
                on_path.remove(holder);
                path.pop();
            }
        }
    }

    /// Get detection statistics
    pub fn detection_count(&self) -> usize {
        self.detection_count
    }

    /// Reset detector
    pub fn reset(&mut self) {
        self.wait_graph.clear();
        self.detection_count = 0;
        debug!("Deadlock detector reset");
    }
}
