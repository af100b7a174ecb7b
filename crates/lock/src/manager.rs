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

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LockManagerConfig;
use crate::deadlock_detector::DeadlockDetector;
use crate::error::{LockError, Result};
use crate::sink::SharedSink;
use crate::state::GrantContext;
use crate::table::LockTable;
use crate::timer::WaitTimer;
use crate::types::{
    ClientId, DeadlockChain, DeadlockResults, LockContext, LockId, LockLevel, LockPolicy, LockResponse, LockView,
    NotifiedWaiters, Requester, RequesterState, WaitContext, WaitSpec,
};

/// Lifecycle state of the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    /// Accepting reestablished state; requests are buffered
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("STARTING"),
            Self::Started => f.write_str("STARTED"),
            Self::Stopping => f.write_str("STOPPING"),
            Self::Stopped => f.write_str("STOPPED"),
        }
    }
}

/// Request held back until the manager starts or a client's reconnect gate opens
struct QueuedRequest {
    lock_id: LockId,
    requester: Requester,
    level: LockLevel,
    sink: SharedSink,
    no_block: bool,
}

pub(crate) struct ManagerInner {
    config: LockManagerConfig,
    table: LockTable,
    /// Ordinary operations hold this shared, `start`/`stop` exclusively
    lifecycle: RwLock<ManagerState>,
    startup_queue: Mutex<Vec<QueuedRequest>>,
    gated: Mutex<HashMap<ClientId, Vec<QueuedRequest>>>,
    gated_count: AtomicUsize,
    policy: RwLock<LockPolicy>,
    timer: WaitTimer,
    scanner: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// Coordinator-side lock manager
///
/// Cheap to clone; clones share the same lock table. All responses to clients are
/// delivered through the [`LockResponseSink`](crate::sink::LockResponseSink) passed
/// with each call.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("state", &self.state())
            .field("policy", &self.policy())
            .field("locks", &self.lock_count())
            .finish()
    }
}

impl LockManager {
    /// Create a manager in the `Starting` state
    pub fn new(config: LockManagerConfig) -> Result<Self> {
        config.validate()?;
        let policy = config.lock_policy;
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| ManagerInner {
            config,
            table: LockTable::new(),
            lifecycle: RwLock::new(ManagerState::Starting),
            startup_queue: Mutex::new(Vec::new()),
            gated: Mutex::new(HashMap::new()),
            gated_count: AtomicUsize::new(0),
            policy: RwLock::new(policy),
            timer: WaitTimer::new(weak.clone()),
            scanner: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.lifecycle.read()
    }

    pub fn policy(&self) -> LockPolicy {
        *self.inner.policy.read()
    }

    fn grant_context(&self, started: bool) -> GrantContext<'_> {
        GrantContext {
            policy: self.policy(),
            timer: &self.inner.timer,
            started,
        }
    }

    // ==================== Lifecycle ====================

    /// `Starting -> Started`: arm deferred timers, grant, replay buffered requests
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.lifecycle.write();
        if *state != ManagerState::Starting {
            return Err(LockError::invalid_state("start", *state));
        }
        *state = ManagerState::Started;

        let ctx = self.grant_context(true);
        for lock_id in self.inner.table.sorted_ids() {
            self.inner.table.with_existing(&lock_id, |lock| lock.notify_started(&ctx));
        }

        let queued = std::mem::take(&mut *self.inner.startup_queue.lock());
        let replayed = queued.len();
        for request in queued {
            if let Some(request) = self.buffer_if_gated(request) {
                self.replay(request);
            }
        }

        if let Some(interval) = self.inner.config.deadlock_scan_interval {
            self.spawn_deadlock_scanner(interval);
        }

        info!(
            "Lock manager started with {} lock(s), replayed {} buffered request(s)",
            self.inner.table.len(),
            replayed
        );
        Ok(())
    }

    /// Stop the manager, dropping all lock state; idempotent
    pub fn stop(&self) {
        let mut state = self.inner.lifecycle.write();
        if matches!(*state, ManagerState::Stopping | ManagerState::Stopped) {
            return;
        }
        *state = ManagerState::Stopping;

        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.timer.shutdown();
        if let Some(scanner) = self.inner.scanner.lock().take() {
            scanner.abort();
        }

        self.inner.table.clear();
        self.inner.startup_queue.lock().clear();
        self.inner.gated.lock().clear();
        self.inner.gated_count.store(0, Ordering::Release);

        *state = ManagerState::Stopped;
        info!("Lock manager stopped");
    }

    pub fn set_lock_policy(&self, policy: LockPolicy) {
        let _lifecycle = self.inner.lifecycle.read();
        let previous = std::mem::replace(&mut *self.inner.policy.write(), policy);
        if previous == policy {
            return;
        }
        info!("Lock policy changed from {:?} to {:?}", previous, policy);

        if policy == LockPolicy::Altruistic {
            for lock_id in self.inner.table.sorted_ids() {
                self.inner.table.with_existing(&lock_id, |lock| lock.recall_greedy());
            }
        }
    }

    // ==================== Requests ====================

    /// Request a lock; `Ok(true)` when granted immediately, otherwise the award arrives
    /// through `sink` later.
    pub fn request_lock(&self, lock_id: &LockId, requester: Requester, level: LockLevel, sink: SharedSink) -> Result<bool> {
        self.request(lock_id, requester, level, sink, false)
    }

    /// Request a lock without queueing; answers `NotAwarded` when it is not grantable now
    pub fn try_request_lock(&self, lock_id: &LockId, requester: Requester, level: LockLevel, sink: SharedSink) -> Result<bool> {
        self.request(lock_id, requester, level, sink, true)
    }

    fn request(&self, lock_id: &LockId, requester: Requester, level: LockLevel, sink: SharedSink, no_block: bool) -> Result<bool> {
        let state = self.inner.lifecycle.read();
        let request = QueuedRequest {
            lock_id: lock_id.clone(),
            requester,
            level,
            sink,
            no_block,
        };

        match *state {
            ManagerState::Starting => {
                debug!("Buffering request of {} for '{}' until start", requester, lock_id);
                self.inner.startup_queue.lock().push(request);
                Ok(false)
            }
            ManagerState::Started => match self.buffer_if_gated(request) {
                Some(request) => self.basic_request(&request),
                None => Ok(false),
            },
            ManagerState::Stopping | ManagerState::Stopped => {
                debug!("Ignoring request of {} for '{}' while {}", requester, lock_id, *state);
                Ok(false)
            }
        }
    }

    fn basic_request(&self, request: &QueuedRequest) -> Result<bool> {
        let ctx = self.grant_context(true);
        self.inner.table.with_lock(&request.lock_id, |lock| {
            lock.request(request.requester, request.level, &request.sink, request.no_block, &ctx)
        })
    }

    /// Replays a buffered request; errors are reported, the caller already got its answer
    fn replay(&self, request: QueuedRequest) {
        if let Err(e) = self.basic_request(&request) {
            warn!("Buffered request of {} for '{}' rejected: {}", request.requester, request.lock_id, e);
        }
    }

    /// Release a hold; unknown locks and non-holders are logged no-ops
    pub fn unlock(&self, lock_id: &LockId, requester: Requester) -> Result<()> {
        let state = self.inner.lifecycle.read();
        match *state {
            ManagerState::Starting => return Err(LockError::invalid_state("unlock", *state)),
            ManagerState::Stopping | ManagerState::Stopped => return Ok(()),
            ManagerState::Started => {}
        }

        let ctx = self.grant_context(true);
        let released = self.inner.table.with_existing(lock_id, |lock| lock.unlock(requester, &ctx));
        if released != Some(true) {
            warn!("Unlock of '{}' by {} which does not hold it", lock_id, requester);
        }
        Ok(())
    }

    // ==================== Wait / notify ====================

    fn require_started(&self, operation: &'static str) -> Result<RwLockReadGuard<'_, ManagerState>> {
        let state = self.inner.lifecycle.read();
        if *state != ManagerState::Started {
            return Err(LockError::invalid_state(operation, *state));
        }
        Ok(state)
    }

    /// Release the lock and park in its wait set
    pub fn wait(&self, lock_id: &LockId, requester: Requester, wait: WaitSpec, sink: SharedSink) -> Result<()> {
        let _state = self.require_started("wait")?;
        let ctx = self.grant_context(true);
        self.inner
            .table
            .with_existing(lock_id, |lock| lock.wait(requester, wait, &sink, &ctx))
            .unwrap_or_else(|| Err(LockError::illegal_monitor_state(lock_id, requester, "lock is not held")))
    }

    /// Move one (or every) waiter to the notified queue, recording it in `notified`
    pub fn notify(&self, lock_id: &LockId, requester: Requester, all: bool, notified: &mut NotifiedWaiters) -> Result<()> {
        let _state = self.require_started("notify")?;
        let ctx = self.grant_context(true);
        self.inner
            .table
            .with_existing(lock_id, |lock| lock.notify(requester, all, notified, &ctx))
            .unwrap_or_else(|| Err(LockError::illegal_monitor_state(lock_id, requester, "lock is not held")))
    }

    /// Remove `requester` from the wait set without granting anything
    pub fn interrupt(&self, lock_id: &LockId, requester: Requester) -> bool {
        let state = self.inner.lifecycle.read();
        if *state != ManagerState::Started {
            debug!("Ignoring interrupt of {} on '{}' while {}", requester, lock_id, *state);
            return false;
        }
        let interrupted = self
            .inner
            .table
            .with_existing(lock_id, |lock| lock.interrupt(requester))
            .unwrap_or(false);
        if !interrupted {
            warn!("Interrupt of {} on '{}' which is not waiting", requester, lock_id);
        }
        interrupted
    }

    pub(crate) fn wait_timeout(&self, lock_id: &LockId, requester: Requester, wait_id: u64) {
        let state = self.inner.lifecycle.read();
        if *state != ManagerState::Started {
            debug!("Ignoring wait timeout of {} on '{}' while {}", requester, lock_id, *state);
            return;
        }
        let ctx = self.grant_context(true);
        self.inner
            .table
            .with_existing(lock_id, |lock| lock.wait_timeout(requester, wait_id, &ctx));
    }

    // ==================== Rebuild ====================

    fn check_reestablish(&self, state: ManagerState, client: ClientId) -> Result<bool> {
        match state {
            ManagerState::Starting => Ok(false),
            ManagerState::Started if self.is_gated(client) => Ok(true),
            _ => Err(LockError::reject_reconnection(
                client,
                format!("no reconnection window open while {state}"),
            )),
        }
    }

    /// Reinstate a hold declared by a reconnecting client
    pub fn reestablish_lock(&self, lock_id: &LockId, requester: Requester, level: LockLevel, sink: SharedSink) -> Result<()> {
        let state = self.inner.lifecycle.read();
        self.check_reestablish(*state, requester.client)?;
        self.inner
            .table
            .with_lock(lock_id, |lock| lock.reestablish_lock(requester, level, &sink))
    }

    /// Reinstate a wait declared by a reconnecting client; its timer starts with the manager
    pub fn reestablish_wait(
        &self,
        lock_id: &LockId,
        requester: Requester,
        level: LockLevel,
        wait: WaitSpec,
        sink: SharedSink,
    ) -> Result<()> {
        let state = self.inner.lifecycle.read();
        let started = self.check_reestablish(*state, requester.client)?;
        let ctx = self.grant_context(started);
        self.inner
            .table
            .with_lock(lock_id, |lock| lock.reestablish_wait(requester, level, wait, &sink, &ctx))
    }

    /// Complete a greedy recall with the client's local holds, waits and pending requests
    pub fn recall_commit(
        &self,
        lock_id: &LockId,
        client: ClientId,
        lock_contexts: &[LockContext],
        wait_contexts: &[WaitContext],
        pending_contexts: &[LockContext],
        sink: SharedSink,
    ) -> Result<()> {
        let state = self.inner.lifecycle.read();
        match *state {
            ManagerState::Starting => return Err(LockError::invalid_state("recall_commit", *state)),
            ManagerState::Stopping | ManagerState::Stopped => return Ok(()),
            ManagerState::Started => {}
        }

        let ctx = self.grant_context(true);
        self.inner.table.with_lock(lock_id, |lock| {
            lock.recall_commit(client, lock_contexts, wait_contexts, pending_contexts, &sink, &ctx)
        })
    }

    /// Purge `client` from every lock, in ascending lock id order; idempotent
    pub fn clear_all_locks_for(&self, client: ClientId) {
        let state = self.inner.lifecycle.read();
        if matches!(*state, ManagerState::Stopping | ManagerState::Stopped) {
            return;
        }

        self.inner
            .startup_queue
            .lock()
            .retain(|r| r.requester.client != client);

        let ctx = self.grant_context(*state == ManagerState::Started);
        let mut purged = 0;
        for lock_id in self.inner.table.sorted_ids() {
            if self
                .inner
                .table
                .with_existing(&lock_id, |lock| lock.purge_client(client, &ctx))
                .unwrap_or(false)
            {
                purged += 1;
            }
        }
        debug!("Cleared {} from {} lock(s)", client, purged);
    }

    // ==================== Reconnect gates ====================

    pub(crate) fn is_gated(&self, client: ClientId) -> bool {
        self.inner.gated_count.load(Ordering::Acquire) > 0 && self.inner.gated.lock().contains_key(&client)
    }

    /// Buffer requests of `client` until its gate is released
    pub(crate) fn open_gate(&self, client: ClientId) {
        let mut gated = self.inner.gated.lock();
        if !gated.contains_key(&client) {
            gated.insert(client, Vec::new());
            self.inner.gated_count.fetch_add(1, Ordering::AcqRel);
            debug!("Requests of {} gated", client);
        }
    }

    /// Release the gate of `client`, replaying its buffered requests in arrival order
    pub(crate) fn release_gate(&self, client: ClientId, replay: bool) {
        let _state = self.inner.lifecycle.read();
        // Held across the replay so later requests of this client queue behind it.
        let mut gated = self.inner.gated.lock();
        let Some(buffered) = gated.remove(&client) else {
            return;
        };
        self.inner.gated_count.fetch_sub(1, Ordering::AcqRel);

        if replay {
            debug!("Replaying {} buffered request(s) of {}", buffered.len(), client);
            for request in buffered {
                self.replay(request);
            }
        } else if !buffered.is_empty() {
            debug!("Discarding {} buffered request(s) of {}", buffered.len(), client);
        }
        drop(gated);
    }

    fn buffer_if_gated(&self, request: QueuedRequest) -> Option<QueuedRequest> {
        if self.inner.gated_count.load(Ordering::Acquire) == 0 {
            return Some(request);
        }
        let mut gated = self.inner.gated.lock();
        match gated.get_mut(&request.requester.client) {
            Some(buffer) => {
                debug!("Buffering request of {} for '{}' until reconnect", request.requester, request.lock_id);
                buffer.push(request);
                None
            }
            None => Some(request),
        }
    }

    /// Ids of locks with any state belonging to `client`
    pub(crate) fn locks_referencing(&self, client: ClientId) -> Vec<LockId> {
        self.inner
            .table
            .map_each(|lock| lock.references(client).then(|| lock.lock_id().clone()))
            .into_iter()
            .flatten()
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn replace_client_state(
        &self,
        lock_id: &LockId,
        previous: ClientId,
        client: ClientId,
        holds: &[LockContext],
        waits: &[WaitContext],
        pending: &[LockContext],
        sink: &SharedSink,
    ) -> Result<()> {
        let state = self.inner.lifecycle.read();
        if matches!(*state, ManagerState::Stopping | ManagerState::Stopped) {
            return Err(LockError::invalid_state("reconcile", *state));
        }
        let ctx = self.grant_context(*state == ManagerState::Started);
        self.inner.table.with_lock(lock_id, |lock| {
            lock.replace_client_state(previous, client, holds, waits, pending, sink, &ctx)
        })
    }

    // ==================== Introspection ====================

    pub fn has_pending(&self, lock_id: &LockId) -> bool {
        self.inner
            .table
            .with_existing(lock_id, |lock| lock.has_pending())
            .unwrap_or(false)
    }

    /// Deliver an `Info` response describing `lock_id` to `sink`
    pub fn query_lock(&self, lock_id: &LockId, requester: Requester, sink: SharedSink) {
        let view = self.lock_view(lock_id).unwrap_or_else(|| LockView {
            lock_id: lock_id.clone(),
            level: None,
            holders: Vec::new(),
            notified: Vec::new(),
            upgrades: Vec::new(),
            pending: Vec::new(),
            waiters: Vec::new(),
            recalled: false,
        });
        sink.deliver(LockResponse::Info { requester, view });
    }

    pub fn lock_view(&self, lock_id: &LockId) -> Option<LockView> {
        self.inner.table.with_existing(lock_id, |lock| lock.view())
    }

    /// Views of every live lock in ascending id order
    pub fn all_locks(&self) -> Vec<LockView> {
        self.inner.table.map_each(|lock| lock.view())
    }

    pub fn lock_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn requester_state(&self, lock_id: &LockId, requester: Requester) -> RequesterState {
        self.inner
            .table
            .with_existing(lock_id, |lock| lock.requester_state(&requester))
            .unwrap_or(RequesterState::Unrequested)
    }

    // ==================== Deadlock detection ====================

    /// Scan a snapshot of the wait-for graph, reporting each cycle to `results`
    pub fn scan_for_deadlocks(&self, results: &mut impl DeadlockResults) -> usize {
        let mut detector = DeadlockDetector::new();
        for snapshot in self.inner.table.map_each(|lock| lock.snapshot()) {
            detector.add_snapshot(&snapshot);
        }
        detector.detect(results)
    }

    pub fn deadlock_chains(&self) -> Vec<DeadlockChain> {
        let mut chains = Vec::new();
        self.scan_for_deadlocks(&mut chains);
        chains
    }

    fn spawn_deadlock_scanner(&self, period: Duration) {
        let Ok(handle) = Handle::try_current() else {
            warn!("No tokio runtime available, periodic deadlock scan disabled");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                for chain in LockManager::from_inner(inner).deadlock_chains() {
                    warn!("Deadlock detected: {}", chain);
                }
            }
        });

        if let Some(previous) = self.inner.scanner.lock().replace(task) {
            previous.abort();
        }
    }
}
