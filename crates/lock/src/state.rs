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

//! State of a single lock: holders, the three grant queues and the wait set.
//!
//! Every method runs inside the lock's critical section. Mutating methods re-check
//! the structural invariants before returning; a violation marks the lock corrupted
//! and panics, and any later access to a corrupted lock panics again.

use std::collections::VecDeque;
use std::time::SystemTime;
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::deadlock_detector::LockSnapshot;
use crate::error::{LockError, Result};
use crate::sink::SharedSink;
use crate::timer::WaitTimer;
use crate::types::{
    ClientId, LockContext, LockHolder, LockId, LockLevel, LockPolicy, LockResponse, LockView, NotifiedWaiters, Requester,
    RequesterState, ServerLockRequest, WaitContext, WaitSpec, Waiter,
};

/// Manager-wide parameters a grant decision depends on
pub(crate) struct GrantContext<'a> {
    pub(crate) policy: LockPolicy,
    pub(crate) timer: &'a WaitTimer,
    /// Grants and wait timers are deferred until the manager has started
    pub(crate) started: bool,
}

impl GrantContext<'_> {
    fn is_greedy(&self) -> bool {
        self.policy == LockPolicy::Greedy
    }
}

struct Holder {
    requester: Requester,
    level: LockLevel,
    greedy: bool,
    acquired_at: SystemTime,
    sink: SharedSink,
}

struct Request {
    requester: Requester,
    level: LockLevel,
    requested_at: SystemTime,
    sink: SharedSink,
}

impl Request {
    fn new(requester: Requester, level: LockLevel, sink: SharedSink) -> Self {
        Self {
            requester,
            level,
            requested_at: SystemTime::now(),
            sink,
        }
    }

    fn view(&self) -> ServerLockRequest {
        ServerLockRequest {
            requester: self.requester,
            level: self.level,
            requested_at: self.requested_at,
        }
    }
}

struct WaitEntry {
    requester: Requester,
    level: LockLevel,
    wait: WaitSpec,
    started_at: SystemTime,
    sink: SharedSink,
    wait_id: u64,
    timer: Option<AbortHandle>,
}

impl Drop for WaitEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Level held after granting `b` on top of an existing hold at `a`
fn combine(a: LockLevel, b: LockLevel) -> LockLevel {
    if a == b { a } else { LockLevel::Upgrade }
}

pub(crate) struct ServerLock {
    lock_id: LockId,
    holders: Vec<Holder>,
    notified: VecDeque<Request>,
    upgrades: VecDeque<Request>,
    pending: VecDeque<Request>,
    waiters: VecDeque<WaitEntry>,
    recalled: bool,
    retired: bool,
    corrupted: bool,
}

impl ServerLock {
    pub(crate) fn new(lock_id: LockId) -> Self {
        Self {
            lock_id,
            holders: Vec::new(),
            notified: VecDeque::new(),
            upgrades: VecDeque::new(),
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
            recalled: false,
            retired: false,
            corrupted: false,
        }
    }

    pub(crate) fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    /// No holders, no queued requests and no waiters
    pub(crate) fn is_clear(&self) -> bool {
        self.holders.is_empty() && !self.has_pending() && self.waiters.is_empty()
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn ensure_usable(&self) {
        if self.corrupted {
            panic!("lock '{}' is corrupted and can no longer be used", self.lock_id);
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.notified.is_empty() || !self.upgrades.is_empty() || !self.pending.is_empty()
    }

    /// Effective level of the lock, `None` when unheld
    pub(crate) fn level(&self) -> Option<LockLevel> {
        if let Some(writer) = self.holders.iter().find(|h| h.level.is_write()) {
            return Some(writer.level);
        }
        (!self.holders.is_empty()).then_some(LockLevel::Read)
    }

    fn holder(&self, requester: &Requester) -> Option<&Holder> {
        self.holders.iter().find(|h| &h.requester == requester)
    }

    fn holder_index(&self, requester: &Requester) -> Option<usize> {
        self.holders.iter().position(|h| &h.requester == requester)
    }

    fn is_waiting(&self, requester: &Requester) -> bool {
        self.waiters.iter().any(|w| &w.requester == requester)
    }

    fn is_queued(&self, requester: &Requester) -> bool {
        self.pending.iter().chain(self.notified.iter()).any(|r| &r.requester == requester)
    }

    fn has_upgrade_request(&self, requester: &Requester) -> bool {
        self.upgrades.iter().any(|r| &r.requester == requester)
    }

    fn has_write_holder(&self) -> bool {
        self.holders.iter().any(|h| h.level.is_write())
    }

    fn has_greedy_holders(&self) -> bool {
        self.holders.iter().any(|h| h.greedy)
    }

    fn greedy_holder(&self, client: ClientId) -> Option<&Holder> {
        self.holders.iter().find(|h| h.greedy && h.requester.client == client)
    }

    /// Whether any holder, queued request or waiter belongs to `client`
    pub(crate) fn references(&self, client: ClientId) -> bool {
        self.holders.iter().any(|h| h.requester.client == client)
            || self
                .notified
                .iter()
                .chain(self.upgrades.iter())
                .chain(self.pending.iter())
                .any(|r| r.requester.client == client)
            || self.waiters.iter().any(|w| w.requester.client == client)
    }

    pub(crate) fn requester_state(&self, requester: &Requester) -> RequesterState {
        if self.is_waiting(requester) {
            RequesterState::Waiting
        } else if self.has_upgrade_request(requester) {
            RequesterState::PendingUpgrade
        } else if self.holder(requester).is_some() {
            RequesterState::Held
        } else if self.is_queued(requester) {
            RequesterState::Pending
        } else {
            RequesterState::Unrequested
        }
    }

    // ==================== Requests ====================

    pub(crate) fn request(
        &mut self,
        requester: Requester,
        level: LockLevel,
        sink: &SharedSink,
        no_block: bool,
        ctx: &GrantContext<'_>,
    ) -> Result<bool> {
        if self.is_waiting(&requester) {
            return Err(LockError::AlreadyWaiting {
                lock_id: self.lock_id.clone(),
                requester,
            });
        }

        let upgrading = match self.holder(&requester).map(|h| h.level) {
            Some(LockLevel::Read) if level.is_write() => true,
            Some(_) => {
                return Err(LockError::AlreadyHeld {
                    lock_id: self.lock_id.clone(),
                    requester,
                });
            }
            None => false,
        };

        if ctx.is_greedy() && !upgrading {
            if let Some(greedy) = self.greedy_holder(requester.client) {
                if greedy.level.is_write() || greedy.level == level {
                    debug!(
                        "{} holds '{}' greedily at {}, {} request from {} is granted locally",
                        requester.client, self.lock_id, greedy.level, level, requester
                    );
                    return Ok(false);
                }
            }
        }

        if self.can_grant(&requester, level, upgrading) {
            if ctx.is_greedy() && !upgrading && (level == LockLevel::Read || self.waiters.is_empty()) {
                self.award_greedy(requester.client, level, sink);
            } else {
                self.award(requester, level, sink);
            }
            self.verify();
            return Ok(true);
        }

        if no_block {
            debug!("Try-lock of '{}' by {} at {} not grantable", self.lock_id, requester, level);
            sink.deliver(LockResponse::NotAwarded {
                lock_id: self.lock_id.clone(),
                requester,
                level,
            });
            return Ok(false);
        }

        if ctx.is_greedy() {
            self.recall(level);
        }
        if self.greedy_holder(requester.client).is_none() {
            self.enqueue(requester, level, sink);
        } else {
            debug!(
                "{} holds '{}' greedily, {} request from {} will arrive with its recall commit",
                requester.client, self.lock_id, level, requester
            );
        }

        self.verify();
        Ok(false)
    }

    fn can_grant(&self, requester: &Requester, level: LockLevel, upgrading: bool) -> bool {
        if upgrading {
            return self.holders.len() == 1 && self.holders[0].requester == *requester;
        }
        if self.recalled || self.has_pending() {
            return false;
        }
        self.holders.is_empty() || (level == LockLevel::Read && !self.has_write_holder())
    }

    /// Whether the head of a grant queue at `level` can be granted now
    fn compatible(&self, level: LockLevel) -> bool {
        if self.holders.is_empty() {
            return true;
        }
        !self.recalled && !level.is_write() && !self.has_write_holder()
    }

    fn enqueue(&mut self, requester: Requester, level: LockLevel, sink: &SharedSink) {
        match self.holder(&requester).map(|h| h.level) {
            Some(LockLevel::Read) if level.is_write() => {
                if self.has_upgrade_request(&requester) {
                    debug!("Duplicate upgrade request from {} on '{}' ignored", requester, self.lock_id);
                } else {
                    self.upgrades.push_back(Request::new(requester, level, sink.clone()));
                }
            }
            Some(held) => {
                debug!("{} already holds '{}' at {}, {} request ignored", requester, self.lock_id, held, level);
            }
            None if self.is_queued(&requester) => {
                debug!("Duplicate lock request from {} on '{}' ignored", requester, self.lock_id);
            }
            None => {
                debug!("{} queued for '{}' at {}", requester, self.lock_id, level);
                self.pending.push_back(Request::new(requester, level, sink.clone()));
            }
        }
    }

    /// Records a hold, merging with an existing hold of the same requester
    fn add_holder(&mut self, requester: Requester, level: LockLevel, greedy: bool, sink: SharedSink) -> LockLevel {
        self.pending.retain(|r| r.requester != requester);
        self.notified.retain(|r| r.requester != requester);

        let held = match self.holder_index(&requester) {
            Some(index) => {
                let holder = &mut self.holders[index];
                holder.level = combine(holder.level, level);
                holder.greedy |= greedy;
                holder.sink = sink;
                holder.level
            }
            None => {
                self.holders.push(Holder {
                    requester,
                    level,
                    greedy,
                    acquired_at: SystemTime::now(),
                    sink,
                });
                level
            }
        };

        if held.is_write() {
            self.upgrades.retain(|r| r.requester != requester);
        }
        held
    }

    fn award(&mut self, requester: Requester, level: LockLevel, sink: &SharedSink) {
        let held = self.add_holder(requester, level, false, sink.clone());
        debug!("Awarded '{}' to {} at {} (holding {})", self.lock_id, requester, level, held);
        sink.deliver(LockResponse::Award {
            lock_id: self.lock_id.clone(),
            requester,
            level,
            greedy: false,
        });
    }

    /// Hands the lock to the whole client, subsuming its own holds and covered requests
    fn award_greedy(&mut self, client: ClientId, level: LockLevel, sink: &SharedSink) {
        let covered = |r: &Request| r.requester.client == client && (level.is_write() || r.level == level);
        self.holders.retain(|h| h.requester.client != client);
        self.pending.retain(|r| !covered(r));
        self.notified.retain(|r| !covered(r));
        self.upgrades.retain(|r| r.requester.client != client);

        let vm = Requester::vm(client);
        self.add_holder(vm, level, true, sink.clone());
        debug!("Awarded '{}' greedily to {} at {}", self.lock_id, client, level);
        sink.deliver(LockResponse::Award {
            lock_id: self.lock_id.clone(),
            requester: vm,
            level,
            greedy: true,
        });
    }

    fn recall(&mut self, level: LockLevel) {
        if self.recalled || !self.has_greedy_holders() {
            return;
        }
        for holder in self.holders.iter().filter(|h| h.greedy) {
            debug!("Recalling '{}' from {}", self.lock_id, holder.requester.client);
            holder.sink.deliver(LockResponse::Recall {
                lock_id: self.lock_id.clone(),
                client: holder.requester.client,
                level,
            });
        }
        self.recalled = true;
    }

    /// Recalls every greedy hold, used when the policy turns altruistic
    pub(crate) fn recall_greedy(&mut self) {
        self.recall(LockLevel::Write);
        self.verify();
    }

    /// Grants queue heads in priority order: notified, upgrades, then FIFO pending
    fn run_grants(&mut self, ctx: &GrantContext<'_>) {
        loop {
            if let Some(level) = self.notified.front().map(|r| r.level) {
                if self.compatible(level) {
                    if let Some(request) = self.notified.pop_front() {
                        self.award(request.requester, request.level, &request.sink);
                    }
                    continue;
                }
                // Only the upgrader's own read hold is in the way; it cannot release while blocked.
                if !self.sole_holder_upgrading() {
                    break;
                }
            }

            if let Some(requester) = self.upgrades.front().map(|r| r.requester) {
                match self.holder(&requester).map(|h| h.level) {
                    Some(LockLevel::Read) if self.holders.len() == 1 => {
                        if let Some(request) = self.upgrades.pop_front() {
                            self.award(request.requester, LockLevel::Write, &request.sink);
                        }
                        continue;
                    }
                    Some(LockLevel::Read) => break,
                    _ => {
                        debug!("Dropping stale upgrade request of {} on '{}'", requester, self.lock_id);
                        self.upgrades.pop_front();
                        continue;
                    }
                }
            }

            let Some(level) = self.pending.front().map(|r| r.level) else {
                break;
            };
            if !self.compatible(level) {
                break;
            }
            let greedy = ctx.is_greedy() && self.greedy_grantable();
            if let Some(request) = self.pending.pop_front() {
                if greedy {
                    self.award_greedy(request.requester.client, request.level, &request.sink);
                } else {
                    self.award(request.requester, request.level, &request.sink);
                }
            }
        }
    }

    /// The head of the upgrade queue is the only holder, at read level
    fn sole_holder_upgrading(&self) -> bool {
        match (self.upgrades.front(), self.holders.as_slice()) {
            (Some(upgrade), [holder]) => holder.requester == upgrade.requester && holder.level == LockLevel::Read,
            _ => false,
        }
    }

    /// Pending head is a write, every pending request is from one client and nobody waits
    fn greedy_grantable(&self) -> bool {
        let Some(head) = self.pending.front() else {
            return false;
        };
        head.level.is_write()
            && self.waiters.is_empty()
            && self.pending.iter().all(|r| r.requester.client == head.requester.client)
    }

    // ==================== Release ====================

    /// Releases the hold of `requester`; an upgraded hold drops back to read
    pub(crate) fn unlock(&mut self, requester: Requester, ctx: &GrantContext<'_>) -> bool {
        let Some(index) = self.holder_index(&requester) else {
            return false;
        };

        let holder = &mut self.holders[index];
        if holder.level.is_upgrade() {
            holder.level = LockLevel::Read;
            debug!("{} downgraded '{}' to READ", requester, self.lock_id);
        } else {
            self.holders.remove(index);
            self.upgrades.retain(|r| r.requester != requester);
            debug!("{} released '{}'", requester, self.lock_id);
        }

        if !self.has_greedy_holders() {
            self.recalled = false;
        }
        if ctx.started {
            self.run_grants(ctx);
        }
        self.verify();
        true
    }

    // ==================== Wait / notify ====================

    /// Level of `requester`'s hold if it is the monitor owner
    fn check_monitor_owner(&self, requester: Requester) -> Result<LockLevel> {
        if self.is_waiting(&requester) {
            return Err(LockError::illegal_monitor_state(&self.lock_id, requester, "requester is in the wait set"));
        }
        let Some(holder) = self.holder(&requester) else {
            return Err(LockError::illegal_monitor_state(&self.lock_id, requester, "not the lock holder"));
        };
        if self.holders.len() != 1 {
            return Err(LockError::illegal_monitor_state(
                &self.lock_id,
                requester,
                format!("invalid holder set size: {}", self.holders.len()),
            ));
        }
        if !holder.level.is_write() {
            return Err(LockError::illegal_monitor_state(
                &self.lock_id,
                requester,
                format!("incorrect lock level: {}", holder.level),
            ));
        }
        Ok(holder.level)
    }

    fn push_waiter(&mut self, requester: Requester, level: LockLevel, wait: WaitSpec, sink: SharedSink, ctx: &GrantContext<'_>) {
        let wait_id = ctx.timer.next_wait_id();
        let timer = match wait.timeout {
            Some(timeout) if ctx.started => ctx.timer.schedule(&self.lock_id, requester, wait_id, timeout),
            _ => None,
        };
        self.waiters.push_back(WaitEntry {
            requester,
            level,
            wait,
            started_at: SystemTime::now(),
            sink,
            wait_id,
            timer,
        });
    }

    pub(crate) fn wait(&mut self, requester: Requester, wait: WaitSpec, sink: &SharedSink, ctx: &GrantContext<'_>) -> Result<()> {
        let level = self.check_monitor_owner(requester)?;

        self.holders.retain(|h| h.requester != requester);
        if !self.has_greedy_holders() {
            self.recalled = false;
        }
        self.push_waiter(requester, level, wait, sink.clone(), ctx);
        debug!("{} waiting on '{}' after releasing {}", requester, self.lock_id, level);

        if ctx.started {
            self.run_grants(ctx);
        }
        self.verify();
        Ok(())
    }

    pub(crate) fn notify(
        &mut self,
        requester: Requester,
        all: bool,
        out: &mut NotifiedWaiters,
        ctx: &GrantContext<'_>,
    ) -> Result<()> {
        self.check_monitor_owner(requester)?;

        let count = if all { self.waiters.len() } else { self.waiters.len().min(1) };
        let woken: Vec<WaitEntry> = self.waiters.drain(..count).collect();
        for waiter in &woken {
            out.add(LockContext::new(self.lock_id.clone(), waiter.requester, waiter.level));
            self.notified
                .push_back(Request::new(waiter.requester, waiter.level, waiter.sink.clone()));
        }
        drop(woken);

        if count > 0 {
            debug!("{} notified {} waiter(s) of '{}'", requester, count, self.lock_id);
            if ctx.is_greedy() {
                self.recall(LockLevel::Write);
            }
        }
        self.verify();
        Ok(())
    }

    pub(crate) fn interrupt(&mut self, requester: Requester) -> bool {
        let Some(index) = self.waiters.iter().position(|w| w.requester == requester) else {
            return false;
        };
        self.waiters.remove(index);
        debug!("{} interrupted while waiting on '{}'", requester, self.lock_id);
        self.verify();
        true
    }

    /// Expires the wait identified by `wait_id`; stale ids are ignored
    pub(crate) fn wait_timeout(&mut self, requester: Requester, wait_id: u64, ctx: &GrantContext<'_>) -> bool {
        let Some(index) = self
            .waiters
            .iter()
            .position(|w| w.requester == requester && w.wait_id == wait_id)
        else {
            debug!("Ignoring stale wait timeout of {} on '{}'", requester, self.lock_id);
            return false;
        };
        let Some(mut waiter) = self.waiters.remove(index) else {
            return false;
        };
        // Running inside this timer's own task.
        waiter.timer.take();

        let level = waiter.level;
        waiter.sink.deliver(LockResponse::WaitTimeout {
            lock_id: self.lock_id.clone(),
            requester,
            level,
        });

        if self.holders.is_empty() {
            if ctx.is_greedy() && self.waiters.is_empty() && !level.is_upgrade() {
                self.award_greedy(requester.client, level, &waiter.sink);
            } else {
                self.award(requester, level, &waiter.sink);
            }
        } else {
            debug!("Wait of {} on '{}' timed out while held, queued as notified", requester, self.lock_id);
            self.notified.push_back(Request::new(requester, level, waiter.sink.clone()));
            if ctx.is_greedy() {
                self.recall(level);
            }
        }

        self.verify();
        true
    }

    /// Arms timers deferred while starting and grants whatever became grantable
    pub(crate) fn notify_started(&mut self, ctx: &GrantContext<'_>) {
        for waiter in self.waiters.iter_mut() {
            if waiter.timer.is_some() {
                continue;
            }
            if let Some(timeout) = waiter.wait.timeout {
                waiter.timer = ctx.timer.schedule(&self.lock_id, waiter.requester, waiter.wait_id, timeout);
            }
        }
        self.run_grants(ctx);
        self.verify();
    }

    // ==================== Rebuild ====================

    /// Conflict with holders other than `requester` and those matched by `ignore`
    fn hold_conflict(&self, requester: Requester, level: LockLevel, ignore: impl Fn(&Requester) -> bool) -> Option<String> {
        self.holders
            .iter()
            .filter(|h| h.requester != requester && !ignore(&h.requester))
            .find(|h| level.is_write() || h.level.is_write())
            .map(|h| format!("{} holds it at {}", h.requester, h.level))
    }

    /// Conflicts among a set of declared holds
    fn declared_conflict(&self, holds: &[LockContext]) -> Result<()> {
        for (i, hold) in holds.iter().enumerate() {
            if let Some(other) = holds[..i]
                .iter()
                .find(|o| o.requester != hold.requester && (o.level.is_write() || hold.level.is_write()))
            {
                return Err(LockError::reestablish_conflict(
                    &self.lock_id,
                    hold.requester,
                    format!("declared {} hold conflicts with declared {} hold of {}", hold.level, other.level, other.requester),
                ));
            }
        }
        Ok(())
    }

    fn validate_holds(&self, holds: &[LockContext], ignore: impl Fn(&Requester) -> bool) -> Result<()> {
        for hold in holds {
            if let Some(reason) = self.hold_conflict(hold.requester, hold.level, &ignore) {
                return Err(LockError::reestablish_conflict(&self.lock_id, hold.requester, reason));
            }
        }
        self.declared_conflict(holds)
    }

    /// A requester is declared in at most one of holding, waiting and pending-while-waiting
    fn validate_declared(&self, holds: &[LockContext], waits: &[WaitContext], pending: &[LockContext]) -> Result<()> {
        for wait in waits {
            if holds.iter().any(|h| h.requester == wait.requester) {
                return Err(LockError::reestablish_conflict(
                    &self.lock_id,
                    wait.requester,
                    "declared as both holder and waiter",
                ));
            }
            if pending.iter().any(|p| p.requester == wait.requester) {
                return Err(LockError::reestablish_conflict(
                    &self.lock_id,
                    wait.requester,
                    "declared as both waiter and pending",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn reestablish_lock(&mut self, requester: Requester, level: LockLevel, sink: &SharedSink) -> Result<()> {
        if self.is_waiting(&requester) {
            return Err(LockError::reestablish_conflict(&self.lock_id, requester, "requester is in the wait set"));
        }

        let current = self.holder(&requester).map(|h| h.level);
        let target = current.map_or(level, |held| combine(held, level));
        if current == Some(target) {
            debug!("Hold of {} on '{}' at {} already reestablished", requester, self.lock_id, target);
            return Ok(());
        }
        if let Some(reason) = self.hold_conflict(requester, target, |_| false) {
            return Err(LockError::reestablish_conflict(&self.lock_id, requester, reason));
        }

        self.add_holder(requester, level, requester.is_vm(), sink.clone());
        debug!("Reestablished {} hold of {} on '{}'", level, requester, self.lock_id);
        self.verify();
        Ok(())
    }

    pub(crate) fn reestablish_wait(
        &mut self,
        requester: Requester,
        level: LockLevel,
        wait: WaitSpec,
        sink: &SharedSink,
        ctx: &GrantContext<'_>,
    ) -> Result<()> {
        if let Some(existing) = self.waiters.iter().find(|w| w.requester == requester) {
            if existing.level == level && existing.wait == wait {
                return Ok(());
            }
            return Err(LockError::reestablish_conflict(
                &self.lock_id,
                requester,
                "already waiting with a different wait",
            ));
        }
        if self.holder(&requester).is_some() {
            return Err(LockError::reestablish_conflict(&self.lock_id, requester, "requester holds the lock"));
        }

        self.push_waiter(requester, level, wait, sink.clone(), ctx);
        debug!("Reestablished wait of {} on '{}'", requester, self.lock_id);
        self.verify();
        Ok(())
    }

    /// Completes a greedy recall with the client's declared local state
    pub(crate) fn recall_commit(
        &mut self,
        client: ClientId,
        holds: &[LockContext],
        waits: &[WaitContext],
        pending: &[LockContext],
        sink: &SharedSink,
        ctx: &GrantContext<'_>,
    ) -> Result<()> {
        self.validate_holds(holds, |r| r.client == client)?;
        self.validate_declared(holds, waits, pending)?;
        if let Some(hold) = holds.iter().find(|h| self.is_waiting(&h.requester)) {
            return Err(LockError::reestablish_conflict(
                &self.lock_id,
                hold.requester,
                "declared hold of a requester in the wait set",
            ));
        }

        for hold in holds {
            self.add_holder(hold.requester, hold.level, false, sink.clone());
        }
        for wait in waits {
            if self.is_waiting(&wait.requester) || self.is_queued(&wait.requester) || self.holder(&wait.requester).is_some() {
                continue;
            }
            self.push_waiter(wait.requester, wait.level, wait.wait, sink.clone(), ctx);
        }
        // A declared read hold with a pending write lands in the upgrade queue.
        for request in pending {
            if self.is_waiting(&request.requester) {
                continue;
            }
            self.enqueue(request.requester, request.level, sink);
        }

        let vm = Requester::vm(client);
        self.holders.retain(|h| h.requester != vm);
        if !self.has_greedy_holders() {
            self.recalled = false;
        }
        debug!(
            "{} committed recall of '{}': {} hold(s), {} wait(s), {} pending",
            client,
            self.lock_id,
            holds.len(),
            waits.len(),
            pending.len()
        );

        if ctx.started {
            self.run_grants(ctx);
        }
        self.verify();
        Ok(())
    }

    /// Replaces everything `previous` had on this lock with the state `client` declares
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn replace_client_state(
        &mut self,
        previous: ClientId,
        client: ClientId,
        holds: &[LockContext],
        waits: &[WaitContext],
        pending: &[LockContext],
        sink: &SharedSink,
        ctx: &GrantContext<'_>,
    ) -> Result<()> {
        self.validate_holds(holds, |r| r.client == previous || r.client == client)?;
        self.validate_declared(holds, waits, pending)?;

        self.remove_client(previous);
        if client != previous {
            self.remove_client(client);
        }

        for hold in holds {
            self.add_holder(hold.requester, hold.level, hold.requester.is_vm(), sink.clone());
        }
        for wait in waits {
            if !self.is_waiting(&wait.requester) && self.holder(&wait.requester).is_none() {
                self.push_waiter(wait.requester, wait.level, wait.wait, sink.clone(), ctx);
            }
        }
        for request in pending {
            self.enqueue(request.requester, request.level, sink);
        }

        if ctx.started {
            self.run_grants(ctx);
        }
        self.verify();
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.holders.len() + self.notified.len() + self.upgrades.len() + self.pending.len() + self.waiters.len()
    }

    fn remove_client(&mut self, client: ClientId) -> bool {
        let before = self.entry_count();
        self.holders.retain(|h| h.requester.client != client);
        self.notified.retain(|r| r.requester.client != client);
        self.upgrades.retain(|r| r.requester.client != client);
        self.pending.retain(|r| r.requester.client != client);
        self.waiters.retain(|w| w.requester.client != client);
        if !self.has_greedy_holders() {
            self.recalled = false;
        }
        before != self.entry_count()
    }

    /// Removes every trace of `client` and hands the lock on
    pub(crate) fn purge_client(&mut self, client: ClientId, ctx: &GrantContext<'_>) -> bool {
        let removed = self.remove_client(client);
        if removed && ctx.started {
            self.run_grants(ctx);
        }
        self.verify();
        removed
    }

    // ==================== Introspection ====================

    pub(crate) fn view(&self) -> LockView {
        LockView {
            lock_id: self.lock_id.clone(),
            level: self.level(),
            holders: self
                .holders
                .iter()
                .map(|h| LockHolder {
                    requester: h.requester,
                    level: h.level,
                    greedy: h.greedy,
                    acquired_at: h.acquired_at,
                })
                .collect(),
            notified: self.notified.iter().map(Request::view).collect(),
            upgrades: self.upgrades.iter().map(Request::view).collect(),
            pending: self.pending.iter().map(Request::view).collect(),
            waiters: self
                .waiters
                .iter()
                .map(|w| Waiter {
                    requester: w.requester,
                    level: w.level,
                    wait: w.wait,
                    started_at: w.started_at,
                })
                .collect(),
            recalled: self.recalled,
        }
    }

    pub(crate) fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            lock_id: self.lock_id.clone(),
            holders: self.holders.iter().map(|h| h.requester).collect(),
            blocked: self
                .notified
                .iter()
                .chain(self.upgrades.iter())
                .chain(self.pending.iter())
                .map(|r| r.requester)
                .chain(self.waiters.iter().map(|w| w.requester))
                .collect(),
        }
    }

    // ==================== Invariants ====================

    fn find_violation(&self) -> Option<String> {
        let writers = self.holders.iter().filter(|h| h.level.is_write()).count();
        if writers > 1 {
            return Some(format!("{writers} write-capable holders"));
        }
        if writers == 1 && self.holders.len() > 1 {
            return Some(format!("write holder shares the lock with {} other holder(s)", self.holders.len() - 1));
        }

        for (i, holder) in self.holders.iter().enumerate() {
            let requester = &holder.requester;
            if self.holders[..i].iter().any(|h| &h.requester == requester) {
                return Some(format!("{requester} recorded as holder twice"));
            }
            if self.is_queued(requester) {
                return Some(format!("holder {requester} is also queued"));
            }
            if self.is_waiting(requester) {
                return Some(format!("holder {requester} is also waiting"));
            }
        }

        if let Some(upgrade) = self
            .upgrades
            .iter()
            .find(|r| self.holder(&r.requester).map(|h| h.level) != Some(LockLevel::Read))
        {
            return Some(format!("upgrade request of {} without a read hold", upgrade.requester));
        }

        for (i, waiter) in self.waiters.iter().enumerate() {
            if self.waiters.iter().take(i).any(|w| w.requester == waiter.requester) {
                return Some(format!("{} waiting twice", waiter.requester));
            }
        }

        None
    }

    fn verify(&mut self) {
        if let Some(violation) = self.find_violation() {
            self.corrupted = true;
            error!("Lock '{}' is corrupted: {}", self.lock_id, violation);
            panic!("lock '{}' invariant violated: {}", self.lock_id, violation);
        }
    }
}
