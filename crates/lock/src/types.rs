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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Opaque lock identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(Arc<str>);

impl LockId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LockId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote connection identifier, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientID[{}]", self.0)
    }
}

/// Client-local logical thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Identity of the client as a whole; greedy holds are recorded under it.
    pub const VM: ThreadId = ThreadId(0);

    pub fn is_vm(&self) -> bool {
        *self == Self::VM
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_vm() {
            f.write_str("ThreadID[VM]")
        } else {
            write!(f, "ThreadID[{}]", self.0)
        }
    }
}

/// Lock requester identity: a thread within a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Requester {
    pub client: ClientId,
    pub thread: ThreadId,
}

impl Requester {
    pub fn new(client: ClientId, thread: ThreadId) -> Self {
        Self { client, thread }
    }

    /// Whole-client identity used for greedy holds
    pub fn vm(client: ClientId) -> Self {
        Self::new(client, ThreadId::VM)
    }

    pub fn is_vm(&self) -> bool {
        self.thread.is_vm()
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.thread)
    }
}

/// Lock level
///
/// `Upgrade` is a read hold that has also been granted write; it excludes every other
/// holder exactly like `Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Shared lock
    Read,
    /// Exclusive lock
    Write,
    /// Read hold upgraded to write
    Upgrade,
}

impl LockLevel {
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read | Self::Upgrade)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write | Self::Upgrade)
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self, Self::Upgrade)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("READ"),
            Self::Write => f.write_str("WRITE"),
            Self::Upgrade => f.write_str("UPGRADE"),
        }
    }
}

/// Grant policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Uncontended locks are handed to the whole client and recalled on contention
    Greedy,
    /// Every grant goes to the requesting thread
    #[default]
    Altruistic,
}

impl std::str::FromStr for LockPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "greedy" => Ok(Self::Greedy),
            "altruistic" => Ok(Self::Altruistic),
            other => Err(format!("unknown lock policy '{other}'")),
        }
    }
}

/// Parameters of a monitor wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WaitSpec {
    /// `None` waits until notified
    pub timeout: Option<Duration>,
}

impl WaitSpec {
    pub fn forever() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

/// A hold or pending request declared by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContext {
    pub lock_id: LockId,
    pub requester: Requester,
    pub level: LockLevel,
}

impl LockContext {
    pub fn new(lock_id: impl Into<LockId>, requester: Requester, level: LockLevel) -> Self {
        Self {
            lock_id: lock_id.into(),
            requester,
            level,
        }
    }
}

/// A wait declared by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitContext {
    pub lock_id: LockId,
    pub requester: Requester,
    pub level: LockLevel,
    pub wait: WaitSpec,
}

impl WaitContext {
    pub fn new(lock_id: impl Into<LockId>, requester: Requester, level: LockLevel, wait: WaitSpec) -> Self {
        Self {
            lock_id: lock_id.into(),
            requester,
            level,
            wait,
        }
    }
}

/// Where a requester stands with respect to one lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequesterState {
    Unrequested,
    Pending,
    PendingUpgrade,
    Held,
    Waiting,
}

/// Awarded lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub requester: Requester,
    pub level: LockLevel,
    pub greedy: bool,
    pub acquired_at: SystemTime,
}

/// Queued lock request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerLockRequest {
    pub requester: Requester,
    pub level: LockLevel,
    pub requested_at: SystemTime,
}

/// Requester parked in the wait set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waiter {
    pub requester: Requester,
    pub level: LockLevel,
    pub wait: WaitSpec,
    pub started_at: SystemTime,
}

/// Read-only view of one lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockView {
    pub lock_id: LockId,
    pub level: Option<LockLevel>,
    pub holders: Vec<LockHolder>,
    pub notified: Vec<ServerLockRequest>,
    pub upgrades: Vec<ServerLockRequest>,
    pub pending: Vec<ServerLockRequest>,
    pub waiters: Vec<Waiter>,
    pub recalled: bool,
}

impl LockView {
    pub fn pending_count(&self) -> usize {
        self.notified.len() + self.upgrades.len() + self.pending.len()
    }
}

/// Responses pushed to clients through their sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockResponse {
    /// Lock granted; `greedy` awards are held by the whole client
    Award {
        lock_id: LockId,
        requester: Requester,
        level: LockLevel,
        greedy: bool,
    },
    /// A try-request could not be granted
    NotAwarded {
        lock_id: LockId,
        requester: Requester,
        level: LockLevel,
    },
    /// Give a greedily held lock back through recall-commit
    Recall {
        lock_id: LockId,
        client: ClientId,
        level: LockLevel,
    },
    /// The wait of `requester` expired
    WaitTimeout {
        lock_id: LockId,
        requester: Requester,
        level: LockLevel,
    },
    /// Answer to a lock query
    Info { requester: Requester, view: LockView },
}

impl LockResponse {
    /// Client the response is addressed to
    pub fn client(&self) -> ClientId {
        match self {
            Self::Award { requester, .. }
            | Self::NotAwarded { requester, .. }
            | Self::WaitTimeout { requester, .. }
            | Self::Info { requester, .. } => requester.client,
            Self::Recall { client, .. } => *client,
        }
    }

    pub fn lock_id(&self) -> &LockId {
        match self {
            Self::Award { lock_id, .. }
            | Self::NotAwarded { lock_id, .. }
            | Self::Recall { lock_id, .. }
            | Self::WaitTimeout { lock_id, .. } => lock_id,
            Self::Info { view, .. } => &view.lock_id,
        }
    }

    pub fn is_award(&self) -> bool {
        matches!(self, Self::Award { .. })
    }

    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }
}

/// Waiters moved out of wait sets by notify, grouped per client for batched delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifiedWaiters {
    by_client: HashMap<ClientId, Vec<LockContext>>,
}

impl NotifiedWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, context: LockContext) {
        self.by_client.entry(context.requester.client).or_default().push(context);
    }

    pub fn for_client(&self, client: ClientId) -> &[LockContext] {
        self.by_client.get(&client).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.by_client.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_client.values().map(Vec::len).sum()
    }

    pub fn into_inner(self) -> HashMap<ClientId, Vec<LockContext>> {
        self.by_client
    }
}

/// One edge of a deadlock cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockLink {
    pub waiter: Requester,
    pub waiting_on: LockId,
    pub blocked_by: Requester,
}

/// A cycle in the wait-for graph; the last link's `blocked_by` is the first link's `waiter`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockChain {
    pub links: Vec<DeadlockLink>,
}

impl DeadlockChain {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn waiters(&self) -> impl Iterator<Item = &Requester> {
        self.links.iter().map(|link| &link.waiter)
    }

    /// Lock the given requester is stuck on within this cycle
    pub fn waiting_on(&self, requester: &Requester) -> Option<&LockId> {
        self.links.iter().find(|l| &l.waiter == requester).map(|l| &l.waiting_on)
    }
}

impl fmt::Display for DeadlockChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, link) in self.links.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{} waits on '{}' held by {}", link.waiter, link.waiting_on, link.blocked_by)?;
        }
        Ok(())
    }
}

/// Receiver of deadlock scan results
pub trait DeadlockResults {
    fn found_deadlock(&mut self, chain: DeadlockChain);
}

impl DeadlockResults for Vec<DeadlockChain> {
    fn found_deadlock(&mut self, chain: DeadlockChain) {
        self.push(chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_level_capabilities() {
        assert!(LockLevel::Read.is_read());
        assert!(!LockLevel::Read.is_write());
        assert!(LockLevel::Write.is_write());
        assert!(LockLevel::Upgrade.is_read() && LockLevel::Upgrade.is_write());
    }

    #[test]
    fn test_lock_policy_parse() {
        assert_eq!("Greedy".parse::<LockPolicy>(), Ok(LockPolicy::Greedy));
        assert_eq!("altruistic".parse::<LockPolicy>(), Ok(LockPolicy::Altruistic));
        assert!("eager".parse::<LockPolicy>().is_err());
    }

    #[test]
    fn test_notified_waiters_grouping() {
        let mut notified = NotifiedWaiters::new();
        let a = Requester::new(ClientId(1), ThreadId(1));
        let b = Requester::new(ClientId(1), ThreadId(2));
        let c = Requester::new(ClientId(2), ThreadId(1));
        notified.add(LockContext::new("l1", a, LockLevel::Write));
        notified.add(LockContext::new("l1", b, LockLevel::Write));
        notified.add(LockContext::new("l2", c, LockLevel::Read));

        assert_eq!(notified.len(), 3);
        assert_eq!(notified.for_client(ClientId(1)).len(), 2);
        assert_eq!(notified.for_client(ClientId(2))[0].lock_id, LockId::new("l2"));
        assert!(notified.for_client(ClientId(9)).is_empty());
    }

    #[test]
    fn test_response_addressing() {
        let requester = Requester::new(ClientId(4), ThreadId(2));
        let award = LockResponse::Award {
            lock_id: LockId::new("order-42"),
            requester,
            level: LockLevel::Write,
            greedy: false,
        };
        assert_eq!(award.client(), ClientId(4));
        assert_eq!(award.lock_id().as_str(), "order-42");

        let recall = LockResponse::Recall {
            lock_id: LockId::new("order-42"),
            client: ClientId(9),
            level: LockLevel::Write,
        };
        assert_eq!(recall.client(), ClientId(9));
    }

    #[test]
    fn test_view_serialization() {
        let view = LockView {
            lock_id: LockId::new("l"),
            level: Some(LockLevel::Read),
            holders: vec![LockHolder {
                requester: Requester::new(ClientId(1), ThreadId(1)),
                level: LockLevel::Read,
                greedy: false,
                acquired_at: SystemTime::UNIX_EPOCH,
            }],
            notified: vec![],
            upgrades: vec![],
            pending: vec![],
            waiters: vec![],
            recalled: false,
        };
        let json = serde_json::to_string(&view).unwrap();
        let back: LockView = serde_json::from_str(&json).unwrap();
        assert_eq!(view, back);
    }
}
