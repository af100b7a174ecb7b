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

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::manager::{LockManager, ManagerInner};
use crate::types::{LockId, Requester};

/// Schedules wait timeouts as tokio tasks.
///
/// A fired timer re-enters the manager and only acts if the waiter it was scheduled
/// for is still parked under the same wait id.
#[derive(Debug)]
pub(crate) struct WaitTimer {
    manager: Weak<ManagerInner>,
    next_wait_id: AtomicU64,
    shutdown: AtomicBool,
}

impl WaitTimer {
    pub(crate) fn new(manager: Weak<ManagerInner>) -> Self {
        Self {
            manager,
            next_wait_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn next_wait_id(&self) -> u64 {
        self.next_wait_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn schedule(&self, lock_id: &LockId, requester: Requester, wait_id: u64, timeout: Duration) -> Option<AbortHandle> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!("No tokio runtime available, wait timeout for {} on '{}' not scheduled", requester, lock_id);
            return None;
        };

        let manager = self.manager.clone();
        let lock_id = lock_id.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            match manager.upgrade() {
                Some(inner) => LockManager::from_inner(inner).wait_timeout(&lock_id, requester, wait_id),
                None => debug!("Lock manager dropped before wait timeout of {} on '{}'", requester, lock_id),
            }
        });

        Some(task.abort_handle())
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
