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

//! Rebuilding lock state for clients that reconnect after a transport failure or a
//! coordinator restart.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::{LockError, Result};
use crate::manager::LockManager;
use crate::sink::SharedSink;
use crate::types::{ClientId, LockContext, LockId, Requester, WaitContext};

/// State a reconnecting client declares for its previous identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectRequest {
    pub previous: ClientId,
    pub client: ClientId,
    pub holds: Vec<LockContext>,
    pub waits: Vec<WaitContext>,
    pub pending: Vec<LockContext>,
}

#[derive(Default)]
struct DeclaredState {
    holds: Vec<LockContext>,
    waits: Vec<WaitContext>,
    pending: Vec<LockContext>,
}

/// Tracks reconnection windows and replays declared client state into the manager
pub struct ReconnectionReconciler {
    manager: LockManager,
    config: ReconnectConfig,
    /// Client -> window deadline
    windows: Mutex<HashMap<ClientId, Instant>>,
    shutdown: AtomicBool,
}

impl ReconnectRequest {
    /// Reconnection that declares no state
    pub fn empty(previous: ClientId, client: ClientId) -> Self {
        Self {
            previous,
            client,
            holds: Vec::new(),
            waits: Vec::new(),
            pending: Vec::new(),
        }
    }
}

impl ReconnectionReconciler {
    pub fn new(manager: LockManager, config: ReconnectConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            config,
            windows: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Declare clients that may reconnect after a coordinator restart
    pub fn register_rebuildable(&self, clients: impl IntoIterator<Item = ClientId>) {
        let deadline = Instant::now() + self.config.window;
        let mut windows = self.windows.lock();
        for client in clients {
            windows.insert(client, deadline);
            self.manager.open_gate(client);
        }
        info!("{} client(s) may reconnect within {:?}", windows.len(), self.config.window);
    }

    /// Retain the state of a live client whose transport dropped
    pub fn client_disconnected(&self, client: ClientId) {
        self.windows.lock().insert(client, Instant::now() + self.config.window);
        self.manager.open_gate(client);
        debug!("{} disconnected, reconnection window open for {:?}", client, self.config.window);
    }

    pub fn is_rebuildable(&self, client: ClientId) -> bool {
        self.windows
            .lock()
            .get(&client)
            .is_some_and(|deadline| Instant::now() <= *deadline)
    }

    pub fn pending_reconnects(&self) -> usize {
        self.windows.lock().len()
    }

    /// Replace the previous identity's lock state with what the client declares
    pub fn reconcile(&self, request: ReconnectRequest, sink: SharedSink) -> Result<()> {
        let ReconnectRequest {
            previous,
            client,
            holds,
            waits,
            pending,
        } = request;

        let deadline = self.windows.lock().remove(&previous);
        let reason = match deadline {
            None => Some("unknown client"),
            Some(deadline) if Instant::now() > deadline => Some("reconnection window expired"),
            Some(_) => None,
        };
        if let Some(reason) = reason {
            warn!("Rejecting reconnection of {} as {}: {}", previous, client, reason);
            self.manager.clear_all_locks_for(previous);
            self.manager.release_gate(previous, false);
            return Err(LockError::reject_reconnection(previous, reason));
        }

        self.manager.open_gate(client);

        let as_client = |requester: Requester| Requester::new(client, requester.thread);
        let mut declared: BTreeMap<LockId, DeclaredState> = BTreeMap::new();
        for hold in holds {
            let requester = as_client(hold.requester);
            declared
                .entry(hold.lock_id.clone())
                .or_default()
                .holds
                .push(LockContext { requester, ..hold });
        }
        for wait in waits {
            let requester = as_client(wait.requester);
            declared
                .entry(wait.lock_id.clone())
                .or_default()
                .waits
                .push(WaitContext { requester, ..wait });
        }
        for request in pending {
            let requester = as_client(request.requester);
            declared
                .entry(request.lock_id.clone())
                .or_default()
                .pending
                .push(LockContext { requester, ..request });
        }

        let mut lock_ids: BTreeSet<LockId> = declared.keys().cloned().collect();
        lock_ids.extend(self.manager.locks_referencing(previous));

        let mut first_error = None;
        for lock_id in &lock_ids {
            let state = declared.remove(lock_id).unwrap_or_default();
            if let Err(e) = self.manager.replace_client_state(
                lock_id,
                previous,
                client,
                &state.holds,
                &state.waits,
                &state.pending,
                &sink,
            ) {
                warn!("Reconnection of {} as {}: {}", previous, client, e);
                first_error.get_or_insert(e);
            }
        }

        if previous != client {
            self.manager.release_gate(previous, false);
        }
        self.manager.release_gate(client, true);
        info!("Reconciled {} as {} across {} lock(s)", previous, client, lock_ids.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Purge every client whose window has passed; returns the purged clients
    pub fn expire(&self) -> Vec<ClientId> {
        let now = Instant::now();
        let expired: Vec<ClientId> = {
            let mut windows = self.windows.lock();
            let expired: Vec<ClientId> = windows
                .iter()
                .filter(|(_, deadline)| now > **deadline)
                .map(|(client, _)| *client)
                .collect();
            for client in &expired {
                windows.remove(client);
            }
            expired
        };

        for client in &expired {
            warn!("Reconnection window of {} expired, releasing its locks", client);
            self.manager.clear_all_locks_for(*client);
            self.manager.release_gate(*client, false);
        }
        expired
    }

    /// Run `expire` every `check_interval` until shut down
    pub fn spawn_expiry_task(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let period = self.config.check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if reconciler.shutdown.load(Ordering::Acquire) {
                    debug!("Reconnection expiry task stopped");
                    break;
                }
                reconciler.expire();
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
