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

use crate::types::{ClientId, LockId, Requester};
use crate::manager::ManagerState;
use thiserror::Error;

/// Lock manager error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// wait/notify issued by a requester that is not the monitor owner
    #[error("Illegal monitor state on lock '{lock_id}' for {requester}: {reason}")]
    IllegalMonitorState {
        lock_id: LockId,
        requester: Requester,
        reason: String,
    },

    /// Client state cannot be rebuilt (unknown client or window expired)
    #[error("Reconnection rejected for client {client}: {reason}")]
    RejectReconnection { client: ClientId, reason: String },

    /// Declared (reestablished or recalled) state contradicts the lock table
    #[error("Cannot reestablish lock '{lock_id}' for {requester}: {reason}")]
    ReestablishConflict {
        lock_id: LockId,
        requester: Requester,
        reason: String,
    },

    /// Requester asked for a lock it already holds
    #[error("Lock '{lock_id}' is already held by {requester}")]
    AlreadyHeld { lock_id: LockId, requester: Requester },

    /// Requester asked for a lock while parked in its wait set
    #[error("{requester} is in the wait set of lock '{lock_id}'")]
    AlreadyWaiting { lock_id: LockId, requester: Requester },

    /// Operation not allowed in the current lifecycle state
    #[error("Operation '{operation}' not allowed while lock manager is {state}")]
    InvalidState {
        operation: &'static str,
        state: ManagerState,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl LockError {
    /// Create illegal monitor state error
    pub fn illegal_monitor_state(lock_id: &LockId, requester: Requester, reason: impl Into<String>) -> Self {
        Self::IllegalMonitorState {
            lock_id: lock_id.clone(),
            requester,
            reason: reason.into(),
        }
    }

    /// Create reconnection rejected error
    pub fn reject_reconnection(client: ClientId, reason: impl Into<String>) -> Self {
        Self::RejectReconnection {
            client,
            reason: reason.into(),
        }
    }

    /// Create reestablish conflict error
    pub fn reestablish_conflict(lock_id: &LockId, requester: Requester, reason: impl Into<String>) -> Self {
        Self::ReestablishConflict {
            lock_id: lock_id.clone(),
            requester,
            reason: reason.into(),
        }
    }

    /// Create invalid lifecycle state error
    pub fn invalid_state(operation: &'static str, state: ManagerState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Errors caused by a misbehaving client; they are answered to that client and never
    /// affect other requesters.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::IllegalMonitorState { .. }
                | Self::ReestablishConflict { .. }
                | Self::AlreadyHeld { .. }
                | Self::AlreadyWaiting { .. }
        )
    }

    /// Expected conditions the caller can recover from by treating the client as new
    /// or retrying once the manager has started.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RejectReconnection { .. } | Self::InvalidState { .. })
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThreadId;

    #[test]
    fn test_error_creation() {
        let lock_id = LockId::new("order-42");
        let requester = Requester::new(ClientId(1), ThreadId(7));

        let err = LockError::illegal_monitor_state(&lock_id, requester, "not the holder");
        assert!(matches!(err, LockError::IllegalMonitorState { .. }));
        assert!(err.to_string().contains("order-42"));

        let err = LockError::reject_reconnection(ClientId(3), "window expired");
        assert!(matches!(err, LockError::RejectReconnection { client: ClientId(3), .. }));
    }

    #[test]
    fn test_error_classification() {
        let lock_id = LockId::new("l");
        let requester = Requester::new(ClientId(1), ThreadId(1));

        assert!(LockError::illegal_monitor_state(&lock_id, requester, "x").is_protocol_violation());
        assert!(!LockError::illegal_monitor_state(&lock_id, requester, "x").is_recoverable());

        let reject = LockError::reject_reconnection(ClientId(1), "unknown");
        assert!(reject.is_recoverable());
        assert!(!reject.is_protocol_violation());

        let state = LockError::invalid_state("unlock", ManagerState::Starting);
        assert!(state.is_recoverable());
        assert!(state.to_string().contains("STARTING"));
    }
}
