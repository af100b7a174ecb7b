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

// ============================================================================
// Core Module Declarations
// ============================================================================

// Service Layer Modules
pub mod manager;
pub mod reconnect;

// Lock State Modules
mod state;
mod table;
mod timer;

// Core Modules
pub mod config;
pub mod deadlock_detector;
pub mod error;
pub mod sink;
pub mod types;

#[cfg(test)]
mod test_util;

// ============================================================================
// Public API Exports
// ============================================================================

// Re-export main types for easy access
pub use crate::{
    // Configuration
    config::{LockManagerConfig, ReconnectConfig},
    // Deadlock detection
    deadlock_detector::DeadlockDetector,
    // Error types
    error::{LockError, Result},
    // Main components
    manager::{LockManager, ManagerState},
    reconnect::{ReconnectRequest, ReconnectionReconciler},
    // Response delivery
    sink::{ChannelSink, LockResponseSink, SharedSink},
    // Core types
    types::{
        ClientId, DeadlockChain, DeadlockLink, DeadlockResults, LockContext, LockHolder, LockId, LockLevel, LockPolicy,
        LockResponse, LockView, NotifiedWaiters, Requester, RequesterState, ServerLockRequest, ThreadId, WaitContext, WaitSpec,
        Waiter,
    },
};

// ============================================================================
// Version Information
// ============================================================================

/// Current version of the lock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
