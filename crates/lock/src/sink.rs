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

//! Response delivery back to clients.
//!
//! The lock manager calls [`LockResponseSink::deliver`] from inside per-lock critical
//! sections, so implementations must never block.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::LockResponse;

/// Non-blocking delivery of responses to a client
pub trait LockResponseSink: Send + Sync {
    fn deliver(&self, response: LockResponse);
}

/// Shared sink handle stored with queued requests and waiters
pub type SharedSink = Arc<dyn LockResponseSink>;

impl LockResponseSink for mpsc::UnboundedSender<LockResponse> {
    fn deliver(&self, response: LockResponse) {
        if let Err(e) = self.send(response) {
            warn!("Dropping lock response for {}: receiver closed", e.0.client());
        }
    }
}

/// Sink backed by an unbounded tokio channel; the transport drains the receiver.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LockResponse>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LockResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn shared(&self) -> SharedSink {
        Arc::new(self.clone())
    }
}

impl LockResponseSink for ChannelSink {
    fn deliver(&self, response: LockResponse) {
        self.tx.deliver(response);
    }
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink").field("closed", &self.tx.is_closed()).finish()
    }
}
