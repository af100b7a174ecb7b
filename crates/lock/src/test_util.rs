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

use parking_lot::Mutex;
use std::sync::Arc;

use crate::sink::{LockResponseSink, SharedSink};
use crate::types::{ClientId, LockLevel, LockResponse, Requester};

/// Sink that records every response for assertions
#[derive(Default)]
pub(crate) struct RecordingSink {
    responses: Mutex<Vec<LockResponse>>,
}

impl RecordingSink {
    pub(crate) fn shared() -> (Arc<RecordingSink>, SharedSink) {
        let recorder = Arc::new(RecordingSink::default());
        let sink: SharedSink = recorder.clone();
        (recorder, sink)
    }

    pub(crate) fn responses(&self) -> Vec<LockResponse> {
        self.responses.lock().clone()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.responses.lock().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.responses.lock().clear();
    }

    /// `(requester, level, greedy)` of every award, in delivery order
    pub(crate) fn awards(&self) -> Vec<(Requester, LockLevel, bool)> {
        self.responses
            .lock()
            .iter()
            .filter_map(|r| match r {
                LockResponse::Award {
                    requester, level, greedy, ..
                } => Some((*requester, *level, *greedy)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn awarded(&self, requester: Requester) -> bool {
        self.awards().iter().any(|(r, _, _)| *r == requester)
    }

    pub(crate) fn recalls(&self) -> Vec<ClientId> {
        self.responses
            .lock()
            .iter()
            .filter_map(|r| match r {
                LockResponse::Recall { client, .. } => Some(*client),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&LockResponse) -> bool) -> usize {
        self.responses.lock().iter().filter(|r| predicate(r)).count()
    }
}

impl LockResponseSink for RecordingSink {
    fn deliver(&self, response: LockResponse) {
        self.responses.lock().push(response);
    }
}
