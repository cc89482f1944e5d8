// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The seam at which an external consensus engine plugs in. The protocol
//! only ever asks "who is active right now", "who am I", and "is the
//! consensus core running" — never anything about rounds, blocks, or votes.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::core::types::Address;

/// What the announce loop needs from the consensus engine.
pub trait ConsensusProvider: Send + Sync {
    /// The current active validator set.
    fn active_set(&self) -> BTreeSet<Address>;
    /// This node's own address, if it is itself a validator.
    fn self_address(&self) -> Option<Address>;
    /// This node's own current endpoint URL, if known.
    fn self_node_url(&self) -> Option<String>;
    /// Whether the consensus core is currently running (vs. syncing/stopped).
    fn core_running(&self) -> bool;
}

/// A fixed validator set for tests: `core_running` is always `true` and the
/// active set never changes underfoot unless the test mutates it directly.
pub struct StaticConsensusProvider {
    active_set: RwLock<BTreeSet<Address>>,
    self_address: Option<Address>,
    self_node_url: RwLock<Option<String>>,
    core_running: RwLock<bool>,
}

impl StaticConsensusProvider {
    /// Build a provider with a fixed active set and identity.
    pub fn new(active_set: BTreeSet<Address>, self_address: Option<Address>) -> Self {
        Self {
            active_set: RwLock::new(active_set),
            self_address,
            self_node_url: RwLock::new(None),
            core_running: RwLock::new(true),
        }
    }

    /// Replace the active set (simulates a membership change in tests).
    pub fn set_active_set(&self, active_set: BTreeSet<Address>) {
        *self.active_set.write().expect("lock poisoned") = active_set;
    }

    /// Set this node's currently-known own URL.
    pub fn set_self_node_url(&self, url: Option<String>) {
        *self.self_node_url.write().expect("lock poisoned") = url;
    }

    /// Toggle whether the consensus core is reported as running.
    pub fn set_core_running(&self, running: bool) {
        *self.core_running.write().expect("lock poisoned") = running;
    }
}

impl ConsensusProvider for StaticConsensusProvider {
    fn active_set(&self) -> BTreeSet<Address> {
        self.active_set.read().expect("lock poisoned").clone()
    }

    fn self_address(&self) -> Option<Address> {
        self.self_address
    }

    fn self_node_url(&self) -> Option<String> {
        self.self_node_url.read().expect("lock poisoned").clone()
    }

    fn core_running(&self) -> bool {
        *self.core_running.read().expect("lock poisoned")
    }
}

/// Production wrapper around a consensus engine's externally-updated
/// validator set: the engine pushes membership changes in via
/// `set_active_set`, mirroring how the teacher's `ConsensusDriver` owns a
/// validator set independent of this protocol's own state.
pub struct AnnounceConsensusAdapter {
    inner: Arc<StaticConsensusProvider>,
}

impl AnnounceConsensusAdapter {
    /// Wrap a shared, externally-mutated provider.
    pub fn new(inner: Arc<StaticConsensusProvider>) -> Self {
        Self { inner }
    }
}

impl ConsensusProvider for AnnounceConsensusAdapter {
    fn active_set(&self) -> BTreeSet<Address> {
        self.inner.active_set()
    }

    fn self_address(&self) -> Option<Address> {
        self.inner.self_address()
    }

    fn self_node_url(&self) -> Option<String> {
        self.inner.self_node_url()
    }

    fn core_running(&self) -> bool {
        self.inner.core_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_reflects_mutations() {
        let a = Address([1u8; 20]);
        let provider = StaticConsensusProvider::new(BTreeSet::new(), Some(a));
        assert!(provider.active_set().is_empty());

        let mut set = BTreeSet::new();
        set.insert(a);
        provider.set_active_set(set.clone());
        assert_eq!(provider.active_set(), set);

        provider.set_core_running(false);
        assert!(!provider.core_running());
    }
}
