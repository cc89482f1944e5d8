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

//! In-memory gossip dedup state: two `address -> last_regossip_time` maps,
//! one per message class, each behind its own read-write lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::core::types::Address;

struct DedupMap {
    last_regossip: RwLock<BTreeMap<Address, Instant>>,
}

impl DedupMap {
    fn new() -> Self {
        Self { last_regossip: RwLock::new(BTreeMap::new()) }
    }

    fn should_regossip(&self, source: &Address, self_address: &Address, now: Instant, cooldown: Duration) -> bool {
        if source == self_address {
            return true;
        }
        let read = self.last_regossip.read().expect("lock poisoned");
        match read.get(source) {
            Some(last) => now.saturating_duration_since(*last) >= cooldown,
            None => true,
        }
    }

    fn record(&self, source: Address, now: Instant) {
        let mut write = self.last_regossip.write().expect("lock poisoned");
        write.insert(source, now);
    }

    fn prune(&self, active_set: &BTreeSet<Address>) {
        let mut write = self.last_regossip.write().expect("lock poisoned");
        write.retain(|addr, _| active_set.contains(addr));
    }
}

/// The two dedup caches, one for version-vector regossip and one for query
/// regossip. Safe to share behind an `Arc` across the announce loop and
/// inbound message handlers.
pub struct GossipDedup {
    version: DedupMap,
    query: DedupMap,
}

impl Default for GossipDedup {
    fn default() -> Self {
        Self::new()
    }
}

impl GossipDedup {
    /// Construct empty dedup state.
    pub fn new() -> Self {
        Self { version: DedupMap::new(), query: DedupMap::new() }
    }

    /// Whether a version row from `source` may be regossiped right now.
    /// Own address is never suppressed.
    pub fn should_regossip_version(&self, source: &Address, self_address: &Address, now: Instant, cooldown: Duration) -> bool {
        self.version.should_regossip(source, self_address, now, cooldown)
    }

    /// Record that a version row from `source` was just regossiped.
    pub fn record_version_regossip(&self, source: Address, now: Instant) {
        self.version.record(source, now);
    }

    /// Whether a query payload from `source` may be regossiped right now.
    pub fn should_regossip_query(&self, source: &Address, self_address: &Address, now: Instant, cooldown: Duration) -> bool {
        self.query.should_regossip(source, self_address, now, cooldown)
    }

    /// Record that a query payload from `source` was just regossiped.
    pub fn record_query_regossip(&self, source: Address, now: Instant) {
        self.query.record(source, now);
    }

    /// Opportunistic prune: drop dedup entries for addresses no longer active.
    pub fn prune(&self, active_set: &BTreeSet<Address>) {
        self.version.prune(active_set);
        self.query.prune(active_set);
    }
}
