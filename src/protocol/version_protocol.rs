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

//! The flat version-vector flood (§4.3): a full-table dump every five
//! minutes, and inbound handling that recovers each row's signer, filters
//! against the active set, upserts, mirrors advances into the endpoint
//! table, and regossips novel rows subject to a per-source cooldown.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::consensus_iface::ConsensusProvider;
use crate::core::crypto;
use crate::core::types::{decode_version_rows, encode_version_rows, version_signing_hash, Address, SignedAnnounceVersion};
use crate::monitoring::metrics::Metrics;
use crate::networking::transport::{AnnounceTransport, MessageCode};
use crate::protocol::endpoint_table::{EndpointTable, EndpointUpdate};
use crate::protocol::gossip_cache::GossipDedup;
use crate::protocol::version_table::VersionTable;
use crate::protocol::{ProtocolError, REGOSSIP_COOLDOWN};

/// Handles the version-vector flood, both directions.
pub struct VersionProtocol {
    version_table: Arc<VersionTable>,
    endpoint_table: Arc<EndpointTable>,
    consensus: Arc<dyn ConsensusProvider>,
    transport: Arc<dyn AnnounceTransport>,
    dedup: Arc<GossipDedup>,
    kick_query: mpsc::Sender<()>,
    metrics: Arc<Metrics>,
}

impl VersionProtocol {
    /// Wire up the version protocol over its shared collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version_table: Arc<VersionTable>,
        endpoint_table: Arc<EndpointTable>,
        consensus: Arc<dyn ConsensusProvider>,
        transport: Arc<dyn AnnounceTransport>,
        dedup: Arc<GossipDedup>,
        kick_query: mpsc::Sender<()>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { version_table, endpoint_table, consensus, transport, dedup, kick_query, metrics }
    }

    /// Dump the full version table and flood it to every peer (the 5-minute
    /// version-share tick).
    pub fn share(&self) -> Result<(), ProtocolError> {
        let rows = self.version_table.get_all()?;
        if rows.is_empty() {
            return Ok(());
        }
        let wire_rows: Vec<SignedAnnounceVersion> =
            rows.into_iter().map(|e| SignedAnnounceVersion { version: e.version, signature: e.signature }).collect();
        let bytes = encode_version_rows(&wire_rows);
        self.transport.multicast(MessageCode::SignedAnnounceVersions, bytes);
        Ok(())
    }

    /// Handle an inbound `SignedAnnounceVersions` message.
    pub fn handle_inbound(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let rows = decode_version_rows(bytes)?;
        let active_set = self.consensus.active_set();

        let mut seen: HashSet<Address> = HashSet::new();
        let mut filtered = Vec::new();
        for row in rows {
            let hash = version_signing_hash(row.version);
            let (_, address) = match crypto::recover_signer(&hash, &row.signature) {
                Ok(v) => v,
                Err(_) => {
                    debug!("dropping version row with unrecoverable signature");
                    continue;
                }
            };
            if !active_set.contains(&address) {
                continue;
            }
            if !seen.insert(address) {
                continue;
            }
            filtered.push(row);
        }

        let new_entries = self.version_table.upsert(filtered)?;
        if new_entries.is_empty() {
            return Ok(());
        }

        let self_is_active = self.consensus.self_address().is_some_and(|a| active_set.contains(&a));
        if self_is_active {
            let updates: Vec<EndpointUpdate> = new_entries
                .iter()
                .map(|e| {
                    let mut u = EndpointUpdate::for_address(e.address);
                    u.public_key = Some(e.public_key);
                    u.highest_known_version = Some(e.version);
                    u
                })
                .collect();
            self.endpoint_table.upsert(updates)?;
        }

        let now = Instant::now();
        let self_address = self.consensus.self_address().unwrap_or(Address([0u8; 20]));
        for entry in &new_entries {
            if self.dedup.should_regossip_version(&entry.address, &self_address, now, REGOSSIP_COOLDOWN) {
                let wire_row = SignedAnnounceVersion { version: entry.version, signature: entry.signature };
                self.transport.multicast(MessageCode::SignedAnnounceVersions, encode_version_rows(&[wire_row]));
                self.dedup.record_version_regossip(entry.address, now);
                self.metrics.version_regossip_total.inc();
            }
        }

        if self.kick_query.try_send(()).is_err() {
            debug!("query-build already pending; dropping kick signal");
        }
        Ok(())
    }

    /// Opportunistic prune, delegated to the backing table.
    pub fn prune(&self, active_set: &BTreeSet<Address>) -> Result<usize, ProtocolError> {
        self.version_table.prune(active_set).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus_iface::StaticConsensusProvider;
    use crate::networking::transport::InboundMessage;
    use crate::storage::kv::MemKvStore;
    use k256::ecdsa::SigningKey;
    use std::sync::Mutex;

    fn key(byte: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[0] = 5;
        bytes[31] = byte;
        SigningKey::from_bytes((&bytes).into()).unwrap()
    }

    fn row(sk: &SigningKey, version: u64) -> SignedAnnounceVersion {
        let hash = version_signing_hash(version);
        let signature = crypto::sign_recoverable(sk, &hash).unwrap();
        SignedAnnounceVersion { version, signature }
    }

    struct RecordingTransport {
        sent: Mutex<Vec<(MessageCode, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    impl AnnounceTransport for RecordingTransport {
        fn multicast(&self, code: MessageCode, payload: Vec<u8>) {
            self.sent.lock().unwrap().push((code, payload));
        }
        fn send_to(&self, _address: &Address, _code: MessageCode, _payload: Vec<u8>) -> Result<(), crate::networking::transport::TransportError> {
            Ok(())
        }
        fn is_connected(&self, _address: &Address) -> bool {
            false
        }
        fn find_peers(&self, _addresses: &BTreeSet<Address>) -> BTreeSet<Address> {
            BTreeSet::new()
        }
        fn bind_address(&self, _address: Address, _peer: libp2p::PeerId) {}
    }

    fn _unused(_: InboundMessage) {}

    #[test]
    fn inbound_rows_outside_active_set_are_dropped() {
        let version_table = Arc::new(VersionTable::new(Arc::new(MemKvStore::new())));
        let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));
        let consensus = Arc::new(StaticConsensusProvider::new(BTreeSet::new(), None));
        let transport = Arc::new(RecordingTransport::new());
        let dedup = Arc::new(GossipDedup::new());
        let (kick_tx, _kick_rx) = mpsc::channel(1);

        let proto = VersionProtocol::new(version_table.clone(), endpoint_table, consensus, transport, dedup, kick_tx, Arc::new(Metrics::new().unwrap()));
        let sk = key(1);
        let bytes = encode_version_rows(&[row(&sk, 1000)]);
        proto.handle_inbound(&bytes).unwrap();

        // No address is active, so nothing should have been stored.
        let all = version_table.get_all().unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn inbound_new_entry_regossips_and_kicks_query() {
        let version_table = Arc::new(VersionTable::new(Arc::new(MemKvStore::new())));
        let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));
        let sk = key(2);
        let hash = version_signing_hash(1000);
        let sig = crypto::sign_recoverable(&sk, &hash).unwrap();
        let (_, address) = crypto::recover_signer(&hash, &sig).unwrap();

        let mut active = BTreeSet::new();
        active.insert(address);
        let consensus = Arc::new(StaticConsensusProvider::new(active, Some(address)));
        let transport = Arc::new(RecordingTransport::new());
        let dedup = Arc::new(GossipDedup::new());
        let (kick_tx, mut kick_rx) = mpsc::channel(1);

        let proto =
            VersionProtocol::new(version_table.clone(), endpoint_table.clone(), consensus, transport.clone(), dedup, kick_tx, Arc::new(Metrics::new().unwrap()));
        let bytes = encode_version_rows(&[row(&sk, 1000)]);
        proto.handle_inbound(&bytes).unwrap();

        assert_eq!(version_table.get(&address).unwrap().unwrap().version, 1000);
        assert_eq!(endpoint_table.get(&address).unwrap().unwrap().highest_known_version, 1000);
        assert!(!transport.sent.lock().unwrap().is_empty());
        assert!(kick_rx.try_recv().is_ok());
    }
}
