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

//! The encrypted query protocol (§4.4): targeted, per-recipient URL
//! delivery. Outbound builds walk the endpoint table looking for stale or
//! unknown recipients; inbound handling decrypts any entry addressed to
//! this node and upserts the sender as a wanted peer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::consensus_iface::ConsensusProvider;
use crate::core::crypto::{self, Signer};
use crate::core::types::{Address, Node, QueryEnodeEnvelope, QueryEnodePayload, Version};
use crate::monitoring::metrics::Metrics;
use crate::networking::transport::{AnnounceTransport, MessageCode};
use crate::protocol::endpoint_table::{EndpointTable, EndpointUpdate, QueryBookkeeping};
use crate::protocol::enode_certificate::CertificateCache;
use crate::protocol::gossip_cache::GossipDedup;
use crate::protocol::{query_backoff, ProtocolError, REGOSSIP_COOLDOWN};

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Handles the encrypted query protocol, both directions.
pub struct QueryProtocol {
    endpoint_table: Arc<EndpointTable>,
    consensus: Arc<dyn ConsensusProvider>,
    transport: Arc<dyn AnnounceTransport>,
    dedup: Arc<GossipDedup>,
    cert_cache: Arc<CertificateCache>,
    metrics: Arc<Metrics>,
}

impl QueryProtocol {
    /// Wire up the query protocol over its shared collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint_table: Arc<EndpointTable>,
        consensus: Arc<dyn ConsensusProvider>,
        transport: Arc<dyn AnnounceTransport>,
        dedup: Arc<GossipDedup>,
        cert_cache: Arc<CertificateCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { endpoint_table, consensus, transport, dedup, cert_cache, metrics }
    }

    /// Walk the endpoint table and push our URL to anyone stale, unknown,
    /// or whose backoff has elapsed. Returns `true` if a query was actually
    /// sent (the announce loop only arms a retry timer when this is so).
    pub fn build_and_send(&self, signer: &dyn Signer, announce_version: Version) -> Result<bool, ProtocolError> {
        let Some(self_url) = self.consensus.self_node_url() else {
            debug!("no self node url yet; skipping query build");
            return Ok(false);
        };
        let self_address = self.consensus.self_address();
        let now = unix_now();

        let mut encrypted_endpoints = Vec::new();
        let mut bookkeeping_updates = Vec::new();

        for entry in self.endpoint_table.get_all()? {
            if Some(entry.address) == self_address {
                continue;
            }
            if entry.version == entry.highest_known_version {
                continue;
            }
            let Some(public_key) = entry.public_key else {
                continue;
            };
            if let Some(last) = entry.last_query_timestamp {
                let timeout = query_backoff(entry.num_query_attempts_for_version).as_secs();
                if now.saturating_sub(last) < timeout {
                    continue;
                }
            }

            let ciphertext = crypto::ecies_encrypt(&public_key, self_url.as_bytes())?;
            encrypted_endpoints.push((entry.address, ciphertext));

            let mut update = EndpointUpdate::for_address(entry.address);
            update.query_bookkeeping = Some(QueryBookkeeping {
                version: entry.version,
                num_query_attempts_for_version: entry.num_query_attempts_for_version + 1,
                last_query_timestamp: now,
            });
            bookkeeping_updates.push(update);
        }

        if encrypted_endpoints.is_empty() {
            return Ok(false);
        }

        let payload = QueryEnodePayload { encrypted_endpoints, version: announce_version, timestamp: now };
        let hash = QueryEnodeEnvelope::payload_hash(&payload);
        let signature = signer.sign_recoverable(&hash)?;
        let envelope = QueryEnodeEnvelope { payload, signature };
        self.transport.multicast(MessageCode::QueryEnode, envelope.encode());
        self.endpoint_table.upsert(bookkeeping_updates)?;
        Ok(true)
    }

    /// Handle an inbound `QueryEnode` message.
    pub fn handle_inbound(&self, signer: &dyn Signer, bytes: &[u8]) -> Result<(), ProtocolError> {
        let envelope = QueryEnodeEnvelope::decode_bytes(bytes)?;
        let hash = QueryEnodeEnvelope::payload_hash(&envelope.payload);
        let (_, sender_address) = crypto::recover_signer(&hash, &envelope.signature)?;

        let active_set = self.consensus.active_set();
        if !active_set.contains(&sender_address) {
            return Err(ProtocolError::UnauthorizedSender);
        }
        self.validate(&envelope.payload, &active_set)?;

        let self_address = self.consensus.self_address();
        if let Some(self_addr) = self_address {
            if active_set.contains(&self_addr) {
                if let Some((_, ciphertext)) =
                    envelope.payload.encrypted_endpoints.iter().find(|(dest, _)| *dest == self_addr)
                {
                    match signer.decrypt(ciphertext) {
                        Ok(plaintext) => match std::str::from_utf8(&plaintext).ok().and_then(|s| Node::parse(s).ok()) {
                            Some(node) => {
                                if self.transport.is_connected(&sender_address) {
                                    if let Some(cert) = self.cert_cache.get() {
                                        let _ = self.transport.send_to(
                                            &sender_address,
                                            MessageCode::EnodeCertificate,
                                            cert.encode(),
                                        );
                                    }
                                }
                                let mut update = EndpointUpdate::for_address(sender_address);
                                update.node_and_version = Some((node, envelope.payload.version));
                                self.endpoint_table.upsert(vec![update])?;
                            }
                            None => debug!("query entry addressed to self did not decode to a node url"),
                        },
                        Err(e) => debug!(?e, "failed to decrypt self-addressed query entry"),
                    }
                }
            }
        }

        let now = Instant::now();
        let self_address_for_dedup = self_address.unwrap_or(Address([0u8; 20]));
        if self.dedup.should_regossip_query(&sender_address, &self_address_for_dedup, now, REGOSSIP_COOLDOWN) {
            self.transport.multicast(MessageCode::QueryEnode, bytes.to_vec());
            self.dedup.record_query_regossip(sender_address, now);
            self.metrics.query_regossip_total.inc();
        }
        Ok(())
    }

    fn validate(&self, payload: &QueryEnodePayload, active_set: &BTreeSet<Address>) -> Result<(), ProtocolError> {
        let mut seen = BTreeSet::new();
        for (dest, _) in &payload.encrypted_endpoints {
            if !seen.insert(*dest) {
                return Err(ProtocolError::ValidationRejected("duplicate destination in query"));
            }
        }
        if payload.encrypted_endpoints.len() > 2 * active_set.len() {
            return Err(ProtocolError::ValidationRejected("oversize query destination list"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus_iface::StaticConsensusProvider;
    use crate::core::crypto::CryptoError;
    use crate::core::types::{Hash32, PublicKey, RecoverableSignature};
    use crate::storage::kv::MemKvStore;
    use k256::ecdsa::SigningKey;
    use k256::SecretKey;
    use rand::rngs::OsRng;

    struct TestSigner {
        sk: SigningKey,
        ecies_secret: SecretKey,
    }

    impl Signer for TestSigner {
        fn public_key(&self) -> PublicKey {
            let encoded = self.sk.verifying_key().to_encoded_point(false);
            let mut out = [0u8; 64];
            out.copy_from_slice(&encoded.as_bytes()[1..]);
            PublicKey(out)
        }
        fn sign_recoverable(&self, prehash: &Hash32) -> Result<RecoverableSignature, CryptoError> {
            crypto::sign_recoverable(&self.sk, prehash)
        }
        fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            crypto::ecies_decrypt(&self.ecies_secret, ciphertext)
        }
    }

    fn signer(byte: u8) -> TestSigner {
        let mut bytes = [0u8; 32];
        bytes[0] = 6;
        bytes[31] = byte;
        TestSigner { sk: SigningKey::from_bytes((&bytes).into()).unwrap(), ecies_secret: SecretKey::random(&mut OsRng) }
    }

    struct NullTransport;
    impl AnnounceTransport for NullTransport {
        fn multicast(&self, _code: MessageCode, _payload: Vec<u8>) {}
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

    #[test]
    fn build_skips_self_and_up_to_date_and_unknown_pubkey() {
        let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));
        let me = signer(1);
        let consensus = Arc::new(StaticConsensusProvider::new(BTreeSet::new(), Some(me.address())));
        consensus.set_self_node_url(Some("enode://aabb@10.0.0.9:30303".to_string()));
        let transport = Arc::new(NullTransport);
        let dedup = Arc::new(GossipDedup::new());
        let cache = Arc::new(CertificateCache::new());
        let proto = QueryProtocol::new(endpoint_table.clone(), consensus, transport, dedup, cache, Arc::new(Metrics::new().unwrap()));

        // up-to-date entry: version == highest_known_version, should be skipped.
        let up_to_date = signer(2);
        let mut u = EndpointUpdate::for_address(up_to_date.address());
        u.public_key = Some(up_to_date.public_key());
        u.highest_known_version = Some(100);
        endpoint_table.upsert(vec![u]).unwrap();

        // unknown pubkey entry (only highest_known_version bumped, no node): still no pubkey set.
        let unknown = signer(3);
        let mut u2 = EndpointUpdate::for_address(unknown.address());
        u2.highest_known_version = Some(50);
        endpoint_table.upsert(vec![u2]).unwrap();

        let sent = proto.build_and_send(&me, 1).unwrap();
        assert!(!sent);
    }

    #[test]
    fn build_sends_for_stale_known_entry() {
        let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));
        let me = signer(4);
        let consensus = Arc::new(StaticConsensusProvider::new(BTreeSet::new(), Some(me.address())));
        consensus.set_self_node_url(Some("enode://aabb@10.0.0.9:30303".to_string()));
        let transport = Arc::new(NullTransport);
        let dedup = Arc::new(GossipDedup::new());
        let cache = Arc::new(CertificateCache::new());
        let proto = QueryProtocol::new(endpoint_table.clone(), consensus, transport, dedup, cache, Arc::new(Metrics::new().unwrap()));

        let stale = signer(5);
        let mut u = EndpointUpdate::for_address(stale.address());
        u.public_key = Some(stale.public_key());
        u.highest_known_version = Some(200);
        endpoint_table.upsert(vec![u]).unwrap();

        let sent = proto.build_and_send(&me, 1).unwrap();
        assert!(sent);
        let entry = endpoint_table.get(&stale.address()).unwrap().unwrap();
        assert_eq!(entry.num_query_attempts_for_version, 1);
    }

    #[test]
    fn inbound_rejects_non_active_sender() {
        let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));
        let consensus = Arc::new(StaticConsensusProvider::new(BTreeSet::new(), None));
        let transport = Arc::new(NullTransport);
        let dedup = Arc::new(GossipDedup::new());
        let cache = Arc::new(CertificateCache::new());
        let proto = QueryProtocol::new(endpoint_table, consensus, transport, dedup, cache, Arc::new(Metrics::new().unwrap()));

        let sender = signer(6);
        let payload = QueryEnodePayload { encrypted_endpoints: vec![], version: 1, timestamp: 1 };
        let hash = QueryEnodeEnvelope::payload_hash(&payload);
        let signature = crypto::sign_recoverable(&sender.sk, &hash).unwrap();
        let envelope = QueryEnodeEnvelope { payload, signature };

        let result = proto.handle_inbound(&sender, &envelope.encode());
        assert!(matches!(result, Err(ProtocolError::UnauthorizedSender)));
    }

    #[test]
    fn inbound_decrypts_self_addressed_entry_and_upserts_sender() {
        let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));
        let me = signer(7);
        let sender = signer(8);

        let mut active = BTreeSet::new();
        active.insert(me.address());
        active.insert(sender.address());
        let consensus = Arc::new(StaticConsensusProvider::new(active, Some(me.address())));
        let transport = Arc::new(NullTransport);
        let dedup = Arc::new(GossipDedup::new());
        let cache = Arc::new(CertificateCache::new());
        let proto = QueryProtocol::new(endpoint_table.clone(), consensus, transport, dedup, cache, Arc::new(Metrics::new().unwrap()));

        let my_pk = me.public_key();
        let url = "enode://aabbcc@10.0.0.5:30303";
        let ciphertext = crypto::ecies_encrypt(&my_pk, url.as_bytes()).unwrap();
        let payload =
            QueryEnodePayload { encrypted_endpoints: vec![(me.address(), ciphertext)], version: 77, timestamp: 1 };
        let hash = QueryEnodeEnvelope::payload_hash(&payload);
        let signature = crypto::sign_recoverable(&sender.sk, &hash).unwrap();
        let envelope = QueryEnodeEnvelope { payload, signature };

        proto.handle_inbound(&me, &envelope.encode()).unwrap();

        let entry = endpoint_table.get(&sender.address()).unwrap().unwrap();
        assert_eq!(entry.version, 77);
    }
}
