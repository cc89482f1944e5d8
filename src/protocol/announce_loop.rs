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

//! The announce loop (§4.5): a single-threaded `tokio::select!` state
//! machine owning the `announcing` flag, the current announce version, and
//! the dynamically-armed retry timer. Every external trigger — ticks,
//! inbound messages, the `updateAnnounceVersion` RPC — funnels through this
//! one task; nothing outside it mutates loop state directly.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::consensus_iface::ConsensusProvider;
use crate::core::crypto::{self, Signer};
use crate::core::types::{
    version_signing_hash, Address, EnodeCertificateEnvelope, QueryEnodeEnvelope, SignedAnnounceVersion, Version,
};
use crate::monitoring::metrics::Metrics;
use crate::networking::transport::{AnnounceTransport, InboundMessage, MessageCode};
use crate::protocol::endpoint_table::EndpointTable;
use crate::protocol::enode_certificate::{CertificateCache, EnodeCertificateProtocol};
use crate::protocol::gossip_cache::GossipDedup;
use crate::protocol::query_protocol::QueryProtocol;
use crate::protocol::version_protocol::VersionProtocol;
use crate::protocol::version_table::VersionTable;
use crate::protocol::{
    ProtocolError, INITIAL_QUERY_DELAY, MEMBERSHIP_TICK, PRUNE_INTERVAL, QUERY_INTERVAL, QUERY_RETRY_TIMER,
    VERSION_BUMP_INTERVAL, VERSION_SHARE_INTERVAL,
};

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Handles external callers use to talk to a running announce loop.
pub struct AnnounceLoopHandle {
    /// Non-blocking "someone might be behind" signal; capacity 1, extras dropped.
    pub kick_query: mpsc::Sender<()>,
    /// Force a version bump and wait for it to complete.
    pub update_version: mpsc::Sender<oneshot::Sender<()>>,
}

struct LoopState {
    announcing: bool,
    announce_version: Version,
    retry_deadline: Option<Instant>,
    initial_query_deadline: Option<Instant>,
}

fn recover_message_sender(code: MessageCode, payload: &[u8]) -> Option<Address> {
    match code {
        MessageCode::SignedAnnounceVersions => {
            let rows = crate::core::types::decode_version_rows(payload).ok()?;
            let first = rows.first()?;
            let hash = version_signing_hash(first.version);
            crypto::recover_signer(&hash, &first.signature).ok().map(|(_, a)| a)
        }
        MessageCode::QueryEnode => {
            let env = QueryEnodeEnvelope::decode_bytes(payload).ok()?;
            let hash = QueryEnodeEnvelope::payload_hash(&env.payload);
            crypto::recover_signer(&hash, &env.signature).ok().map(|(_, a)| a)
        }
        MessageCode::EnodeCertificate => {
            let env = EnodeCertificateEnvelope::decode_bytes(payload).ok()?;
            let hash = EnodeCertificateEnvelope::payload_hash(&env.payload);
            crypto::recover_signer(&hash, &env.signature).ok().map(|(_, a)| a)
        }
    }
}

/// Spawn the announce loop task. Returns a handle for external callers plus
/// the task's join handle.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    consensus: Arc<dyn ConsensusProvider>,
    signer: Arc<dyn Signer>,
    transport: Arc<dyn AnnounceTransport>,
    version_table: Arc<VersionTable>,
    endpoint_table: Arc<EndpointTable>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    proxy_address: Option<Address>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
) -> (AnnounceLoopHandle, tokio::task::JoinHandle<()>) {
    let dedup = Arc::new(GossipDedup::new());
    let cert_cache = Arc::new(CertificateCache::new());

    let (kick_tx, mut kick_rx) = mpsc::channel::<()>(1);
    let (update_tx, mut update_rx) = mpsc::channel::<oneshot::Sender<()>>(8);

    let version_protocol = Arc::new(VersionProtocol::new(
        version_table.clone(),
        endpoint_table.clone(),
        consensus.clone(),
        transport.clone(),
        dedup.clone(),
        kick_tx.clone(),
        metrics.clone(),
    ));
    let query_protocol = Arc::new(QueryProtocol::new(
        endpoint_table.clone(),
        consensus.clone(),
        transport.clone(),
        dedup.clone(),
        cert_cache.clone(),
        metrics.clone(),
    ));
    let cert_protocol = Arc::new(EnodeCertificateProtocol::new(endpoint_table.clone(), cert_cache.clone(), None));

    let handle = AnnounceLoopHandle { kick_query: kick_tx.clone(), update_version: update_tx };

    let join = tokio::spawn(async move {
        let mut state = LoopState { announcing: false, announce_version: 0, retry_deadline: None, initial_query_deadline: None };

        let mut membership_tick = interval(MEMBERSHIP_TICK);
        membership_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut version_share_tick = interval(VERSION_SHARE_INTERVAL);
        version_share_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut version_bump_tick = interval(VERSION_BUMP_INTERVAL);
        version_bump_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune_tick = interval(PRUNE_INTERVAL);
        prune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut query_tick = interval(QUERY_INTERVAL);
        query_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("announce loop started");

        loop {
            let far_future = Instant::now() + Duration::from_secs(3600);
            let retry_deadline = state.retry_deadline.unwrap_or(far_future);
            let initial_query_deadline = state.initial_query_deadline.unwrap_or(far_future);

            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("announce loop shutting down");
                        break;
                    }
                }

                _ = membership_tick.tick() => {
                    let should_announce = consensus.core_running()
                        && consensus.self_address().is_some_and(|a| consensus.active_set().contains(&a));
                    if should_announce && !state.announcing {
                        state.announcing = true;
                        match attempt_version_bump(
                            &mut state.announce_version,
                            &*consensus,
                            &*signer,
                            &*transport,
                            &version_table,
                            &cert_protocol,
                            proxy_address,
                        ) {
                            Ok(true) => metrics.cert_minted_total.inc(),
                            Ok(false) => {}
                            Err(e) => {
                                metrics.record_protocol_error(&e);
                                warn!(?e, "version bump on announcing edge failed");
                            }
                        }
                        state.initial_query_deadline = Some(Instant::now() + INITIAL_QUERY_DELAY);
                    } else if !should_announce && state.announcing {
                        state.announcing = false;
                        state.retry_deadline = None;
                    }
                }

                _ = version_share_tick.tick() => {
                    if let Err(e) = version_protocol.share() {
                        metrics.record_protocol_error(&e);
                        warn!(?e, "version share failed");
                    }
                }

                _ = version_bump_tick.tick() => {
                    if state.announcing {
                        match attempt_version_bump(
                            &mut state.announce_version,
                            &*consensus,
                            &*signer,
                            &*transport,
                            &version_table,
                            &cert_protocol,
                            proxy_address,
                        ) {
                            Ok(true) => metrics.cert_minted_total.inc(),
                            Ok(false) => {}
                            Err(e) => {
                                metrics.record_protocol_error(&e);
                                warn!(?e, "periodic version bump failed");
                            }
                        }
                    }
                }

                _ = prune_tick.tick() => {
                    let active = consensus.active_set();
                    if let Err(e) = version_table.prune(&active) {
                        warn!(?e, "version table prune failed");
                    }
                    if let Err(e) = endpoint_table.prune(&active) {
                        warn!(?e, "endpoint table prune failed");
                    }
                    dedup.prune(&active);
                    if let Ok(rows) = version_table.get_all() {
                        metrics.version_table_size.set(rows.len() as i64);
                    }
                    if let Ok(rows) = endpoint_table.get_all() {
                        metrics.endpoint_table_size.set(rows.len() as i64);
                    }
                }

                _ = query_tick.tick() => {
                    if state.announcing && kick_tx.try_send(()).is_err() {
                        debug!("query-build already pending; dropping periodic kick");
                    }
                }

                _ = sleep_until(retry_deadline), if state.retry_deadline.is_some() => {
                    state.retry_deadline = None;
                    if kick_tx.try_send(()).is_err() {
                        debug!("query-build already pending; dropping retry kick");
                    }
                }

                _ = sleep_until(initial_query_deadline), if state.initial_query_deadline.is_some() => {
                    state.initial_query_deadline = None;
                    if kick_tx.try_send(()).is_err() {
                        debug!("query-build already pending; dropping initial-query kick");
                    }
                }

                Some(()) = kick_rx.recv() => {
                    if state.announcing {
                        match query_protocol.build_and_send(&*signer, state.announce_version) {
                            Ok(true) => {
                                metrics.query_sent_total.inc();
                                if state.retry_deadline.is_none() {
                                    state.retry_deadline = Some(Instant::now() + QUERY_RETRY_TIMER);
                                }
                            }
                            Ok(false) => {}
                            Err(e) => {
                                metrics.record_protocol_error(&e);
                                warn!(?e, "query build failed");
                            }
                        }
                    }
                }

                Some(ack) = update_rx.recv() => {
                    match attempt_version_bump(
                        &mut state.announce_version,
                        &*consensus,
                        &*signer,
                        &*transport,
                        &version_table,
                        &cert_protocol,
                        proxy_address,
                    ) {
                        Ok(true) => metrics.cert_minted_total.inc(),
                        Ok(false) => {}
                        Err(e) => {
                            metrics.record_protocol_error(&e);
                            warn!(?e, "forced version bump failed");
                        }
                    }
                    let _ = ack.send(());
                }

                maybe_msg = inbound_rx.recv() => {
                    match maybe_msg {
                        Some(InboundMessage { peer, code, payload }) => {
                            if let Some(sender) = recover_message_sender(code, &payload) {
                                transport.bind_address(sender, peer);
                            }
                            let result = match code {
                                MessageCode::SignedAnnounceVersions => version_protocol.handle_inbound(&payload),
                                MessageCode::QueryEnode => query_protocol.handle_inbound(&*signer, &payload),
                                MessageCode::EnodeCertificate => {
                                    cert_protocol.handle_inbound(&payload, &consensus.active_set())
                                }
                            };
                            log_protocol_result(code, result, &metrics);
                        }
                        None => {
                            warn!("inbound channel closed; stopping announce loop");
                            break;
                        }
                    }
                }
            }
        }
    });

    (handle, join)
}

fn log_protocol_result(code: MessageCode, result: Result<(), ProtocolError>, metrics: &Metrics) {
    match result {
        Ok(()) => {}
        Err(ProtocolError::UnauthorizedSender) => debug!(?code, "dropped message from unauthorized sender"),
        Err(ProtocolError::MalformedMessage) => {
            metrics.record_protocol_error(&ProtocolError::MalformedMessage);
            warn!(?code, "dropped malformed message");
        }
        Err(ProtocolError::ValidationRejected(reason)) => {
            metrics.record_protocol_error(&ProtocolError::ValidationRejected(reason));
            info!(?code, reason, "dropped message failing validation");
        }
        Err(e) => {
            metrics.record_protocol_error(&e);
            warn!(?code, ?e, "error handling inbound message");
        }
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageCode::SignedAnnounceVersions => "SignedAnnounceVersions",
            MessageCode::QueryEnode => "QueryEnode",
            MessageCode::EnodeCertificate => "EnodeCertificate",
        };
        f.write_str(s)
    }
}

/// The version-bump procedure (§4.5): mint a certificate, forward it to our
/// own proxy if we run behind one, multicast it to the mesh, sign a new
/// version row, and upsert-and-gossip it. No-ops if `now_unix` does not
/// strictly exceed the current version.
#[allow(clippy::too_many_arguments)]
fn attempt_version_bump(
    announce_version: &mut Version,
    consensus: &dyn ConsensusProvider,
    signer: &dyn Signer,
    transport: &dyn AnnounceTransport,
    version_table: &VersionTable,
    cert_protocol: &EnodeCertificateProtocol,
    proxy_address: Option<Address>,
) -> Result<bool, ProtocolError> {
    let candidate = unix_now();
    if candidate <= *announce_version {
        return Ok(false);
    }

    let Some(url) = consensus.self_node_url() else {
        debug!("no self node url yet; skipping version bump");
        return Ok(false);
    };

    let cert = cert_protocol.build(signer, &url, candidate)?;
    let cert_bytes = cert.encode();

    if let Some(proxy) = proxy_address {
        let _ = transport.send_to(&proxy, MessageCode::EnodeCertificate, cert_bytes.clone());
    }
    transport.multicast(MessageCode::EnodeCertificate, cert_bytes);

    let hash = version_signing_hash(candidate);
    let signature = signer.sign_recoverable(&hash)?;
    let row = SignedAnnounceVersion { version: candidate, signature };
    let new_entries = version_table.upsert(vec![row.clone()])?;
    if !new_entries.is_empty() {
        transport.multicast(
            MessageCode::SignedAnnounceVersions,
            crate::core::types::encode_version_rows(&[row]),
        );
    }

    *announce_version = candidate;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus_iface::StaticConsensusProvider;
    use crate::core::crypto::CryptoError;
    use crate::core::types::{Hash32, PublicKey, RecoverableSignature};
    use crate::storage::kv::MemKvStore;
    use k256::ecdsa::SigningKey;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct TestSigner {
        sk: SigningKey,
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
        fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Err(CryptoError::Malformed)
        }
    }

    struct RecordingTransport {
        sent: Mutex<Vec<MessageCode>>,
    }
    impl AnnounceTransport for RecordingTransport {
        fn multicast(&self, code: MessageCode, _payload: Vec<u8>) {
            self.sent.lock().unwrap().push(code);
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

    #[test]
    fn version_bump_is_noop_when_not_strictly_increasing() {
        let version_table = VersionTable::new(Arc::new(MemKvStore::new()));
        let signer = TestSigner { sk: SigningKey::from_bytes((&[9u8; 32]).into()).unwrap() };
        let consensus = StaticConsensusProvider::new(BTreeSet::new(), Some(signer.address()));
        consensus.set_self_node_url(Some(format!("enode://{}@10.0.0.1:30303", hex::encode(signer.public_key().0))));
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let cert_cache = Arc::new(CertificateCache::new());
        let cert_protocol =
            EnodeCertificateProtocol::new(Arc::new(EndpointTable::new(Arc::new(MemKvStore::new()))), cert_cache, None);

        let mut version = u64::MAX;
        let bumped =
            attempt_version_bump(&mut version, &consensus, &signer, &transport, &version_table, &cert_protocol, None)
                .unwrap();
        assert!(!bumped);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn version_bump_mints_cert_and_row() {
        let version_table = VersionTable::new(Arc::new(MemKvStore::new()));
        let signer = TestSigner { sk: SigningKey::from_bytes((&[11u8; 32]).into()).unwrap() };
        let consensus = StaticConsensusProvider::new(BTreeSet::new(), Some(signer.address()));
        consensus.set_self_node_url(Some(format!("enode://{}@10.0.0.1:30303", hex::encode(signer.public_key().0))));
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let cert_cache = Arc::new(CertificateCache::new());
        let cert_protocol =
            EnodeCertificateProtocol::new(Arc::new(EndpointTable::new(Arc::new(MemKvStore::new()))), cert_cache.clone(), None);

        let mut version = 0u64;
        let bumped =
            attempt_version_bump(&mut version, &consensus, &signer, &transport, &version_table, &cert_protocol, None)
                .unwrap();
        assert!(bumped);
        assert!(version > 0);
        assert!(cert_cache.get().is_some());
        let sent = transport.sent.lock().unwrap();
        assert!(sent.contains(&MessageCode::EnodeCertificate));
        assert!(sent.contains(&MessageCode::SignedAnnounceVersions));
    }
}
