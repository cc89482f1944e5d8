#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k256::ecdsa::SigningKey;

use valannounce::consensus_iface::StaticConsensusProvider;
use valannounce::core::crypto::{self, CryptoError, Signer};
use valannounce::core::types::{Address, Hash32, PublicKey, RecoverableSignature};
use valannounce::monitoring::metrics::Metrics;
use valannounce::networking::transport::{AnnounceTransport, MessageCode, TransportError};
use valannounce::protocol::announce_loop;
use valannounce::protocol::endpoint_table::{EndpointTable, EndpointUpdate};
use valannounce::protocol::version_table::VersionTable;
use valannounce::storage::kv::MemKvStore;

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

fn signer(byte: u8) -> TestSigner {
    let mut bytes = [0u8; 32];
    bytes[0] = 77;
    bytes[31] = byte;
    TestSigner { sk: SigningKey::from_bytes((&bytes).into()).expect("valid scalar") }
}

struct RecordingTransport {
    sent: Mutex<Vec<(MessageCode, Vec<u8>)>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    fn codes(&self) -> Vec<MessageCode> {
        self.sent.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }
}

impl AnnounceTransport for RecordingTransport {
    fn multicast(&self, code: MessageCode, payload: Vec<u8>) {
        self.sent.lock().unwrap().push((code, payload));
    }
    fn send_to(&self, _address: &Address, _code: MessageCode, _payload: Vec<u8>) -> Result<(), TransportError> {
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

/// Drives the real spawned announce loop (not the bare `attempt_version_bump`
/// helper the unit tests exercise) through both halves of fresh-join
/// convergence (spec.md §8 scenario 1): the version-bump procedure publishes
/// our own signed version and certificate, and the query builder delivers
/// our URL to a peer the endpoint table already marks stale.
#[tokio::test]
async fn announce_loop_converges_self_bump_and_stale_peer_query() {
    let me = signer(1);
    let me_address = me.address();
    let stale_peer = signer(2);

    let mut active = BTreeSet::new();
    active.insert(me_address);
    active.insert(stale_peer.address());

    let consensus = Arc::new(StaticConsensusProvider::new(active, Some(me_address)));
    consensus.set_self_node_url(Some(format!("enode://{}@10.0.0.1:30303", hex::encode(me.public_key().0))));

    let version_table = Arc::new(VersionTable::new(Arc::new(MemKvStore::new())));
    let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));

    // Seed the endpoint table as if a version flood already told us about
    // `stale_peer` at version 500 but we never received their URL.
    let mut seed = EndpointUpdate::for_address(stale_peer.address());
    seed.public_key = Some(stale_peer.public_key());
    seed.highest_known_version = Some(500);
    endpoint_table.upsert(vec![seed]).expect("seed upsert");

    let transport = Arc::new(RecordingTransport::new());
    let (_inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));

    let (handle, join) = announce_loop::spawn(
        consensus,
        Arc::new(me),
        transport.clone(),
        version_table.clone(),
        endpoint_table.clone(),
        inbound_rx,
        None,
        shutdown_rx,
        metrics,
    );

    // Force the version bump the 5s membership tick would otherwise drive,
    // and wait for the loop to acknowledge it.
    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    let _ = handle.update_version.send(ack_tx).await;
    ack_rx.await.expect("bump acked");

    let own_row = version_table.get(&me_address).unwrap().expect("own version row present");
    assert!(own_row.version > 0);
    assert!(transport.codes().contains(&MessageCode::EnodeCertificate));
    assert!(transport.codes().contains(&MessageCode::SignedAnnounceVersions));

    // Kick the query builder; `stale_peer` has a known public key and
    // highest_known_version > version, so it must be addressed in the
    // outbound QueryEnode payload within one full cycle.
    let _ = handle.kick_query.send(()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.codes().contains(&MessageCode::QueryEnode));

    let entry = endpoint_table.get(&stale_peer.address()).unwrap().expect("entry present");
    assert_eq!(entry.num_query_attempts_for_version, 1);

    let _ = shutdown_tx.send(true);
    let _ = join.await;
}
