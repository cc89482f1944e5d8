#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use k256::ecdsa::SigningKey;

use valannounce::core::crypto::{self, CryptoError, Signer};
use valannounce::core::types::{EnodeCertificateEnvelope, EnodeCertificatePayload, Hash32, Node, PublicKey, RecoverableSignature};
use valannounce::protocol::enode_certificate::{CertificateCache, EnodeCertificateProtocol, ProxyRole};
use valannounce::protocol::endpoint_table::EndpointTable;
use valannounce::protocol::ProtocolError;
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
    bytes[0] = 88;
    bytes[31] = byte;
    TestSigner { sk: SigningKey::from_bytes((&bytes).into()).expect("valid scalar") }
}

/// spec.md §9 scenario 5 ("Proxy install"): a proxy installs a certificate
/// at version 50 from the validator it proxies, then must refuse a later
/// certificate for that same validator carrying a lower version rather than
/// silently overwriting its handshake credential.
#[test]
fn proxy_rejects_cert_version_regression() {
    let validator = signer(1);
    let url = format!("enode://{}@10.0.0.2:30303", hex::encode(validator.public_key().0));
    let node = Node::parse(&url).expect("valid node url");

    let endpoint_table = Arc::new(EndpointTable::new(Arc::new(MemKvStore::new())));
    let cache = Arc::new(CertificateCache::new());
    let role = ProxyRole { proxied_validator_address: validator.address(), own_node_id: node.node_id() };
    let proto = EnodeCertificateProtocol::new(endpoint_table, cache.clone(), Some(role));

    let cert_50 = proto.build(&validator, &url, 50).expect("mint cert");
    proto.handle_inbound(&cert_50.encode(), &BTreeSet::new()).expect("install cert at version 50");
    assert_eq!(cache.get().expect("cert cached").payload.version, 50);

    // Built by hand (not via `proto.build`, which always overwrites the
    // cache for a self-mint) to simulate a regression cert arriving over
    // the wire from the same validator identity.
    let payload_40 = EnodeCertificatePayload { enode_url: url, version: 40 };
    let hash_40 = EnodeCertificateEnvelope::payload_hash(&payload_40);
    let signature_40 = validator.sign_recoverable(&hash_40).expect("sign regression cert");
    let envelope_40 = EnodeCertificateEnvelope { payload: payload_40, signature: signature_40 };

    let err = proto
        .handle_inbound(&envelope_40.encode(), &BTreeSet::new())
        .expect_err("version regression must be rejected");
    assert!(matches!(err, ProtocolError::ValidationRejected(_)));
    assert_eq!(cache.get().expect("cert cached").payload.version, 50, "cache must still hold the higher version");
}
