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

//! Core data model: addresses, versions, node URLs, and the RLP wire types
//! exchanged by the announce/query/certificate protocols.

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 32-byte hash (Keccak256 output).
pub type Hash32 = [u8; 32];

/// Monotonically increasing, origin-scoped announce version (Unix seconds).
pub type Version = u64;

/// Domain separator mixed into the announce-version signing hash (Invariant A/B).
pub const SIGNED_ANNOUNCE_VERSION_DOMAIN: &[u8] = b"signedAnnounceVersion";

/// Codec errors for the wire types in this module.
#[derive(Debug, Error)]
pub enum CodecError {
    /// RLP decode failure.
    #[error("rlp decode")]
    Decode,
    /// A fixed-size field had the wrong length on the wire.
    #[error("invalid field length")]
    BadLength,
    /// The node URL could not be parsed.
    #[error("invalid node url")]
    BadNodeUrl,
}

impl From<DecoderError> for CodecError {
    fn from(_: DecoderError) -> Self {
        CodecError::Decode
    }
}

/// 20-byte validator address, `keccak256(uncompressed_pubkey)[12..]`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = CodecError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| CodecError::BadLength)?;
        if bytes.len() != 20 {
            return Err(CodecError::BadLength);
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl Encodable for Address {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.0.as_slice());
    }
}

impl Decodable for Address {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.as_val()?;
        if bytes.len() != 20 {
            return Err(DecoderError::RlpInvalidLength);
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

/// Uncompressed secp256k1 public key, 64 bytes (no `0x04` prefix), i.e. `x || y`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; 64]);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(0x{}...)", hex::encode(&self.0[..8]))
    }
}

impl Encodable for PublicKey {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.0.as_slice());
    }
}

impl Decodable for PublicKey {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.as_val()?;
        if bytes.len() != 64 {
            return Err(DecoderError::RlpInvalidLength);
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&bytes);
        Ok(PublicKey(out))
    }
}

/// Recoverable ECDSA (secp256k1) signature: `r || s` (64 bytes) plus a 1-byte recovery id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    /// `r || s`.
    pub rs: [u8; 64],
    /// Recovery id, 0 or 1.
    pub rec_id: u8,
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig(0x{}, v={})", hex::encode(self.rs), self.rec_id)
    }
}

impl RecoverableSignature {
    /// Serialize as `r || s || v` (65 bytes).
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&self.rs);
        out[64] = self.rec_id;
        out
    }

    /// Parse from a 65-byte `r || s || v` buffer.
    pub fn from_bytes(b: &[u8]) -> Result<Self, CodecError> {
        if b.len() != 65 {
            return Err(CodecError::BadLength);
        }
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&b[..64]);
        Ok(Self { rs, rec_id: b[64] })
    }
}

impl Encodable for RecoverableSignature {
    fn rlp_append(&self, s: &mut RlpStream) {
        let bytes = self.to_bytes();
        s.append(&bytes.as_slice());
    }
}

impl Decodable for RecoverableSignature {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.as_val()?;
        RecoverableSignature::from_bytes(&bytes).map_err(|_| DecoderError::RlpInvalidLength)
    }
}

/// A parsed network endpoint: identity public key plus reachable host/port.
///
/// `node_id` is stable across host/port churn (proxy migration, restarts on a
/// new address) because it is derived from the public key alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Node identity public key.
    pub public_key: PublicKey,
    /// Reachable host (IP or DNS name).
    pub host: String,
    /// Reachable port.
    pub port: u16,
}

impl Node {
    /// Stable identity, independent of `host`/`port`.
    pub fn node_id(&self) -> Hash32 {
        crate::core::crypto::keccak256(&self.public_key.0)
    }

    /// Parse `enode://<128-hex-char-pubkey>@host:port`.
    pub fn parse(url: &str) -> Result<Self, CodecError> {
        let rest = url.strip_prefix("enode://").ok_or(CodecError::BadNodeUrl)?;
        let (pk_hex, hostport) = rest.split_once('@').ok_or(CodecError::BadNodeUrl)?;
        let pk_bytes = hex::decode(pk_hex).map_err(|_| CodecError::BadNodeUrl)?;
        if pk_bytes.len() != 64 {
            return Err(CodecError::BadNodeUrl);
        }
        let mut pk = [0u8; 64];
        pk.copy_from_slice(&pk_bytes);

        let (host, port_s) = hostport.rsplit_once(':').ok_or(CodecError::BadNodeUrl)?;
        let port: u16 = port_s.parse().map_err(|_| CodecError::BadNodeUrl)?;
        if host.is_empty() {
            return Err(CodecError::BadNodeUrl);
        }

        Ok(Node {
            public_key: PublicKey(pk),
            host: host.to_string(),
            port,
        })
    }

    /// Encode back into `enode://<pubkey>@host:port`.
    pub fn to_url_string(&self) -> String {
        format!("enode://{}@{}:{}", hex::encode(self.public_key.0), self.host, self.port)
    }
}

/// Wire row for the flat version-vector flood (§4.3). `address`/`public_key`
/// are recovered from `signature`, never transmitted.
#[derive(Clone, Debug)]
pub struct SignedAnnounceVersion {
    /// Announce version.
    pub version: Version,
    /// Signature over `keccak256(rlp([SIGNED_ANNOUNCE_VERSION_DOMAIN, version]))`.
    pub signature: RecoverableSignature,
}

impl Encodable for SignedAnnounceVersion {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.version);
        s.append(&self.signature);
    }
}

impl Decodable for SignedAnnounceVersion {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(SignedAnnounceVersion {
            version: rlp.val_at(0)?,
            signature: rlp.val_at(1)?,
        })
    }
}

/// Hash signed to authenticate a `SignedAnnounceVersion` row.
pub fn version_signing_hash(version: Version) -> Hash32 {
    let mut s = RlpStream::new_list(2);
    s.append(&SIGNED_ANNOUNCE_VERSION_DOMAIN);
    s.append(&version);
    crate::core::crypto::keccak256(&s.out())
}

/// Encode a batch of rows for the `SignedAnnounceVersions` wire message.
pub fn encode_version_rows(rows: &[SignedAnnounceVersion]) -> Vec<u8> {
    let mut s = RlpStream::new_list(rows.len());
    for r in rows {
        s.append(r);
    }
    s.out().to_vec()
}

/// Decode the `SignedAnnounceVersions` wire message.
pub fn decode_version_rows(bytes: &[u8]) -> Result<Vec<SignedAnnounceVersion>, CodecError> {
    let rlp = Rlp::new(bytes);
    rlp.as_list::<SignedAnnounceVersion>().map_err(CodecError::from)
}

/// Query payload: per-recipient ECIES-encrypted endpoint URL, plus the
/// sender's announce version and a freshness timestamp.
#[derive(Clone, Debug)]
pub struct QueryEnodePayload {
    /// `(dest_address, ecies_ciphertext)` pairs.
    pub encrypted_endpoints: Vec<(Address, Vec<u8>)>,
    /// Sender's current announce version.
    pub version: Version,
    /// Sender's timestamp at build time (guarantees hash uniqueness on retry).
    pub timestamp: u64,
}

impl Encodable for QueryEnodePayload {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.begin_list(self.encrypted_endpoints.len());
        for (addr, ct) in &self.encrypted_endpoints {
            s.begin_list(2);
            s.append(addr);
            s.append(&ct.as_slice());
        }
        s.append(&self.version);
        s.append(&self.timestamp);
    }
}

impl Decodable for QueryEnodePayload {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let list_rlp = rlp.at(0)?;
        let mut encrypted_endpoints = Vec::with_capacity(list_rlp.item_count()?);
        for item in list_rlp.iter() {
            let addr: Address = item.val_at(0)?;
            let ct: Vec<u8> = item.val_at(1)?;
            encrypted_endpoints.push((addr, ct));
        }
        Ok(QueryEnodePayload {
            encrypted_endpoints,
            version: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
        })
    }
}

/// Signed `QueryEnode` envelope.
#[derive(Clone, Debug)]
pub struct QueryEnodeEnvelope {
    /// Payload.
    pub payload: QueryEnodePayload,
    /// Signature over `keccak256(rlp(payload))`.
    pub signature: RecoverableSignature,
}

impl Encodable for QueryEnodeEnvelope {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.payload);
        s.append(&self.signature);
    }
}

impl Decodable for QueryEnodeEnvelope {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(QueryEnodeEnvelope {
            payload: rlp.val_at(0)?,
            signature: rlp.val_at(1)?,
        })
    }
}

impl QueryEnodeEnvelope {
    /// Encode the full envelope for the wire.
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Decode a full envelope from the wire.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        rlp::decode(bytes).map_err(CodecError::from)
    }

    /// Hash of the payload alone, the value actually signed.
    pub fn payload_hash(payload: &QueryEnodePayload) -> Hash32 {
        crate::core::crypto::keccak256(&rlp::encode(payload))
    }
}

/// Endpoint certificate payload: `(enode_url, version)`.
#[derive(Clone, Debug)]
pub struct EnodeCertificatePayload {
    /// Full enode URL string.
    pub enode_url: String,
    /// Announce version this URL is valid at.
    pub version: Version,
}

impl Encodable for EnodeCertificatePayload {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.enode_url.as_bytes());
        s.append(&self.version);
    }
}

impl Decodable for EnodeCertificatePayload {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let url_bytes: Vec<u8> = rlp.val_at(0)?;
        let enode_url = String::from_utf8(url_bytes).map_err(|_| DecoderError::Custom("utf8"))?;
        Ok(EnodeCertificatePayload {
            enode_url,
            version: rlp.val_at(1)?,
        })
    }
}

/// Signed endpoint certificate envelope.
#[derive(Clone, Debug)]
pub struct EnodeCertificateEnvelope {
    /// Payload.
    pub payload: EnodeCertificatePayload,
    /// Signature over `keccak256(rlp(payload))`.
    pub signature: RecoverableSignature,
}

impl Encodable for EnodeCertificateEnvelope {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.payload);
        s.append(&self.signature);
    }
}

impl Decodable for EnodeCertificateEnvelope {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(EnodeCertificateEnvelope {
            payload: rlp.val_at(0)?,
            signature: rlp.val_at(1)?,
        })
    }
}

impl EnodeCertificateEnvelope {
    /// Encode the full envelope for the wire.
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Decode a full envelope from the wire.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        rlp::decode(bytes).map_err(CodecError::from)
    }

    /// Hash of the payload alone, the value actually signed.
    pub fn payload_hash(payload: &EnodeCertificatePayload) -> Hash32 {
        crate::core::crypto::keccak256(&rlp::encode(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_url_round_trips() {
        let pk = [7u8; 64];
        let node = Node {
            public_key: PublicKey(pk),
            host: "10.0.0.5".to_string(),
            port: 30303,
        };
        let s = node.to_url_string();
        let parsed = Node::parse(&s).expect("parse");
        assert_eq!(parsed, node);
    }

    #[test]
    fn node_id_independent_of_hostport() {
        let pk = [9u8; 64];
        let a = Node { public_key: PublicKey(pk), host: "1.2.3.4".into(), port: 1 };
        let b = Node { public_key: PublicKey(pk), host: "5.6.7.8".into(), port: 2 };
        assert_eq!(a.node_id(), b.node_id());
    }

    #[test]
    fn version_rows_round_trip() {
        let rows = vec![
            SignedAnnounceVersion { version: 1000, signature: RecoverableSignature { rs: [1u8; 64], rec_id: 0 } },
            SignedAnnounceVersion { version: 2000, signature: RecoverableSignature { rs: [2u8; 64], rec_id: 1 } },
        ];
        let enc = encode_version_rows(&rows);
        let dec = decode_version_rows(&enc).expect("decode");
        assert_eq!(dec.len(), 2);
        assert_eq!(dec[0].version, 1000);
        assert_eq!(dec[1].version, 2000);
        assert_eq!(dec[1].signature.rec_id, 1);
    }

    #[test]
    fn query_envelope_round_trips() {
        let payload = QueryEnodePayload {
            encrypted_endpoints: vec![(Address([1u8; 20]), vec![0xde, 0xad, 0xbe, 0xef])],
            version: 42,
            timestamp: 12345,
        };
        let env = QueryEnodeEnvelope { payload, signature: RecoverableSignature { rs: [3u8; 64], rec_id: 1 } };
        let bytes = env.encode();
        let back = QueryEnodeEnvelope::decode_bytes(&bytes).expect("decode");
        assert_eq!(back.payload.version, 42);
        assert_eq!(back.payload.encrypted_endpoints.len(), 1);
        assert_eq!(back.payload.encrypted_endpoints[0].0, Address([1u8; 20]));
    }

    #[test]
    fn cert_envelope_round_trips() {
        let payload = EnodeCertificatePayload { enode_url: "enode://aa@1.2.3.4:30303".into(), version: 7 };
        let env = EnodeCertificateEnvelope { payload, signature: RecoverableSignature { rs: [4u8; 64], rec_id: 0 } };
        let bytes = env.encode();
        let back = EnodeCertificateEnvelope::decode_bytes(&bytes).expect("decode");
        assert_eq!(back.payload.version, 7);
        assert_eq!(back.payload.enode_url, "enode://aa@1.2.3.4:30303");
    }
}
