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

//! Durable `(validator_addr -> signed announce version)` store with
//! signer-recovery (Invariants A/B).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::core::crypto;
use crate::core::types::{version_signing_hash, Address, PublicKey, RecoverableSignature, SignedAnnounceVersion, Version};
use crate::protocol::ProtocolError;
use crate::storage::kv::{KvOp, KvStore};

const TREE: &str = "version_table";

/// A row as held in the table: the recovered identity plus the signed
/// version and the signature that authenticated it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionEntry {
    /// Recovered validator address.
    pub address: Address,
    /// Recovered public key.
    pub public_key: PublicKey,
    /// The highest version ever observed with a valid signature.
    pub version: Version,
    /// The signature that authenticated `version`.
    pub signature: RecoverableSignature,
}

fn encode_entry(e: &VersionEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + 8 + 65);
    out.extend_from_slice(&e.public_key.0);
    out.extend_from_slice(&e.version.to_be_bytes());
    out.extend_from_slice(&e.signature.to_bytes());
    out
}

fn decode_entry(address: Address, bytes: &[u8]) -> Result<VersionEntry, ProtocolError> {
    if bytes.len() != 64 + 8 + 65 {
        return Err(ProtocolError::MalformedMessage);
    }
    let mut public_key = [0u8; 64];
    public_key.copy_from_slice(&bytes[..64]);
    let mut version_bytes = [0u8; 8];
    version_bytes.copy_from_slice(&bytes[64..72]);
    let version = u64::from_be_bytes(version_bytes);
    let signature = RecoverableSignature::from_bytes(&bytes[72..137]).map_err(|_| ProtocolError::MalformedMessage)?;
    Ok(VersionEntry { address, public_key: PublicKey(public_key), version, signature })
}

/// Version table: one row per validator, keyed by address.
pub struct VersionTable {
    store: Arc<dyn KvStore>,
}

impl VersionTable {
    /// Wrap a `KvStore` as a version table.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Look up the current row for `address`, if any.
    pub fn get(&self, address: &Address) -> Result<Option<VersionEntry>, ProtocolError> {
        match self.store.get(TREE, &address.0)? {
            Some(bytes) => Ok(Some(decode_entry(*address, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Full dump, for periodic sharing (§4.3 outbound cadence).
    pub fn get_all(&self) -> Result<Vec<VersionEntry>, ProtocolError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_all(TREE)? {
            if key.len() != 20 {
                continue;
            }
            let mut addr = [0u8; 20];
            addr.copy_from_slice(&key);
            out.push(decode_entry(Address(addr), &value)?);
        }
        Ok(out)
    }

    /// Validate and recover each row, keep only those that strictly advance
    /// the stored version for their address, commit survivors atomically,
    /// and return them (what must be regossiped).
    pub fn upsert(&self, rows: Vec<SignedAnnounceVersion>) -> Result<Vec<VersionEntry>, ProtocolError> {
        let mut running_best: HashMap<Address, Version> = HashMap::new();
        let mut survivors = Vec::new();
        let mut ops = Vec::new();

        for row in rows {
            let hash = version_signing_hash(row.version);
            let (public_key, address) = crypto::recover_signer(&hash, &row.signature)?;

            let base = match running_best.get(&address) {
                Some(v) => *v,
                None => self.get(&address)?.map(|e| e.version).unwrap_or(0),
            };
            if row.version <= base {
                continue;
            }
            running_best.insert(address, row.version);

            let entry = VersionEntry { address, public_key, version: row.version, signature: row.signature };
            ops.push(KvOp::Put { key: address.0.to_vec(), value: encode_entry(&entry) });
            survivors.push(entry);
        }

        if !ops.is_empty() {
            self.store.commit_atomic(TREE, ops)?;
        }
        Ok(survivors)
    }

    /// Remove every row whose address is absent from `active_set`.
    pub fn prune(&self, active_set: &BTreeSet<Address>) -> Result<usize, ProtocolError> {
        let mut ops = Vec::new();
        for (key, _) in self.store.scan_all(TREE)? {
            if key.len() != 20 {
                continue;
            }
            let mut addr = [0u8; 20];
            addr.copy_from_slice(&key);
            if !active_set.contains(&Address(addr)) {
                ops.push(KvOp::Del { key });
            }
        }
        let removed = ops.len();
        if removed > 0 {
            self.store.commit_atomic(TREE, ops)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemKvStore;
    use k256::ecdsa::SigningKey;

    fn key(byte: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[0] = 3;
        bytes[31] = byte;
        SigningKey::from_bytes((&bytes).into()).unwrap()
    }

    fn row(signing_key: &SigningKey, version: Version) -> SignedAnnounceVersion {
        let hash = version_signing_hash(version);
        let signature = crypto::sign_recoverable(signing_key, &hash).unwrap();
        SignedAnnounceVersion { version, signature }
    }

    #[test]
    fn upsert_rejects_non_increasing_version() {
        let table = VersionTable::new(Arc::new(MemKvStore::new()));
        let sk = key(1);

        let new1 = table.upsert(vec![row(&sk, 2000)]).unwrap();
        assert_eq!(new1.len(), 1);

        let new2 = table.upsert(vec![row(&sk, 1500)]).unwrap();
        assert!(new2.is_empty());

        let stored = table.get(&new1[0].address).unwrap().unwrap();
        assert_eq!(stored.version, 2000);
    }

    #[test]
    fn upsert_is_idempotent() {
        let table = VersionTable::new(Arc::new(MemKvStore::new()));
        let sk = key(2);
        let r = row(&sk, 42);

        let first = table.upsert(vec![r.clone()]).unwrap();
        assert_eq!(first.len(), 1);
        let second = table.upsert(vec![r]).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn upsert_within_batch_honors_running_max() {
        let table = VersionTable::new(Arc::new(MemKvStore::new()));
        let sk = key(3);

        let survivors = table.upsert(vec![row(&sk, 200), row(&sk, 100), row(&sk, 300)]).unwrap();
        // 200 survives (first seen), 100 is rejected against running max 200, 300 survives.
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors.last().unwrap().version, 300);
    }

    #[test]
    fn prune_drops_inactive_addresses() {
        let table = VersionTable::new(Arc::new(MemKvStore::new()));
        let sk_a = key(10);
        let sk_b = key(11);
        let a = table.upsert(vec![row(&sk_a, 1)]).unwrap()[0].address;
        let b = table.upsert(vec![row(&sk_b, 1)]).unwrap()[0].address;

        let mut active = BTreeSet::new();
        active.insert(a);

        let removed = table.prune(&active).unwrap();
        assert_eq!(removed, 1);
        assert!(table.get(&a).unwrap().is_some());
        assert!(table.get(&b).unwrap().is_none());
    }
}
