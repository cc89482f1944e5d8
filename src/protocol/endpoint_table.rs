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

//! Durable `(validator_addr -> endpoint state)` store (§4.2), the table that
//! decides who is stale and therefore eligible for a query.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::core::types::{Address, Node, PublicKey, Version};
use crate::protocol::ProtocolError;
use crate::storage::kv::{KvOp, KvStore};

const TREE: &str = "endpoint_table";

/// One validator's known endpoint state.
///
/// Invariant C: `version <= highest_known_version`. Invariant D: the entry
/// is stale (query-eligible) when `version < highest_known_version`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointEntry {
    /// The validator this entry describes.
    pub address: Address,
    /// Parsed endpoint URL, if one has been delivered yet.
    pub node: Option<Node>,
    /// Identity public key, learned from a version row or a delivered URL.
    pub public_key: Option<PublicKey>,
    /// The version the currently-held `node` was delivered at.
    pub version: Version,
    /// The largest version announced for this address we've ever seen.
    pub highest_known_version: Version,
    /// Query attempts made against the current `version`.
    pub num_query_attempts_for_version: u32,
    /// Timestamp of the last query attempt against the current `version`.
    pub last_query_timestamp: Option<u64>,
}

impl EndpointEntry {
    fn empty(address: Address) -> Self {
        Self {
            address,
            node: None,
            public_key: None,
            version: 0,
            highest_known_version: 0,
            num_query_attempts_for_version: 0,
            last_query_timestamp: None,
        }
    }

    /// Invariant D: stale and therefore query-eligible.
    pub fn is_stale(&self) -> bool {
        self.version < self.highest_known_version
    }
}

impl fmt::Display for EndpointEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} node={} version={} highest_known={} attempts={}",
            self.address,
            self.node.as_ref().map(Node::to_url_string).unwrap_or_else(|| "<none>".to_string()),
            self.version,
            self.highest_known_version,
            self.num_query_attempts_for_version,
        )
    }
}

impl Encodable for EndpointEntry {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(10);
        s.append(&self.address);
        match &self.node {
            Some(n) => {
                s.append(&1u8);
                s.append(&n.to_url_string());
            }
            None => {
                s.append(&0u8);
                s.append(&"");
            }
        }
        match &self.public_key {
            Some(pk) => {
                s.append(&1u8);
                s.append(pk);
            }
            None => {
                s.append(&0u8);
                s.append(&[0u8; 64].as_slice());
            }
        }
        s.append(&self.version);
        s.append(&self.highest_known_version);
        s.append(&self.num_query_attempts_for_version);
        match self.last_query_timestamp {
            Some(t) => {
                s.append(&1u8);
                s.append(&t);
            }
            None => {
                s.append(&0u8);
                s.append(&0u64);
            }
        }
    }
}

impl Decodable for EndpointEntry {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let address: Address = rlp.val_at(0)?;

        let node_flag: u8 = rlp.val_at(1)?;
        let node_url: String = rlp.val_at(2)?;
        let node = if node_flag == 1 {
            Some(Node::parse(&node_url).map_err(|_| DecoderError::Custom("node url"))?)
        } else {
            None
        };

        let pk_flag: u8 = rlp.val_at(3)?;
        let pk: PublicKey = rlp.val_at(4)?;
        let public_key = if pk_flag == 1 { Some(pk) } else { None };

        let version: Version = rlp.val_at(5)?;
        let highest_known_version: Version = rlp.val_at(6)?;
        let num_query_attempts_for_version: u32 = rlp.val_at(7)?;

        let ts_flag: u8 = rlp.val_at(8)?;
        let ts: u64 = rlp.val_at(9)?;
        let last_query_timestamp = if ts_flag == 1 { Some(ts) } else { None };

        Ok(EndpointEntry {
            address,
            node,
            public_key,
            version,
            highest_known_version,
            num_query_attempts_for_version,
            last_query_timestamp,
        })
    }
}

/// Query bookkeeping update, accepted only if it matches the entry's current
/// `version` (prevents a stale reply from clobbering counters for a newer
/// endpoint).
#[derive(Clone, Debug)]
pub struct QueryBookkeeping {
    /// The `version` this bookkeeping update applies to.
    pub version: Version,
    /// New attempt count.
    pub num_query_attempts_for_version: u32,
    /// New last-attempt timestamp.
    pub last_query_timestamp: u64,
}

/// A single merge-per-field update, the only way to mutate the table.
#[derive(Clone, Debug, Default)]
pub struct EndpointUpdate {
    /// Target address.
    pub address: Option<Address>,
    /// Accepted only if `version` strictly exceeds the stored `version`.
    pub node_and_version: Option<(Node, Version)>,
    /// Accepted only if it exceeds the stored `highest_known_version`.
    pub highest_known_version: Option<Version>,
    /// Stored idempotently.
    pub public_key: Option<PublicKey>,
    /// See [`QueryBookkeeping`].
    pub query_bookkeeping: Option<QueryBookkeeping>,
}

impl EndpointUpdate {
    /// Start a blank update for `address`.
    pub fn for_address(address: Address) -> Self {
        Self { address: Some(address), ..Default::default() }
    }
}

/// Endpoint table: one row per validator, keyed by address.
pub struct EndpointTable {
    store: Arc<dyn KvStore>,
}

impl EndpointTable {
    /// Wrap a `KvStore` as an endpoint table.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Look up the current row for `address`, if any.
    pub fn get(&self, address: &Address) -> Result<Option<EndpointEntry>, ProtocolError> {
        match self.store.get(TREE, &address.0)? {
            Some(bytes) => {
                let rlp = Rlp::new(&bytes);
                Ok(Some(rlp.as_val().map_err(|_| ProtocolError::MalformedMessage)?))
            }
            None => Ok(None),
        }
    }

    /// `GetAllValEnodes`: every row currently held.
    pub fn get_all(&self) -> Result<Vec<EndpointEntry>, ProtocolError> {
        let mut out = Vec::new();
        for (_, value) in self.store.scan_all(TREE)? {
            let rlp = Rlp::new(&value);
            out.push(rlp.as_val().map_err(|_| ProtocolError::MalformedMessage)?);
        }
        Ok(out)
    }

    /// Apply a batch of merge-per-field updates atomically.
    pub fn upsert(&self, updates: Vec<EndpointUpdate>) -> Result<(), ProtocolError> {
        let mut ops = Vec::new();
        for u in updates {
            let Some(address) = u.address else { continue };
            let mut entry = self.get(&address)?.unwrap_or_else(|| EndpointEntry::empty(address));
            let mut changed = false;

            if let Some((node, version)) = u.node_and_version {
                if version > entry.version {
                    entry.node = Some(node);
                    entry.version = version;
                    entry.num_query_attempts_for_version = 0;
                    entry.last_query_timestamp = None;
                    if version > entry.highest_known_version {
                        entry.highest_known_version = version;
                    }
                    changed = true;
                }
            }

            if let Some(hkv) = u.highest_known_version {
                if hkv > entry.highest_known_version {
                    entry.highest_known_version = hkv;
                    changed = true;
                }
            }

            if let Some(pk) = u.public_key {
                if entry.public_key != Some(pk) {
                    entry.public_key = Some(pk);
                    changed = true;
                }
            }

            if let Some(qb) = u.query_bookkeeping {
                if qb.version == entry.version {
                    entry.num_query_attempts_for_version = qb.num_query_attempts_for_version;
                    entry.last_query_timestamp = Some(qb.last_query_timestamp);
                    changed = true;
                }
            }

            if changed {
                ops.push(KvOp::Put { key: address.0.to_vec(), value: rlp::encode(&entry).to_vec() });
            }
        }
        if !ops.is_empty() {
            self.store.commit_atomic(TREE, ops)?;
        }
        Ok(())
    }

    /// Drop rows whose address is no longer in `active_set`.
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

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn node() -> Node {
        Node { public_key: PublicKey([9u8; 64]), host: "10.0.0.1".into(), port: 30303 }
    }

    #[test]
    fn node_and_version_only_accepted_on_increase() {
        let table = EndpointTable::new(Arc::new(MemKvStore::new()));
        let a = addr(1);

        let mut u = EndpointUpdate::for_address(a);
        u.node_and_version = Some((node(), 100));
        table.upsert(vec![u]).unwrap();

        let entry = table.get(&a).unwrap().unwrap();
        assert_eq!(entry.version, 100);
        assert_eq!(entry.highest_known_version, 100);

        let mut stale_update = EndpointUpdate::for_address(a);
        stale_update.node_and_version = Some((node(), 50));
        table.upsert(vec![stale_update]).unwrap();
        assert_eq!(table.get(&a).unwrap().unwrap().version, 100);
    }

    #[test]
    fn highest_known_version_marks_entry_stale() {
        let table = EndpointTable::new(Arc::new(MemKvStore::new()));
        let a = addr(2);

        let mut u = EndpointUpdate::for_address(a);
        u.node_and_version = Some((node(), 100));
        table.upsert(vec![u]).unwrap();

        let mut hk = EndpointUpdate::for_address(a);
        hk.highest_known_version = Some(200);
        table.upsert(vec![hk]).unwrap();

        let entry = table.get(&a).unwrap().unwrap();
        assert!(entry.is_stale());
        assert_eq!(entry.highest_known_version, 200);
        assert_eq!(entry.version, 100);
    }

    #[test]
    fn query_bookkeeping_rejected_if_version_mismatched() {
        let table = EndpointTable::new(Arc::new(MemKvStore::new()));
        let a = addr(3);

        let mut u = EndpointUpdate::for_address(a);
        u.node_and_version = Some((node(), 100));
        table.upsert(vec![u]).unwrap();

        let mut stale_bookkeeping = EndpointUpdate::for_address(a);
        stale_bookkeeping.query_bookkeeping =
            Some(QueryBookkeeping { version: 50, num_query_attempts_for_version: 7, last_query_timestamp: 999 });
        table.upsert(vec![stale_bookkeeping]).unwrap();

        let entry = table.get(&a).unwrap().unwrap();
        assert_eq!(entry.num_query_attempts_for_version, 0);

        let mut fresh_bookkeeping = EndpointUpdate::for_address(a);
        fresh_bookkeeping.query_bookkeeping =
            Some(QueryBookkeeping { version: 100, num_query_attempts_for_version: 1, last_query_timestamp: 555 });
        table.upsert(vec![fresh_bookkeeping]).unwrap();

        let entry = table.get(&a).unwrap().unwrap();
        assert_eq!(entry.num_query_attempts_for_version, 1);
        assert_eq!(entry.last_query_timestamp, Some(555));
    }

    #[test]
    fn version_advance_resets_query_bookkeeping() {
        let table = EndpointTable::new(Arc::new(MemKvStore::new()));
        let a = addr(4);

        let mut u = EndpointUpdate::for_address(a);
        u.node_and_version = Some((node(), 100));
        table.upsert(vec![u]).unwrap();
        let mut bk = EndpointUpdate::for_address(a);
        bk.query_bookkeeping = Some(QueryBookkeeping { version: 100, num_query_attempts_for_version: 3, last_query_timestamp: 42 });
        table.upsert(vec![bk]).unwrap();

        let mut advance = EndpointUpdate::for_address(a);
        advance.node_and_version = Some((node(), 150));
        table.upsert(vec![advance]).unwrap();

        let entry = table.get(&a).unwrap().unwrap();
        assert_eq!(entry.num_query_attempts_for_version, 0);
        assert_eq!(entry.last_query_timestamp, None);
    }

    #[test]
    fn prune_drops_inactive_addresses() {
        let table = EndpointTable::new(Arc::new(MemKvStore::new()));
        let a = addr(5);
        let b = addr(6);
        let mut ua = EndpointUpdate::for_address(a);
        ua.highest_known_version = Some(1);
        let mut ub = EndpointUpdate::for_address(b);
        ub.highest_known_version = Some(1);
        table.upsert(vec![ua, ub]).unwrap();

        let mut active = BTreeSet::new();
        active.insert(a);
        let removed = table.prune(&active).unwrap();
        assert_eq!(removed, 1);
        assert!(table.get(&a).unwrap().is_some());
        assert!(table.get(&b).unwrap().is_none());
    }
}
