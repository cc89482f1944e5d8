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

//! Endpoint certificates (§4.6): a tiny signed `(enode_url, version)` proof,
//! used as a handshake credential and as a direct reply to a query the
//! recipient can already answer. Includes proxy-forwarding semantics for
//! proxy/proxied-validator deployments.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::core::crypto::{self, Signer};
use crate::core::types::{Address, EnodeCertificateEnvelope, EnodeCertificatePayload, Hash32, Node, Version};
use crate::protocol::endpoint_table::{EndpointTable, EndpointUpdate};
use crate::protocol::ProtocolError;

/// Holds the most recently generated certificate for this node, shared
/// between the announce loop (which mints it on a version bump) and the
/// query protocol (which offers it as a direct reply).
#[derive(Default)]
pub struct CertificateCache {
    inner: Mutex<Option<EnodeCertificateEnvelope>>,
}

impl CertificateCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently cached certificate, if one has been minted yet.
    pub fn get(&self) -> Option<EnodeCertificateEnvelope> {
        self.inner.lock().expect("lock poisoned").clone()
    }

    fn set(&self, cert: EnodeCertificateEnvelope) {
        *self.inner.lock().expect("lock poisoned") = Some(cert);
    }

    fn installed_version(&self) -> Option<Version> {
        self.inner.lock().expect("lock poisoned").as_ref().map(|c| c.payload.version)
    }
}

/// When this node proxies traffic for a validator it does not itself sign
/// consensus messages for, but still participates in certificate exchange
/// on that validator's behalf.
#[derive(Clone, Copy, Debug)]
pub struct ProxyRole {
    /// The validator this node proxies for.
    pub proxied_validator_address: Address,
    /// This proxy's own node identity (`Node::node_id()` of its enode URL).
    pub own_node_id: Hash32,
}

/// Builds and handles endpoint certificates.
pub struct EnodeCertificateProtocol {
    endpoint_table: Arc<EndpointTable>,
    cache: Arc<CertificateCache>,
    proxy_role: Option<ProxyRole>,
}

impl EnodeCertificateProtocol {
    /// Wire up the certificate protocol.
    pub fn new(endpoint_table: Arc<EndpointTable>, cache: Arc<CertificateCache>, proxy_role: Option<ProxyRole>) -> Self {
        Self { endpoint_table, cache, proxy_role }
    }

    /// Mint a fresh certificate for `enode_url` at `version`, cache it, and
    /// return it (step 1 of the version-bump procedure, §4.5).
    pub fn build(&self, signer: &dyn Signer, enode_url: &str, version: Version) -> Result<EnodeCertificateEnvelope, ProtocolError> {
        let payload = EnodeCertificatePayload { enode_url: enode_url.to_string(), version };
        let hash = EnodeCertificateEnvelope::payload_hash(&payload);
        let signature = signer.sign_recoverable(&hash)?;
        let envelope = EnodeCertificateEnvelope { payload, signature };
        self.cache.set(envelope.clone());
        Ok(envelope)
    }

    /// Handle an inbound `EnodeCertificate` message, whether it arrived via
    /// gossip or as a direct reply to a query.
    pub fn handle_inbound(&self, bytes: &[u8], active_set: &std::collections::BTreeSet<Address>) -> Result<(), ProtocolError> {
        let envelope = EnodeCertificateEnvelope::decode_bytes(bytes)?;
        let hash = EnodeCertificateEnvelope::payload_hash(&envelope.payload);
        let (_, cert_address) = crypto::recover_signer(&hash, &envelope.signature)?;

        if let Some(role) = self.proxy_role {
            if cert_address == role.proxied_validator_address {
                let node = Node::parse(&envelope.payload.enode_url)?;
                if node.node_id() != role.own_node_id {
                    debug!("cert from proxied validator targets a different node identity; ignoring");
                    return Ok(());
                }
                if let Some(installed) = self.cache.installed_version() {
                    if envelope.payload.version < installed {
                        return Err(ProtocolError::ValidationRejected("certificate version regression"));
                    }
                }
                self.cache.set(envelope);
                return Ok(());
            }
            // Any other peer's cert is forwarded to the proxied validator,
            // never upserted locally — the validator decides what to do with it.
            debug!(%cert_address, "forwarding certificate to proxied validator");
            return Ok(());
        }

        if !active_set.contains(&cert_address) {
            return Err(ProtocolError::UnauthorizedSender);
        }
        let node = Node::parse(&envelope.payload.enode_url)?;
        let mut update = EndpointUpdate::for_address(cert_address);
        update.node_and_version = Some((node, envelope.payload.version));
        self.endpoint_table.upsert(vec![update])?;
        Ok(())
    }
}
