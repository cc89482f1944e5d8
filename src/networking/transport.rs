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
#![allow(missing_docs)]

//! The announce protocol's transport seam: gossipsub for the two flood
//! messages (signed version vectors, query-enode payloads) and a small
//! request-response protocol for the direct certificate reply a peer sends
//! back to a query it already has an answer for. Generalizes the single
//! `ConsensusMsg` gossipsub loop in `networking::p2p` to the three message
//! codes the announce protocol speaks.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use libp2p::{
    core::upgrade,
    gossipsub::{self, IdentTopic, MessageAuthenticity},
    identify, noise, ping,
    request_response::{self, ProtocolSupport},
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport,
};

use libp2p::futures::StreamExt;
use libp2p::swarm::Config as SwarmConfig;

use crate::core::types::Address;
use crate::monitoring::metrics::Metrics;

/// The three wire messages the announce protocol gossips or sends directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageCode {
    /// A batch of signed announce-version rows (§4.3).
    SignedAnnounceVersions,
    /// An encrypted query-enode payload (§4.4).
    QueryEnode,
    /// An endpoint certificate, sent directly in reply to a query (§4.6).
    EnodeCertificate,
}

impl MessageCode {
    fn topic_name(self) -> &'static str {
        match self {
            MessageCode::SignedAnnounceVersions => "valannounce/signed-announce-versions/1",
            MessageCode::QueryEnode => "valannounce/query-enode/1",
            MessageCode::EnodeCertificate => "valannounce/enode-certificate/1",
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            MessageCode::SignedAnnounceVersions => 0,
            MessageCode::QueryEnode => 1,
            MessageCode::EnodeCertificate => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageCode::SignedAnnounceVersions),
            1 => Some(MessageCode::QueryEnode),
            2 => Some(MessageCode::EnodeCertificate),
            _ => None,
        }
    }
}

/// A message delivered by the transport: who it came from and what it said.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// The peer that handed us the bytes (transport-level identity, not a
    /// validator address — callers bind the two via `bind_address` once a
    /// signature in the payload reveals the sender's validator identity).
    pub peer: PeerId,
    /// Which of the three wire messages this is.
    pub code: MessageCode,
    /// The message payload, stripped of any framing the transport added.
    pub payload: Vec<u8>,
}

/// What the announce protocol needs from the underlying peer-to-peer layer.
/// Kept deliberately small: the transport is an external collaborator, not
/// part of the protocol's own state machine.
pub trait AnnounceTransport: Send + Sync {
    /// Gossip `payload` under `code` to the whole mesh. Best-effort: a
    /// publish failure is logged and counted, never returned to the caller,
    /// since the announce loop must never block or retry on transport
    /// backpressure.
    fn multicast(&self, code: MessageCode, payload: Vec<u8>);

    /// Send `payload` directly to the peer bound to `address`, if connected.
    fn send_to(&self, address: &Address, code: MessageCode, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Whether `address` currently resolves to a connected peer.
    fn is_connected(&self, address: &Address) -> bool;

    /// Narrow `addresses` down to the subset currently connected.
    fn find_peers(&self, addresses: &BTreeSet<Address>) -> BTreeSet<Address>;

    /// Record that `address` is reachable via `peer` — called once a
    /// message's signature reveals a validator identity for a connection
    /// the transport already has open.
    fn bind_address(&self, address: Address, peer: PeerId);
}

/// Transport errors surfaced to callers of `send_to`.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination address has no bound, connected peer.
    #[error("peer not connected")]
    NotConnected,
    /// The outbound queue is full or the swarm task has stopped.
    #[error("outbound channel unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("io")]
    Io,
    #[error("config")]
    Config,
}

/// Runtime configuration for the transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Listen address as string (e.g. "/ip4/0.0.0.0/tcp/4001").
    pub listen_addr: String,
    /// Data directory used for persistent libp2p identity.
    pub data_dir: String,
    /// Bootstrap peers.
    pub bootstrap: Vec<String>,
    /// Optional allowlist of peer ids (empty => allow all).
    pub allow_peers: Vec<String>,
}

const MAX_FRAME_BYTES: u32 = 256 * 1024;

async fn read_framed<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_framed<T>(io: &mut T, bytes: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len = bytes.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(bytes).await?;
    io.close().await?;
    Ok(())
}

/// Length-prefixed raw-byte codec for the direct-send request-response
/// protocol. The "response" is an empty acknowledgement; the announce
/// protocol's actual reply (an endpoint certificate) travels as its own
/// direct-send request on the way back, not as this protocol's response.
#[derive(Clone, Default)]
struct RawCodec;

#[async_trait::async_trait]
impl request_response::Codec for RawCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = Vec<u8>;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req).await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, res: Self::Response) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &res).await
    }
}

#[derive(Debug)]
enum BehaviourEvent {
    Gossipsub(gossipsub::Event),
    Identify(()),
    Ping(()),
    DirectSend(request_response::Event<Vec<u8>, Vec<u8>>),
}
impl From<gossipsub::Event> for BehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        Self::Gossipsub(e)
    }
}
impl From<identify::Event> for BehaviourEvent {
    fn from(_e: identify::Event) -> Self {
        Self::Identify(())
    }
}
impl From<ping::Event> for BehaviourEvent {
    fn from(_e: ping::Event) -> Self {
        Self::Ping(())
    }
}
impl From<request_response::Event<Vec<u8>, Vec<u8>>> for BehaviourEvent {
    fn from(e: request_response::Event<Vec<u8>, Vec<u8>>) -> Self {
        Self::DirectSend(e)
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    direct_send: request_response::Behaviour<RawCodec>,
}

enum Outbound {
    Multicast(MessageCode, Vec<u8>),
    SendTo(PeerId, MessageCode, Vec<u8>),
}

fn ensure_dir(path: &str) -> Result<(), P2pError> {
    let p = Path::new(path);
    if !p.exists() {
        std::fs::create_dir_all(p).map_err(|_| P2pError::Io)?;
    }
    Ok(())
}

/// Shared bookkeeping the trait impl and the swarm task both touch: which
/// peers are currently connected, and which validator address is bound to
/// which peer.
struct Directory {
    connected: RwLock<HashSet<PeerId>>,
    bindings: RwLock<BTreeMap<Address, PeerId>>,
}

impl Directory {
    fn new() -> Self {
        Self { connected: RwLock::new(HashSet::new()), bindings: RwLock::new(BTreeMap::new()) }
    }

    fn peer_for(&self, address: &Address) -> Option<PeerId> {
        self.bindings.read().expect("lock poisoned").get(address).copied()
    }

    fn is_connected(&self, address: &Address) -> bool {
        match self.peer_for(address) {
            Some(peer) => self.connected.read().expect("lock poisoned").contains(&peer),
            None => false,
        }
    }
}

/// A libp2p-backed `AnnounceTransport`.
pub struct Libp2pAnnounceTransport {
    outbound_tx: mpsc::Sender<Outbound>,
    directory: Arc<Directory>,
}

impl Libp2pAnnounceTransport {
    /// Spawn the swarm task and return a handle plus the inbound message
    /// stream and the task's join handle.
    pub fn spawn(
        cfg: TransportConfig,
        metrics: Arc<Metrics>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundMessage>, tokio::task::JoinHandle<()>), P2pError> {
        ensure_dir(&cfg.data_dir)?;

        let (local_peer_id, id_keys) = crate::networking::p2p_identity::load_or_create_identity(&cfg.data_dir)
            .map_err(|_| P2pError::Io)?;

        let mut allow_set: HashSet<PeerId> = HashSet::new();
        for s in cfg.allow_peers.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
            match s.parse::<PeerId>() {
                Ok(pid) => {
                    allow_set.insert(pid);
                }
                Err(_) => warn!(peer = %s, "invalid allow_peers entry; ignoring"),
            }
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(1024);
        let (in_tx, in_rx) = mpsc::channel::<InboundMessage>(1024);
        let directory = Arc::new(Directory::new());
        let directory_task = directory.clone();

        let listen_addr = cfg.listen_addr.clone();
        let bootstrap = cfg.bootstrap.clone();

        let join = tokio::spawn(async move {
            let noise_keys = match noise::Config::new(&id_keys) {
                Ok(v) => v,
                Err(_) => {
                    warn!("failed to build noise config");
                    return;
                }
            };

            let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
                .upgrade(upgrade::Version::V1)
                .authenticate(noise_keys)
                .multiplex(yamux::Config::default())
                .boxed();

            let gcfg = gossipsub::ConfigBuilder::default()
                .validation_mode(gossipsub::ValidationMode::Permissive)
                .heartbeat_interval(Duration::from_secs(1))
                .build()
                .unwrap_or_else(|_| gossipsub::Config::default());

            let mut gossipsub = match gossipsub::Behaviour::new(MessageAuthenticity::Signed(id_keys.clone()), gcfg) {
                Ok(v) => v,
                Err(_) => {
                    warn!("failed to create gossipsub behaviour");
                    return;
                }
            };

            let topics = [
                MessageCode::SignedAnnounceVersions,
                MessageCode::QueryEnode,
                MessageCode::EnodeCertificate,
            ]
            .map(|code| IdentTopic::new(code.topic_name()));
            for topic in &topics {
                if let Err(e) = gossipsub.subscribe(topic) {
                    warn!(err = ?e, "failed to subscribe topic");
                }
            }

            let identify = identify::Behaviour::new(identify::Config::new(
                "valannounce/1.0.0".to_string(),
                id_keys.public(),
            ));

            let ping = ping::Behaviour::new(
                ping::Config::new().with_interval(Duration::from_secs(10)).with_timeout(Duration::from_secs(20)),
            );

            let direct_send = request_response::Behaviour::<RawCodec>::new(
                [(StreamProtocol::new("/valannounce/direct/1"), ProtocolSupport::Full)],
                request_response::Config::default(),
            );

            let behaviour = Behaviour { gossipsub, identify, ping, direct_send };
            let mut swarm = Swarm::new(transport, behaviour, local_peer_id, SwarmConfig::with_tokio_executor());

            let listen: Multiaddr = match listen_addr.parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!(addr = %listen_addr, "bad listen_addr");
                    return;
                }
            };
            if let Err(e) = swarm.listen_on(listen) {
                warn!(err = ?e, "listen_on failed");
                return;
            }

            for b in bootstrap.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
                match b.parse::<Multiaddr>() {
                    Ok(ma) => {
                        if let Err(e) = swarm.dial(ma.clone()) {
                            warn!(boot = %b, err = ?e, "dial bootstrap failed");
                        } else {
                            info!(boot = %b, "dialing bootstrap");
                        }
                    }
                    Err(_) => warn!(boot = %b, "bad bootstrap addr; skipping"),
                }
            }

            info!(%local_peer_id, "announce transport started");
            metrics.p2p_peers.set(0);

            loop {
                tokio::select! {
                    maybe_out = out_rx.recv() => {
                        match maybe_out {
                            Some(Outbound::Multicast(code, payload)) => {
                                let mut framed = Vec::with_capacity(payload.len() + 1);
                                framed.push(code.to_byte());
                                framed.extend_from_slice(&payload);
                                let topic = IdentTopic::new(code.topic_name());
                                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, framed) {
                                    warn!(err = ?e, "gossipsub publish failed");
                                }
                            }
                            Some(Outbound::SendTo(peer, code, payload)) => {
                                let mut framed = Vec::with_capacity(payload.len() + 1);
                                framed.push(code.to_byte());
                                framed.extend_from_slice(&payload);
                                swarm.behaviour_mut().direct_send.send_request(&peer, framed);
                            }
                            None => {
                                warn!("outbound channel closed; stopping transport task");
                                break;
                            }
                        }
                    }

                    ev = swarm.select_next_some() => {
                        match ev {
                            SwarmEvent::NewListenAddr { address, .. } => {
                                info!(addr = %address, "listening");
                            }

                            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                                if !allow_set.is_empty() && !allow_set.contains(&peer_id) {
                                    warn!(%peer_id, "peer not in allowlist; disconnecting");
                                    metrics.p2p_banned_total.inc();
                                    let _ = swarm.disconnect_peer_id(peer_id);
                                    continue;
                                }
                                directory_task.connected.write().expect("lock poisoned").insert(peer_id);
                                metrics.p2p_peers.inc();
                                info!(%peer_id, "peer connected");
                            }

                            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                                directory_task.connected.write().expect("lock poisoned").remove(&peer_id);
                                metrics.p2p_peers.dec();
                                info!(%peer_id, "peer disconnected");
                            }

                            SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
                                propagation_source,
                                message,
                                ..
                            })) => {
                                if !allow_set.is_empty() && !allow_set.contains(&propagation_source) {
                                    warn!(%propagation_source, "message from non-allowlisted peer; dropping");
                                    metrics.p2p_banned_total.inc();
                                    continue;
                                }
                                match decode_framed(&message.data) {
                                    Some((code, payload)) => {
                                        let _ = in_tx.send(InboundMessage { peer: propagation_source, code, payload }).await;
                                    }
                                    None => {
                                        warn!(%propagation_source, "malformed gossip frame");
                                        metrics.p2p_invalid_msg_total.inc();
                                    }
                                }
                            }

                            SwarmEvent::Behaviour(BehaviourEvent::DirectSend(request_response::Event::Message {
                                peer,
                                message: request_response::Message::Request { request, channel, .. },
                            })) => {
                                let _ = swarm.behaviour_mut().direct_send.send_response(channel, Vec::new());
                                match decode_framed(&request) {
                                    Some((code, payload)) => {
                                        let _ = in_tx.send(InboundMessage { peer, code, payload }).await;
                                    }
                                    None => {
                                        warn!(%peer, "malformed direct-send frame");
                                        metrics.p2p_invalid_msg_total.inc();
                                    }
                                }
                            }

                            SwarmEvent::Behaviour(BehaviourEvent::DirectSend(_)) => {}
                            SwarmEvent::Behaviour(BehaviourEvent::Identify(_)) => {}
                            SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}

                            _ => {}
                        }
                    }
                }
            }
        });

        Ok((Arc::new(Self { outbound_tx: out_tx, directory }), in_rx, join))
    }
}

fn decode_framed(bytes: &[u8]) -> Option<(MessageCode, Vec<u8>)> {
    let (code_byte, rest) = bytes.split_first()?;
    let code = MessageCode::from_byte(*code_byte)?;
    Some((code, rest.to_vec()))
}

impl AnnounceTransport for Libp2pAnnounceTransport {
    fn multicast(&self, code: MessageCode, payload: Vec<u8>) {
        if self.outbound_tx.try_send(Outbound::Multicast(code, payload)).is_err() {
            warn!("announce transport outbound queue full; dropping multicast");
        }
    }

    fn send_to(&self, address: &Address, code: MessageCode, payload: Vec<u8>) -> Result<(), TransportError> {
        let peer = self.directory.peer_for(address).ok_or(TransportError::NotConnected)?;
        if !self.directory.connected.read().expect("lock poisoned").contains(&peer) {
            return Err(TransportError::NotConnected);
        }
        self.outbound_tx
            .try_send(Outbound::SendTo(peer, code, payload))
            .map_err(|_| TransportError::Unavailable)
    }

    fn is_connected(&self, address: &Address) -> bool {
        self.directory.is_connected(address)
    }

    fn find_peers(&self, addresses: &BTreeSet<Address>) -> BTreeSet<Address> {
        addresses.iter().filter(|a| self.directory.is_connected(a)).copied().collect()
    }

    fn bind_address(&self, address: Address, peer: PeerId) {
        self.directory.bindings.write().expect("lock poisoned").insert(address, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_code_byte_round_trips() {
        for code in [MessageCode::SignedAnnounceVersions, MessageCode::QueryEnode, MessageCode::EnodeCertificate] {
            assert_eq!(MessageCode::from_byte(code.to_byte()), Some(code));
        }
    }

    #[test]
    fn decode_framed_rejects_empty_and_unknown_code() {
        assert!(decode_framed(&[]).is_none());
        assert!(decode_framed(&[99, 1, 2, 3]).is_none());
        let (code, payload) = decode_framed(&[1, 9, 9]).unwrap();
        assert_eq!(code, MessageCode::QueryEnode);
        assert_eq!(payload, vec![9, 9]);
    }

    #[test]
    fn directory_tracks_bindings_and_connectivity() {
        let dir = Directory::new();
        let addr = Address([7u8; 20]);
        assert!(!dir.is_connected(&addr));

        let peer = PeerId::random();
        dir.bindings.write().unwrap().insert(addr, peer);
        assert!(!dir.is_connected(&addr));

        dir.connected.write().unwrap().insert(peer);
        assert!(dir.is_connected(&addr));
    }
}
