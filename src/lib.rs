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

//! Amunchain validator-endpoint announcement and discovery service.
//!
//! This repository provides:
//! - Deterministic types & canonical RLP encoding for the announce wire formats
//! - Signer-recovery secp256k1 crypto and a disk-backed, passphrase-encrypted keystore
//! - The version-vector flood, encrypted query protocol, and endpoint certificates
//!   that let validators discover each other's reachable endpoints
//! - Encrypted P2P transport (libp2p Noise + Yamux) carrying those protocols over gossipsub
//! - Durable key-value storage for the version and endpoint tables
//! - Monitoring via Prometheus metrics and structured logging

/// Node configuration (TOML, loaded at startup).
pub mod config;
/// Core protocol primitives (types, crypto, keystore).
pub mod core;
/// The seam at which an external consensus engine supplies the active set.
pub mod consensus_iface;
/// Observability (metrics, HTTP surface, structured logging helpers).
pub mod monitoring;
/// P2P networking stack (libp2p transport, peer registry, scoring, anti-abuse).
pub mod networking;
/// The announce/query gossip protocols and their backing tables.
pub mod protocol;
/// Durable and in-memory key/value storage.
pub mod storage;
