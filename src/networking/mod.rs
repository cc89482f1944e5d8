#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: libp2p transport and peer admission.

pub mod p2p_identity;
pub mod peer_registry;
pub mod transport;
