//! Key custody: the disk-backed secp256k1 signer.

pub mod keystore;
