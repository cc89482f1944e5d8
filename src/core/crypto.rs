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

//! secp256k1 signer-recovery and ECIES, the two crypto primitives the
//! announce/query protocols build on.
//!
//! Recovery replaces transmitting an address or public key: the signer's
//! identity comes out of the signature itself (Invariant A/B), so spoofing
//! requires forging a valid signature, not just claiming someone else's
//! address.

use hkdf::Hkdf;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::{PublicKey as K256PublicKey, SecretKey};
use rand::rngs::OsRng;
use ring::aead;
use sha2::Sha256;
use thiserror::Error;

use crate::core::types::{Address, Hash32, PublicKey, RecoverableSignature};

const ECIES_NONCE_LEN: usize = 12;
const ECIES_EPHEMERAL_PUBLIC_LEN: usize = 65;
const ECIES_HKDF_INFO: &[u8] = b"valannounce-query-ecies-v1";

/// Crypto-layer errors, folded into `ProtocolError::CryptoError` by callers.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signing failed (backend/rng failure).
    #[error("signing failed")]
    Sign,
    /// A signature, public key, or ciphertext was structurally invalid.
    #[error("malformed cryptographic material")]
    Malformed,
    /// ECIES encryption or decryption failed (key derivation or AEAD).
    #[error("ecies failure")]
    Ecies,
}

/// Keccak256, used for both addresses and domain-separated signing hashes.
pub fn keccak256(data: &[u8]) -> Hash32 {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&out);
    hash
}

/// Derive the 20-byte address from an uncompressed public key:
/// `keccak256(pubkey)[12..]`.
pub fn address_from_public_key(pk: &PublicKey) -> Address {
    let hash = keccak256(&pk.0);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    Address(out)
}

fn to_uncompressed_public_key(vk: &VerifyingKey) -> PublicKey {
    let encoded = vk.to_encoded_point(false);
    let bytes = encoded.as_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&bytes[1..]);
    PublicKey(out)
}

/// Sign a prehashed message, producing a signature whose recovery id lets a
/// verifier recompute the signer's public key (and address) with no other
/// input than the hash and the signature.
pub fn sign_recoverable(
    signing_key: &SigningKey,
    prehash: &Hash32,
) -> Result<RecoverableSignature, CryptoError> {
    let (sig, recid): (EcdsaSignature, RecoveryId) = signing_key
        .sign_prehash_recoverable(prehash)
        .map_err(|_| CryptoError::Sign)?;
    let mut rs = [0u8; 64];
    rs.copy_from_slice(&sig.to_bytes());
    Ok(RecoverableSignature { rs, rec_id: recid.to_byte() })
}

/// Recover the signer's public key and address from a prehashed message and
/// its recoverable signature. Fails only on structurally invalid input
/// (malformed signature, recovery id, or a point that doesn't recover to a
/// valid curve point) — never silently.
pub fn recover_signer(
    prehash: &Hash32,
    sig: &RecoverableSignature,
) -> Result<(PublicKey, Address), CryptoError> {
    let recid = RecoveryId::from_byte(sig.rec_id).ok_or(CryptoError::Malformed)?;
    let signature = EcdsaSignature::from_slice(&sig.rs).map_err(|_| CryptoError::Malformed)?;
    let verifying_key = VerifyingKey::recover_from_prehash(prehash, &signature, recid)
        .map_err(|_| CryptoError::Malformed)?;
    let pk = to_uncompressed_public_key(&verifying_key);
    let addr = address_from_public_key(&pk);
    Ok((pk, addr))
}

fn sec1_from_raw(pk: &PublicKey) -> [u8; 65] {
    let mut out = [0u8; 65];
    out[0] = 0x04;
    out[1..].copy_from_slice(&pk.0);
    out
}

fn derive_aead_key(ikm: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(ECIES_HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::Ecies)?;
    Ok(okm)
}

fn aes_gcm_seal(key: &[u8; 32], nonce: [u8; ECIES_NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key).map_err(|_| CryptoError::Ecies)?;
    let less_safe = aead::LessSafeKey::new(unbound);
    let mut in_out = plaintext.to_vec();
    less_safe
        .seal_in_place_append_tag(aead::Nonce::assume_unique_for_key(nonce), aead::Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Ecies)?;
    Ok(in_out)
}

fn aes_gcm_open(key: &[u8; 32], nonce: [u8; ECIES_NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key).map_err(|_| CryptoError::Ecies)?;
    let less_safe = aead::LessSafeKey::new(unbound);
    let mut in_out = ciphertext.to_vec();
    let plain = less_safe
        .open_in_place(aead::Nonce::assume_unique_for_key(nonce), aead::Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Ecies)?;
    Ok(plain.to_vec())
}

/// ECIES-encrypt `plaintext` for `recipient`: ephemeral secp256k1 keypair,
/// ECDH, HKDF-SHA256, AES-256-GCM. Wire layout is
/// `ephemeral_pubkey(65) || nonce(12) || ciphertext+tag`.
pub fn ecies_encrypt(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient_point =
        K256PublicKey::from_sec1_bytes(&sec1_from_raw(recipient)).map_err(|_| CryptoError::Malformed)?;

    let ephemeral_secret = SecretKey::random(&mut OsRng);
    let ephemeral_public = ephemeral_secret.public_key();

    let shared = k256::ecdh::diffie_hellman(
        ephemeral_secret.to_nonzero_scalar(),
        recipient_point.as_affine(),
    );
    let key = derive_aead_key(shared.raw_secret_bytes().as_slice())?;

    let mut nonce = [0u8; ECIES_NONCE_LEN];
    use rand::RngCore;
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = aes_gcm_seal(&key, nonce, plaintext)?;

    let ephemeral_encoded = ephemeral_public.to_encoded_point(false);
    let mut out = Vec::with_capacity(ECIES_EPHEMERAL_PUBLIC_LEN + ECIES_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_encoded.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a ciphertext produced by [`ecies_encrypt`] using the recipient's
/// private key.
pub fn ecies_decrypt(recipient_secret: &SecretKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < ECIES_EPHEMERAL_PUBLIC_LEN + ECIES_NONCE_LEN + 16 {
        return Err(CryptoError::Malformed);
    }
    let (ephemeral_bytes, rest) = ciphertext.split_at(ECIES_EPHEMERAL_PUBLIC_LEN);
    let (nonce_bytes, body) = rest.split_at(ECIES_NONCE_LEN);

    let ephemeral_point = K256PublicKey::from_sec1_bytes(ephemeral_bytes).map_err(|_| CryptoError::Malformed)?;
    let shared = k256::ecdh::diffie_hellman(
        recipient_secret.to_nonzero_scalar(),
        ephemeral_point.as_affine(),
    );
    let key = derive_aead_key(shared.raw_secret_bytes().as_slice())?;

    let mut nonce = [0u8; ECIES_NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    aes_gcm_open(&key, nonce, body)
}

/// The signer seam the announce/query protocols use. A `Keystore` backed by
/// a disk-resident secp256k1 key implements this in production; tests can
/// supply an in-memory signing key instead.
pub trait Signer: Send + Sync {
    /// This signer's uncompressed public key.
    fn public_key(&self) -> PublicKey;
    /// This signer's address (`keccak256(public_key)[12..]`).
    fn address(&self) -> Address {
        address_from_public_key(&self.public_key())
    }
    /// Produce a recoverable signature over a prehashed message.
    fn sign_recoverable(&self, prehash: &Hash32) -> Result<RecoverableSignature, CryptoError>;
    /// Decrypt an ECIES ciphertext addressed to this signer.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[31] = byte;
        bytes[0] = 1;
        SigningKey::from_bytes((&bytes).into()).expect("valid scalar")
    }

    #[test]
    fn sign_and_recover_round_trips() {
        let sk = test_key(42);
        let expected_pk = to_uncompressed_public_key(sk.verifying_key());
        let expected_addr = address_from_public_key(&expected_pk);

        let hash = keccak256(b"hello announce protocol");
        let sig = sign_recoverable(&sk, &hash).expect("sign");
        let (pk, addr) = recover_signer(&hash, &sig).expect("recover");

        assert_eq!(pk.0, expected_pk.0);
        assert_eq!(addr, expected_addr);
    }

    #[test]
    fn recover_fails_on_wrong_hash() {
        let sk = test_key(7);
        let hash = keccak256(b"first message");
        let sig = sign_recoverable(&sk, &hash).expect("sign");
        let (_, addr_for_first) = recover_signer(&hash, &sig).expect("recover");

        let other_hash = keccak256(b"a different message");
        let (_, addr_for_other) = recover_signer(&other_hash, &sig).expect("recover still succeeds structurally");
        assert_ne!(addr_for_first, addr_for_other);
    }

    #[test]
    fn ecies_round_trips() {
        let recipient_secret = SecretKey::random(&mut OsRng);
        let recipient_public = recipient_secret.public_key().to_encoded_point(false);
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&recipient_public.as_bytes()[1..]);
        let recipient_pk = PublicKey(raw);

        let plaintext = b"enode://aabb@10.0.0.1:30303";
        let ciphertext = ecies_encrypt(&recipient_pk, plaintext).expect("encrypt");
        let decrypted = ecies_decrypt(&recipient_secret, &ciphertext).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ecies_wrong_recipient_fails() {
        let recipient_secret = SecretKey::random(&mut OsRng);
        let recipient_public = recipient_secret.public_key().to_encoded_point(false);
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&recipient_public.as_bytes()[1..]);
        let recipient_pk = PublicKey(raw);

        let ciphertext = ecies_encrypt(&recipient_pk, b"secret url").expect("encrypt");

        let wrong_secret = SecretKey::random(&mut OsRng);
        assert!(ecies_decrypt(&wrong_secret, &ciphertext).is_err());
    }
}
