#![forbid(unsafe_code)]
#![deny(missing_docs)]
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

//! Keystore: secp256k1 signer-recovery signing with rate limiting and an
//! audit trail.
//!
//! ## Production hardening
//! - **Atomic writes** for private key material.
//! - **Key-at-rest encryption** (optional) via `AMUNCHAIN_KEY_PASSPHRASE` (or legacy `NEXUS_KEY_PASSPHRASE`).
//! - **Audit log rotation** (best-effort).
//! - **Best-effort zeroization** of sensitive buffers.
//!
//! ### Key encryption format
//! If `AMUNCHAIN_KEY_PASSPHRASE` is set, `validator.key` is stored as:
//! `MAGIC(9) || SALT(16) || NONCE(12) || CIPHERTEXT+TAG(..)`
//! where the ciphertext is AES-256-GCM over the raw 32-byte secp256k1 scalar.

use k256::SecretKey;
use ring::{
    aead,
    pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use std::{
    fs,
    io::Write,
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};
use thiserror::Error;
use zeroize::Zeroize;

use crate::core::crypto::{self, CryptoError, Signer};
use crate::core::types::{Address, Hash32, PublicKey, RecoverableSignature};

fn env_first(keys: &[&str]) -> Option<String> {
    for &k in keys {
        if let Ok(v) = std::env::var(k) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
    }
    None
}

const KEY_FILE_MAGIC: &[u8] = b"AMUNKEY2"; // v2: secp256k1 scalar instead of Ed25519 PKCS#8
const KEY_SALT_LEN: usize = 16;
const KEY_NONCE_LEN: usize = 12;

const MAX_AUDIT_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB
const AUDIT_ROTATE_KEEP: usize = 3;

// PBKDF2 params: 100k iterations is a reasonable baseline for server-side passphrases.
// Increase if your deployment can afford it.
const PBKDF2_ITERS_DEFAULT: u32 = 100_000;

fn pbkdf2_iters() -> NonZeroU32 {
    // Optional override via env (defense-in-depth; keep bounds sane).
    // Example: AMUNCHAIN_PBKDF2_ITERS=300000 (or legacy NEXUS_PBKDF2_ITERS=300000)
    let iters = env_first(&["AMUNCHAIN_PBKDF2_ITERS", "NEXUS_PBKDF2_ITERS"])
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(PBKDF2_ITERS_DEFAULT);

    // Clamp to a practical range to avoid accidental DoS / too-weak configs.
    let iters = iters.clamp(10_000, 10_000_000);
    NonZeroU32::new(iters).unwrap_or_else(|| NonZeroU32::new(PBKDF2_ITERS_DEFAULT).expect("nonzero"))
}

/// Keystore errors.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("io")]
    Io,
    #[error("invalid key encoding")]
    InvalidKey,
    #[error("missing passphrase (set AMUNCHAIN_KEY_PASSPHRASE)")]
    MissingPassphrase,
    #[error("crypto")]
    Crypto,
    #[error("rate limited")]
    RateLimited,
}

impl From<CryptoError> for KeystoreError {
    fn from(_: CryptoError) -> Self {
        KeystoreError::Crypto
    }
}

/// Signer backend abstraction (HSM compatible).
pub trait SignerBackend: Send + Sync {
    /// Return the uncompressed public key (64 bytes, no `0x04` prefix).
    fn public_key(&self) -> PublicKey;
    /// Sign a prehashed message, recoverably.
    fn sign_recoverable(&self, prehash: &Hash32) -> Result<RecoverableSignature, KeystoreError>;
    /// Decrypt an ECIES ciphertext addressed to this key.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeystoreError>;
}

/// Simple file-backed secp256k1 signing key.
pub struct FileSecp256k1Backend {
    secret: SecretKey,
    signing_key: k256::ecdsa::SigningKey,
    public_key: PublicKey,
}

fn rotate_audit_if_needed(path: &Path) {
    let Ok(md) = fs::metadata(path) else { return; };
    if md.len() <= MAX_AUDIT_BYTES {
        return;
    }

    // best-effort rotation (no crash if it fails)
    for i in (1..=AUDIT_ROTATE_KEEP).rev() {
        let dst = PathBuf::from(format!("{}.{}", path.display(), i));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            PathBuf::from(format!("{}.{}", path.display(), i - 1))
        };
        if src.exists() {
            let _ = fs::rename(&src, &dst);
        }
    }
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Atomic write to disk (best-effort fsync, then rename).
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), KeystoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| KeystoreError::Io)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| KeystoreError::Io)?;
        f.write_all(bytes).map_err(|_| KeystoreError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| KeystoreError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

fn derive_aes256gcm_key(passphrase: &[u8], salt: &[u8; KEY_SALT_LEN]) -> Result<[u8; 32], KeystoreError> {
    let mut out = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        pbkdf2_iters(),
        salt,
        passphrase,
        &mut out,
    );
    Ok(out)
}

fn encrypt_scalar(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; KEY_SALT_LEN];
    rng.fill(&mut salt).map_err(|_| KeystoreError::Crypto)?;

    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| KeystoreError::Crypto)?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_aes256gcm_key(passphrase, &salt)?;
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| KeystoreError::Crypto)?;
    let less_safe = aead::LessSafeKey::new(unbound);

    // ciphertext buffer = plaintext + tag
    let mut in_out = plaintext.to_vec();
    less_safe
        .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| KeystoreError::Crypto)?;

    key.zeroize();

    let mut out = Vec::with_capacity(KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + in_out.len());
    out.extend_from_slice(KEY_FILE_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn decrypt_scalar(passphrase: &[u8], bytes: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    if bytes.len() < KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + 16 {
        return Err(KeystoreError::InvalidKey);
    }
    if &bytes[..KEY_FILE_MAGIC.len()] != KEY_FILE_MAGIC {
        // Not encrypted, caller should treat as a plaintext scalar.
        return Ok(bytes.to_vec());
    }

    let mut salt = [0u8; KEY_SALT_LEN];
    salt.copy_from_slice(&bytes[KEY_FILE_MAGIC.len()..KEY_FILE_MAGIC.len() + KEY_SALT_LEN]);
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    nonce_bytes.copy_from_slice(
        &bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN..KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN],
    );
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_aes256gcm_key(passphrase, &salt)?;
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| KeystoreError::Crypto)?;
    let less_safe = aead::LessSafeKey::new(unbound);

    let mut in_out = bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN..].to_vec();
    let plain = less_safe
        .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| KeystoreError::Crypto)?;

    key.zeroize();
    Ok(plain.to_vec())
}

impl FileSecp256k1Backend {
    /// Load or create a secp256k1 key file.
    ///
    /// If `AMUNCHAIN_KEY_PASSPHRASE` is set, the key file is encrypted at rest.
    pub fn load_or_create(path: &Path) -> Result<Self, KeystoreError> {
        let pass = env_first(&["AMUNCHAIN_KEY_PASSPHRASE", "NEXUS_KEY_PASSPHRASE"]);

        let scalar_bytes = if path.exists() {
            let bytes = fs::read(path).map_err(|_| KeystoreError::Io)?;
            if bytes.starts_with(KEY_FILE_MAGIC) {
                let Some(p) = pass.as_deref() else {
                    return Err(KeystoreError::MissingPassphrase);
                };
                decrypt_scalar(p.as_bytes(), &bytes)?
            } else {
                bytes
            }
        } else {
            use rand::RngCore;
            let mut raw = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut raw);

            let on_disk = if let Some(p) = pass.as_deref() {
                encrypt_scalar(p.as_bytes(), &raw)?
            } else {
                raw.to_vec()
            };
            atomic_write_private(path, &on_disk)?;
            raw.to_vec()
        };

        let mut buf = [0u8; 32];
        if scalar_bytes.len() != 32 {
            return Err(KeystoreError::InvalidKey);
        }
        buf.copy_from_slice(&scalar_bytes);

        let secret = SecretKey::from_slice(&buf).map_err(|_| KeystoreError::InvalidKey)?;
        buf.zeroize();

        let signing_key = k256::ecdsa::SigningKey::from(&secret);
        let encoded = secret.public_key().to_encoded_point(false);
        let mut pk = [0u8; 64];
        pk.copy_from_slice(&encoded.as_bytes()[1..]);

        Ok(Self { secret, signing_key, public_key: PublicKey(pk) })
    }
}

impl SignerBackend for FileSecp256k1Backend {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn sign_recoverable(&self, prehash: &Hash32) -> Result<RecoverableSignature, KeystoreError> {
        crypto::sign_recoverable(&self.signing_key, prehash).map_err(|_| KeystoreError::Crypto)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        crypto::ecies_decrypt(&self.secret, ciphertext).map_err(|_| KeystoreError::Crypto)
    }
}

/// Rate limiter (token bucket style, simple and deterministic).
#[derive(Debug)]
struct RateLimiter {
    window_start: Instant,
    count: u32,
    limit_per_sec: u32,
}

impl RateLimiter {
    fn new(limit_per_sec: u32) -> Self {
        Self { window_start: Instant::now(), count: 0, limit_per_sec }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit_per_sec {
            return false;
        }
        self.count = self.count.saturating_add(1);
        true
    }
}

/// Keystore wrapper: rate limiting and an audit trail around a [`SignerBackend`].
pub struct Keystore<B: SignerBackend> {
    backend: B,
    limiter: Mutex<RateLimiter>,
    audit_path: PathBuf,
}

impl Keystore<FileSecp256k1Backend> {
    /// Load or create keystore in `data_dir/validator.key` and write audit to `data_dir/audit.log`.
    pub fn open(data_dir: &str) -> Result<Self, KeystoreError> {
        let mut key_path = PathBuf::from(data_dir);
        key_path.push("validator.key");

        let mut audit_path = PathBuf::from(data_dir);
        audit_path.push("audit.log");

        let backend = FileSecp256k1Backend::load_or_create(&key_path)?;
        Ok(Self { backend, limiter: Mutex::new(RateLimiter::new(10_000)), audit_path })
    }
}

impl<B: SignerBackend> Keystore<B> {
    /// Public key.
    pub fn public_key(&self) -> PublicKey {
        self.backend.public_key()
    }

    fn rate_limit(&self) -> Result<(), KeystoreError> {
        let mut guard = self.limiter.lock().map_err(|_| KeystoreError::RateLimited)?;
        if !guard.allow() {
            return Err(KeystoreError::RateLimited);
        }
        Ok(())
    }
}

impl<B: SignerBackend> Signer for Keystore<B> {
    fn public_key(&self) -> PublicKey {
        self.backend.public_key()
    }

    fn sign_recoverable(&self, prehash: &Hash32) -> Result<RecoverableSignature, CryptoError> {
        self.rate_limit().map_err(|_| CryptoError::Sign)?;
        let _ = append_audit(&self.audit_path, "sign", prehash);
        self.backend.sign_recoverable(prehash).map_err(|_| CryptoError::Sign)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.rate_limit().map_err(|_| CryptoError::Ecies)?;
        let _ = append_audit(&self.audit_path, "decrypt", ciphertext);
        self.backend.decrypt(ciphertext).map_err(|_| CryptoError::Ecies)
    }
}

impl<B: SignerBackend> Keystore<B> {
    /// This signer's address, convenience wrapper over the `Signer` trait.
    pub fn address(&self) -> Address {
        crypto::address_from_public_key(&self.backend.public_key())
    }
}

/// Validate that `bytes` is a well-formed Ed25519 public key. The peer
/// registry is signed by a separate, out-of-band operations key (not a
/// validator's secp256k1 announce key), so it keeps its own, independent
/// verification primitive.
pub fn verify_pubkey_bytes(bytes: &[u8; 32]) -> bool {
    // Ed25519 public keys have no structural validity predicate beyond their
    // 32-byte length, which the type already guarantees; a bad key simply
    // fails the next `verify_sig_bytes` call instead.
    let _ = bytes;
    true
}

/// Verify an Ed25519 signature over `msg` under `pubkey`.
pub fn verify_sig_bytes(pubkey: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, pubkey)
        .verify(msg, sig)
        .is_ok()
}

fn append_audit(path: &Path, action: &str, msg: &[u8]) -> Result<(), KeystoreError> {
    rotate_audit_if_needed(path);

    // best-effort: store SHA-256(message) only (avoid leaking content)
    let digest = ring::digest::digest(&ring::digest::SHA256, msg);
    let line = format!(
        "{{\"action\":\"{}\",\"msg_sha256\":\"{}\"}}\n",
        action,
        hex::encode(digest.as_ref())
    );

    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|_| KeystoreError::Io)?;
    set_private_perms_best_effort(path);
    f.write_all(line.as_bytes()).map_err(|_| KeystoreError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::keccak256;

    #[test]
    fn open_creates_and_reloads_same_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8 path");

        let ks1 = Keystore::<FileSecp256k1Backend>::open(data_dir).expect("open 1");
        let pk1 = Signer::public_key(&ks1);

        let ks2 = Keystore::<FileSecp256k1Backend>::open(data_dir).expect("open 2");
        let pk2 = Signer::public_key(&ks2);

        assert_eq!(pk1.0, pk2.0);
    }

    #[test]
    fn sign_recovers_to_own_address() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ks = Keystore::<FileSecp256k1Backend>::open(dir.path().to_str().unwrap()).expect("open");

        let hash = keccak256(b"signedAnnounceVersion payload");
        let sig = Signer::sign_recoverable(&ks, &hash).expect("sign");
        let (_, addr) = crypto::recover_signer(&hash, &sig).expect("recover");

        assert_eq!(addr, ks.address());
    }

    #[test]
    fn encrypted_at_rest_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().unwrap().to_string();

        std::env::set_var("AMUNCHAIN_KEY_PASSPHRASE", "correct horse battery staple");
        let ks1 = Keystore::<FileSecp256k1Backend>::open(&data_dir).expect("open encrypted");
        let pk1 = Signer::public_key(&ks1);

        let ks2 = Keystore::<FileSecp256k1Backend>::open(&data_dir).expect("reopen encrypted");
        let pk2 = Signer::public_key(&ks2);
        std::env::remove_var("AMUNCHAIN_KEY_PASSPHRASE");

        assert_eq!(pk1.0, pk2.0);
    }
}
