// DotStore
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Crypto provider and secret store collaborators
//!
//! Both are chosen once at store construction; the engine never probes for
//! platform modules at runtime. The digest is used for tamper and
//! corruption detection on stored payloads, not for security.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use sha3::{Digest, Sha3_256};

use dotstore_common::{StoreError, StoreResult};

use crate::cache::eviction::{AccessStamp, EvictionPolicy, select_victim};

/// Nonce length for AES-GCM, prefixed to every ciphertext.
const NONCE_LEN: usize = 12;

/// Key length for AES-256-GCM.
const KEY_LEN: usize = 32;

/// Cryptographic primitives consumed by the engine
pub trait CryptoProvider: Send + Sync {
    /// Hex digest of the given bytes.
    fn digest(&self, bytes: &[u8]) -> String;

    /// `n` bytes of cryptographically secure randomness.
    fn random_bytes(&self, n: usize) -> Vec<u8>;

    /// Authenticated encryption; the nonce is generated internally and
    /// carried inside the returned ciphertext.
    fn aead_encrypt(&self, plaintext: &[u8], key: &[u8]) -> StoreResult<Vec<u8>>;

    /// Authenticated decryption; fails on tamper or wrong key.
    fn aead_decrypt(&self, ciphertext: &[u8], key: &[u8]) -> StoreResult<Vec<u8>>;
}

/// Production provider: SHA3-256 digests, OS randomness, AES-256-GCM.
#[derive(Debug, Default, Clone)]
pub struct StdCrypto;

impl StdCrypto {
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &[u8]) -> StoreResult<Aes256Gcm> {
        if key.len() != KEY_LEN {
            return Err(StoreError::Unknown(format!("AEAD key must be {KEY_LEN} bytes, got {}", key.len())));
        }
        Ok(Aes256Gcm::new_from_slice(key).map_err(|e| StoreError::Unknown(e.to_string()))?)
    }
}

impl CryptoProvider for StdCrypto {
    fn digest(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha3_256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    fn aead_encrypt(&self, plaintext: &[u8], key: &[u8]) -> StoreResult<Vec<u8>> {
        let cipher = Self::cipher(key)?;
        let nonce_bytes = self.random_bytes(NONCE_LEN);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher.encrypt(nonce, plaintext).map_err(|_| StoreError::Unknown("AEAD encryption failed".into()))?;

        let mut out = nonce_bytes;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn aead_decrypt(&self, ciphertext: &[u8], key: &[u8]) -> StoreResult<Vec<u8>> {
        if ciphertext.len() <= NONCE_LEN {
            return Err(StoreError::CorruptedData("ciphertext shorter than nonce".into()));
        }
        let cipher = Self::cipher(key)?;
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| StoreError::CorruptedData("AEAD authentication failed".into()))
    }
}

/// Named secret storage consumed by callers that hold encryption keys
pub trait SecretStore: Send + Sync {
    fn get(&self, alias: &str) -> Option<Vec<u8>>;
    fn set(&self, alias: &str, secret: Vec<u8>);
    fn delete(&self, alias: &str);
}

/// In-memory secret store; the only implementation shipped with the engine.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, alias: &str) -> Option<Vec<u8>> {
        self.secrets.lock().get(alias).cloned()
    }

    fn set(&self, alias: &str, secret: Vec<u8>) {
        self.secrets.lock().insert(alias.to_string(), secret);
    }

    fn delete(&self, alias: &str) {
        self.secrets.lock().remove(alias);
    }
}

struct CredentialEntry {
    secret: Vec<u8>,
    stamp: AccessStamp,
}

/// Decorator that keeps a bounded credential cache in front of a slower
/// secret store, ranked with the same decaying-frequency scoring the data
/// cache uses.
pub struct CachingSecretStore<S> {
    inner: S,
    capacity: usize,
    entries: Mutex<HashMap<String, CredentialEntry>>,
}

impl<S: SecretStore> CachingSecretStore<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn admit(&self, alias: &str, secret: Vec<u8>) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(alias) && entries.len() >= self.capacity {
            let victim = select_victim(EvictionPolicy::Lfu, entries.iter().map(|(k, e)| (k.clone(), e.stamp)));
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }
        entries.insert(alias.to_string(), CredentialEntry { secret, stamp: AccessStamp::new() });
    }
}

impl<S: SecretStore> SecretStore for CachingSecretStore<S> {
    fn get(&self, alias: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.entries.lock().get_mut(alias) {
            entry.stamp.touch();
            return Some(entry.secret.clone());
        }

        let secret = self.inner.get(alias)?;
        self.admit(alias, secret.clone());
        Some(secret)
    }

    fn set(&self, alias: &str, secret: Vec<u8>) {
        self.inner.set(alias, secret.clone());
        self.admit(alias, secret);
    }

    fn delete(&self, alias: &str) {
        self.inner.delete(alias);
        self.entries.lock().remove(alias);
    }
}
