// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Password sealing: Argon2id key derivation + AES-256-GCM.
//!
//! The KDF cost parameters are fixed constants, not stored per record, so any
//! compliant reader can open a record with only the password. Salt and nonce
//! are fresh random values for every [`seal`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Argon2id salt length.
pub const SALT_LEN: usize = 32;

/// AES-GCM nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// Derived key length (AES-256).
pub const KEY_LEN: usize = 32;

/// Argon2id iterations.
pub const ARGON2_T_COST: u32 = 3;

/// Argon2id memory in KiB.
pub const ARGON2_M_COST: u32 = 4096;

/// Argon2id lanes.
pub const ARGON2_P_COST: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Tag mismatch: wrong password or modified ciphertext.
    #[error("authentication failed")]
    Authentication,
}

pub type CipherResult<T> = Result<T, CipherError>;

/// Output of [`seal`]: ciphertext (tag appended) plus the salt and nonce used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub ciphertext: Vec<u8>,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

/// Symmetric key for exactly one seal/open call.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    fn derive(password: &str, salt: &[u8; SALT_LEN]) -> CipherResult<Self> {
        let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(KEY_LEN))
            .map_err(|e| CipherError::Kdf(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Self([0u8; KEY_LEN]);
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut key.0)
            .map_err(|e| CipherError::Kdf(e.to_string()))?;
        Ok(key)
    }

    fn cipher(&self) -> CipherResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| CipherError::Kdf(e.to_string()))
    }
}

/// Encrypt `plaintext` under a key derived from `password` and a fresh salt.
pub fn seal(plaintext: &[u8], password: &str) -> CipherResult<SealedSecret> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = DerivedKey::derive(password, &salt)?;
    let ciphertext = key
        .cipher()?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CipherError::Encrypt(e.to_string()))?;

    Ok(SealedSecret { ciphertext, salt, nonce })
}

/// Decrypt a [`SealedSecret`] with `password`.
pub fn open(sealed: &SealedSecret, password: &str) -> CipherResult<Zeroizing<Vec<u8>>> {
    let key = DerivedKey::derive(password, &sealed.salt)?;
    let plaintext = key
        .cipher()?
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| CipherError::Authentication)?;
    Ok(Zeroizing::new(plaintext))
}
