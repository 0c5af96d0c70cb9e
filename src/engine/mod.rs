// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key/Account Engine
//!
//! Capability interface for every primitive the wallet store and channel
//! client consume: mnemonic generation, account derivation, X25519 key
//! agreement, channel AEAD and domain-separated signatures.
//!
//! The core never performs primitive crypto math itself; it talks to a
//! [`KeyEngine`] reached through an explicitly-owned [`EngineHandle`].
//! [`LocalKeyEngine`] is the shipped implementation.
//!
//! ## Secrets
//!
//! - [`Mnemonic`] and [`SharedSecret`] are zeroized on drop
//! - Neither implements a revealing `Debug`

pub mod handle;
pub mod local;

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub use handle::EngineHandle;
pub use local::LocalKeyEngine;

/// Account number used for the P2P identity.
pub const P2P_ACCOUNT: u32 = 0;

/// Derivation index used for the P2P identity.
pub const P2P_INDEX: u32 = 0;

/// Context string that separates channel signatures from blockchain signatures.
pub const SIGNING_CONTEXT: &str = "HeartEarth P2P Message";

/// Errors raised by a [`KeyEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("address {requested} does not belong to the derived account {derived}")]
    AddressMismatch { requested: String, derived: String },

    #[error("engine initialization failed: {0}")]
    Initialization(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Value types
// =============================================================================

/// A BIP-39 phrase held in zeroizing memory.
///
/// Construction does not validate; the engine checks the phrase on first use.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Mnemonic(String);

impl Mnemonic {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self(phrase.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn word_count(&self) -> usize {
        self.0.split_whitespace().count()
    }
}

impl fmt::Debug for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mnemonic([REDACTED; {} words])", self.word_count())
    }
}

impl PartialEq for Mnemonic {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Mnemonic {}

/// Blockchain and network identities derived from one (account, index) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccount {
    /// EIP-55 checksummed secp256k1 address.
    pub blockchain_address: String,
    /// Hex-encoded Ed25519 public key identifying this peer on the relay.
    pub peer_id: String,
    pub account_number: u32,
    pub index: u32,
}

/// Public half of a derived X25519 key-exchange keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X25519Key {
    /// Hex-encoded 32-byte Montgomery point.
    pub public_key: String,
}

/// 32-byte X25519 shared secret. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Channel ciphertext as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Hex-encoded ciphertext including the 16-byte Poly1305 tag.
    pub ciphertext: String,
    /// Hex-encoded 96-bit nonce.
    pub nonce: String,
}

/// What a signature binds: the signing domain, the claimed address and
/// origin, and an optional payload.
#[derive(Debug, Clone, Copy)]
pub struct SignRequest<'a> {
    pub domain: &'a str,
    pub address: &'a str,
    pub origin: &'a str,
    pub payload: Option<&'a str>,
}

/// Authentication proof attached to every outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature {
    pub address: String,
    pub domain: String,
    pub origin: String,
    /// `0x`-prefixed 65-byte recoverable secp256k1 signature.
    pub signature: String,
}

/// Build the statement that is actually signed.
///
/// The leading [`SIGNING_CONTEXT`] line keeps these signatures from ever
/// being valid for a blockchain transaction or a sign-in message.
pub fn signing_statement(domain: &str, address: &str, origin: &str, payload: Option<&str>) -> String {
    format!(
        "{SIGNING_CONTEXT}\nDomain: {domain}\nAddress: {address}\nURI: {origin}\nPayload: {}",
        payload.unwrap_or_default()
    )
}

/// Copy a hex string into a zeroizing buffer of exactly `N` bytes.
pub(crate) fn decode_hex_array<const N: usize>(value: &str) -> Option<Zeroizing<[u8; N]>> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    let bytes = Zeroizing::new(hex::decode(trimmed).ok()?);
    if bytes.len() != N {
        return None;
    }
    let mut out = Zeroizing::new([0u8; N]);
    out.copy_from_slice(&bytes);
    Some(out)
}

// =============================================================================
// Capability trait
// =============================================================================

/// The Key/Account Engine capability.
///
/// Every method is pure given its inputs (apart from fresh randomness in
/// [`generate_mnemonic`](Self::generate_mnemonic) and
/// [`aead_encrypt`](Self::aead_encrypt)) and completes in bounded time.
pub trait KeyEngine: Send + Sync {
    fn generate_mnemonic(&self) -> EngineResult<Mnemonic>;

    /// Fail with [`EngineError::InvalidMnemonic`] unless the phrase is a valid
    /// English BIP-39 mnemonic.
    fn validate_mnemonic(&self, mnemonic: &Mnemonic) -> EngineResult<()>;

    fn derive_account(&self, mnemonic: &Mnemonic, account: u32, index: u32) -> EngineResult<WalletAccount>;

    fn derive_x25519_key(&self, mnemonic: &Mnemonic, account: u32, index: u32) -> EngineResult<X25519Key>;

    fn ecdh_shared_secret(
        &self,
        mnemonic: &Mnemonic,
        account: u32,
        index: u32,
        their_public_key: &str,
    ) -> EngineResult<SharedSecret>;

    fn aead_encrypt(&self, plaintext: &str, secret: &SharedSecret, channel_id: &str) -> EngineResult<EncryptedPayload>;

    fn aead_decrypt(
        &self,
        ciphertext: &str,
        nonce: &str,
        secret: &SharedSecret,
        channel_id: &str,
    ) -> EngineResult<String>;

    fn sign(
        &self,
        mnemonic: &Mnemonic,
        account: u32,
        index: u32,
        request: SignRequest<'_>,
    ) -> EngineResult<MessageSignature>;

    /// Check that `signature` was produced by its claimed address over
    /// `payload`. Malformed signatures are errors; a well-formed signature
    /// from another key is `Ok(false)`.
    fn verify(&self, signature: &MessageSignature, payload: Option<&str>) -> EngineResult<bool>;
}
