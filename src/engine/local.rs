// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process [`KeyEngine`] built on audited crates.
//!
//! ## Derivation
//!
//! ```text
//! mnemonic ──BIP-39──▶ seed (64 bytes)
//!   ├─ BIP-32 m/44'/60'/{account}'/0/{index} ──▶ secp256k1 ──▶ address, EIP-191 signatures
//!   ├─ HKDF-SHA256 "heartearth/p2p/peer/{a}/{i}"   ──▶ Ed25519 seed ──▶ peer id
//!   └─ HKDF-SHA256 "heartearth/p2p/x25519/{a}/{i}" ──▶ X25519 static secret
//! ```
//!
//! Channel keys are HKDF-SHA256 expansions of the X25519 shared secret,
//! bound to the channel id; ciphertexts use ChaCha20-Poly1305.

use std::str::FromStr;

use alloy::primitives::{Address, Signature};
use alloy::signers::local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner};
use alloy::signers::SignerSync;
use bip39::Language;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use super::{
    decode_hex_array, signing_statement, EncryptedPayload, EngineError, EngineResult, KeyEngine,
    MessageSignature, Mnemonic, SharedSecret, SignRequest, WalletAccount, X25519Key,
};

/// HKDF salt shared by every P2P key derived from the BIP-39 seed.
const HKDF_SALT: &[u8] = b"heartearth-p2p-v1";

const PEER_INFO_PREFIX: &str = "heartearth/p2p/peer";
const X25519_INFO_PREFIX: &str = "heartearth/p2p/x25519";
const CHANNEL_INFO_PREFIX: &str = "heartearth/p2p/channel/v1|";

/// Entropy for a 12-word phrase.
const MNEMONIC_ENTROPY_BYTES: usize = 16;

/// ChaCha20-Poly1305 nonce length.
pub const CHANNEL_NONCE_LEN: usize = 12;

/// Stateless engine; cheap to construct and share.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalKeyEngine;

impl LocalKeyEngine {
    /// Create the engine after checking the BIP-39 wordlist round-trips.
    pub fn new() -> EngineResult<Self> {
        let engine = Self;
        let probe = engine.generate_mnemonic()?;
        engine
            .parse(&probe)
            .map_err(|e| EngineError::Initialization(e.to_string()))?;
        Ok(engine)
    }

    fn parse(&self, mnemonic: &Mnemonic) -> EngineResult<bip39::Mnemonic> {
        let normalized: Zeroizing<String> = Zeroizing::new(mnemonic.as_str().nfkd().collect());
        let joined = Zeroizing::new(normalized.split_whitespace().collect::<Vec<_>>().join(" "));
        bip39::Mnemonic::parse_in_normalized(Language::English, &joined)
            .map_err(|e| EngineError::InvalidMnemonic(e.to_string()))
    }

    fn seed(&self, mnemonic: &Mnemonic) -> EngineResult<Zeroizing<[u8; 64]>> {
        let parsed = self.parse(mnemonic)?;
        Ok(Zeroizing::new(parsed.to_seed_normalized("")))
    }

    fn expand_seed(&self, mnemonic: &Mnemonic, info: &str) -> EngineResult<Zeroizing<[u8; 32]>> {
        let seed = self.seed(mnemonic)?;
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), seed.as_ref());
        let mut okm = Zeroizing::new([0u8; 32]);
        hkdf.expand(info.as_bytes(), okm.as_mut())
            .map_err(|e| EngineError::Derivation(format!("HKDF expand failed: {e}")))?;
        Ok(okm)
    }

    fn signer(&self, mnemonic: &Mnemonic, account: u32, index: u32) -> EngineResult<PrivateKeySigner> {
        let phrase = Zeroizing::new(self.parse(mnemonic)?.to_string());
        MnemonicBuilder::<English>::default()
            .phrase(phrase.as_str())
            .derivation_path(format!("m/44'/60'/{account}'/0/{index}"))
            .map_err(|e| EngineError::Derivation(e.to_string()))?
            .build()
            .map_err(|e| EngineError::Derivation(e.to_string()))
    }

    fn x25519_secret(&self, mnemonic: &Mnemonic, account: u32, index: u32) -> EngineResult<x25519_dalek::StaticSecret> {
        let okm = self.expand_seed(mnemonic, &format!("{X25519_INFO_PREFIX}/{account}/{index}"))?;
        Ok(x25519_dalek::StaticSecret::from(*okm))
    }

    fn channel_cipher(&self, secret: &SharedSecret, channel_id: &str) -> EngineResult<ChaCha20Poly1305> {
        let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        let info = format!("{CHANNEL_INFO_PREFIX}{channel_id}");
        hkdf.expand(info.as_bytes(), key.as_mut())
            .map_err(|e| EngineError::Derivation(format!("HKDF expand failed: {e}")))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key.as_ref())))
    }
}

impl KeyEngine for LocalKeyEngine {
    fn generate_mnemonic(&self) -> EngineResult<Mnemonic> {
        let mut entropy = Zeroizing::new([0u8; MNEMONIC_ENTROPY_BYTES]);
        OsRng.fill_bytes(entropy.as_mut());
        let phrase = bip39::Mnemonic::from_entropy_in(Language::English, entropy.as_ref())
            .map_err(|e| EngineError::Derivation(e.to_string()))?;
        Ok(Mnemonic::new(phrase.to_string()))
    }

    fn validate_mnemonic(&self, mnemonic: &Mnemonic) -> EngineResult<()> {
        self.parse(mnemonic).map(|_| ())
    }

    fn derive_account(&self, mnemonic: &Mnemonic, account: u32, index: u32) -> EngineResult<WalletAccount> {
        let signer = self.signer(mnemonic, account, index)?;
        let peer_seed = self.expand_seed(mnemonic, &format!("{PEER_INFO_PREFIX}/{account}/{index}"))?;
        let peer_key = ed25519_dalek::SigningKey::from_bytes(&peer_seed);

        Ok(WalletAccount {
            blockchain_address: signer.address().to_checksum(None),
            peer_id: hex::encode(peer_key.verifying_key().to_bytes()),
            account_number: account,
            index,
        })
    }

    fn derive_x25519_key(&self, mnemonic: &Mnemonic, account: u32, index: u32) -> EngineResult<X25519Key> {
        let secret = self.x25519_secret(mnemonic, account, index)?;
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(X25519Key {
            public_key: hex::encode(public.as_bytes()),
        })
    }

    fn ecdh_shared_secret(
        &self,
        mnemonic: &Mnemonic,
        account: u32,
        index: u32,
        their_public_key: &str,
    ) -> EngineResult<SharedSecret> {
        let their_bytes = decode_hex_array::<32>(their_public_key)
            .ok_or_else(|| EngineError::InvalidPublicKey("expected 32 hex-encoded bytes".to_string()))?;
        let their_public = x25519_dalek::PublicKey::from(*their_bytes);

        let secret = self.x25519_secret(mnemonic, account, index)?;
        let shared = secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(EngineError::InvalidPublicKey("low-order point".to_string()));
        }
        Ok(SharedSecret::from_bytes(*shared.as_bytes()))
    }

    fn aead_encrypt(&self, plaintext: &str, secret: &SharedSecret, channel_id: &str) -> EngineResult<EncryptedPayload> {
        let cipher = self.channel_cipher(secret, channel_id)?;

        let mut nonce = [0u8; CHANNEL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: channel_id.as_bytes(),
                },
            )
            .map_err(|e| EngineError::Encryption(e.to_string()))?;

        Ok(EncryptedPayload {
            ciphertext: hex::encode(ciphertext),
            nonce: hex::encode(nonce),
        })
    }

    fn aead_decrypt(
        &self,
        ciphertext: &str,
        nonce: &str,
        secret: &SharedSecret,
        channel_id: &str,
    ) -> EngineResult<String> {
        let nonce = decode_hex_array::<CHANNEL_NONCE_LEN>(nonce)
            .ok_or_else(|| EngineError::Decryption("nonce must be 12 hex-encoded bytes".to_string()))?;
        let ciphertext =
            hex::decode(ciphertext).map_err(|e| EngineError::Decryption(format!("ciphertext is not hex: {e}")))?;

        let cipher = self.channel_cipher(secret, channel_id)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce.as_ref()),
                    Payload {
                        msg: &ciphertext,
                        aad: channel_id.as_bytes(),
                    },
                )
                .map_err(|_| EngineError::Decryption("authentication tag mismatch".to_string()))?,
        );

        String::from_utf8(plaintext.to_vec()).map_err(|e| EngineError::Decryption(format!("plaintext is not UTF-8: {e}")))
    }

    fn sign(
        &self,
        mnemonic: &Mnemonic,
        account: u32,
        index: u32,
        request: SignRequest<'_>,
    ) -> EngineResult<MessageSignature> {
        let signer = self.signer(mnemonic, account, index)?;
        let derived = signer.address().to_checksum(None);
        if !derived.eq_ignore_ascii_case(request.address) {
            return Err(EngineError::AddressMismatch {
                requested: request.address.to_string(),
                derived,
            });
        }

        let statement = signing_statement(request.domain, &derived, request.origin, request.payload);
        let signature = signer
            .sign_message_sync(statement.as_bytes())
            .map_err(|e| EngineError::Signing(e.to_string()))?;

        Ok(MessageSignature {
            address: derived,
            domain: request.domain.to_string(),
            origin: request.origin.to_string(),
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        })
    }

    fn verify(&self, signature: &MessageSignature, payload: Option<&str>) -> EngineResult<bool> {
        let expected = Address::from_str(&signature.address)
            .map_err(|e| EngineError::InvalidSignature(format!("bad address: {e}")))?;

        let raw = signature.signature.strip_prefix("0x").unwrap_or(&signature.signature);
        let bytes = hex::decode(raw).map_err(|e| EngineError::InvalidSignature(format!("not hex: {e}")))?;
        let parsed = Signature::try_from(bytes.as_slice()).map_err(|e| EngineError::InvalidSignature(e.to_string()))?;

        let statement = signing_statement(&signature.domain, &signature.address, &signature.origin, payload);
        match parsed.recover_address_from_msg(statement.as_bytes()) {
            Ok(recovered) => Ok(recovered == expected),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn mnemonic() -> Mnemonic {
        Mnemonic::new(PHRASE)
    }

    #[test]
    fn generated_mnemonic_is_valid_and_fresh() {
        let engine = LocalKeyEngine::new().unwrap();
        let a = engine.generate_mnemonic().unwrap();
        let b = engine.generate_mnemonic().unwrap();
        assert_eq!(a.word_count(), 12);
        engine.validate_mnemonic(&a).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_mnemonic_rejected() {
        let engine = LocalKeyEngine;
        let bad = Mnemonic::new("abandon abandon abandon");
        assert!(matches!(engine.validate_mnemonic(&bad), Err(EngineError::InvalidMnemonic(_))));
    }

    #[test]
    fn derive_account_matches_bip44_vector() {
        let engine = LocalKeyEngine;
        let account = engine.derive_account(&mnemonic(), 0, 0).unwrap();
        // Well-known first address of the "abandon ... about" test phrase.
        assert_eq!(account.blockchain_address, "0x9858EfFD232B4033E47d90003D41EC34EcaEda94");
        assert_eq!(account.peer_id.len(), 64);
        assert_eq!(account.account_number, 0);
        assert_eq!(account.index, 0);
    }

    #[test]
    fn extra_whitespace_does_not_change_identity() {
        let engine = LocalKeyEngine;
        let spaced = Mnemonic::new(format!("  {}  ", PHRASE.replace(' ', "   ")));
        let a = engine.derive_account(&mnemonic(), 0, 0).unwrap();
        let b = engine.derive_account(&spaced, 0, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_indices_give_different_keys() {
        let engine = LocalKeyEngine;
        let a = engine.derive_x25519_key(&mnemonic(), 0, 0).unwrap();
        let b = engine.derive_x25519_key(&mnemonic(), 0, 1).unwrap();
        assert_ne!(a.public_key, b.public_key);
        assert_eq!(a.public_key.len(), 64);
    }

    #[test]
    fn ecdh_is_symmetric_and_channel_aead_roundtrips() {
        let engine = LocalKeyEngine;
        let alice = mnemonic();
        let bob = engine.generate_mnemonic().unwrap();
        let alice_pub = engine.derive_x25519_key(&alice, 0, 0).unwrap();
        let bob_pub = engine.derive_x25519_key(&bob, 0, 0).unwrap();

        let ab = engine.ecdh_shared_secret(&alice, 0, 0, &bob_pub.public_key).unwrap();
        let ba = engine.ecdh_shared_secret(&bob, 0, 0, &alice_pub.public_key).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());

        let sealed = engine.aead_encrypt("hello bob", &ab, "/art/dev/general/v1").unwrap();
        let opened = engine
            .aead_decrypt(&sealed.ciphertext, &sealed.nonce, &ba, "/art/dev/general/v1")
            .unwrap();
        assert_eq!(opened, "hello bob");
    }

    #[test]
    fn channel_binding_is_enforced() {
        let engine = LocalKeyEngine;
        let secret = SharedSecret::from_bytes([9u8; 32]);
        let sealed = engine.aead_encrypt("scoped", &secret, "/a").unwrap();
        let result = engine.aead_decrypt(&sealed.ciphertext, &sealed.nonce, &secret, "/b");
        assert!(matches!(result, Err(EngineError::Decryption(_))));
    }

    #[test]
    fn low_order_public_key_rejected() {
        let engine = LocalKeyEngine;
        let zero = "00".repeat(32);
        let result = engine.ecdh_shared_secret(&mnemonic(), 0, 0, &zero);
        assert!(matches!(result, Err(EngineError::InvalidPublicKey(_))));

        let short = engine.ecdh_shared_secret(&mnemonic(), 0, 0, "abcd");
        assert!(matches!(short, Err(EngineError::InvalidPublicKey(_))));
    }

    #[test]
    fn sign_and_verify() {
        let engine = LocalKeyEngine;
        let account = engine.derive_account(&mnemonic(), 0, 0).unwrap();
        let request = SignRequest {
            domain: "p2p.heartearth.art",
            address: &account.blockchain_address,
            origin: "https://p2p.heartearth.art",
            payload: Some("payload"),
        };
        let signature = engine.sign(&mnemonic(), 0, 0, request).unwrap();

        assert!(engine.verify(&signature, Some("payload")).unwrap());
        assert!(!engine.verify(&signature, Some("other payload")).unwrap());

        let mut forged = signature.clone();
        forged.domain = "evil.example".to_string();
        assert!(!engine.verify(&forged, Some("payload")).unwrap());
    }

    #[test]
    fn sign_rejects_foreign_address() {
        let engine = LocalKeyEngine;
        let request = SignRequest {
            domain: "d",
            address: "0x0000000000000000000000000000000000000001",
            origin: "o",
            payload: None,
        };
        let result = engine.sign(&mnemonic(), 0, 0, request);
        assert!(matches!(result, Err(EngineError::AddressMismatch { .. })));
    }

    #[test]
    fn malformed_signature_is_an_error() {
        let engine = LocalKeyEngine;
        let signature = MessageSignature {
            address: "0x9858EfFD232B4033E47d90003D41EC34EcaEda94".to_string(),
            domain: "d".to_string(),
            origin: "o".to_string(),
            signature: "0x1234".to_string(),
        };
        assert!(engine.verify(&signature, None).is_err());
    }
}
