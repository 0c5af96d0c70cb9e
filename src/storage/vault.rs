// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Encrypted Wallet Store.
//!
//! Seals the mnemonic with [`cipher`](super::cipher) and persists the result
//! as a single [`WalletRecord`] under [`WALLET_ID`]. Every mutating call is
//! one `put` or one `delete` on the underlying [`RecordStore`].

use base64ct::{Base64, Encoding};
use tracing::{debug, info, warn};

use super::cipher::{self, CipherError, SealedSecret, NONCE_LEN, SALT_LEN};
use super::{RecordStore, StorageError, WalletRecord, WALLET_ID};
use crate::engine::Mnemonic;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("no wallet found")]
    NotFound,

    #[error("invalid password")]
    InvalidPassword,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type WalletResult<T> = Result<T, WalletError>;

impl From<CipherError> for WalletError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Authentication => WalletError::InvalidPassword,
            other => WalletError::Crypto(other.to_string()),
        }
    }
}

pub struct WalletVault<S> {
    store: S,
}

impl<S: RecordStore> WalletVault<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store_ref(&self) -> &S {
        &self.store
    }

    /// Seal `mnemonic` under `password` and write it, replacing any existing record.
    pub fn store(&self, mnemonic: &Mnemonic, password: &str) -> WalletResult<()> {
        let record = seal_record(mnemonic, password)?;
        self.store.put(WALLET_ID, &record)?;
        info!(wallet_id = WALLET_ID, "Wallet record stored");
        Ok(())
    }

    /// Read the record and decrypt it with `password`.
    pub fn load(&self, password: &str) -> WalletResult<Mnemonic> {
        let record = self.store.get(WALLET_ID)?.ok_or(WalletError::NotFound)?;
        let sealed = decode_record(&record)?;

        let plaintext = match cipher::open(&sealed, password) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(wallet_id = WALLET_ID, error = %e, "Wallet unlock rejected");
                return Err(e.into());
            }
        };
        let phrase = std::str::from_utf8(&plaintext)
            .map_err(|e| WalletError::Crypto(format!("decrypted mnemonic is not UTF-8: {e}")))?;
        Ok(Mnemonic::new(phrase))
    }

    /// `true` iff a record is present. Store failures read as absent.
    pub fn exists(&self) -> bool {
        match self.store.get(WALLET_ID) {
            Ok(record) => record.is_some(),
            Err(e) => {
                warn!(wallet_id = WALLET_ID, error = %e, "Wallet existence check failed");
                false
            }
        }
    }

    /// Remove the record. Succeeds when there is nothing to remove.
    pub fn delete(&self) -> WalletResult<()> {
        self.store.delete(WALLET_ID)?;
        info!(wallet_id = WALLET_ID, "Wallet record deleted");
        Ok(())
    }

    /// Re-seal the stored mnemonic under `new_password`.
    ///
    /// The replacement is written with a single `put`; a failure leaves the
    /// old record readable with `old_password`.
    pub fn change_password(&self, old_password: &str, new_password: &str) -> WalletResult<()> {
        let mnemonic = self.load(old_password)?;
        let record = seal_record(&mnemonic, new_password)?;
        self.store.put(WALLET_ID, &record)?;
        info!(wallet_id = WALLET_ID, "Wallet password changed");
        Ok(())
    }
}

fn seal_record(mnemonic: &Mnemonic, password: &str) -> WalletResult<WalletRecord> {
    let sealed = cipher::seal(mnemonic.as_str().as_bytes(), password)?;
    Ok(WalletRecord {
        id: WALLET_ID.to_string(),
        encrypted_data: Base64::encode_string(&sealed.ciphertext),
        salt: Base64::encode_string(&sealed.salt),
        iv: Base64::encode_string(&sealed.nonce),
        created_at: chrono::Utc::now().timestamp_millis(),
    })
}

fn decode_record(record: &WalletRecord) -> WalletResult<SealedSecret> {
    let ciphertext = decode_field("encryptedData", &record.encrypted_data)?;
    let salt = decode_field("salt", &record.salt)?;
    let nonce = decode_field("iv", &record.iv)?;

    let salt: [u8; SALT_LEN] = salt
        .try_into()
        .map_err(|v: Vec<u8>| WalletError::Crypto(format!("salt must be {SALT_LEN} bytes, got {}", v.len())))?;
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|v: Vec<u8>| WalletError::Crypto(format!("iv must be {NONCE_LEN} bytes, got {}", v.len())))?;

    Ok(SealedSecret { ciphertext, salt, nonce })
}

fn decode_field(name: &str, value: &str) -> WalletResult<Vec<u8>> {
    Base64::decode_vec(value).map_err(|e| WalletError::Crypto(format!("{name} is not valid base64: {e}")))
}
