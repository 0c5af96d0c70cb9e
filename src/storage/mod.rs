// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Wallet Storage
//!
//! Password-sealed persistence of the wallet mnemonic.
//!
//! ## Layers
//!
//! - [`RecordStore`]: opaque put/get/delete of a [`WalletRecord`] by id,
//!   atomic per call. Backends: [`InMemoryRecordStore`], [`RedbRecordStore`].
//! - [`cipher`]: Argon2id key derivation and AES-256-GCM sealing.
//! - [`vault`]: the Encrypted Wallet Store ([`WalletVault`]).
//!
//! ## Storage Layout
//!
//! ```text
//! $DATA_DIR/
//!   wallets.redb      # table `wallets`: wallet id → JSON WalletRecord
//! ```
//!
//! The plaintext mnemonic never reaches a [`RecordStore`].

pub mod cipher;
pub mod memory;
pub mod paths;
pub mod redb_store;
pub mod vault;

use serde::{Deserialize, Serialize};

pub use memory::InMemoryRecordStore;
pub use paths::StoragePaths;
pub use redb_store::RedbRecordStore;
pub use vault::{WalletError, WalletResult, WalletVault};

/// Fixed logical id of the single wallet record.
pub const WALLET_ID: &str = "main";

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// Record
// =============================================================================

/// The sealed mnemonic as persisted.
///
/// Binary fields are standard padded base64, `createdAt` is epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    pub id: String,
    /// AES-256-GCM ciphertext with the 16-byte tag appended.
    pub encrypted_data: String,
    pub salt: String,
    pub iv: String,
    pub created_at: i64,
}

// =============================================================================
// Capability
// =============================================================================

/// Persistent Record Store capability.
///
/// Each call is atomic: readers see either the whole record or none of it.
pub trait RecordStore: Send + Sync {
    /// Insert or replace the record stored under `id`.
    fn put(&self, id: &str, record: &WalletRecord) -> StorageResult<()>;

    fn get(&self, id: &str) -> StorageResult<Option<WalletRecord>>;

    /// Remove the record. Deleting an absent id succeeds.
    fn delete(&self, id: &str) -> StorageResult<()>;
}

impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    fn put(&self, id: &str, record: &WalletRecord) -> StorageResult<()> {
        (**self).put(id, record)
    }

    fn get(&self, id: &str) -> StorageResult<Option<WalletRecord>> {
        (**self).get(id)
    }

    fn delete(&self, id: &str) -> StorageResult<()> {
        (**self).delete(id)
    }
}
