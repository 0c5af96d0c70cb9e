// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded record store backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `wallets`: wallet id → serialized WalletRecord (JSON bytes)

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::{RecordStore, StoragePaths, StorageResult, WalletRecord};

// =============================================================================
// Table Definitions
// =============================================================================

/// wallet id → serialized WalletRecord (JSON bytes).
const WALLETS: TableDefinition<&str, &[u8]> = TableDefinition::new("wallets");

// =============================================================================
// RedbRecordStore
// =============================================================================

/// On-disk record store. Every call runs in its own redb transaction.
pub struct RedbRecordStore {
    db: Database,
}

impl RedbRecordStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create the table so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(WALLETS)?;
        }
        write_txn.commit()?;

        tracing::debug!(path = %path.display(), "Opened wallet database");
        Ok(Self { db })
    }

    /// Open the database at its standard location under `paths`.
    pub fn open_in(paths: &StoragePaths) -> StorageResult<Self> {
        Self::open(&paths.wallet_db())
    }
}

impl std::fmt::Debug for RedbRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRecordStore").finish_non_exhaustive()
    }
}

impl RecordStore for RedbRecordStore {
    fn put(&self, id: &str, record: &WalletRecord) -> StorageResult<()> {
        let json = serde_json::to_vec(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WALLETS)?;
            table.insert(id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> StorageResult<Option<WalletRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WALLETS)?;
        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn delete(&self, id: &str) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WALLETS)?;
            table.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
