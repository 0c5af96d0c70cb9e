// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Process-local record store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::{RecordStore, StorageError, StorageResult, WalletRecord};

/// `HashMap` behind a `RwLock`. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, WalletRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail with [`StorageError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Unavailable("record store lock poisoned".to_string())
}

impl RecordStore for InMemoryRecordStore {
    fn put(&self, id: &str, record: &WalletRecord) -> StorageResult<()> {
        self.check_writable()?;
        self.records
            .write()
            .map_err(poisoned)?
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> StorageResult<Option<WalletRecord>> {
        Ok(self.records.read().map_err(poisoned)?.get(id).cloned())
    }

    fn delete(&self, id: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.records.write().map_err(poisoned)?.remove(id);
        Ok(())
    }
}
