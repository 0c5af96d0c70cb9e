// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Secure Wallet
//!
//! The operations a front end calls: create or import a wallet, unlock it,
//! and derive accounts. Argon2id and key derivation are CPU-bound, so they
//! run on the blocking pool.

use std::sync::Arc;

use tracing::info;
use zeroize::Zeroizing;

use crate::engine::{EngineError, EngineHandle, Mnemonic, WalletAccount, P2P_ACCOUNT, P2P_INDEX};
use crate::storage::{RecordStore, WalletError, WalletVault};

#[derive(Debug, thiserror::Error)]
pub enum SecureWalletError {
    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type SecureWalletResult<T> = Result<T, SecureWalletError>;

/// A decrypted wallet. Drop it as soon as the mnemonic is no longer needed.
#[derive(Debug)]
pub struct UnlockedWallet {
    pub account: WalletAccount,
    pub mnemonic: Mnemonic,
}

pub struct SecureWallet<S> {
    vault: Arc<WalletVault<S>>,
    engine: EngineHandle,
}

impl<S> Clone for SecureWallet<S> {
    fn clone(&self) -> Self {
        Self {
            vault: Arc::clone(&self.vault),
            engine: self.engine.clone(),
        }
    }
}

impl<S: RecordStore + 'static> SecureWallet<S> {
    pub fn new(store: S, engine: EngineHandle) -> Self {
        Self {
            vault: Arc::new(WalletVault::new(store)),
            engine,
        }
    }

    pub fn vault(&self) -> &WalletVault<S> {
        &self.vault
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Generate a new mnemonic, seal it under `password` and return the
    /// P2P account.
    pub async fn create_wallet(&self, password: &str) -> SecureWalletResult<WalletAccount> {
        let engine = self.engine.get().await?;
        let mnemonic = engine.generate_mnemonic()?;
        let account = engine.derive_account(&mnemonic, P2P_ACCOUNT, P2P_INDEX)?;
        self.store_blocking(mnemonic, password).await?;
        info!(address = %account.blockchain_address, peer_id = %account.peer_id, "Wallet created");
        Ok(account)
    }

    /// Validate an existing phrase and seal it under `password`.
    pub async fn import_wallet(&self, mnemonic: Mnemonic, password: &str) -> SecureWalletResult<WalletAccount> {
        let engine = self.engine.get().await?;
        engine.validate_mnemonic(&mnemonic)?;
        let account = engine.derive_account(&mnemonic, P2P_ACCOUNT, P2P_INDEX)?;
        self.store_blocking(mnemonic, password).await?;
        info!(address = %account.blockchain_address, "Wallet imported");
        Ok(account)
    }

    pub async fn unlock_wallet(&self, password: &str) -> SecureWalletResult<UnlockedWallet> {
        let vault = Arc::clone(&self.vault);
        let password = Zeroizing::new(password.to_string());
        let mnemonic = tokio::task::spawn_blocking(move || vault.load(&password))
            .await
            .map_err(|e| SecureWalletError::Task(e.to_string()))??;

        let engine = self.engine.get().await?;
        let account = engine.derive_account(&mnemonic, P2P_ACCOUNT, P2P_INDEX)?;
        Ok(UnlockedWallet { account, mnemonic })
    }

    pub async fn change_password(&self, old_password: &str, new_password: &str) -> SecureWalletResult<()> {
        let vault = Arc::clone(&self.vault);
        let old_password = Zeroizing::new(old_password.to_string());
        let new_password = Zeroizing::new(new_password.to_string());
        tokio::task::spawn_blocking(move || vault.change_password(&old_password, &new_password))
            .await
            .map_err(|e| SecureWalletError::Task(e.to_string()))??;
        Ok(())
    }

    pub fn wallet_exists(&self) -> bool {
        self.vault.exists()
    }

    pub fn delete_wallet(&self) -> SecureWalletResult<()> {
        self.vault.delete()?;
        Ok(())
    }

    /// Derive any (account, index) pair from an unlocked mnemonic.
    pub async fn create_account(&self, mnemonic: &Mnemonic, account: u32, index: u32) -> SecureWalletResult<WalletAccount> {
        let engine = self.engine.get().await?;
        Ok(engine.derive_account(mnemonic, account, index)?)
    }

    async fn store_blocking(&self, mnemonic: Mnemonic, password: &str) -> SecureWalletResult<()> {
        let vault = Arc::clone(&self.vault);
        let password = Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || vault.store(&mnemonic, &password))
            .await
            .map_err(|e| SecureWalletError::Task(e.to_string()))??;
        Ok(())
    }
}
