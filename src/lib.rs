// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HeartEarth Core - password-sealed wallet store and encrypted channel client
//!
//! This crate keeps a user's BIP-39 mnemonic sealed at rest behind a
//! password-derived key, and speaks the HeartEarth peer protocol: signed
//! key announcements, end-to-end encrypted channel messages, and signed
//! plaintext fallback.
//!
//! ## Modules
//!
//! - `config` - Environment-driven configuration
//! - `telemetry` - Tracing subscriber setup
//! - `engine` - Key/account capability (derivation, X25519, AEAD, signatures)
//! - `storage` - Record store backends and the encrypted wallet vault
//! - `wallet` - Create / import / unlock facade over vault and engine
//! - `channel` - Relay transports, wire frames and the channel client

pub mod channel;
pub mod config;
pub mod engine;
pub mod storage;
pub mod telemetry;
pub mod wallet;

pub use channel::{
    ChannelClient, ChatMessage, ConnectionState, MemoryRelay, MessageContent, TcpConnector, WebSocketConnector,
};
pub use config::{ClientConfig, PeerInfo, RecipientPolicy, WalletConfig};
pub use engine::{EngineHandle, KeyEngine, LocalKeyEngine, Mnemonic, WalletAccount};
pub use storage::{InMemoryRecordStore, RecordStore, RedbRecordStore, WalletError, WalletVault};
pub use wallet::{SecureWallet, SecureWalletError, UnlockedWallet};
