// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, default values, and the config structs built
//! from them.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for the wallet database | `./data` |
//! | `P2P_RELAY_URL` | Relay address (`wss://`, `ws://` or `tcp://host:port`) | `wss://p2p.heartearth.art/ws` |
//! | `P2P_CHANNEL` | Subscribed channel / topic | `/art/dev/general/v1` |
//! | `P2P_ENCRYPTION` | Encrypt outbound messages when a peer key is known | `true` |
//! | `P2P_RECIPIENT_POLICY` | `first-peer` or `fan-out` | `first-peer` |
//! | `P2P_OPERATION_TIMEOUT_MS` | Bound on handshake, derivation and send steps | `10000` |
//! | `P2P_SIGNING_DOMAIN` | Domain bound into every signature | `p2p.heartearth.art` |
//! | `P2P_SIGNING_ORIGIN` | Origin bound into every signature | `https://p2p.heartearth.art` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::StoragePaths;

/// Environment variable name for the data directory path.
///
/// # Default
/// `./data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Environment variable name for the relay URL.
pub const RELAY_URL_ENV: &str = "P2P_RELAY_URL";

pub const CHANNEL_ENV: &str = "P2P_CHANNEL";

pub const ENCRYPTION_ENV: &str = "P2P_ENCRYPTION";

pub const RECIPIENT_POLICY_ENV: &str = "P2P_RECIPIENT_POLICY";

pub const OPERATION_TIMEOUT_ENV: &str = "P2P_OPERATION_TIMEOUT_MS";

pub const SIGNING_DOMAIN_ENV: &str = "P2P_SIGNING_DOMAIN";

pub const SIGNING_ORIGIN_ENV: &str = "P2P_SIGNING_ORIGIN";

/// `json` switches the subscriber to JSON lines.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_RELAY_URL: &str = "wss://p2p.heartearth.art/ws";
pub const DEFAULT_CHANNEL: &str = "/art/dev/general/v1";
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_SIGNING_DOMAIN: &str = "p2p.heartearth.art";
pub const DEFAULT_SIGNING_ORIGIN: &str = "https://p2p.heartearth.art";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn invalid(var: &'static str, value: &str, reason: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// Recipient policy
// =============================================================================

/// Who an encrypted message is sealed for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipientPolicy {
    /// One frame, sealed for the first peer whose key arrived.
    #[default]
    #[serde(rename = "first-peer")]
    FirstKnownPeer,
    /// One frame per known peer, each addressed with `recipient`.
    FanOut,
}

impl FromStr for RecipientPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first-peer" | "first" => Ok(Self::FirstKnownPeer),
            "fan-out" | "fanout" => Ok(Self::FanOut),
            other => Err(format!("expected `first-peer` or `fan-out`, got `{other}`")),
        }
    }
}

impl fmt::Display for RecipientPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstKnownPeer => f.write_str("first-peer"),
            Self::FanOut => f.write_str("fan-out"),
        }
    }
}

// =============================================================================
// Client configuration
// =============================================================================

/// This session's identities, as derived from the unlocked wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub blockchain_address: String,
}

impl From<&crate::engine::WalletAccount> for PeerInfo {
    fn from(account: &crate::engine::WalletAccount) -> Self {
        Self {
            peer_id: account.peer_id.clone(),
            blockchain_address: account.blockchain_address.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: Url,
    pub channel: String,
    pub peer_info: PeerInfo,
    pub encryption_enabled: bool,
    pub recipient_policy: RecipientPolicy,
    pub operation_timeout: Duration,
    pub signing_domain: String,
    pub signing_origin: String,
}

impl ClientConfig {
    /// Config with defaults for everything but the relay, channel and identity.
    pub fn new(relay_url: Url, channel: impl Into<String>, peer_info: PeerInfo) -> Self {
        Self {
            relay_url,
            channel: channel.into(),
            peer_info,
            encryption_enabled: true,
            recipient_policy: RecipientPolicy::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            signing_domain: DEFAULT_SIGNING_DOMAIN.to_string(),
            signing_origin: DEFAULT_SIGNING_ORIGIN.to_string(),
        }
    }

    /// Load from the process environment.
    pub fn from_env(peer_info: PeerInfo) -> ConfigResult<Self> {
        Self::from_lookup(peer_info, |var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(peer_info: PeerInfo, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup(RELAY_URL_ENV).unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
        let relay_url = Url::parse(&raw_url).map_err(|e| invalid(RELAY_URL_ENV, &raw_url, e))?;
        // In-process `memory://` relays cannot be named from the environment.
        if !matches!(relay_url.scheme(), "ws" | "wss" | "tcp") {
            return Err(invalid(RELAY_URL_ENV, &raw_url, "scheme must be ws, wss or tcp"));
        }

        let channel = lookup(CHANNEL_ENV).unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
        if channel.trim().is_empty() {
            return Err(invalid(CHANNEL_ENV, &channel, "must not be empty"));
        }

        let mut config = Self::new(relay_url, channel, peer_info);

        if let Some(raw) = lookup(ENCRYPTION_ENV) {
            config.encryption_enabled = parse_bool(&raw).ok_or_else(|| invalid(ENCRYPTION_ENV, &raw, "expected true or false"))?;
        }
        if let Some(raw) = lookup(RECIPIENT_POLICY_ENV) {
            config.recipient_policy = raw.parse().map_err(|e: String| invalid(RECIPIENT_POLICY_ENV, &raw, e))?;
        }
        if let Some(raw) = lookup(OPERATION_TIMEOUT_ENV) {
            let ms: u64 = raw.trim().parse().map_err(|e| invalid(OPERATION_TIMEOUT_ENV, &raw, e))?;
            if ms == 0 {
                return Err(invalid(OPERATION_TIMEOUT_ENV, &raw, "must be positive"));
            }
            config.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(domain) = lookup(SIGNING_DOMAIN_ENV) {
            config.signing_domain = domain;
        }
        if let Some(origin) = lookup(SIGNING_ORIGIN_ENV) {
            Url::parse(&origin).map_err(|e| invalid(SIGNING_ORIGIN_ENV, &origin, e))?;
            config.signing_origin = origin;
        }

        Ok(config)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Wallet configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub data_dir: PathBuf,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(crate::storage::paths::DATA_ROOT),
        }
    }
}

impl WalletConfig {
    pub fn from_env() -> Self {
        std::env::var(DATA_DIR_ENV)
            .map(|dir| Self { data_dir: dir.into() })
            .unwrap_or_default()
    }

    pub fn paths(&self) -> StoragePaths {
        StoragePaths::new(&self.data_dir)
    }
}
