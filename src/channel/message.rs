// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! What observers receive.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const SENDER_KEY_UNKNOWN: &str = "[Encrypted message - sender key unknown]";
pub const DECRYPTION_FAILED: &str = "[Encrypted message - decryption failed]";
pub const ENCRYPTION_NOT_INITIALIZED: &str = "[Encrypted message - encryption not initialized]";

/// Sender id used when a frame carries none.
pub const UNKNOWN_SENDER: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    /// States reported to connection observers.
    pub fn is_observable(self) -> bool {
        matches!(self, Self::Connected | Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Body of a delivered message: decrypted or plain text, or the reason it
/// could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    SenderKeyUnknown,
    DecryptionFailed,
    EncryptionNotInitialized,
}

impl MessageContent {
    pub fn is_placeholder(&self) -> bool {
        !matches!(self, Self::Text(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::SenderKeyUnknown => SENDER_KEY_UNKNOWN,
            Self::DecryptionFailed => DECRYPTION_FAILED,
            Self::EncryptionNotInitialized => ENCRYPTION_NOT_INITIALIZED,
        }
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub topic: String,
    pub sender: String,
    pub content: MessageContent,
    /// Epoch milliseconds; sender's when present, else time of receipt.
    pub timestamp: i64,
    pub encrypted: bool,
    /// Whether the frame's signature verified over its payload.
    pub verified: bool,
}

impl ChatMessage {
    pub fn data(&self) -> &str {
        self.content.as_str()
    }
}
