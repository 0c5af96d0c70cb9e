// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JSON wire frames.
//!
//! ```text
//! {"type":"key_announcement","data":<x25519 hex>,"signature":{..},"sender":<peer id>}
//! {"type":"publish","topic":..,"data":<text>,"signature":{..},"sender":..,"timestamp":..}
//! {"type":"publish","topic":..,"encrypted":true,"ciphertext":<hex>,"nonce":<hex>,"signature":{..},"sender":..}
//! ```
//!
//! Unknown `type` values parse as [`Frame::Unknown`]. An announcement's
//! signature covers `<sender>|<key>`, so it cannot be replayed under another
//! peer id.

use serde::{Deserialize, Serialize};

use crate::engine::MessageSignature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    KeyAnnouncement(KeyAnnouncement),
    #[serde(alias = "message")]
    Publish(PublishFrame),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAnnouncement {
    /// Hex X25519 public key.
    #[serde(alias = "public_key")]
    pub data: String,
    pub signature: MessageSignature,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl KeyAnnouncement {
    pub fn signed_payload(&self) -> String {
        announcement_payload(&self.sender, &self.data)
    }
}

/// The string a key announcement's signature covers.
pub fn announcement_payload(sender: &str, public_key: &str) -> String {
    format!("{sender}|{public_key}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFrame {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<MessageSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Peer id the ciphertext was sealed for (fan-out only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PublishFrame {
    /// The string the sender signed: ciphertext when encrypted, text otherwise.
    pub fn signed_payload(&self) -> Option<&str> {
        if self.encrypted {
            self.ciphertext.as_deref()
        } else {
            self.data.as_deref()
        }
    }
}

impl Frame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
