// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport closed")]
    Closed,

    #[error("unsupported relay scheme: {0}")]
    UnsupportedScheme(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Failures inside connect and send. The public client absorbs these into
/// state transitions and boolean results.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("frame serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Why an inbound frame was dropped. Logged, never returned.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame for topic {got:?}, subscribed to {expected:?}")]
    WrongTopic { expected: String, got: String },

    #[error("key announcement from {sender} failed signature verification")]
    BadSignature { sender: String },

    #[error("frame missing required field `{0}`")]
    MissingField(&'static str),

    #[error("frame addressed to {recipient}")]
    NotForUs { recipient: String },
}
