// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Secure Channel
//!
//! Authenticated, optionally end-to-end encrypted publish/subscribe over a
//! relay.
//!
//! ## Protocol
//!
//! 1. On connect the client announces its X25519 public key, signed with
//!    the wallet identity over its peer id and the key.
//! 2. Peers record verified announcements in a bounded per-session key
//!    table. The first wallet address seen for a peer id is pinned; later
//!    announcements for that id must come from the same wallet.
//! 3. Outbound text is sealed with ChaCha20-Poly1305 under the X25519
//!    shared secret of a known peer (or every known peer, see
//!    [`RecipientPolicy`](crate::config::RecipientPolicy)), or sent as signed
//!    plaintext when no peer key is known.
//! 4. Inbound frames are filtered by topic, verified, decrypted when
//!    possible, and handed to observers. Unreadable ciphertext arrives as a
//!    placeholder [`MessageContent`], never as an error.
//!
//! ## Structure
//!
//! - [`ChannelClient`]: public lifecycle, send, observers
//! - `session`: the task that owns one connection's state
//! - [`transport`]: `ws://`/`wss://`, `tcp://` line-framed and in-process relays
//! - [`frame`]: JSON wire format

pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod observers;
mod session;
pub mod transport;

pub use client::ChannelClient;
pub use error::{ChannelError, ChannelResult, ProtocolError, TransportError, TransportResult};
pub use frame::{announcement_payload, Frame, KeyAnnouncement, PublishFrame};
pub use message::{ChatMessage, ConnectionState, MessageContent};
pub use session::{PeerKeyEntry, MAX_KNOWN_PEERS, SECRET_CACHE_CAPACITY};
pub use transport::{
    connector_for, Connector, FrameSink, MemoryRelay, TcpConnector, TransportEvent, TransportLink, WebSocketConnector,
};
