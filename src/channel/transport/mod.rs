// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Duplex transport capability.
//!
//! A [`Connector`] opens a [`TransportLink`]: a sink for outbound frames and
//! an ordered stream of [`TransportEvent`]s. The session task is the only
//! consumer of that stream.

mod memory;
mod tcp;
mod websocket;

pub use memory::MemoryRelay;
pub use tcp::TcpConnector;
pub use websocket::WebSocketConnector;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use super::error::{TransportError, TransportResult};

/// Buffered inbound events per link.
pub const EVENT_BUFFER: usize = 1024;

/// Largest accepted inbound frame. Longer lines or messages are discarded
/// without being buffered whole.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame, exactly as received.
    Frame(String),
    /// The relay closed the link.
    Closed,
    /// The link failed.
    Error(String),
}

/// Outbound half of a link.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> TransportResult<()>;

    /// Release the link. Safe to call more than once.
    async fn close(&mut self) -> TransportResult<()>;
}

pub struct TransportLink {
    pub sink: Box<dyn FrameSink>,
    /// `None` from `recv` means the link is gone.
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> TransportResult<TransportLink>;
}

/// Connector for a `ws://`, `wss://` or `tcp://` relay URL.
///
/// `memory://` relays live in-process and must be passed explicitly.
pub fn connector_for(url: &Url) -> TransportResult<Arc<dyn Connector>> {
    match url.scheme() {
        "ws" | "wss" => Ok(Arc::new(WebSocketConnector::new())),
        "tcp" => Ok(Arc::new(TcpConnector::new())),
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}
