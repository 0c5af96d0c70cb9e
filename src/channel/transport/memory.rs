// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process relay.
//!
//! Every frame a link sends is forwarded to every other open link, in send
//! order. The sender does not receive its own frames. Fault switches let
//! tests drive refusal, stalls, send failures and relay shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::{Connector, FrameSink, TransportEvent, TransportLink, EVENT_BUFFER};
use crate::channel::error::{TransportError, TransportResult};

#[derive(Default)]
struct RelayState {
    next_id: u64,
    endpoints: HashMap<u64, mpsc::Sender<TransportEvent>>,
    relayed: Vec<String>,
    refuse_connections: bool,
    stall_opens: bool,
    fail_sends: bool,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of open links.
    pub fn endpoint_count(&self) -> usize {
        self.state().endpoints.len()
    }

    /// Every frame sent through the relay so far, in order.
    pub fn relayed_frames(&self) -> Vec<String> {
        self.state().relayed.clone()
    }

    /// Deliver a raw frame to every open link, as if from a peer outside
    /// this process.
    pub fn inject(&self, frame: impl Into<String>) {
        let frame = frame.into();
        let state = self.state();
        for tx in state.endpoints.values() {
            if tx.try_send(TransportEvent::Frame(frame.clone())).is_err() {
                warn!("Memory relay dropped injected frame for a full or closed link");
            }
        }
    }

    /// Close every link from the relay side.
    pub fn close_all(&self) {
        let endpoints: Vec<_> = self.state().endpoints.drain().collect();
        for (_, tx) in endpoints {
            let _ = tx.try_send(TransportEvent::Closed);
        }
    }

    /// Fail every link from the relay side.
    pub fn fail_all(&self, reason: &str) {
        let endpoints: Vec<_> = self.state().endpoints.drain().collect();
        for (_, tx) in endpoints {
            let _ = tx.try_send(TransportEvent::Error(reason.to_string()));
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Make `open` never complete.
    pub fn stall_opens(&self, stall: bool) {
        self.state().stall_opens = stall;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    fn unregister(&self, id: u64) {
        if self.state().endpoints.remove(&id).is_some() {
            debug!(endpoint = id, "Memory relay link closed");
        }
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryRelay {
    async fn open(&self, url: &Url) -> TransportResult<TransportLink> {
        let (refuse, stall) = {
            let state = self.state();
            (state.refuse_connections, state.stall_opens)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if refuse {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let id = {
            let mut state = self.state();
            let id = state.next_id;
            state.next_id += 1;
            state.endpoints.insert(id, tx);
            id
        };
        debug!(endpoint = id, relay = %url, "Memory relay link opened");

        Ok(TransportLink {
            sink: Box::new(MemorySink {
                id,
                relay: self.clone(),
                closed: false,
            }),
            events: rx,
        })
    }
}

struct MemorySink {
    id: u64,
    relay: MemoryRelay,
    closed: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut state = self.relay.state();
        if state.fail_sends {
            return Err(TransportError::Send("relay rejected frame".to_string()));
        }
        if !state.endpoints.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        for (id, tx) in state.endpoints.iter() {
            if *id == self.id {
                continue;
            }
            if tx.try_send(TransportEvent::Frame(frame.clone())).is_err() {
                warn!(endpoint = id, "Memory relay dropped frame for a full or closed link");
            }
        }
        state.relayed.push(frame);
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        if !self.closed {
            self.closed = true;
            self.relay.unregister(self.id);
        }
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        if !self.closed {
            self.relay.unregister(self.id);
        }
    }
}
