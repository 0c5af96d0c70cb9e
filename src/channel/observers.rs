// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Observer registry with isolated delivery.
//!
//! A panicking handler is logged and skipped; the remaining handlers still
//! run and protocol state is unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

use super::message::{ChatMessage, ConnectionState};

pub type MessageHandler = Arc<dyn Fn(&ChatMessage) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
pub struct Observers {
    messages: RwLock<Vec<MessageHandler>>,
    connection: RwLock<Vec<ConnectionHandler>>,
}

impl Observers {
    pub fn add_message_handler(&self, handler: MessageHandler) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn add_connection_handler(&self, handler: ConnectionHandler) {
        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Invoke every message handler. Returns how many completed.
    pub fn notify_message(&self, message: &ChatMessage) -> usize {
        // Snapshot so a handler may register further handlers.
        let handlers = self.messages.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut delivered = 0;
        for (idx, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(handler = idx, sender = %message.sender, "Message handler panicked"),
            }
        }
        delivered
    }

    pub fn notify_connection(&self, state: ConnectionState) -> usize {
        let handlers = self.connection.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut delivered = 0;
        for (idx, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(state))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(handler = idx, %state, "Connection handler panicked"),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages = self.messages.read().map(|h| h.len()).unwrap_or(0);
        let connection = self.connection.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Observers")
            .field("message_handlers", &messages)
            .field("connection_handlers", &connection)
            .finish()
    }
}
