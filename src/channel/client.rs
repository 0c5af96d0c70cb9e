// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Public channel client.
//!
//! [`ChannelClient`] drives the connection lifecycle and hands work to the
//! session task spawned for each connection. Errors never escape the
//! public surface: connect reports a [`ConnectionState`], send reports a
//! `bool`, and failures surface to connection observers as
//! [`ConnectionState::Error`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{ChannelError, ChannelResult};
use super::frame::{announcement_payload, Frame, KeyAnnouncement};
use super::message::{ChatMessage, ConnectionState};
use super::session::{Command, PeerKeyEntry, SessionInit, SessionTask, Shared};
use super::transport::{connector_for, Connector, TransportLink};
use crate::config::ClientConfig;
use crate::engine::{
    EngineHandle, KeyEngine, Mnemonic, SignRequest, X25519Key, P2P_ACCOUNT, P2P_INDEX,
};

/// Queued client commands per session.
const COMMAND_BUFFER: usize = 64;

struct ActiveSession {
    commands: mpsc::Sender<Command>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Established {
    engine: Arc<dyn KeyEngine>,
    link: TransportLink,
    own_key: Option<X25519Key>,
    announcement: Option<String>,
}

struct Inner {
    config: Arc<ClientConfig>,
    engine: EngineHandle,
    connector: Arc<dyn Connector>,
    encryption: Arc<AtomicBool>,
    shared: Arc<Shared>,
    session: Mutex<Option<ActiveSession>>,
}

/// Authenticated, optionally encrypted pub/sub client for one channel.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl ChannelClient {
    pub fn new(config: ClientConfig, engine: EngineHandle, connector: Arc<dyn Connector>) -> Self {
        let encryption = Arc::new(AtomicBool::new(config.encryption_enabled));
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                engine,
                connector,
                encryption,
                shared: Arc::new(Shared::new()),
                session: Mutex::new(None),
            }),
        }
    }

    /// Client whose connector is picked from the relay URL scheme.
    pub fn from_config(config: ClientConfig, engine: EngineHandle) -> ChannelResult<Self> {
        let connector = connector_for(&config.relay_url)?;
        Ok(Self::new(config, engine, connector))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the relay link and, given a mnemonic with encryption enabled,
    /// announce this peer's X25519 key.
    ///
    /// Returns the resulting state. A call while already connecting or
    /// connected is a no-op. Without a mnemonic the session can still
    /// receive, but every send must supply one.
    pub async fn connect(&self, mnemonic: Option<Mnemonic>) -> ConnectionState {
        let shared = &self.inner.shared;
        let token = {
            let mut current = shared.current();
            let state = shared.state();
            if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
                warn!(%state, "Connect requested while already active");
                return state;
            }
            if let Some(stale) = current.take() {
                stale.cancel();
            }
            let token = CancellationToken::new();
            *current = Some(token.clone());
            shared.replace_state(ConnectionState::Connecting);
            token
        };

        self.reap_session().await;

        let relay = self.inner.config.relay_url.to_string();
        info!(%relay, channel = %self.inner.config.channel, "Connecting to relay");

        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!(%relay, "Connect abandoned by disconnect");
                return shared.state();
            }
            result = self.handshake(mnemonic.as_ref()) => result,
        };

        match result {
            Ok(established) => self.start_session(token, established, mnemonic).await,
            Err(e) => {
                warn!(%relay, error = %e, "Failed to connect to relay");
                shared.publish_state(&token, ConnectionState::Error);
            }
        }
        shared.state()
    }

    async fn handshake(&self, mnemonic: Option<&Mnemonic>) -> ChannelResult<Established> {
        let config = &self.inner.config;
        let timeout = config.operation_timeout;

        let engine = tokio::time::timeout(timeout, self.inner.engine.get())
            .await
            .map_err(|_| ChannelError::Timeout("engine initialization"))??;

        let mut link = tokio::time::timeout(timeout, self.inner.connector.open(&config.relay_url))
            .await
            .map_err(|_| ChannelError::Timeout("relay connect"))??;

        let plain = |engine: Arc<dyn KeyEngine>, link: TransportLink| Established {
            engine,
            link,
            own_key: None,
            announcement: None,
        };

        let mnemonic = match mnemonic {
            Some(mnemonic) if self.encryption_enabled() => mnemonic.clone(),
            _ => return Ok(plain(engine, link)),
        };

        let (own_key, json) = match self.prepare_announcement(Arc::clone(&engine), mnemonic).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Encryption setup failed; session continues without encryption");
                return Ok(plain(engine, link));
            }
        };
        let sent = tokio::time::timeout(timeout, link.sink.send(json.clone()))
            .await
            .map_err(|_| ChannelError::Timeout("key announcement"))
            .and_then(|sent| sent.map_err(ChannelError::from));
        if let Err(e) = sent {
            if let Err(close_error) = link.sink.close().await {
                debug!(error = %close_error, "Transport close failed");
            }
            return Err(e);
        }
        debug!(public_key = %own_key.public_key, "Announced encryption key");

        Ok(Established {
            engine,
            link,
            own_key: Some(own_key),
            announcement: Some(json),
        })
    }

    /// Derive this peer's X25519 key and sign it together with our peer id,
    /// on the blocking pool. Returns the key and the serialized announcement.
    async fn prepare_announcement(
        &self,
        engine: Arc<dyn KeyEngine>,
        mnemonic: Mnemonic,
    ) -> ChannelResult<(X25519Key, String)> {
        let config = Arc::clone(&self.inner.config);
        let task = tokio::task::spawn_blocking(move || -> ChannelResult<(X25519Key, String)> {
            let key = engine.derive_x25519_key(&mnemonic, P2P_ACCOUNT, P2P_INDEX)?;
            let payload = announcement_payload(&config.peer_info.peer_id, &key.public_key);
            let signature = engine.sign(
                &mnemonic,
                P2P_ACCOUNT,
                P2P_INDEX,
                SignRequest {
                    domain: &config.signing_domain,
                    address: &config.peer_info.blockchain_address,
                    origin: &config.signing_origin,
                    payload: Some(&payload),
                },
            )?;
            let json = Frame::KeyAnnouncement(KeyAnnouncement {
                data: key.public_key.clone(),
                signature,
                sender: config.peer_info.peer_id.clone(),
                topic: None,
            })
            .to_json()?;
            Ok((key, json))
        });

        let joined = tokio::time::timeout(self.inner.config.operation_timeout, task)
            .await
            .map_err(|_| ChannelError::Timeout("key derivation"))?;
        Ok(joined.map_err(|e| ChannelError::Task(e.to_string()))??)
    }

    async fn start_session(&self, token: CancellationToken, established: Established, mnemonic: Option<Mnemonic>) {
        let shared = &self.inner.shared;
        let mut slot = self.inner.session.lock().await;

        let Established {
            engine,
            mut link,
            own_key,
            announcement,
        } = established;
        if token.is_cancelled() {
            if let Err(e) = link.sink.close().await {
                debug!(error = %e, "Transport close failed");
            }
            return;
        }

        shared.set_own_public_key(own_key.as_ref().map(|k| k.public_key.clone()));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let task = SessionTask::new(SessionInit {
            config: Arc::clone(&self.inner.config),
            engine,
            shared: Arc::clone(shared),
            encryption: Arc::clone(&self.inner.encryption),
            token: token.clone(),
            link,
            commands: commands_rx,
            mnemonic,
            own_key,
            announcement,
        });
        *slot = Some(ActiveSession {
            commands: commands_tx,
            token: token.clone(),
            handle: tokio::spawn(task.run()),
        });

        if shared.publish_state(&token, ConnectionState::Connected) {
            info!(
                relay = %self.inner.config.relay_url,
                channel = %self.inner.config.channel,
                "Connected to relay"
            );
        }
    }

    /// Tear down the connection. Idempotent.
    ///
    /// Once this returns no observer fires for the old connection, and the
    /// peer-key table is gone. Observers registered on the client stay.
    pub async fn disconnect(&self) {
        let shared = &self.inner.shared;
        let previous = {
            let mut current = shared.current();
            if let Some(token) = current.take() {
                token.cancel();
            }
            shared.set_own_public_key(None);
            let previous = shared.replace_state(ConnectionState::Disconnected);
            if matches!(previous, ConnectionState::Connecting | ConnectionState::Connected) {
                shared.observers.notify_connection(ConnectionState::Disconnected);
            }
            previous
        };

        self.reap_session().await;
        info!(%previous, "Disconnected from relay");
    }

    /// Wait for the previous session task, if any, to finish.
    async fn reap_session(&self) {
        let session = self.inner.session.lock().await.take();
        if let Some(ActiveSession { commands, token, handle }) = session {
            token.cancel();
            drop(commands);
            if let Err(e) = handle.await {
                warn!(error = %e, "Channel session task failed");
            }
        }
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Publish `content` on the channel. Returns whether a frame was sent.
    ///
    /// Encrypts for known peers when encryption is on, otherwise falls back
    /// to signed plaintext. `mnemonic` overrides the one given at connect.
    pub async fn send_message(&self, content: &str, mnemonic: Option<&Mnemonic>) -> bool {
        if self.state() != ConnectionState::Connected {
            warn!(state = %self.state(), "Cannot send message: not connected");
            return false;
        }
        let Some((commands, token)) = self
            .inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| (s.commands.clone(), s.token.clone()))
        else {
            return false;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Send {
            content: content.to_string(),
            mnemonic: mnemonic.cloned(),
            reply: reply_tx,
        };
        // Outer bound; the session also bounds the transport write.
        let deadline = self.inner.config.operation_timeout * 2;
        let outcome = tokio::time::timeout(deadline, async move {
            commands.send(command).await.ok()?;
            reply_rx.await.ok()
        })
        .await;

        match outcome {
            Ok(Some(sent)) => sent,
            Ok(None) => {
                debug!("Session ended before the message was sent");
                false
            }
            Err(_) => {
                warn!("Send timed out");
                self.inner.shared.publish_state(&token, ConnectionState::Error);
                self.inner.shared.set_own_public_key(None);
                token.cancel();
                false
            }
        }
    }

    /// Peers whose encryption keys this session has learned, in the order
    /// they first announced.
    pub async fn known_peers(&self) -> Vec<PeerKeyEntry> {
        let Some(commands) = self.inner.session.lock().await.as_ref().map(|s| s.commands.clone()) else {
            return Vec::new();
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(Command::KnownPeers { reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.inner.shared.observers.add_message_handler(Arc::new(handler));
    }

    /// Called with `Connected`, `Disconnected` and `Error` transitions.
    pub fn on_connection_change<F>(&self, handler: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.shared.observers.add_connection_handler(Arc::new(handler));
    }

    /// Every state change, including `Connecting`.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.subscribe()
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// This session's announced X25519 public key, if encryption is ready.
    pub fn own_public_key(&self) -> Option<String> {
        self.inner.shared.own_public_key()
    }

    /// Takes effect on the next send or receive.
    pub fn set_encryption_enabled(&self, enabled: bool) {
        self.inner.encryption.store(enabled, Ordering::SeqCst);
        info!(enabled, "Channel encryption toggled");
    }

    pub fn encryption_enabled(&self) -> bool {
        self.inner.encryption.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("relay_url", &self.inner.config.relay_url.as_str())
            .field("channel", &self.inner.config.channel)
            .field("state", &self.state())
            .finish()
    }
}
