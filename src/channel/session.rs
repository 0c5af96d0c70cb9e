// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-connection protocol task.
//!
//! One [`SessionTask`] owns everything a live connection needs: the
//! transport link, this session's X25519 key, the peer-key table and the
//! shared-secret cache. It consumes transport events and client commands
//! from a single `select!` loop, so session state is never mutated
//! concurrently. Dropping the task drops the peer table.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{ChannelResult, ProtocolError};
use super::frame::{Frame, KeyAnnouncement, PublishFrame};
use super::message::{ChatMessage, ConnectionState, MessageContent, UNKNOWN_SENDER};
use super::observers::Observers;
use super::transport::{FrameSink, TransportEvent, TransportLink};
use crate::config::{ClientConfig, RecipientPolicy};
use crate::engine::{
    EngineResult, KeyEngine, MessageSignature, Mnemonic, SharedSecret, SignRequest, X25519Key, P2P_ACCOUNT,
    P2P_INDEX,
};

/// Shared secrets kept per session.
pub const SECRET_CACHE_CAPACITY: usize = 64;

/// Peers a session will learn keys for. Announcements from further new
/// peer ids are dropped and not answered.
pub const MAX_KNOWN_PEERS: usize = 256;

/// A remote peer's announced key-exchange key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerKeyEntry {
    pub peer_id: String,
    pub x25519_public_key: String,
    /// Wallet address that signed the peer's first accepted announcement.
    /// Later announcements and signed messages for this peer id must come
    /// from the same address.
    pub blockchain_address: String,
}

// =============================================================================
// State shared with the client
// =============================================================================

/// Connection state, observers, and the notification gate.
///
/// `current` holds the token of the live connection attempt. Every
/// notification checks that token while holding the lock, and
/// `disconnect` cancels it under the same lock, so nothing is delivered
/// once `disconnect` has cancelled.
pub(crate) struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) observers: Observers,
    current: Mutex<Option<CancellationToken>>,
    own_public_key: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            state_tx,
            observers: Observers::default(),
            current: Mutex::new(None),
            own_public_key: Mutex::new(None),
        }
    }

    pub(crate) fn current(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Set the state without notifying. Returns the previous state.
    pub(crate) fn replace_state(&self, state: ConnectionState) -> ConnectionState {
        self.state_tx.send_replace(state)
    }

    /// Set `state` and notify observers, unless `token` was cancelled.
    pub(crate) fn publish_state(&self, token: &CancellationToken, state: ConnectionState) -> bool {
        let _gate = self.current();
        if token.is_cancelled() {
            return false;
        }
        self.state_tx.send_replace(state);
        if state.is_observable() {
            self.observers.notify_connection(state);
        }
        true
    }

    pub(crate) fn deliver(&self, token: &CancellationToken, message: &ChatMessage) -> bool {
        let _gate = self.current();
        if token.is_cancelled() {
            return false;
        }
        self.observers.notify_message(message);
        true
    }

    pub(crate) fn own_public_key(&self) -> Option<String> {
        self.own_public_key.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_own_public_key(&self, key: Option<String>) {
        *self.own_public_key.lock().unwrap_or_else(PoisonError::into_inner) = key;
    }

    /// Clear the own key for a session that ended by itself. A cancelled
    /// session's key was already cleared by whoever cancelled it.
    fn release_own_key(&self, token: &CancellationToken) {
        let _gate = self.current();
        if !token.is_cancelled() {
            self.set_own_public_key(None);
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

pub(crate) enum Command {
    Send {
        content: String,
        mnemonic: Option<Mnemonic>,
        reply: oneshot::Sender<bool>,
    },
    KnownPeers {
        reply: oneshot::Sender<Vec<PeerKeyEntry>>,
    },
}

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(String),
}

// =============================================================================
// Session task
// =============================================================================

pub(crate) struct SessionInit {
    pub config: Arc<ClientConfig>,
    pub engine: Arc<dyn KeyEngine>,
    pub shared: Arc<Shared>,
    pub encryption: Arc<AtomicBool>,
    pub token: CancellationToken,
    pub link: TransportLink,
    pub commands: mpsc::Receiver<Command>,
    pub mnemonic: Option<Mnemonic>,
    pub own_key: Option<X25519Key>,
    /// Serialized key announcement, repeated whenever a new peer appears.
    pub announcement: Option<String>,
}

pub(crate) struct SessionTask {
    config: Arc<ClientConfig>,
    engine: Arc<dyn KeyEngine>,
    shared: Arc<Shared>,
    encryption: Arc<AtomicBool>,
    token: CancellationToken,
    sink: Box<dyn FrameSink>,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    mnemonic: Option<Mnemonic>,
    own_key: Option<X25519Key>,
    announcement: Option<String>,
    /// Insertion-ordered, at most [`MAX_KNOWN_PEERS`]; a re-announcement
    /// keeps the peer's position.
    peers: Vec<PeerKeyEntry>,
    /// Keyed by the peer's public key.
    secrets: LruCache<String, SharedSecret>,
}

impl SessionTask {
    pub(crate) fn new(init: SessionInit) -> Self {
        Self {
            config: init.config,
            engine: init.engine,
            shared: init.shared,
            encryption: init.encryption,
            token: init.token,
            sink: init.link.sink,
            events: init.link.events,
            commands: init.commands,
            mnemonic: init.mnemonic,
            own_key: init.own_key,
            announcement: init.announcement,
            peers: Vec::new(),
            secrets: LruCache::new(NonZeroUsize::new(SECRET_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Run until cancelled or the link ends.
    pub(crate) async fn run(mut self) {
        info!(
            channel = %self.config.channel,
            peer_id = %self.config.peer_info.peer_id,
            encryption_ready = self.own_key.is_some(),
            "Channel session started"
        );

        let end = loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break SessionEnd::Cancelled,
                command = self.commands.recv() => match command {
                    Some(Command::Send { content, mnemonic, reply }) => {
                        match self.handle_send(&content, mnemonic).await {
                            Ok(sent) => {
                                let _ = reply.send(sent);
                            }
                            Err(end) => {
                                self.conclude(end).await;
                                let _ = reply.send(false);
                                return;
                            }
                        }
                    }
                    Some(Command::KnownPeers { reply }) => {
                        let _ = reply.send(self.peers.clone());
                    }
                    None => break SessionEnd::Cancelled,
                },
                event = self.events.recv() => match event {
                    Some(TransportEvent::Frame(raw)) => {
                        if self.handle_frame(&raw) {
                            if let Err(end) = self.reannounce().await {
                                break end;
                            }
                        }
                    }
                    Some(TransportEvent::Closed) | None => break SessionEnd::Closed,
                    Some(TransportEvent::Error(reason)) => break SessionEnd::Failed(reason),
                },
            }
        };

        self.conclude(end).await;
    }

    async fn conclude(&mut self, end: SessionEnd) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Transport close failed");
        }
        self.shared.release_own_key(&self.token);

        match end {
            SessionEnd::Cancelled => debug!(channel = %self.config.channel, "Channel session cancelled"),
            SessionEnd::Closed => {
                info!(channel = %self.config.channel, "Relay closed the connection");
                self.shared.publish_state(&self.token, ConnectionState::Disconnected);
            }
            SessionEnd::Failed(reason) => {
                warn!(channel = %self.config.channel, %reason, "Channel session failed");
                self.shared.publish_state(&self.token, ConnectionState::Error);
            }
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// `Ok(false)` when nothing could be sent; `Err` when the link failed.
    async fn handle_send(&mut self, content: &str, mnemonic: Option<Mnemonic>) -> Result<bool, SessionEnd> {
        let Some(mnemonic) = mnemonic.or_else(|| self.mnemonic.clone()) else {
            warn!("No mnemonic available for message signing");
            return Ok(false);
        };

        let frames = match self.build_frames(content, &mnemonic) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Failed to build outbound message");
                return Ok(false);
            }
        };

        for json in frames {
            match tokio::time::timeout(self.config.operation_timeout, self.sink.send(json)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SessionEnd::Failed(format!("send failed: {e}"))),
                Err(_) => return Err(SessionEnd::Failed("send timed out".to_string())),
            }
        }
        Ok(true)
    }

    /// Serialized frames for one outbound message.
    fn build_frames(&mut self, content: &str, mnemonic: &Mnemonic) -> ChannelResult<Vec<String>> {
        let encryption_on = self.encryption.load(Ordering::SeqCst);
        if encryption_on && self.own_key.is_some() {
            if self.peers.is_empty() {
                warn!(channel = %self.config.channel, "No peers with known encryption keys; sending plaintext");
            } else {
                match self.encrypted_frames(content, mnemonic) {
                    Ok(frames) => return Ok(frames),
                    Err(e) => warn!(error = %e, "Encryption failed; falling back to plaintext"),
                }
            }
        } else if encryption_on {
            warn!(channel = %self.config.channel, "Encryption not initialized for this session; sending plaintext");
        } else {
            debug!("Encryption disabled; sending plaintext");
        }

        let signature = self.sign(mnemonic, content)?;
        let frame = Frame::Publish(PublishFrame {
            topic: self.config.channel.clone(),
            data: Some(content.to_string()),
            signature: Some(signature),
            sender: Some(self.config.peer_info.peer_id.clone()),
            timestamp: Some(now_millis()),
            ..Default::default()
        });
        Ok(vec![frame.to_json()?])
    }

    fn encrypted_frames(&mut self, content: &str, mnemonic: &Mnemonic) -> ChannelResult<Vec<String>> {
        let targets: Vec<PeerKeyEntry> = match self.config.recipient_policy {
            RecipientPolicy::FirstKnownPeer => self.peers.iter().take(1).cloned().collect(),
            RecipientPolicy::FanOut => self.peers.clone(),
        };
        let cacheable = self.mnemonic.as_ref() == Some(mnemonic);

        let mut frames = Vec::with_capacity(targets.len());
        for peer in &targets {
            let sealed = if cacheable {
                let secret = cached_secret(&mut self.secrets, self.engine.as_ref(), mnemonic, &peer.x25519_public_key)?;
                self.engine.aead_encrypt(content, secret, &self.config.channel)?
            } else {
                let secret = self
                    .engine
                    .ecdh_shared_secret(mnemonic, P2P_ACCOUNT, P2P_INDEX, &peer.x25519_public_key)?;
                self.engine.aead_encrypt(content, &secret, &self.config.channel)?
            };
            let signature = self.sign(mnemonic, &sealed.ciphertext)?;

            let recipient = match self.config.recipient_policy {
                RecipientPolicy::FanOut => Some(peer.peer_id.clone()),
                RecipientPolicy::FirstKnownPeer => None,
            };
            debug!(recipient = %peer.peer_id, "Encrypted outbound message");
            let frame = Frame::Publish(PublishFrame {
                topic: self.config.channel.clone(),
                encrypted: true,
                ciphertext: Some(sealed.ciphertext),
                nonce: Some(sealed.nonce),
                signature: Some(signature),
                sender: Some(self.config.peer_info.peer_id.clone()),
                recipient,
                timestamp: Some(now_millis()),
                data: None,
            });
            frames.push(frame.to_json()?);
        }
        Ok(frames)
    }

    /// Repeat our key announcement so a peer that joined after us learns it.
    async fn reannounce(&mut self) -> Result<(), SessionEnd> {
        let Some(announcement) = self.announcement.clone() else {
            return Ok(());
        };
        match tokio::time::timeout(self.config.operation_timeout, self.sink.send(announcement)).await {
            Ok(Ok(())) => {
                debug!("Re-announced encryption key");
                Ok(())
            }
            Ok(Err(e)) => Err(SessionEnd::Failed(format!("key announcement failed: {e}"))),
            Err(_) => Err(SessionEnd::Failed("key announcement timed out".to_string())),
        }
    }

    fn sign(&self, mnemonic: &Mnemonic, payload: &str) -> EngineResult<MessageSignature> {
        self.engine.sign(
            mnemonic,
            P2P_ACCOUNT,
            P2P_INDEX,
            SignRequest {
                domain: &self.config.signing_domain,
                address: &self.config.peer_info.blockchain_address,
                origin: &self.config.signing_origin,
                payload: Some(payload),
            },
        )
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Returns `true` when the frame introduced a peer we did not know.
    fn handle_frame(&mut self, raw: &str) -> bool {
        match Frame::from_json(raw) {
            Ok(Frame::KeyAnnouncement(announcement)) => return self.handle_announcement(announcement),
            Ok(Frame::Publish(frame)) => self.handle_publish(frame),
            Ok(Frame::Unknown) => debug!("Ignoring frame of unknown type"),
            Err(e) => {
                let error = ProtocolError::Malformed(e.to_string());
                warn!(%error, "Dropping inbound frame");
            }
        }
        false
    }

    fn handle_announcement(&mut self, announcement: KeyAnnouncement) -> bool {
        if let Some(topic) = &announcement.topic {
            if *topic != self.config.channel {
                let error = ProtocolError::WrongTopic {
                    expected: self.config.channel.clone(),
                    got: topic.clone(),
                };
                debug!(%error, "Dropping key announcement");
                return false;
            }
        }
        if announcement.sender == self.config.peer_info.peer_id {
            debug!("Ignoring our own key announcement");
            return false;
        }
        if crate::engine::decode_hex_array::<32>(&announcement.data).is_none() {
            let error = ProtocolError::Malformed("announced key is not 32 hex-encoded bytes".to_string());
            warn!(sender = %announcement.sender, %error, "Dropping key announcement");
            return false;
        }
        if !self.signature_valid(&announcement.signature, &announcement.signed_payload()) {
            let error = ProtocolError::BadSignature {
                sender: announcement.sender.clone(),
            };
            warn!(%error, "Dropping key announcement");
            return false;
        }

        let signer = announcement.signature.address;
        let table_full = self.peers.len() >= MAX_KNOWN_PEERS;
        let is_new = match self.peers.iter_mut().find(|p| p.peer_id == announcement.sender) {
            Some(entry) if !entry.blockchain_address.eq_ignore_ascii_case(&signer) => {
                let error = ProtocolError::BadSignature {
                    sender: announcement.sender.clone(),
                };
                warn!(
                    %error,
                    pinned = %entry.blockchain_address,
                    %signer,
                    "Dropping key announcement from a different wallet"
                );
                return false;
            }
            Some(entry) => {
                entry.x25519_public_key = announcement.data;
                false
            }
            None if table_full => {
                warn!(
                    peer_id = %announcement.sender,
                    limit = MAX_KNOWN_PEERS,
                    "Peer table full; dropping key announcement"
                );
                return false;
            }
            None => {
                self.peers.push(PeerKeyEntry {
                    peer_id: announcement.sender.clone(),
                    x25519_public_key: announcement.data,
                    blockchain_address: signer,
                });
                true
            }
        };
        info!(peer_id = %announcement.sender, known_peers = self.peers.len(), "Learned peer encryption key");
        is_new
    }

    fn handle_publish(&mut self, frame: PublishFrame) {
        if frame.topic != self.config.channel {
            let error = ProtocolError::WrongTopic {
                expected: self.config.channel.clone(),
                got: frame.topic.clone(),
            };
            debug!(%error, "Dropping publish frame");
            return;
        }
        let own_id = &self.config.peer_info.peer_id;
        if frame.sender.as_deref() == Some(own_id.as_str()) {
            debug!("Ignoring echo of our own frame");
            return;
        }
        if let Some(recipient) = &frame.recipient {
            if recipient != own_id {
                let error = ProtocolError::NotForUs {
                    recipient: recipient.clone(),
                };
                debug!(%error, "Dropping publish frame");
                return;
            }
        }

        let sender = frame.sender.clone().unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let verified = match (&frame.signature, frame.signed_payload()) {
            (Some(signature), Some(payload)) => {
                self.signer_pinned_to(&sender, signature) && self.signature_valid(signature, payload)
            }
            _ => false,
        };

        let content = if frame.encrypted {
            self.open_encrypted(&frame, &sender)
        } else {
            match &frame.data {
                Some(text) => MessageContent::Text(text.clone()),
                None => {
                    warn!(error = %ProtocolError::MissingField("data"), %sender, "Dropping publish frame");
                    return;
                }
            }
        };

        let message = ChatMessage {
            topic: frame.topic,
            sender,
            content,
            timestamp: frame.timestamp.unwrap_or_else(now_millis),
            encrypted: frame.encrypted,
            verified,
        };
        self.shared.deliver(&self.token, &message);
    }

    fn open_encrypted(&mut self, frame: &PublishFrame, sender: &str) -> MessageContent {
        let mnemonic = match (&self.mnemonic, &self.own_key) {
            (Some(mnemonic), Some(_)) if self.encryption.load(Ordering::SeqCst) => mnemonic.clone(),
            _ => {
                warn!(%sender, "Cannot decrypt message: encryption not initialized");
                return MessageContent::EncryptionNotInitialized;
            }
        };
        let Some(peer_key) = self
            .peers
            .iter()
            .find(|p| p.peer_id == sender)
            .map(|p| p.x25519_public_key.clone())
        else {
            warn!(%sender, "Cannot decrypt message: no public key for sender");
            return MessageContent::SenderKeyUnknown;
        };
        let (Some(ciphertext), Some(nonce)) = (frame.ciphertext.as_deref(), frame.nonce.as_deref()) else {
            warn!(%sender, error = %ProtocolError::MissingField("ciphertext"), "Cannot decrypt message");
            return MessageContent::DecryptionFailed;
        };

        let opened = cached_secret(&mut self.secrets, self.engine.as_ref(), &mnemonic, &peer_key)
            .and_then(|secret| self.engine.aead_decrypt(ciphertext, nonce, secret, &self.config.channel));
        match opened {
            Ok(text) => {
                debug!(%sender, "Decrypted inbound message");
                MessageContent::Text(text)
            }
            Err(e) => {
                warn!(%sender, error = %e, "Failed to decrypt message");
                MessageContent::DecryptionFailed
            }
        }
    }

    /// False when `sender` has announced a key from a different wallet.
    fn signer_pinned_to(&self, sender: &str, signature: &MessageSignature) -> bool {
        self.peers
            .iter()
            .find(|p| p.peer_id == sender)
            .is_none_or(|p| p.blockchain_address.eq_ignore_ascii_case(&signature.address))
    }

    /// Signature is over `payload`, verifies, and is bound to our domain and origin.
    fn signature_valid(&self, signature: &MessageSignature, payload: &str) -> bool {
        if signature.domain != self.config.signing_domain || signature.origin != self.config.signing_origin {
            return false;
        }
        match self.engine.verify(signature, Some(payload)) {
            Ok(valid) => valid,
            Err(e) => {
                debug!(error = %e, "Unverifiable signature");
                false
            }
        }
    }
}

fn cached_secret<'a>(
    secrets: &'a mut LruCache<String, SharedSecret>,
    engine: &dyn KeyEngine,
    mnemonic: &Mnemonic,
    peer_key: &str,
) -> EngineResult<&'a SharedSecret> {
    secrets.try_get_or_insert(peer_key.to_string(), || {
        engine.ecdh_shared_secret(mnemonic, P2P_ACCOUNT, P2P_INDEX, peer_key)
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
