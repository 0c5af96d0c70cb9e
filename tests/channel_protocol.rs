// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Channel clients talking through an in-process relay.

use std::sync::Arc;
use std::time::Duration;

use heartearth_core::channel::{
    announcement_payload, ChannelClient, ChatMessage, ConnectionState, Frame, KeyAnnouncement, MemoryRelay,
    MessageContent, PublishFrame, MAX_KNOWN_PEERS,
};
use heartearth_core::config::{
    ClientConfig, PeerInfo, RecipientPolicy, DEFAULT_SIGNING_DOMAIN, DEFAULT_SIGNING_ORIGIN,
};
use heartearth_core::engine::{
    EngineHandle, KeyEngine, LocalKeyEngine, MessageSignature, Mnemonic, SignRequest, WalletAccount, P2P_ACCOUNT,
    P2P_INDEX,
};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use url::Url;

const CHANNEL: &str = "/art/test/general/v1";
const ALICE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const BOB: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";
const CAROL: &str = "letter advice cage absurd amount doctor acoustic avoid letter advice cage above";

struct Peer {
    client: ChannelClient,
    mnemonic: Mnemonic,
    account: WalletAccount,
    engine: Arc<LocalKeyEngine>,
    inbox: UnboundedReceiver<ChatMessage>,
    states: UnboundedReceiver<ConnectionState>,
}

impl Peer {
    async fn connect(&self) -> ConnectionState {
        self.client.connect(Some(self.mnemonic.clone())).await
    }
}

fn peer_with(relay: &MemoryRelay, phrase: &str, configure: impl FnOnce(&mut ClientConfig)) -> Peer {
    let engine = Arc::new(LocalKeyEngine::new().unwrap());
    let mnemonic = Mnemonic::new(phrase);
    let account = engine.derive_account(&mnemonic, 0, 0).unwrap();

    let mut config = ClientConfig::new(Url::parse("memory://test").unwrap(), CHANNEL, PeerInfo::from(&account));
    config.operation_timeout = Duration::from_secs(5);
    configure(&mut config);

    let client = ChannelClient::new(
        config,
        EngineHandle::from_engine(Arc::clone(&engine) as Arc<dyn KeyEngine>),
        Arc::new(relay.clone()),
    );

    let (message_tx, inbox) = mpsc::unbounded_channel();
    client.on_message(move |m: &ChatMessage| {
        let _ = message_tx.send(m.clone());
    });
    let (state_tx, states) = mpsc::unbounded_channel();
    client.on_connection_change(move |s: ConnectionState| {
        let _ = state_tx.send(s);
    });

    Peer {
        client,
        mnemonic,
        account,
        engine,
        inbox,
        states,
    }
}

fn peer(relay: &MemoryRelay, phrase: &str) -> Peer {
    peer_with(relay, phrase, |_| {})
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

async fn assert_silent<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Ok(unexpected) = rx.try_recv() {
        panic!("unexpected notification: {unexpected:?}");
    }
}

async fn wait_for_peers(client: &ChannelClient, count: usize) {
    for _ in 0..500 {
        if client.known_peers().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} known peers");
}

fn publish_frames(relay: &MemoryRelay) -> Vec<PublishFrame> {
    relay
        .relayed_frames()
        .iter()
        .filter_map(|raw| match Frame::from_json(raw) {
            Ok(Frame::Publish(frame)) => Some(frame),
            _ => None,
        })
        .collect()
}

fn announcements_from(relay: &MemoryRelay, sender: &str) -> Vec<KeyAnnouncement> {
    relay
        .relayed_frames()
        .iter()
        .filter_map(|raw| match Frame::from_json(raw) {
            Ok(Frame::KeyAnnouncement(a)) if a.sender == sender => Some(a),
            _ => None,
        })
        .collect()
}

fn sign_as(signer: &Peer, payload: &str) -> MessageSignature {
    signer
        .engine
        .sign(
            &signer.mnemonic,
            P2P_ACCOUNT,
            P2P_INDEX,
            SignRequest {
                domain: DEFAULT_SIGNING_DOMAIN,
                address: &signer.account.blockchain_address,
                origin: DEFAULT_SIGNING_ORIGIN,
                payload: Some(payload),
            },
        )
        .unwrap()
}

/// A key announcement claiming `sender`, signed with `signer`'s wallet.
fn announcement_signed_by(signer: &Peer, sender: &str, public_key: &str) -> String {
    Frame::KeyAnnouncement(KeyAnnouncement {
        data: public_key.to_string(),
        signature: sign_as(signer, &announcement_payload(sender, public_key)),
        sender: sender.to_string(),
        topic: None,
    })
    .to_json()
    .unwrap()
}

fn x25519_key(peer: &Peer) -> String {
    peer.engine
        .derive_x25519_key(&peer.mnemonic, P2P_ACCOUNT, P2P_INDEX)
        .unwrap()
        .public_key
}

/// Two connected peers that have each learned the other's key.
async fn connected_pair(relay: &MemoryRelay) -> (Peer, Peer) {
    let mut alice = peer(relay, ALICE);
    let mut bob = peer(relay, BOB);
    assert_eq!(alice.connect().await, ConnectionState::Connected);
    assert_eq!(bob.connect().await, ConnectionState::Connected);
    assert_eq!(next(&mut alice.states).await, ConnectionState::Connected);
    assert_eq!(next(&mut bob.states).await, ConnectionState::Connected);
    wait_for_peers(&alice.client, 1).await;
    wait_for_peers(&bob.client, 1).await;
    (alice, bob)
}

#[tokio::test]
async fn announcement_then_encrypted_send() {
    let relay = MemoryRelay::new();
    let (alice, mut bob) = connected_pair(&relay).await;

    let known = alice.client.known_peers().await;
    assert_eq!(known[0].peer_id, bob.account.peer_id);
    assert_eq!(Some(known[0].x25519_public_key.clone()), bob.client.own_public_key());

    assert!(alice.client.send_message("hello bob", None).await);

    let received = next(&mut bob.inbox).await;
    assert_eq!(received.content, MessageContent::Text("hello bob".to_string()));
    assert_eq!(received.sender, alice.account.peer_id);
    assert!(received.encrypted);
    assert!(received.verified);

    let frame = publish_frames(&relay).pop().unwrap();
    assert!(frame.encrypted);
    assert!(frame.data.is_none());
    let alice_key = alice.client.own_public_key().unwrap();
    let secret = bob.engine.ecdh_shared_secret(&bob.mnemonic, 0, 0, &alice_key).unwrap();
    let opened = bob
        .engine
        .aead_decrypt(frame.ciphertext.as_deref().unwrap(), frame.nonce.as_deref().unwrap(), &secret, CHANNEL)
        .unwrap();
    assert_eq!(opened, "hello bob");
}

#[tokio::test]
async fn no_peer_keys_falls_back_to_plaintext() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, ALICE);
    alice.connect().await;
    assert!(alice.client.known_peers().await.is_empty());

    assert!(alice.client.send_message("anyone there?", None).await);

    let frame = publish_frames(&relay).pop().unwrap();
    assert!(!frame.encrypted);
    assert_eq!(frame.data.as_deref(), Some("anyone there?"));
    assert_eq!(frame.topic, CHANNEL);
    assert!(frame.signature.is_some());
}

#[tokio::test]
async fn unknown_sender_gets_placeholder() {
    let relay = MemoryRelay::new();
    let mut bob = peer(&relay, BOB);
    bob.connect().await;

    relay.inject(
        json!({
            "type": "publish",
            "topic": CHANNEL,
            "encrypted": true,
            "ciphertext": "00".repeat(32),
            "nonce": "00".repeat(12),
            "sender": "stranger",
        })
        .to_string(),
    );

    let received = next(&mut bob.inbox).await;
    assert_eq!(received.content, MessageContent::SenderKeyUnknown);
    assert_eq!(received.sender, "stranger");
    assert!(!received.verified);
    assert_silent(&mut bob.inbox).await;
}

#[tokio::test]
async fn tampered_ciphertext_gets_placeholder() {
    let relay = MemoryRelay::new();
    let (mut alice, mut bob) = connected_pair(&relay).await;

    assert!(alice.client.send_message("original", None).await);
    assert_eq!(next(&mut bob.inbox).await.data(), "original");

    let mut frame = publish_frames(&relay).pop().unwrap();
    let mut ciphertext = frame.ciphertext.take().unwrap();
    let flipped = if ciphertext.starts_with('0') { "1" } else { "0" };
    ciphertext.replace_range(0..1, flipped);
    frame.ciphertext = Some(ciphertext);
    relay.inject(Frame::Publish(frame).to_json().unwrap());

    let received = next(&mut bob.inbox).await;
    assert_eq!(received.content, MessageContent::DecryptionFailed);
    assert!(!received.verified);
    assert_silent(&mut bob.inbox).await;
    // Alice drops the echo of her own sender id.
    assert_silent(&mut alice.inbox).await;
}

#[tokio::test]
async fn other_topics_are_ignored() {
    let relay = MemoryRelay::new();
    let mut bob = peer(&relay, BOB);
    bob.connect().await;

    relay.inject(json!({"type": "publish", "topic": "/other", "data": "nope", "sender": "x"}).to_string());
    relay.inject("{not json");
    relay.inject(json!({"type": "peer_list", "peers": []}).to_string());
    relay.inject(json!({"type": "publish", "topic": CHANNEL, "data": "yes", "sender": "x", "timestamp": 42}).to_string());

    let received = next(&mut bob.inbox).await;
    assert_eq!(received.data(), "yes");
    assert_eq!(received.timestamp, 42);
    assert!(!received.encrypted);
    assert!(!received.verified);
    assert_silent(&mut bob.inbox).await;
}

#[tokio::test]
async fn plaintext_between_peers_is_verified() {
    let relay = MemoryRelay::new();
    let alice = peer_with(&relay, ALICE, |c| c.encryption_enabled = false);
    let mut bob = peer(&relay, BOB);
    alice.connect().await;
    bob.connect().await;

    assert!(alice.client.send_message("in the clear", None).await);
    let received = next(&mut bob.inbox).await;
    assert_eq!(received.content, MessageContent::Text("in the clear".to_string()));
    assert!(!received.encrypted);
    assert!(received.verified);
    assert_eq!(received.sender, alice.account.peer_id);
}

#[tokio::test]
async fn disabled_decryption_gets_placeholder() {
    let relay = MemoryRelay::new();
    let (alice, mut bob) = connected_pair(&relay).await;

    bob.client.set_encryption_enabled(false);
    assert!(alice.client.send_message("sealed", None).await);

    let received = next(&mut bob.inbox).await;
    assert_eq!(received.content, MessageContent::EncryptionNotInitialized);
    assert!(received.encrypted);
}

#[tokio::test]
async fn panicking_observer_is_isolated() {
    let relay = MemoryRelay::new();
    let alice = peer_with(&relay, ALICE, |c| c.encryption_enabled = false);
    let mut bob = peer(&relay, BOB);
    bob.client.on_message(|_: &ChatMessage| panic!("observer failure"));
    alice.connect().await;
    bob.connect().await;

    assert!(alice.client.send_message("one", None).await);
    assert!(alice.client.send_message("two", None).await);
    assert_eq!(next(&mut bob.inbox).await.data(), "one");
    assert_eq!(next(&mut bob.inbox).await.data(), "two");
    assert!(bob.client.is_connected());
}

#[tokio::test]
async fn disconnect_clears_session_and_silences_observers() {
    let relay = MemoryRelay::new();
    let (alice, mut bob) = connected_pair(&relay).await;
    assert_eq!(relay.endpoint_count(), 2);

    bob.client.disconnect().await;
    assert_eq!(next(&mut bob.states).await, ConnectionState::Disconnected);
    assert_eq!(bob.client.state(), ConnectionState::Disconnected);
    assert!(bob.client.known_peers().await.is_empty());
    assert!(bob.client.own_public_key().is_none());
    assert_eq!(relay.endpoint_count(), 1);

    assert!(alice.client.send_message("after", None).await);
    relay.inject(json!({"type": "publish", "topic": CHANNEL, "data": "late", "sender": "x"}).to_string());
    assert!(!bob.client.send_message("gone", None).await);

    bob.client.disconnect().await;
    assert_silent(&mut bob.inbox).await;
    assert_silent(&mut bob.states).await;
}

#[tokio::test]
async fn disconnect_during_handshake() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, ALICE);
    relay.stall_opens(true);

    let mut changes = alice.client.state_changes();
    let client = alice.client.clone();
    let mnemonic = alice.mnemonic.clone();
    let connecting = tokio::spawn(async move { client.connect(Some(mnemonic)).await });

    changes.wait_for(|s| *s == ConnectionState::Connecting).await.unwrap();
    alice.client.disconnect().await;

    assert_eq!(connecting.await.unwrap(), ConnectionState::Disconnected);
    assert_eq!(next(&mut alice.states).await, ConnectionState::Disconnected);
    assert_silent(&mut alice.states).await;
    assert_eq!(relay.endpoint_count(), 0);

    relay.stall_opens(false);
    assert_eq!(alice.connect().await, ConnectionState::Connected);
    assert_eq!(next(&mut alice.states).await, ConnectionState::Connected);
}

#[tokio::test]
async fn second_connect_is_a_no_op() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, ALICE);
    assert_eq!(alice.connect().await, ConnectionState::Connected);
    assert_eq!(alice.connect().await, ConnectionState::Connected);
    assert_eq!(relay.endpoint_count(), 1);
    assert_eq!(next(&mut alice.states).await, ConnectionState::Connected);
    assert_silent(&mut alice.states).await;
}

#[tokio::test]
async fn fan_out_reaches_every_known_peer() {
    let relay = MemoryRelay::new();
    let alice = peer_with(&relay, ALICE, |c| c.recipient_policy = RecipientPolicy::FanOut);
    let mut bob = peer(&relay, BOB);
    let mut carol = peer(&relay, CAROL);
    alice.connect().await;
    bob.connect().await;
    carol.connect().await;
    wait_for_peers(&alice.client, 2).await;
    wait_for_peers(&bob.client, 2).await;
    wait_for_peers(&carol.client, 2).await;

    assert!(alice.client.send_message("everyone", None).await);

    for inbox in [&mut bob.inbox, &mut carol.inbox] {
        let received = next(inbox).await;
        assert_eq!(received.content, MessageContent::Text("everyone".to_string()));
        assert!(received.verified);
    }
    assert_silent(&mut bob.inbox).await;
    assert_silent(&mut carol.inbox).await;

    let recipients: Vec<_> = publish_frames(&relay).into_iter().filter_map(|f| f.recipient).collect();
    assert_eq!(recipients.len(), 2);
    assert!(recipients.contains(&bob.account.peer_id));
    assert!(recipients.contains(&carol.account.peer_id));
}

#[tokio::test]
async fn first_known_peer_policy_excludes_later_peers() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, ALICE);
    let mut bob = peer(&relay, BOB);
    let mut carol = peer(&relay, CAROL);
    alice.connect().await;
    bob.connect().await;
    carol.connect().await;
    wait_for_peers(&alice.client, 2).await;
    wait_for_peers(&bob.client, 2).await;
    wait_for_peers(&carol.client, 2).await;

    assert!(alice.client.send_message("only bob", None).await);
    assert_eq!(next(&mut bob.inbox).await.data(), "only bob");
    assert_eq!(next(&mut carol.inbox).await.content, MessageContent::DecryptionFailed);
}

#[tokio::test]
async fn relay_close_reports_disconnected() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, ALICE);
    alice.connect().await;
    assert_eq!(next(&mut alice.states).await, ConnectionState::Connected);

    relay.close_all();
    assert_eq!(next(&mut alice.states).await, ConnectionState::Disconnected);
    assert!(!alice.client.is_connected());
    assert!(alice.client.own_public_key().is_none());
}

#[tokio::test]
async fn relay_failure_reports_error() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, ALICE);
    alice.connect().await;
    assert_eq!(next(&mut alice.states).await, ConnectionState::Connected);

    relay.fail_all("link reset");
    assert_eq!(next(&mut alice.states).await, ConnectionState::Error);
    assert_eq!(alice.client.state(), ConnectionState::Error);

    assert_eq!(alice.connect().await, ConnectionState::Connected);
}

#[tokio::test]
async fn send_failure_returns_false_and_reports_error() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, ALICE);
    alice.connect().await;
    assert_eq!(next(&mut alice.states).await, ConnectionState::Connected);

    relay.fail_sends(true);
    assert!(!alice.client.send_message("lost", None).await);
    assert_eq!(next(&mut alice.states).await, ConnectionState::Error);
    assert!(!alice.client.send_message("still lost", None).await);
}

#[tokio::test]
async fn refused_connection_reports_error() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, ALICE);
    relay.refuse_connections(true);

    assert_eq!(alice.connect().await, ConnectionState::Error);
    assert_eq!(next(&mut alice.states).await, ConnectionState::Error);
    assert!(!alice.client.send_message("nope", None).await);
}

#[tokio::test]
async fn session_without_mnemonic_needs_one_per_send() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, ALICE);
    let mut bob = peer(&relay, BOB);
    assert_eq!(alice.client.connect(None).await, ConnectionState::Connected);
    bob.connect().await;
    assert!(alice.client.own_public_key().is_none());

    assert!(!alice.client.send_message("unsigned", None).await);
    assert!(alice.client.send_message("signed", Some(&alice.mnemonic)).await);

    // Without its own key the session can only send plaintext.
    let received = next(&mut bob.inbox).await;
    assert_eq!(received.content, MessageContent::Text("signed".to_string()));
    assert!(!received.encrypted);
    assert!(received.verified);
}

#[tokio::test]
async fn announcement_for_known_peer_from_other_wallet_is_rejected() {
    let relay = MemoryRelay::new();
    let (mut alice, mut bob) = connected_pair(&relay).await;
    let mallory = peer(&relay, CAROL);
    let bob_key = bob.client.own_public_key().unwrap();

    // Mallory's own wallet claiming Bob's peer id.
    relay.inject(announcement_signed_by(&mallory, &bob.account.peer_id, &x25519_key(&mallory)));
    // Bob's genuine announcement replayed under another peer id.
    let genuine = announcements_from(&relay, &bob.account.peer_id).remove(0);
    let replayed = KeyAnnouncement {
        sender: "mallory".to_string(),
        ..genuine
    };
    relay.inject(Frame::KeyAnnouncement(replayed).to_json().unwrap());
    // A message claiming Bob's id, signed by Mallory.
    relay.inject(
        Frame::Publish(PublishFrame {
            topic: CHANNEL.to_string(),
            data: Some("from bob, honest".to_string()),
            signature: Some(sign_as(&mallory, "from bob, honest")),
            sender: Some(bob.account.peer_id.clone()),
            ..Default::default()
        })
        .to_json()
        .unwrap(),
    );

    let impersonated = next(&mut alice.inbox).await;
    assert_eq!(impersonated.data(), "from bob, honest");
    assert!(!impersonated.verified);

    let known = alice.client.known_peers().await;
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].peer_id, bob.account.peer_id);
    assert_eq!(known[0].x25519_public_key, bob_key);
    assert!(known[0].blockchain_address.eq_ignore_ascii_case(&bob.account.blockchain_address));

    assert!(alice.client.send_message("secret for bob", None).await);
    let received = next(&mut bob.inbox).await;
    assert_eq!(received.content, MessageContent::Text("secret for bob".to_string()));
    assert!(received.verified);
}

#[tokio::test]
async fn peer_table_is_bounded() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, ALICE);
    alice.connect().await;
    let mallory = peer(&relay, CAROL);
    let key = x25519_key(&mallory);

    for i in 0..=MAX_KNOWN_PEERS {
        relay.inject(announcement_signed_by(&mallory, &format!("peer-{i}"), &key));
    }
    wait_for_peers(&alice.client, MAX_KNOWN_PEERS).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let known = alice.client.known_peers().await;
    assert_eq!(known.len(), MAX_KNOWN_PEERS);
    assert_eq!(known[0].peer_id, "peer-0");
    let overflow = format!("peer-{MAX_KNOWN_PEERS}");
    assert!(known.iter().all(|p| p.peer_id != overflow));

    // The initial announcement plus one answer per accepted peer.
    assert_eq!(announcements_from(&relay, &alice.account.peer_id).len(), 1 + MAX_KNOWN_PEERS);
}
