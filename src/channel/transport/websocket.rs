// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! WebSocket transport: one JSON frame per text message.
//!
//! `wss://` runs over rustls with the `ring` provider and the webpki root
//! store.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::{Connector, FrameSink, TransportEvent, TransportLink, EVENT_BUFFER, MAX_FRAME_BYTES};
use crate::channel::error::{ProtocolError, TransportError, TransportResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

fn check_scheme(url: &Url) -> TransportResult<()> {
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}

fn install_crypto_provider() {
    // Err only means a provider is already installed for this process.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> TransportResult<TransportLink> {
        check_scheme(url)?;
        if url.scheme() == "wss" {
            install_crypto_provider();
        }

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_FRAME_BYTES);
        config.max_frame_size = Some(MAX_FRAME_BYTES);

        let (stream, _response) = tokio_tungstenite::connect_async_with_config(url.as_str(), Some(config), true)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(%url, "WebSocket relay link opened");

        let (writer, read_half) = stream.split();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_frames(read_half, tx));

        Ok(TransportLink {
            sink: Box::new(WsSink {
                writer: Some(writer),
                reader,
            }),
            events: rx,
        })
    }
}

async fn read_frames<S>(mut stream: S, tx: mpsc::Sender<TransportEvent>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let event = match stream.next().await {
            None | Some(Ok(Message::Close(_))) => TransportEvent::Closed,
            Some(Ok(Message::Text(text))) => TransportEvent::Frame(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => TransportEvent::Frame(text),
                Err(e) => {
                    let error = ProtocolError::Malformed(format!("binary frame is not UTF-8: {e}"));
                    warn!(%error, "Dropping inbound frame");
                    continue;
                }
            },
            // Control frames are answered by tungstenite.
            Some(Ok(_)) => continue,
            Some(Err(e)) => TransportEvent::Error(e.to_string()),
        };

        let terminal = !matches!(event, TransportEvent::Frame(_));
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
}

struct WsSink {
    writer: Option<SplitSink<WsStream, Message>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> TransportResult<()> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        writer
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.reader.abort();
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                debug!(error = %e, "WebSocket close failed");
            }
        }
        Ok(())
    }
}

impl Drop for WsSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn only_websocket_schemes() {
        assert!(check_scheme(&Url::parse("wss://p2p.heartearth.art/ws").unwrap()).is_ok());
        assert!(check_scheme(&Url::parse("ws://127.0.0.1:4001/ws").unwrap()).is_ok());
        assert!(matches!(
            check_scheme(&Url::parse("tcp://127.0.0.1:4001").unwrap()),
            Err(TransportError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn text_message_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = loop {
                if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                    break text;
                }
            };
            ws.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
            ws.send(Message::Text(r#"{"type":"ack"}"#.to_string())).await.unwrap();
            ws.close(None).await.unwrap();
            first
        });

        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let mut link = WebSocketConnector::new().open(&url).await.unwrap();
        link.sink.send(r#"{"type":"publish"}"#.to_string()).await.unwrap();

        assert_eq!(server.await.unwrap(), r#"{"type":"publish"}"#);
        // The non-UTF-8 binary message is dropped.
        assert_eq!(
            link.events.recv().await,
            Some(TransportEvent::Frame(r#"{"type":"ack"}"#.to_string()))
        );
        assert_eq!(link.events.recv().await, Some(TransportEvent::Closed));

        link.sink.close().await.unwrap();
        assert!(matches!(link.sink.send("x".to_string()).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        assert!(matches!(
            WebSocketConnector::new().open(&url).await,
            Err(TransportError::Connect { .. })
        ));
    }
}
