// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! TCP transport: one JSON frame per line.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::{Connector, FrameSink, TransportEvent, TransportLink, EVENT_BUFFER, MAX_FRAME_BYTES};
use crate::channel::error::{ProtocolError, TransportError, TransportResult};

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

fn socket_addr(url: &Url) -> TransportResult<String> {
    if url.scheme() != "tcp" {
        return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
    }
    let host = url.host_str().ok_or_else(|| TransportError::Connect {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = url.port().ok_or_else(|| TransportError::Connect {
        url: url.to_string(),
        reason: "missing port".to_string(),
    })?;
    Ok(format!("{host}:{port}"))
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, url: &Url) -> TransportResult<TransportLink> {
        let addr = socket_addr(url)?;
        let stream = TcpStream::connect(&addr).await.map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;
        debug!(%addr, "TCP relay link opened");

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_frames(BufReader::new(read_half), tx));

        Ok(TransportLink {
            sink: Box::new(TcpSink {
                writer: Some(BufWriter::new(write_half)),
                reader,
            }),
            events: rx,
        })
    }
}

async fn read_frames<R>(mut reader: R, tx: mpsc::Sender<TransportEvent>)
where
    R: AsyncBufRead + Unpin,
{
    // One byte past the limit tells an oversized line from a full one.
    let limit = MAX_FRAME_BYTES as u64 + 1;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut reader).take(limit).read_until(b'\n', &mut line).await;
        let event = match read {
            Ok(0) => TransportEvent::Closed,
            Ok(n) if n as u64 == limit && line.last() != Some(&b'\n') => {
                warn!(limit = MAX_FRAME_BYTES, "Dropping oversized frame");
                match skip_line(&mut reader).await {
                    Ok(true) => continue,
                    Ok(false) => TransportEvent::Closed,
                    Err(e) => TransportEvent::Error(e.to_string()),
                }
            }
            Ok(_) => match std::str::from_utf8(&line) {
                Ok(text) => {
                    let frame = text.trim_end_matches(['\r', '\n']);
                    if frame.is_empty() {
                        continue;
                    }
                    TransportEvent::Frame(frame.to_string())
                }
                Err(e) => {
                    let error = ProtocolError::Malformed(format!("frame is not UTF-8: {e}"));
                    warn!(%error, "Dropping inbound frame");
                    continue;
                }
            },
            Err(e) => TransportEvent::Error(e.to_string()),
        };

        let terminal = !matches!(event, TransportEvent::Frame(_));
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
}

/// Discard input up to and including the next newline without buffering it.
/// `Ok(false)` when the stream ended first.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (consumed, found) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(false);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if found {
            return Ok(true);
        }
    }
}

struct TcpSink {
    writer: Option<BufWriter<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: String) -> TransportResult<()> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        writer.write_all(b"\n").await.map_err(|e| TransportError::Send(e.to_string()))?;
        writer.flush().await.map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.reader.abort();
        if let Some(mut writer) = self.writer.take() {
            // Peer may already be gone.
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "TCP shutdown failed");
            }
        }
        Ok(())
    }
}

impl Drop for TcpSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
