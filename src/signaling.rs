//! Signaling link to the coordinator
//!
//! A persistent, ordered, reliable byte-stream between a peer and the
//! coordinator; the only channel session negotiation flows over. Each
//! WebSocket binary message carries one length-prefixed envelope.
//!
//! If the link drops, every in-flight ICE exchange keyed by it is
//! aborted: the link's cancellation token fires and the owner decides
//! whether to tear down peers still negotiating or exit outright.

use crate::codec::{Codec, Envelope};
use crate::error::{CommError, CommResult};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const MAX_CONNECT_RETRIES: u32 = 10;
const BASE_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Send half of an established signaling session. Incoming envelopes
/// arrive on the receiver returned by [`SignalingLink::connect`];
/// `closed()` fires when the socket is gone in either direction.
pub struct SignalingLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    closed: CancellationToken,
}

impl SignalingLink {
    /// Dial the coordinator with capped exponential backoff. Returns
    /// the link plus the stream of decoded inbound envelopes.
    pub async fn connect(
        url: &str,
        codec: Codec,
    ) -> CommResult<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        Self::connect_with_retries(url, codec, MAX_CONNECT_RETRIES).await
    }

    /// `connect` with an explicit retry budget
    pub async fn connect_with_retries(
        url: &str,
        codec: Codec,
        max_retries: u32,
    ) -> CommResult<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let parsed = Url::parse(url)?;

        let mut retry = 0u32;
        let ws_stream = loop {
            match connect_async(parsed.clone()).await {
                Ok((stream, response)) => {
                    if response.status().as_u16() != 101 {
                        return Err(CommError::Transport(format!(
                            "signaling handshake failed with status {}",
                            response.status()
                        )));
                    }
                    break stream;
                }
                Err(e) => {
                    retry += 1;
                    if retry >= max_retries {
                        return Err(CommError::Transport(format!(
                            "cannot reach coordinator at {}: {}",
                            url, e
                        )));
                    }
                    let wait = BASE_RETRY_WAIT * (1 << retry.min(4));
                    warn!(url, error = %e, retry, "signaling connect failed, retrying");
                    tokio::time::sleep(wait).await;
                }
            }
        };
        info!(url, "signaling link established");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let closed = CancellationToken::new();

        let (mut write, mut read) = ws_stream.split();

        let reader_codec = codec.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Binary(framed)) => {
                        let payload = match reader_codec.deframe(&framed) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "bad signaling frame");
                                continue;
                            }
                        };
                        match reader_codec.decode(payload) {
                            Ok(envelope) => {
                                if inbound_tx.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(CommError::UnknownMessageType { type_tag, raw }) => {
                                warn!(
                                    type_tag,
                                    raw_len = raw.len(),
                                    "unknown signaling envelope"
                                );
                            }
                            Err(e) => warn!(error = %e, "undecodable signaling envelope"),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("signaling socket closed by coordinator");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "signaling socket error");
                        break;
                    }
                }
            }
            reader_closed.cancel();
        });

        let writer_codec = codec;
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    envelope = outbound_rx.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let framed = match writer_codec.frame(&envelope.encode()) {
                    Ok(framed) => framed,
                    Err(e) => {
                        warn!(error = %e, "cannot frame outbound envelope");
                        continue;
                    }
                };
                if write.send(Message::Binary(framed)).await.is_err() {
                    break;
                }
            }
            writer_closed.cancel();
        });

        Ok((
            Self {
                outbound: outbound_tx,
                closed,
            },
            inbound_rx,
        ))
    }

    /// Queue an envelope for the coordinator
    pub fn send(&self, envelope: Envelope) -> CommResult<()> {
        self.outbound
            .send(envelope)
            .map_err(|_| CommError::Transport("signaling link closed".to_string()))
    }

    /// Fires when the link is gone in either direction
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
