//! WebSocket link to the room relay
//!
//! One duplex, message-oriented channel. The link only routes: outbound
//! messages come in on an mpsc and go out as JSON text frames, inbound frames
//! are parsed and handed to the coordinator. On unexpected closure it retries
//! after a fixed short delay for as long as the session is active. While
//! disconnected, outbound traffic is dropped rather than queued; the per-peer
//! state machines carry their own retry flags.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::types::SignalMessage;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Relay endpoint, e.g. `wss://host/ws`.
    pub url: String,
    /// Room token; sent both as a query parameter and a WS subprotocol so it
    /// survives proxies that strip one or the other.
    pub token: String,
    pub reconnect_delay: Duration,
}

pub struct SignalingLink {
    cfg: LinkConfig,
    inbound: mpsc::Sender<SignalMessage>,
    outbound: mpsc::Receiver<SignalMessage>,
    active: watch::Receiver<bool>,
}

impl SignalingLink {
    pub fn new(
        cfg: LinkConfig,
        inbound: mpsc::Sender<SignalMessage>,
        outbound: mpsc::Receiver<SignalMessage>,
        active: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            inbound,
            outbound,
            active,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            if !*self.active.borrow() {
                return Ok(());
            }
            match self.session().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("signaling link lost: {e:#}"),
            }
            if !*self.active.borrow() {
                return Ok(());
            }
            self.backoff().await;
        }
    }

    /// One connection lifetime. `Ok` means the session ended deliberately;
    /// `Err` asks `run` to reconnect.
    async fn session(&mut self) -> Result<()> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .context("invalid relay url")?;
        if !self.cfg.token.is_empty() {
            let proto = format!("token.{}", self.cfg.token);
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                proto.parse().context("token not header-safe")?,
            );
        }

        let (ws, _) = connect_async(request)
            .await
            .context("relay connection failed")?;
        info!("signaling connected to {}", self.cfg.url);
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                changed = self.active.changed() => {
                    if changed.is_err() || !*self.active.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                maybe = self.outbound.recv() => {
                    match maybe {
                        Some(msg) => {
                            let json = serde_json::to_string(&msg)?;
                            sink.send(Message::Text(json.into()))
                                .await
                                .context("relay send failed")?;
                        }
                        // Coordinator gone; nothing left to relay.
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SignalMessage>(&text) {
                                Ok(msg) => {
                                    if self.inbound.send(msg).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(e) => debug!("ignoring unparseable frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => bail!("closed by relay"),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e).context("relay stream error"),
                    }
                }
            }
        }
    }

    /// Fixed short delay before reconnecting. Outbound messages produced
    /// while disconnected are drained and dropped here.
    async fn backoff(&mut self) {
        let delay = tokio::time::sleep(self.cfg.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return,
                changed = self.active.changed() => {
                    if changed.is_err() || !*self.active.borrow() {
                        return;
                    }
                }
                maybe = self.outbound.recv() => {
                    match maybe {
                        Some(msg) => debug!("dropping {} while disconnected", msg.msg_type()),
                        None => return,
                    }
                }
            }
        }
    }

    fn endpoint(&self) -> String {
        if self.cfg.token.is_empty() {
            self.cfg.url.clone()
        } else {
            let sep = if self.cfg.url.contains('?') { '&' } else { '?' };
            format!("{}{}t={}", self.cfg.url, sep, self.cfg.token)
        }
    }
}
