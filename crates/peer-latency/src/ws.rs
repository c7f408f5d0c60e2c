//! WebSocket signaling adapter
//!
//! Connects to the shared signaling server and plugs it into a
//! [`LatencyHandle`]: outgoing envelopes are serialized onto the socket,
//! incoming text frames are offered to `handle_signal_json`, and frames the
//! latency subsystem doesn't recognise can be passed through to the host.
//! When the socket goes away the transport detaches itself, which tears down
//! every session, unless the host has attached a newer transport since.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::manager::LatencyHandle;
use crate::protocol::SignalEnvelope;
use crate::transport::{SignalingTransport, TransportError};

enum Outgoing {
    Frame(String),
    Close,
}

/// Signaling transport over a WebSocket connection
pub struct WsSignalingTransport {
    url: String,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl WsSignalingTransport {
    /// Connect to `url` and attach the socket to `handle`
    ///
    /// Text frames that are not latency envelopes go to `passthrough`, if given.
    pub async fn connect(
        url: &str,
        handle: LatencyHandle,
        passthrough: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Arc<Self>, TransportError> {
        info!("[Signaling] Connecting to {}", url);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let transport = Arc::new(Self {
            url: url.to_string(),
            outgoing,
            open: open.clone(),
        });

        let attached: Arc<dyn SignalingTransport> = transport.clone();
        handle
            .attach_transport(Some(attached))
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        // Weak: the socket closes once every strong handle is dropped
        let this: Weak<Self> = Arc::downgrade(&transport);
        let url = url.to_string();
        let loop_handle = handle;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = outgoing_rx.recv() => match out {
                        Some(Outgoing::Frame(text)) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                warn!("[Signaling] Send to {} failed: {}", url, e);
                                break;
                            }
                        }
                        Some(Outgoing::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !loop_handle.handle_signal_json(&text) {
                                if let Some(tx) = &passthrough {
                                    let _ = tx.send(text.to_string());
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("[Signaling] WebSocket closed: {}", url);
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("[Signaling] WebSocket error from {}: {}", url, e);
                            break;
                        }
                        _ => {}
                    },
                }
            }
            open.store(false, Ordering::Relaxed);
            if let Some(this) = this.upgrade() {
                let _ = loop_handle.detach_transport(this);
            }
            debug!("[Signaling] Socket loop for {} ended", url);
        });

        Ok(transport)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the socket; the read loop then detaches the transport
    pub fn close(&self) {
        if self.open.swap(false, Ordering::Relaxed) {
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

#[async_trait]
impl SignalingTransport for WsSignalingTransport {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let text = envelope
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.outgoing
            .send(Outgoing::Frame(text))
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}
