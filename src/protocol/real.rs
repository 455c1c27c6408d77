//! Production [`super::ProtocolClient`] backed by the teacher crate's
//! Noise-over-WebSocket transport (`full` feature only).
//!
//! This performs a real Noise `XX_25519_AESGCM_SHA256` handshake
//! (`crate::socket::noise`) and decodes the resulting frames as binary
//! protocol nodes (`crate::binary`). Full WhatsApp node semantics (message
//! routing, app-state patches, ...) are out of scope per spec.md §1 — this
//! translates only the lifecycle-relevant events the core needs.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    ConnectFailureReason, OpenConfig, ProtocolClient, ProtocolEvent, ProtocolVersion, SocketHandle,
};
use crate::binary::Node;
use crate::error::Result;
use crate::socket::{connect_noise, NoiseRecv, NoiseTransport};
use crate::store::session::Creds;

/// Default production [`ProtocolClient`]: one Noise handshake per `open()`.
pub struct RealProtocolClient {
    ws_url: String,
}

impl RealProtocolClient {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

impl Default for RealProtocolClient {
    fn default() -> Self {
        Self::new(crate::socket::DEFAULT_WS_URL)
    }
}

struct RealSocketHandle {
    transport: NoiseTransport,
}

#[async_trait]
impl SocketHandle for RealSocketHandle {
    async fn close(&self) {
        if let Err(err) = crate::transport::Transport::close(&self.transport).await {
            tracing::debug!(error = %err, "error closing noise transport");
        }
    }
}

#[async_trait]
impl ProtocolClient for RealProtocolClient {
    async fn open(
        &self,
        config: OpenConfig,
        _creds: Creds,
    ) -> Result<(
        mpsc::UnboundedReceiver<ProtocolEvent>,
        Box<dyn SocketHandle>,
    )> {
        tracing::info!(instance = %config.instance_name, version = ?config.version, "opening noise socket");
        let (transport, recv) = connect_noise(&self.ws_url).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(recv_loop(config.instance_name, recv, tx));
        Ok((rx, Box::new(RealSocketHandle { transport })))
    }

    async fn fetch_latest_version(&self) -> Result<ProtocolVersion> {
        // The upstream library exposes a version-check endpoint; the binary
        // node protocol needed to query it is not implemented here (out of
        // scope per spec.md §1), so we pin a known-good version.
        Ok((2, 3000, 0))
    }
}

async fn recv_loop(
    instance_name: String,
    recv: NoiseRecv,
    tx: mpsc::UnboundedSender<ProtocolEvent>,
) {
    while let Ok(frame) = recv.next_decrypted_frame().await {
        match Node::decode(&frame) {
            Ok(node) => {
                if let Some(event) = translate_node(&node) {
                    if tx.send(event).is_err() {
                        break;
                    }
                } else {
                    tracing::debug!(instance = %instance_name, tag = %node.tag, "unhandled node");
                }
            }
            Err(err) => {
                tracing::debug!(instance = %instance_name, error = %err, "failed to decode node");
            }
        }
    }
    let _ = tx.send(ProtocolEvent::ConnectionClose {
        reason: ConnectFailureReason::Other,
    });
}

/// Map a subset of binary nodes to lifecycle events. Real node semantics
/// (iq/message/receipt routing) are out of scope; we only recognize the
/// `stream:error` logout sentinel here.
fn translate_node(node: &Node) -> Option<ProtocolEvent> {
    if node.tag == "stream:error" {
        let logged_out = node
            .attrs
            .get("code")
            .map(|c| c == "401")
            .unwrap_or(false);
        return Some(ProtocolEvent::ConnectionClose {
            reason: if logged_out {
                ConnectFailureReason::LoggedOut
            } else {
                ConnectFailureReason::Other
            },
        });
    }
    None
}
