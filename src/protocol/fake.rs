//! In-memory [`super::ProtocolClient`] used by the test suite to inject
//! synthetic QR/open/close events deterministically (spec.md §9).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{OpenConfig, ProtocolClient, ProtocolEvent, ProtocolVersion, SocketHandle};
use crate::error::Result;
use crate::store::session::Creds;

struct FakeSocketHandle {
    instance_name: String,
    closed: Arc<Mutex<HashMap<String, bool>>>,
}

#[async_trait]
impl SocketHandle for FakeSocketHandle {
    async fn close(&self) {
        self.closed
            .lock()
            .await
            .insert(self.instance_name.clone(), true);
    }
}

/// Fake protocol client. `inject` sends a [`ProtocolEvent`] to whichever
/// supervisor currently has the matching instance open; `open_count`
/// reports how many times `open` has been called for an instance, useful
/// for asserting the cold-start / reconnection admission properties in
/// spec.md §8.
#[derive(Default)]
pub struct FakeProtocolClient {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<ProtocolEvent>>>,
    closed: Arc<Mutex<HashMap<String, bool>>>,
    open_counts: Mutex<HashMap<String, u32>>,
    version: ProtocolVersion,
}

impl FakeProtocolClient {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            closed: Arc::new(Mutex::new(HashMap::new())),
            open_counts: Mutex::new(HashMap::new()),
            version: (2, 3000, 0),
        }
    }

    /// Send `event` to the currently-open socket for `instance_name`.
    /// Returns `false` if no socket is open (the receiver was dropped or
    /// `open` was never called).
    pub async fn inject(&self, instance_name: &str, event: ProtocolEvent) -> bool {
        let senders = self.senders.lock().await;
        match senders.get(instance_name) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn open_count(&self, instance_name: &str) -> u32 {
        *self
            .open_counts
            .lock()
            .await
            .get(instance_name)
            .unwrap_or(&0)
    }

    pub async fn is_closed(&self, instance_name: &str) -> bool {
        *self.closed.lock().await.get(instance_name).unwrap_or(&false)
    }
}

#[async_trait]
impl ProtocolClient for FakeProtocolClient {
    async fn open(
        &self,
        config: OpenConfig,
        _creds: Creds,
    ) -> Result<(
        mpsc::UnboundedReceiver<ProtocolEvent>,
        Box<dyn SocketHandle>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .await
            .insert(config.instance_name.clone(), tx);
        self.closed
            .lock()
            .await
            .insert(config.instance_name.clone(), false);
        *self
            .open_counts
            .lock()
            .await
            .entry(config.instance_name.clone())
            .or_insert(0) += 1;
        Ok((
            rx,
            Box::new(FakeSocketHandle {
                instance_name: config.instance_name,
                closed: self.closed.clone(),
            }),
        ))
    }

    async fn fetch_latest_version(&self) -> Result<ProtocolVersion> {
        Ok(self.version)
    }
}
