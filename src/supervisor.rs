//! Socket Supervisor (spec.md §4.B): owns the live connection for one
//! instance across its entire life, including automatic re-entry after
//! clean disconnects.
//!
//! The state machine reuses [`crate::store::registry::ConnectionStatus`]
//! rather than a parallel `SupervisorState` enum — the two are the same
//! five states (`disconnected`, `connecting`, `qr_pending`, `connected`,
//! `failed`) and keeping one definition avoids the pair drifting apart
//! (see DESIGN.md).

use std::io::Cursor;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use image::Luma;
use qrcode::QrCode;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::admission::{Admission, MAX_RETRIES};
use crate::error::Result;
use crate::protocol::{OpenConfig, ProtocolClient, ProtocolEvent, SocketHandle};
use crate::store::registry::{ConnectionStatus, InstanceRegistry, InstanceUpdate};
use crate::store::session::SessionHandle;
use crate::store::session_repo::SessionRepository;

/// QR pixel dimension (spec.md §4.B).
const QR_DIMENSION: u32 = 300;

/// QR validity window.
const QR_TTL: ChronoDuration = ChronoDuration::seconds(60);

/// Mutable, lock-guarded half of a [`Supervisor`] — everything that changes
/// across the socket's lifetime.
struct State {
    status: ConnectionStatus,
    qr: Option<String>,
    session: Option<Arc<SessionHandle>>,
    socket: Option<Box<dyn SocketHandle>>,
    event_task: Option<JoinHandle<()>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            qr: None,
            session: None,
            socket: None,
            event_task: None,
        }
    }
}

/// One instance's live connection. Spec.md §4.C's Fleet Coordinator owns
/// the map from `instance_id` to `Arc<Supervisor>`; a Supervisor never
/// holds a reference back to the Fleet — it asks for re-admission by
/// sending itself down `reconnect_tx`, which the Coordinator's background
/// reconnection loop drains (avoids an `Arc` cycle; see DESIGN.md).
pub struct Supervisor {
    pub instance_id: Uuid,
    pub instance_name: String,
    registry: Arc<dyn InstanceRegistry>,
    session_repo: Arc<dyn SessionRepository>,
    protocol: Arc<dyn ProtocolClient>,
    admission: Arc<Admission>,
    reconnect_tx: mpsc::UnboundedSender<Arc<Supervisor>>,
    state: RwLock<State>,
}

impl Supervisor {
    pub fn new(
        instance_id: Uuid,
        instance_name: String,
        registry: Arc<dyn InstanceRegistry>,
        session_repo: Arc<dyn SessionRepository>,
        protocol: Arc<dyn ProtocolClient>,
        admission: Arc<Admission>,
        reconnect_tx: mpsc::UnboundedSender<Arc<Supervisor>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id,
            instance_name,
            registry,
            session_repo,
            protocol,
            admission,
            reconnect_tx,
            state: RwLock::new(State::default()),
        })
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    /// Memory-mirror QR lookup, preferred over the Registry row (spec.md §4.C
    /// `get_qr`).
    pub async fn qr(&self) -> Option<String> {
        self.state.read().await.qr.clone()
    }

    /// Tear down any pre-existing socket, mark `connecting`, open the
    /// Session State Store, build a socket, subscribe to events.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.teardown_socket().await;

        self.registry
            .update(
                self.instance_id,
                InstanceUpdate::default().status(ConnectionStatus::Connecting),
            )
            .await?;
        {
            let mut state = self.state.write().await;
            state.status = ConnectionStatus::Connecting;
        }

        let session = Arc::new(SessionHandle::open(self.session_repo.clone(), self.instance_name.clone()).await?);
        let creds = session.creds().await;
        let version = self.admission.protocol_version(&*self.protocol).await?;

        let (mut rx, handle) = self
            .protocol
            .open(
                OpenConfig {
                    instance_name: self.instance_name.clone(),
                    version,
                },
                creds,
            )
            .await?;

        let event_task = tokio::spawn({
            let this = self.clone();
            async move {
                while let Some(event) = rx.recv().await {
                    this.handle_event(event).await;
                }
            }
        });

        let mut state = self.state.write().await;
        state.session = Some(session);
        state.socket = Some(handle);
        state.event_task = Some(event_task);
        Ok(())
    }

    /// Tear down and re-`connect` from scratch. The session blob survives
    /// because it is keyed by `instance_name`, never deleted here.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.connect().await
    }

    /// Terminate the socket without status side effects (shutdown path).
    pub async fn close(&self) {
        self.teardown_socket().await;
    }

    /// Flush the open `SessionHandle`'s pending debounce write, if one
    /// exists (spec.md §4.C shutdown protocol: "cancels all debounce timers
    /// and awaits their flush").
    pub async fn flush_session(&self) -> Result<()> {
        let session = self.state.read().await.session.clone();
        match session {
            Some(session) => session.flush().await,
            None => Ok(()),
        }
    }

    /// Cancel the open `SessionHandle`'s pending debounce timer and delete
    /// its row, falling back to a direct repo delete if no handle was ever
    /// opened. Must be used instead of a bare repo delete: a debounced write
    /// already in flight could otherwise fire after the row is gone and
    /// recreate it (spec.md §4.C).
    pub async fn remove_session(&self) -> Result<()> {
        let session = self.state.write().await.session.take();
        match session {
            Some(session) => session.remove_session().await,
            None => crate::store::session::remove_session(&*self.session_repo, &self.instance_name).await,
        }
    }

    async fn teardown_socket(&self) {
        let mut state = self.state.write().await;
        if let Some(task) = state.event_task.take() {
            task.abort();
        }
        if let Some(socket) = state.socket.take() {
            socket.close().await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Qr { challenge } => self.on_qr(challenge).await,
            ProtocolEvent::ConnectionOpen { identity } => self.on_open(identity.phone_number().to_string()).await,
            ProtocolEvent::ConnectionClose { reason } => self.on_close(reason).await,
            ProtocolEvent::CredsUpdate { creds } => {
                let session = self.state.read().await.session.clone();
                if let Some(session) = session {
                    if let Err(err) = session.save_creds(creds).await {
                        tracing::warn!(instance = %self.instance_name, error = %err, "save_creds failed");
                    }
                }
            }
        }
    }

    async fn on_qr(&self, challenge: String) {
        let data_url = render_qr_data_url(&challenge);
        {
            let mut state = self.state.write().await;
            state.status = ConnectionStatus::QrPending;
            state.qr = Some(data_url.clone());
        }
        let expires_at = Utc::now() + QR_TTL;
        if let Err(err) = self
            .registry
            .update(
                self.instance_id,
                InstanceUpdate::default()
                    .status(ConnectionStatus::QrPending)
                    .qr(Some(data_url), Some(expires_at)),
            )
            .await
        {
            tracing::warn!(instance = %self.instance_name, error = %err, "failed to persist qr event");
        }
    }

    async fn on_open(&self, phone_number: String) {
        self.admission.reset_retries(self.instance_id).await;
        {
            let mut state = self.state.write().await;
            state.status = ConnectionStatus::Connected;
            state.qr = None;
        }
        if let Err(err) = self
            .registry
            .update(
                self.instance_id,
                InstanceUpdate::default()
                    .status(ConnectionStatus::Connected)
                    .connected(true)
                    .qr(None, None)
                    .owner_phone_number(Some(phone_number))
                    .last_connected_at(Some(Utc::now())),
            )
            .await
        {
            tracing::warn!(instance = %self.instance_name, error = %err, "failed to persist connection open");
        }
    }

    async fn on_close(self: &Arc<Self>, reason: crate::protocol::ConnectFailureReason) {
        if reason.is_logged_out() {
            let session = self.state.read().await.session.clone();
            if let Some(session) = session {
                if let Err(err) = session.remove_session().await {
                    tracing::warn!(instance = %self.instance_name, error = %err, "remove_session failed on logout");
                }
            }
            {
                let mut state = self.state.write().await;
                state.status = ConnectionStatus::Disconnected;
                state.qr = None;
                state.session = None;
            }
            if let Err(err) = self
                .registry
                .update(
                    self.instance_id,
                    InstanceUpdate::default()
                        .status(ConnectionStatus::Disconnected)
                        .connected(false)
                        .qr(None, None)
                        .owner_phone_number(None),
                )
                .await
            {
                tracing::warn!(instance = %self.instance_name, error = %err, "failed to persist logout");
            }
            return;
        }

        let retries = self.admission.record_retry(self.instance_id).await;
        if retries > MAX_RETRIES {
            {
                let mut state = self.state.write().await;
                state.status = ConnectionStatus::Failed;
            }
            if let Err(err) = self
                .registry
                .update(
                    self.instance_id,
                    InstanceUpdate::default()
                        .status(ConnectionStatus::Failed)
                        .connected(false),
                )
                .await
            {
                tracing::warn!(instance = %self.instance_name, error = %err, "failed to persist failed state");
            }
            return;
        }

        {
            let mut state = self.state.write().await;
            state.status = ConnectionStatus::Connecting;
        }
        if let Err(err) = self
            .registry
            .update(
                self.instance_id,
                InstanceUpdate::default()
                    .status(ConnectionStatus::Connecting)
                    .connected(false),
            )
            .await
        {
            tracing::warn!(instance = %self.instance_name, error = %err, "failed to persist reconnecting state");
        }

        if self.reconnect_tx.send(self.clone()).is_err() {
            tracing::warn!(instance = %self.instance_name, "reconnection channel closed, dropping request");
        }
    }
}

/// Render `challenge` as a 300px PNG QR code and return it as a
/// `data:image/png;base64,...` URL (spec.md §4.B).
fn render_qr_data_url(challenge: &str) -> String {
    let code = QrCode::new(challenge.as_bytes()).expect("qr payload too large for qrcode crate");
    let image = code
        .render::<Luma<u8>>()
        .max_dimensions(QR_DIMENSION, QR_DIMENSION)
        .build();
    let mut bytes: Vec<u8> = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encoding a qr code to png cannot fail");
    format!("data:image/png;base64,{}", BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fake::FakeProtocolClient;
    use crate::store::registry::{MemoryRegistry, NewInstance};
    use crate::store::session_repo::MemorySessionRepository;

    fn fixture() -> (
        Arc<dyn InstanceRegistry>,
        Arc<dyn SessionRepository>,
        Arc<FakeProtocolClient>,
        Arc<Admission>,
    ) {
        (
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemorySessionRepository::new()),
            Arc::new(FakeProtocolClient::new()),
            Arc::new(Admission::new()),
        )
    }

    #[tokio::test]
    async fn connect_then_qr_event_updates_mirror_and_row() {
        let (registry, session_repo, protocol, admission) = fixture();
        let instance = registry
            .insert(NewInstance {
                user_id: Uuid::new_v4(),
                instance_name: "vendas-01".into(),
                webhook_url: "https://example.com".into(),
            })
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            instance.id,
            instance.instance_name.clone(),
            registry.clone(),
            session_repo,
            protocol.clone(),
            admission,
            tx,
        );
        supervisor.connect().await.unwrap();
        assert!(protocol.inject("vendas-01", ProtocolEvent::Qr { challenge: "1@abc".into() }).await);
        // allow the spawned event task to process
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(supervisor.qr().await.is_some());
        let row = registry.select_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::QrPending);
        assert!(row.qr_code.is_some());
    }

    #[tokio::test]
    async fn connection_open_clears_qr_and_sets_phone() {
        let (registry, session_repo, protocol, admission) = fixture();
        let instance = registry
            .insert(NewInstance {
                user_id: Uuid::new_v4(),
                instance_name: "open-test".into(),
                webhook_url: "https://example.com".into(),
            })
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            instance.id,
            instance.instance_name.clone(),
            registry.clone(),
            session_repo,
            protocol.clone(),
            admission,
            tx,
        );
        supervisor.connect().await.unwrap();
        protocol
            .inject(
                "open-test",
                ProtocolEvent::ConnectionOpen {
                    identity: crate::protocol::SocketIdentity {
                        user_id: "5511999999999:1@s.whatsapp.net".into(),
                    },
                },
            )
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let row = registry.select_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::Connected);
        assert!(row.is_connected);
        assert_eq!(row.owner_phone_number.as_deref(), Some("5511999999999"));
        assert!(supervisor.qr().await.is_none());
    }

    #[tokio::test]
    async fn logout_close_wipes_session_without_reconnect_request() {
        let (registry, session_repo, protocol, admission) = fixture();
        let instance = registry
            .insert(NewInstance {
                user_id: Uuid::new_v4(),
                instance_name: "logout-test".into(),
                webhook_url: "https://example.com".into(),
            })
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            instance.id,
            instance.instance_name.clone(),
            registry.clone(),
            session_repo,
            protocol.clone(),
            admission,
            tx,
        );
        supervisor.connect().await.unwrap();
        protocol
            .inject(
                "logout-test",
                ProtocolEvent::ConnectionClose {
                    reason: crate::protocol::ConnectFailureReason::LoggedOut,
                },
            )
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let row = registry.select_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flush_session_persists_pending_debounce_write() {
        tokio::time::pause();
        let (registry, session_repo, protocol, admission) = fixture();
        let instance = registry
            .insert(NewInstance {
                user_id: Uuid::new_v4(),
                instance_name: "flush-test".into(),
                webhook_url: "https://example.com".into(),
            })
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            instance.id,
            instance.instance_name.clone(),
            registry.clone(),
            session_repo.clone(),
            protocol.clone(),
            admission,
            tx,
        );
        supervisor.connect().await.unwrap();

        let session = supervisor.state.read().await.session.clone().unwrap();
        session
            .set(vec![crate::store::session::KeyPatch {
                category: "pre-key".into(),
                id: "1".into(),
                value: Some(vec![9, 9, 9]),
            }])
            .await;

        // `Fleet::shutdown` calls this for every Supervisor instead of
        // waiting out the debounce window.
        supervisor.flush_session().await.unwrap();

        let row = session_repo.load("flush-test").await.unwrap().unwrap();
        assert_eq!(row.keys.as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_session_cancels_pending_debounce_before_deleting_row() {
        tokio::time::pause();
        let (registry, session_repo, protocol, admission) = fixture();
        let instance = registry
            .insert(NewInstance {
                user_id: Uuid::new_v4(),
                instance_name: "debounce-delete".into(),
                webhook_url: "https://example.com".into(),
            })
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            instance.id,
            instance.instance_name.clone(),
            registry.clone(),
            session_repo.clone(),
            protocol.clone(),
            admission,
            tx,
        );
        supervisor.connect().await.unwrap();

        // Schedule a debounced keys write that hasn't fired yet, then delete
        // right away, as `Fleet::delete_instance` does.
        let session = supervisor.state.read().await.session.clone().unwrap();
        session
            .set(vec![crate::store::session::KeyPatch {
                category: "pre-key".into(),
                id: "1".into(),
                value: Some(vec![1, 2, 3]),
            }])
            .await;
        supervisor.remove_session().await.unwrap();

        // If the debounce timer weren't cancelled, it would fire here and
        // recreate the row via `upsert_keys`.
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert!(!session_repo.exists("debounce-delete").await.unwrap());
    }

    #[tokio::test]
    async fn non_fatal_close_requests_reconnect_and_increments_retry() {
        let (registry, session_repo, protocol, admission) = fixture();
        let instance = registry
            .insert(NewInstance {
                user_id: Uuid::new_v4(),
                instance_name: "retry-test".into(),
                webhook_url: "https://example.com".into(),
            })
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            instance.id,
            instance.instance_name.clone(),
            registry.clone(),
            session_repo,
            protocol.clone(),
            admission.clone(),
            tx,
        );
        supervisor.connect().await.unwrap();
        protocol
            .inject(
                "retry-test",
                ProtocolEvent::ConnectionClose {
                    reason: crate::protocol::ConnectFailureReason::Other,
                },
            )
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_ok());
        assert_eq!(admission.retry_count(instance.id).await, 1);
        let row = registry.select_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::Connecting);
    }
}
