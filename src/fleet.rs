//! Fleet Coordinator (spec.md §4.C): instance creation/deletion, cold-start
//! recovery, and reconnection admission for every Supervisor it owns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::Admission;
use crate::error::{Error, NotFoundError, Result};
use crate::protocol::ProtocolClient;
use crate::store::registry::{ConnectionStatus, InstanceRegistry, InstanceUpdate, NewInstance};
use crate::store::registry::Instance;
use crate::store::session_repo::SessionRepository;
use crate::supervisor::Supervisor;

/// Cold-start batch size (spec.md §4.C).
const BOOT_BATCH_SIZE: usize = 5;

/// Statuses recovered at boot: anything that was mid-flight when the
/// process last stopped.
const RECOVERABLE_STATUSES: [ConnectionStatus; 3] = [
    ConnectionStatus::Connected,
    ConnectionStatus::Connecting,
    ConnectionStatus::QrPending,
];

/// The Instance Lifecycle & Reconnection Coordinator. Owns every
/// [`Supervisor`]'s lifetime; a Supervisor never owns a reference back to
/// its `Fleet` (see `supervisor.rs`'s module doc).
pub struct Fleet {
    registry: Arc<dyn InstanceRegistry>,
    session_repo: Arc<dyn SessionRepository>,
    protocol: Arc<dyn ProtocolClient>,
    admission: Arc<Admission>,
    max_instances: usize,
    staggered_boot_delay: Duration,
    supervisors: RwLock<HashMap<Uuid, Arc<Supervisor>>>,
    reconnect_tx: mpsc::UnboundedSender<Arc<Supervisor>>,
    shutdown: CancellationToken,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Fleet {
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        session_repo: Arc<dyn SessionRepository>,
        protocol: Arc<dyn ProtocolClient>,
        max_instances: usize,
        staggered_boot_delay: Duration,
    ) -> Arc<Self> {
        let admission = Arc::new(Admission::new());
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let fleet = Arc::new(Self {
            registry,
            session_repo,
            protocol,
            admission: admission.clone(),
            max_instances,
            staggered_boot_delay,
            supervisors: RwLock::new(HashMap::new()),
            reconnect_tx,
            shutdown: shutdown.clone(),
            reconnect_task: Mutex::new(None),
        });

        let task = tokio::spawn(reconnection_loop(reconnect_rx, admission, shutdown));
        // Stash the handle so `shutdown()` can await it; `try_lock` is safe
        // here since nothing else can see `fleet` yet.
        if let Ok(mut guard) = fleet.reconnect_task.try_lock() {
            *guard = Some(task);
        }
        fleet
    }

    fn new_supervisor(&self, instance: &Instance) -> Arc<Supervisor> {
        Supervisor::new(
            instance.id,
            instance.instance_name.clone(),
            self.registry.clone(),
            self.session_repo.clone(),
            self.protocol.clone(),
            self.admission.clone(),
            self.reconnect_tx.clone(),
        )
    }

    /// `create_instance`: persist the row, register a Supervisor, and kick
    /// off its first `connect()` in the background.
    pub async fn create_instance(
        self: &Arc<Self>,
        user_id: Uuid,
        instance_name: String,
        webhook_url: String,
    ) -> Result<Instance> {
        // Hold the write lock across the capacity check and the eventual
        // insert so two concurrent calls can't both pass the check with one
        // slot free (spec.md §5: the cap is a hard ceiling, not advisory).
        let mut supervisors = self.supervisors.write().await;
        if supervisors.len() >= self.max_instances {
            return Err(Error::Conflict(crate::error::ConflictError::CapacityExceeded(
                self.max_instances,
            )));
        }

        let instance = self
            .registry
            .insert(NewInstance {
                user_id,
                instance_name,
                webhook_url,
            })
            .await?;

        let supervisor = self.new_supervisor(&instance);
        supervisors.insert(instance.id, supervisor.clone());
        drop(supervisors);

        tokio::spawn(async move {
            if let Err(err) = supervisor.connect().await {
                tracing::warn!(error = %err, "initial connect failed");
            }
        });

        Ok(instance)
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.registry.list().await
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<Instance> {
        self.registry
            .select_by_id(instance_id)
            .await?
            .ok_or(NotFoundError::Instance(instance_id))
            .map_err(Into::into)
    }

    /// Memory mirror preferred over the Registry row (spec.md §4.C).
    pub async fn get_qr(&self, instance_id: Uuid) -> Result<(Option<String>, ConnectionStatus)> {
        if let Some(supervisor) = self.supervisors.read().await.get(&instance_id).cloned() {
            return Ok((supervisor.qr().await, supervisor.status().await));
        }
        let instance = self
            .registry
            .select_by_id(instance_id)
            .await?
            .ok_or(NotFoundError::Instance(instance_id))?;
        Ok((instance.qr_code, instance.connection_status))
    }

    pub async fn restart_instance(&self, instance_id: Uuid) -> Result<()> {
        let supervisor = self
            .supervisors
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .ok_or(NotFoundError::Instance(instance_id))?;
        supervisor.restart().await
    }

    /// Close the socket, drop in-memory mirrors, wipe the session, then
    /// delete the Registry row — in that order, so a late `creds.update`
    /// can't recreate the session row after deletion (spec.md §4.C).
    pub async fn delete_instance(&self, instance_id: Uuid) -> Result<()> {
        let supervisor = self
            .supervisors
            .write()
            .await
            .remove(&instance_id)
            .ok_or(NotFoundError::Instance(instance_id))?;

        supervisor.close().await;
        supervisor.remove_session().await?;
        self.admission.forget(instance_id).await;
        self.registry.delete(instance_id).await?;
        Ok(())
    }

    /// Cold-start recovery: resume every instance that was mid-flight when
    /// the process last stopped, in batches of [`BOOT_BATCH_SIZE`] with
    /// [`Self::staggered_boot_delay`] between batches (spec.md §4.C).
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        let pending = self
            .registry
            .select_where_status_in(&RECOVERABLE_STATUSES, self.max_instances)
            .await?;

        for batch in pending.chunks(BOOT_BATCH_SIZE) {
            let mut handles = Vec::with_capacity(batch.len());
            for instance in batch {
                let supervisor = self.new_supervisor(instance);
                self.supervisors
                    .write()
                    .await
                    .insert(instance.id, supervisor.clone());
                let instance_name = instance.instance_name.clone();
                handles.push(tokio::spawn(async move {
                    if let Err(err) = supervisor.connect().await {
                        tracing::warn!(instance = %instance_name, error = %err, "boot recovery connect failed");
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
            tokio::time::sleep(self.staggered_boot_delay).await;
        }
        Ok(())
    }

    /// Cancel the reconnection loop, close every live socket, then flush
    /// every Supervisor's pending debounced write (spec.md §5: "Shutdown
    /// cancels all debounce timers and awaits their flush"). Does not delete
    /// any rows or sessions.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.reconnect_task.lock().await.take() {
            let _ = task.await;
        }
        let supervisors: Vec<Arc<Supervisor>> =
            self.supervisors.read().await.values().cloned().collect();
        for supervisor in &supervisors {
            supervisor.close().await;
        }
        for supervisor in &supervisors {
            if let Err(err) = supervisor.flush_session().await {
                tracing::warn!(instance = %supervisor.instance_name, error = %err, "flush on shutdown failed");
            }
        }
    }
}

/// Background task draining reconnection requests: acquire a semaphore
/// slot, sleep a random jitter in [1s, 5s], then `connect()` — decorrelates
/// a thundering herd of simultaneous closes (spec.md §4.C).
async fn reconnection_loop(
    mut rx: mpsc::UnboundedReceiver<Arc<Supervisor>>,
    admission: Arc<Admission>,
    shutdown: CancellationToken,
) {
    loop {
        let supervisor = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(supervisor) => supervisor,
                None => break,
            },
        };
        let admission = admission.clone();
        tokio::spawn(async move {
            let _permit = admission.acquire_reconnect_slot().await;
            let jitter_secs = rand::thread_rng().gen_range(1.0..=5.0_f64);
            tokio::time::sleep(Duration::from_secs_f64(jitter_secs)).await;
            if let Err(err) = supervisor.connect().await {
                tracing::warn!(instance = %supervisor.instance_name, error = %err, "reconnection attempt failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fake::FakeProtocolClient;
    use crate::protocol::ProtocolEvent;
    use crate::store::registry::MemoryRegistry;
    use crate::store::session_repo::MemorySessionRepository;

    fn new_fleet(max_instances: usize) -> Arc<Fleet> {
        Fleet::new(
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemorySessionRepository::new()),
            Arc::new(FakeProtocolClient::new()),
            max_instances,
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn create_instance_starts_connecting() {
        let fleet = new_fleet(80);
        let instance = fleet
            .create_instance(Uuid::new_v4(), "vendas-01".into(), "https://hook".into())
            .await
            .unwrap();
        assert_eq!(instance.connection_status, ConnectionStatus::Connecting);
        let fetched = fleet.get_instance(instance.id).await.unwrap();
        assert_eq!(fetched.id, instance.id);
    }

    #[tokio::test]
    async fn create_instance_rejects_over_capacity() {
        let fleet = new_fleet(1);
        fleet
            .create_instance(Uuid::new_v4(), "first".into(), "https://hook".into())
            .await
            .unwrap();
        let err = fleet
            .create_instance(Uuid::new_v4(), "second".into(), "https://hook".into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(crate::error::ConflictError::CapacityExceeded(1))
        ));
    }

    #[tokio::test]
    async fn concurrent_create_instance_never_exceeds_capacity() {
        let fleet = new_fleet(4);
        let mut handles = Vec::new();
        for i in 0..16 {
            let fleet = fleet.clone();
            handles.push(tokio::spawn(async move {
                fleet
                    .create_instance(Uuid::new_v4(), format!("race-{i}"), "https://hook".into())
                    .await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 4);
        assert_eq!(fleet.list_instances().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn get_qr_prefers_memory_mirror() {
        let fleet = new_fleet(80);
        let instance = fleet
            .create_instance(Uuid::new_v4(), "qr-test".into(), "https://hook".into())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (qr, status) = fleet.get_qr(instance.id).await.unwrap();
        assert!(qr.is_none());
        assert_eq!(status, ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn delete_instance_removes_row_and_supervisor() {
        let fleet = new_fleet(80);
        let instance = fleet
            .create_instance(Uuid::new_v4(), "to-delete".into(), "https://hook".into())
            .await
            .unwrap();
        fleet.delete_instance(instance.id).await.unwrap();
        let err = fleet.get_instance(instance.id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound(NotFoundError::Instance(id)) if id == instance.id
        ));
        let err = fleet.restart_instance(instance.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFoundError::Instance(_))));
    }

    #[tokio::test]
    async fn unknown_instance_operations_are_not_found() {
        let fleet = new_fleet(80);
        let missing = Uuid::new_v4();
        assert!(matches!(
            fleet.get_instance(missing).await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            fleet.restart_instance(missing).await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            fleet.delete_instance(missing).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn boot_recovery_resumes_recoverable_instances_in_batches() {
        let registry = Arc::new(MemoryRegistry::new());
        let session_repo = Arc::new(MemorySessionRepository::new());
        let protocol = Arc::new(FakeProtocolClient::new());
        for i in 0..12 {
            let instance = registry
                .insert(NewInstance {
                    user_id: Uuid::new_v4(),
                    instance_name: format!("boot-{i}"),
                    webhook_url: "https://hook".into(),
                })
                .await
                .unwrap();
            registry
                .update(
                    instance.id,
                    InstanceUpdate::default().status(ConnectionStatus::Connected),
                )
                .await
                .unwrap();
        }
        let fleet = Fleet::new(registry, session_repo, protocol.clone(), 80, Duration::from_millis(1));
        fleet.recover().await.unwrap();
        for i in 0..12 {
            assert_eq!(protocol.open_count(&format!("boot-{i}")).await, 1);
        }
    }

    #[tokio::test]
    async fn reconnection_herd_is_bounded_by_semaphore() {
        let fleet = new_fleet(80);
        let mut instances = Vec::new();
        for i in 0..8 {
            let instance = fleet
                .create_instance(Uuid::new_v4(), format!("herd-{i}"), "https://hook".into())
                .await
                .unwrap();
            instances.push(instance);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fleet.admission.available_reconnect_slots(), 5);
        fleet.shutdown().await;
    }
}
