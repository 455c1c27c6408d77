//! Instance Registry (spec.md §4.D): the durable directory of instances and
//! their last observed connection status / QR blob.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{Result, StoreError};

/// `connection_status` column / in-memory field (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "qr_pending" => Ok(Self::QrPending),
            "connected" => Ok(Self::Connected),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Load(format!(
                "unknown connection_status '{other}'"
            ))),
        }
    }
}

/// One row of `whatsapp_instances` (spec.md §6).
#[derive(Clone, Debug)]
pub struct Instance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub instance_name: String,
    pub webhook_url: String,
    pub is_connected: bool,
    pub connection_status: ConnectionStatus,
    pub qr_code: Option<String>,
    pub qr_code_expires_at: Option<DateTime<Utc>>,
    pub owner_phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Fields a status transition can touch in one write (spec.md §4.B's event
/// handlers never update more than this set at a time).
#[derive(Clone, Debug, Default)]
pub struct InstanceUpdate {
    pub connection_status: Option<ConnectionStatus>,
    pub is_connected: Option<bool>,
    pub qr_code: Option<Option<String>>,
    pub qr_code_expires_at: Option<Option<DateTime<Utc>>>,
    pub owner_phone_number: Option<Option<String>>,
    pub last_connected_at: Option<Option<DateTime<Utc>>>,
}

impl InstanceUpdate {
    pub fn status(mut self, status: ConnectionStatus) -> Self {
        self.connection_status = Some(status);
        self
    }

    pub fn connected(mut self, connected: bool) -> Self {
        self.is_connected = Some(connected);
        self
    }

    pub fn qr(mut self, code: Option<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.qr_code = Some(code);
        self.qr_code_expires_at = Some(expires_at);
        self
    }

    pub fn owner_phone_number(mut self, phone: Option<String>) -> Self {
        self.owner_phone_number = Some(phone);
        self
    }

    pub fn last_connected_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_connected_at = Some(at);
        self
    }
}

/// New-instance parameters for `insert` (spec.md §4.C `create_instance`).
pub struct NewInstance {
    pub user_id: Uuid,
    pub instance_name: String,
    pub webhook_url: String,
}

/// Row-level operations the core depends on, keyed by `instance_id` or
/// `instance_name` (spec.md §4.D).
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Insert a new row in `connecting` status. Must surface a unique-name
    /// (or unique-user) conflict distinctly so the Fleet Coordinator can map
    /// it to `ConflictError`.
    async fn insert(&self, new: NewInstance) -> Result<Instance>;

    async fn select_by_id(&self, id: Uuid) -> Result<Option<Instance>>;

    async fn select_by_name(&self, instance_name: &str) -> Result<Option<Instance>>;

    /// Ordered by `created_at` descending (spec.md §4.D).
    async fn list(&self) -> Result<Vec<Instance>>;

    async fn update(&self, id: Uuid, update: InstanceUpdate) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Rows whose status is one of `statuses`, ordered by `last_connected_at`
    /// ascending, capped at `limit` — the cold-start recovery query
    /// (spec.md §4.C).
    async fn select_where_status_in(
        &self,
        statuses: &[ConnectionStatus],
        limit: usize,
    ) -> Result<Vec<Instance>>;

    /// Whether `user_id` already owns an instance (1:1 invariant, spec.md §3).
    async fn user_has_instance(&self, user_id: Uuid) -> Result<bool>;
}

/// Postgres-backed [`InstanceRegistry`], following
/// `TaceoLabs-oprf-service`'s `PostgresSecretManager` shape.
pub struct PostgresInstanceRegistry {
    pool: PgPool,
}

impl PostgresInstanceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    user_id: Uuid,
    instance_name: String,
    webhook_url: String,
    is_connected: bool,
    connection_status: String,
    qr_code: Option<String>,
    qr_code_expires_at: Option<DateTime<Utc>>,
    owner_phone_number: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_connected_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> std::result::Result<Self, Self::Error> {
        Ok(Instance {
            id: row.id,
            user_id: row.user_id,
            instance_name: row.instance_name,
            webhook_url: row.webhook_url,
            is_connected: row.is_connected,
            connection_status: row.connection_status.parse()?,
            qr_code: row.qr_code,
            qr_code_expires_at: row.qr_code_expires_at,
            owner_phone_number: row.owner_phone_number,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_connected_at: row.last_connected_at,
        })
    }
}

#[async_trait]
impl InstanceRegistry for PostgresInstanceRegistry {
    async fn insert(&self, new: NewInstance) -> Result<Instance> {
        let result: std::result::Result<InstanceRow, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO whatsapp_instances
                (id, user_id, instance_name, webhook_url, is_connected, connection_status,
                 created_at, updated_at)
            VALUES (gen_random_uuid(), $1, $2, $3, false, 'connecting', now(), now())
            RETURNING id, user_id, instance_name, webhook_url, is_connected, connection_status,
                      qr_code, qr_code_expires_at, owner_phone_number, created_at, updated_at,
                      last_connected_at
            "#,
        )
        .bind(new.user_id)
        .bind(&new.instance_name)
        .bind(&new.webhook_url)
        .fetch_one(&self.pool)
        .await;

        let row = match result {
            Ok(row) => row,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(match db_err.constraint() {
                    Some(c) if c.contains("instance_name") => {
                        crate::error::ConflictError::NameTaken(new.instance_name).into()
                    }
                    _ => crate::error::ConflictError::UserHasInstance(new.user_id).into(),
                });
            }
            Err(err) => return Err(StoreError::Sqlx(err).into()),
        };
        row.try_into().map_err(Into::into)
    }

    async fn select_by_id(&self, id: Uuid) -> Result<Option<Instance>> {
        let row: Option<InstanceRow> = sqlx::query_as(
            r#"SELECT id, user_id, instance_name, webhook_url, is_connected, connection_status,
                      qr_code, qr_code_expires_at, owner_phone_number, created_at, updated_at,
                      last_connected_at
               FROM whatsapp_instances WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        row.map(TryInto::try_into).transpose().map_err(Into::into)
    }

    async fn select_by_name(&self, instance_name: &str) -> Result<Option<Instance>> {
        let row: Option<InstanceRow> = sqlx::query_as(
            r#"SELECT id, user_id, instance_name, webhook_url, is_connected, connection_status,
                      qr_code, qr_code_expires_at, owner_phone_number, created_at, updated_at,
                      last_connected_at
               FROM whatsapp_instances WHERE instance_name = $1"#,
        )
        .bind(instance_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        row.map(TryInto::try_into).transpose().map_err(Into::into)
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            r#"SELECT id, user_id, instance_name, webhook_url, is_connected, connection_status,
                      qr_code, qr_code_expires_at, owner_phone_number, created_at, updated_at,
                      last_connected_at
               FROM whatsapp_instances ORDER BY created_at DESC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        rows.into_iter()
            .map(|row| Instance::try_from(row).map_err(Into::into))
            .collect()
    }

    async fn update(&self, id: Uuid, update: InstanceUpdate) -> Result<()> {
        // Coalesce into one UPDATE; unset fields fall back to their current
        // value via `COALESCE`-free explicit binds (only touched columns are
        // not in this statement, so it stays a single dynamic-shape-free
        // query by always writing every optional field we track).
        let current = self
            .select_by_id(id)
            .await?
            .ok_or_else(|| StoreError::Load(format!("instance {id} not found")))?;
        let connection_status = update.connection_status.unwrap_or(current.connection_status);
        let is_connected = update.is_connected.unwrap_or(current.is_connected);
        let qr_code = update.qr_code.unwrap_or(current.qr_code);
        let qr_code_expires_at = update
            .qr_code_expires_at
            .unwrap_or(current.qr_code_expires_at);
        let owner_phone_number = update
            .owner_phone_number
            .unwrap_or(current.owner_phone_number);
        let last_connected_at = update.last_connected_at.unwrap_or(current.last_connected_at);

        sqlx::query(
            r#"
            UPDATE whatsapp_instances SET
                connection_status = $2,
                is_connected = $3,
                qr_code = $4,
                qr_code_expires_at = $5,
                owner_phone_number = $6,
                last_connected_at = $7,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(connection_status.as_str())
        .bind(is_connected)
        .bind(qr_code)
        .bind(qr_code_expires_at)
        .bind(owner_phone_number)
        .bind(last_connected_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query(r#"DELETE FROM whatsapp_instances WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn select_where_status_in(
        &self,
        statuses: &[ConnectionStatus],
        limit: usize,
    ) -> Result<Vec<Instance>> {
        let statuses: Vec<&'static str> = statuses.iter().map(ConnectionStatus::as_str).collect();
        let rows: Vec<InstanceRow> = sqlx::query_as(
            r#"SELECT id, user_id, instance_name, webhook_url, is_connected, connection_status,
                      qr_code, qr_code_expires_at, owner_phone_number, created_at, updated_at,
                      last_connected_at
               FROM whatsapp_instances
               WHERE connection_status = ANY($1)
               ORDER BY last_connected_at ASC NULLS FIRST
               LIMIT $2"#,
        )
        .bind(&statuses)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        rows.into_iter()
            .map(|row| Instance::try_from(row).map_err(Into::into))
            .collect()
    }

    async fn user_has_instance(&self, user_id: Uuid) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as(r#"SELECT count(*) FROM whatsapp_instances WHERE user_id = $1"#)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Sqlx)?;
        Ok(row.map(|(n,)| n > 0).unwrap_or(false))
    }
}

/// In-memory [`InstanceRegistry`] used by tests (mirrors the teacher's
/// `MemoryStore` pattern).
#[derive(Default)]
pub struct MemoryRegistry {
    rows: std::sync::RwLock<std::collections::HashMap<Uuid, Instance>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRegistry for MemoryRegistry {
    async fn insert(&self, new: NewInstance) -> Result<Instance> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        if rows
            .values()
            .any(|i| i.instance_name == new.instance_name)
        {
            return Err(crate::error::ConflictError::NameTaken(new.instance_name).into());
        }
        if rows.values().any(|i| i.user_id == new.user_id) {
            return Err(crate::error::ConflictError::UserHasInstance(new.user_id).into());
        }
        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            instance_name: new.instance_name,
            webhook_url: new.webhook_url,
            is_connected: false,
            connection_status: ConnectionStatus::Connecting,
            qr_code: None,
            qr_code_expires_at: None,
            owner_phone_number: None,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
        };
        rows.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn select_by_id(&self, id: Uuid) -> Result<Option<Instance>> {
        Ok(self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn select_by_name(&self, instance_name: &str) -> Result<Option<Instance>> {
        Ok(self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .values()
            .find(|i| i.instance_name == instance_name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let mut all: Vec<Instance> = self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn update(&self, id: Uuid, update: InstanceUpdate) -> Result<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        let instance = rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Load(format!("instance {id} not found")))?;
        if let Some(status) = update.connection_status {
            instance.connection_status = status;
        }
        if let Some(connected) = update.is_connected {
            instance.is_connected = connected;
        }
        if let Some(qr) = update.qr_code {
            instance.qr_code = qr;
        }
        if let Some(expires) = update.qr_code_expires_at {
            instance.qr_code_expires_at = expires;
        }
        if let Some(phone) = update.owner_phone_number {
            instance.owner_phone_number = phone;
        }
        if let Some(at) = update.last_connected_at {
            instance.last_connected_at = at;
        }
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.rows
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .remove(&id);
        Ok(())
    }

    async fn select_where_status_in(
        &self,
        statuses: &[ConnectionStatus],
        limit: usize,
    ) -> Result<Vec<Instance>> {
        let mut matching: Vec<Instance> = self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .values()
            .filter(|i| statuses.contains(&i.connection_status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.last_connected_at.cmp(&b.last_connected_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn user_has_instance(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .values()
            .any(|i| i.user_id == user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_instance(name: &str) -> NewInstance {
        NewInstance {
            user_id: Uuid::new_v4(),
            instance_name: name.to_string(),
            webhook_url: "https://example.com/hook".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_starts_in_connecting_status() {
        let reg = MemoryRegistry::new();
        let instance = reg.insert(new_instance("vendas-01")).await.unwrap();
        assert_eq!(instance.connection_status, ConnectionStatus::Connecting);
        assert!(!instance.is_connected);
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let reg = MemoryRegistry::new();
        reg.insert(new_instance("dup")).await.unwrap();
        let err = reg.insert(new_instance("dup")).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Conflict(crate::error::ConflictError::NameTaken(_))
        ));
    }

    #[tokio::test]
    async fn second_instance_for_same_user_is_conflict() {
        let reg = MemoryRegistry::new();
        let user_id = Uuid::new_v4();
        reg.insert(NewInstance {
            user_id,
            instance_name: "one".into(),
            webhook_url: "https://example.com".into(),
        })
        .await
        .unwrap();
        let err = reg
            .insert(NewInstance {
                user_id,
                instance_name: "two".into(),
                webhook_url: "https://example.com".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Conflict(crate::error::ConflictError::UserHasInstance(_))
        ));
    }

    #[tokio::test]
    async fn select_where_status_in_orders_and_caps() {
        let reg = MemoryRegistry::new();
        for i in 0..10 {
            let instance = reg.insert(new_instance(&format!("inst-{i}"))).await.unwrap();
            reg.update(
                instance.id,
                InstanceUpdate::default().status(ConnectionStatus::Connected),
            )
            .await
            .unwrap();
        }
        let recovered = reg
            .select_where_status_in(&[ConnectionStatus::Connected, ConnectionStatus::Connecting], 5)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 5);
    }

    #[tokio::test]
    async fn update_unknown_id_errors() {
        let reg = MemoryRegistry::new();
        let err = reg
            .update(Uuid::new_v4(), InstanceUpdate::default())
            .await;
        assert!(err.is_err());
    }
}
