//! Session State Store Adapter (spec.md §4.A).
//!
//! `SessionHandle::open` is the `open(instance_name)` contract from the
//! spec: it returns the decoded `creds` document, and exposes
//! `get`/`set`/`save_creds`/`flush`/`remove_session` against the in-memory
//! `keys` map, coalescing writes into the durable store on a 500ms debounce
//! window (spec.md §9's "Debounce timers" design note).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{Result, StoreError};
use crate::protocol::{decode_app_state_sync_key, AppStateSyncKeyData};
use crate::store::codec::{self, from_buffer_json, to_buffer_json};
use crate::store::session_repo::SessionRepository;
use crate::types::Jid;

/// Coalescing window for `keys` writes (spec.md §4.A).
const DEBOUNCE: Duration = Duration::from_millis(500);

/// The protocol-level credential document. Byte-carrying fields round-trip
/// through the binary-aware codec so the whole struct serializes to/from
/// the tagged JSON shape stored in `whatsapp_sessions.creds`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Creds {
    pub registration_id: u32,
    #[serde(with = "codec::buffer_opt", default)]
    pub noise_key_pub: Option<Vec<u8>>,
    #[serde(with = "codec::buffer_opt", default)]
    pub noise_key_priv: Option<Vec<u8>>,
    #[serde(with = "codec::buffer_opt", default)]
    pub identity_key_pub: Option<Vec<u8>>,
    #[serde(with = "codec::buffer_opt", default)]
    pub identity_key_priv: Option<Vec<u8>>,
    #[serde(with = "codec::buffer_opt", default)]
    pub adv_secret_key: Option<Vec<u8>>,
    #[serde(with = "codec::buffer_opt", default)]
    pub account: Option<Vec<u8>>,
    pub me: Option<Jid>,
    pub platform: Option<String>,
}

impl Default for Creds {
    fn default() -> Self {
        Self {
            registration_id: 0,
            noise_key_pub: None,
            noise_key_priv: None,
            identity_key_pub: None,
            identity_key_priv: None,
            adv_secret_key: None,
            account: None,
            me: None,
            platform: None,
        }
    }
}

impl Creds {
    /// The protocol library's initializer (spec.md §4.A): a fresh Noise
    /// keypair, identity keypair, and adv secret, with a random
    /// `registration_id`. Used by [`SessionHandle::open`] when no row exists
    /// yet for an `instance_name`.
    pub fn generate() -> Self {
        let keys = crate::pairing::generate_pairing_keys();
        Self {
            registration_id: rand::random::<u32>() & 0x3FFF,
            noise_key_pub: Some(keys.noise_public.to_vec()),
            noise_key_priv: Some(keys.noise_private.to_vec()),
            identity_key_pub: Some(keys.identity_public.to_vec()),
            identity_key_priv: Some(keys.identity_private.to_vec()),
            adv_secret_key: Some(keys.adv_secret.to_vec()),
            account: None,
            me: None,
            platform: None,
        }
    }
}

/// One `key_store.set` patch entry: delete the compound key if `value` is
/// `None`, otherwise store it.
#[derive(Clone, Debug)]
pub struct KeyPatch {
    pub category: String,
    pub id: String,
    pub value: Option<Vec<u8>>,
}

/// Decoded value returned by `key_store.get`. Most categories decode to raw
/// bytes; `app-state-sync-key` is additionally lifted into its structured
/// form (spec.md §4.A).
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedKeyValue {
    Raw(Vec<u8>),
    AppStateSyncKey(AppStateSyncKeyData),
}

const APP_STATE_SYNC_KEY_CATEGORY: &str = "app-state-sync-key";

fn compound_key(category: &str, id: &str) -> String {
    format!("{category}-{id}")
}

fn encode_keys_json(keys: &HashMap<String, Vec<u8>>) -> Value {
    Value::Object(
        keys.iter()
            .map(|(k, v)| (k.clone(), to_buffer_json(v)))
            .collect(),
    )
}

fn decode_keys_json(value: &Value) -> Result<HashMap<String, Vec<u8>>> {
    if value.is_null() {
        return Ok(HashMap::new());
    }
    let obj = value
        .as_object()
        .ok_or_else(|| StoreError::Codec("keys document is not an object".into()))?;
    obj.iter()
        .map(|(k, v)| {
            from_buffer_json(v)
                .map(|bytes| (k.clone(), bytes))
                .map_err(StoreError::Codec)
        })
        .collect::<std::result::Result<_, _>>()
        .map_err(Into::into)
}

/// The open session handle for one `instance_name`: decoded `creds`, an
/// in-memory `keys` map, and the debounce timer coalescing writes to it.
pub struct SessionHandle {
    instance_name: String,
    repo: Arc<dyn SessionRepository>,
    creds: RwLock<Creds>,
    keys: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    pending_flush: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// `open(instance_name)`: load the row, or initialize fresh credentials
    /// if absent (spec.md §4.A).
    pub async fn open(repo: Arc<dyn SessionRepository>, instance_name: impl Into<String>) -> Result<Self> {
        let instance_name = instance_name.into();
        let (creds, keys) = match repo.load(&instance_name).await? {
            Some(row) if !row.creds.is_null() => {
                let creds: Creds = serde_json::from_value(row.creds)?;
                (creds, decode_keys_json(&row.keys)?)
            }
            Some(row) => (Creds::generate(), decode_keys_json(&row.keys)?),
            None => (Creds::generate(), HashMap::new()),
        };
        Ok(Self {
            instance_name,
            repo,
            creds: RwLock::new(creds),
            keys: Arc::new(RwLock::new(keys)),
            pending_flush: std::sync::Mutex::new(None),
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub async fn creds(&self) -> Creds {
        self.creds.read().await.clone()
    }

    /// `key_store.get(type, ids[])`.
    pub async fn get(&self, category: &str, ids: &[String]) -> HashMap<String, DecodedKeyValue> {
        let keys = self.keys.read().await;
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            let compound = compound_key(category, id);
            let Some(bytes) = keys.get(&compound) else {
                continue;
            };
            let decoded = if category == APP_STATE_SYNC_KEY_CATEGORY {
                match decode_app_state_sync_key(bytes) {
                    Ok(data) => DecodedKeyValue::AppStateSyncKey(data),
                    Err(_) => DecodedKeyValue::Raw(bytes.clone()),
                }
            } else {
                DecodedKeyValue::Raw(bytes.clone())
            };
            out.insert(id.clone(), decoded);
        }
        out
    }

    /// `key_store.set(patch)`. Completes before the debounced persistence
    /// does (spec.md §4.A).
    pub async fn set(&self, patch: Vec<KeyPatch>) {
        {
            let mut keys = self.keys.write().await;
            for entry in patch {
                let compound = compound_key(&entry.category, &entry.id);
                match entry.value {
                    Some(bytes) => {
                        keys.insert(compound, bytes);
                    }
                    None => {
                        keys.remove(&compound);
                    }
                }
            }
        }
        self.schedule_flush();
    }

    /// Reset the debounce window: abort any pending timer and spawn a fresh
    /// one that writes the latest `keys` snapshot after [`DEBOUNCE`].
    fn schedule_flush(&self) {
        let repo = self.repo.clone();
        let keys = self.keys.clone();
        let instance_name = self.instance_name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let snapshot = keys.read().await.clone();
            if let Err(err) = repo
                .upsert_keys(&instance_name, encode_keys_json(&snapshot))
                .await
            {
                tracing::warn!(instance = %instance_name, error = %err, "debounced keys write failed");
            }
        });
        let mut pending = self
            .pending_flush
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(old) = pending.replace(handle) {
            old.abort();
        }
    }

    /// `save_creds()`: upsert `creds` and the current `keys` snapshot in a
    /// single row write. Does not cancel a pending debounce timer (spec.md §9).
    pub async fn save_creds(&self, creds: Creds) -> Result<()> {
        *self.creds.write().await = creds.clone();
        let creds_json = serde_json::to_value(&creds)?;
        let keys_json = encode_keys_json(&*self.keys.read().await);
        self.repo
            .upsert(&self.instance_name, creds_json, keys_json)
            .await
    }

    /// Cancel every pending timer and issue the outstanding write synchronously.
    pub async fn flush(&self) -> Result<()> {
        let pending = self
            .pending_flush
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = pending {
            handle.abort();
        }
        let snapshot = self.keys.read().await.clone();
        self.repo
            .upsert_keys(&self.instance_name, encode_keys_json(&snapshot))
            .await
    }

    /// `remove_session(instance_name)`: cancel pending writes and delete the
    /// row. Safe to call when the row doesn't exist.
    pub async fn remove_session(&self) -> Result<()> {
        let pending = self
            .pending_flush
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = pending {
            handle.abort();
        }
        self.repo.delete(&self.instance_name).await
    }
}

/// Delete a session row directly, without an open [`SessionHandle`]. Used by
/// the Fleet Coordinator when deleting an instance it never had to reopen.
pub async fn remove_session(repo: &dyn SessionRepository, instance_name: &str) -> Result<()> {
    repo.delete(instance_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::session_repo::MemorySessionRepository;

    fn repo() -> Arc<dyn SessionRepository> {
        Arc::new(MemorySessionRepository::new())
    }

    #[tokio::test]
    async fn open_on_absent_row_produces_fresh_creds() {
        let handle = SessionHandle::open(repo(), "fresh").await.unwrap();
        let creds = handle.creds().await;
        assert!(creds.noise_key_pub.is_some());
        assert!(creds.identity_key_pub.is_some());
    }

    #[tokio::test]
    async fn set_then_get_roundtrips_bytes() {
        let handle = SessionHandle::open(repo(), "alice").await.unwrap();
        let blob = vec![0u8, 1, 2, 255, 254];
        handle
            .set(vec![KeyPatch {
                category: "pre-key".into(),
                id: "1".into(),
                value: Some(blob.clone()),
            }])
            .await;
        let got = handle.get("pre-key", &["1".to_string()]).await;
        match got.get("1") {
            Some(DecodedKeyValue::Raw(bytes)) => assert_eq!(bytes, &blob),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn set_null_value_deletes_key() {
        let handle = SessionHandle::open(repo(), "bob").await.unwrap();
        handle
            .set(vec![KeyPatch {
                category: "session".into(),
                id: "x".into(),
                value: Some(vec![1, 2, 3]),
            }])
            .await;
        handle
            .set(vec![KeyPatch {
                category: "session".into(),
                id: "x".into(),
                value: None,
            }])
            .await;
        let got = handle.get("session", &["x".to_string()]).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn app_state_sync_key_lifted_to_structured_form() {
        let handle = SessionHandle::open(repo(), "carol").await.unwrap();
        let data = AppStateSyncKeyData {
            key_id: vec![7u8; 32],
            fingerprint: vec![8u8; 32],
            timestamp: 42,
            key_data: vec![1, 2, 3],
        };
        let bytes = crate::protocol::encode_app_state_sync_key(&data);
        handle
            .set(vec![KeyPatch {
                category: APP_STATE_SYNC_KEY_CATEGORY.into(),
                id: "k1".into(),
                value: Some(bytes),
            }])
            .await;
        let got = handle
            .get(APP_STATE_SYNC_KEY_CATEGORY, &["k1".to_string()])
            .await;
        match got.get("k1") {
            Some(DecodedKeyValue::AppStateSyncKey(decoded)) => assert_eq!(decoded, &data),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn debounce_coalesces_many_sets_into_one_write() {
        tokio::time::pause();
        let r = Arc::new(MemorySessionRepository::new());
        let handle = SessionHandle::open(r.clone(), "debounced").await.unwrap();
        for i in 0..100u32 {
            handle
                .set(vec![KeyPatch {
                    category: "pre-key".into(),
                    id: i.to_string(),
                    value: Some(vec![i as u8]),
                }])
                .await;
        }
        tokio::time::advance(DEBOUNCE * 2).await;
        tokio::task::yield_now().await;
        let row = r.load("debounced").await.unwrap().unwrap();
        let keys = decode_keys_json(&row.keys).unwrap();
        assert_eq!(keys.len(), 100);
    }

    #[tokio::test]
    async fn save_creds_persists_both_fields() {
        let r = Arc::new(MemorySessionRepository::new());
        let handle = SessionHandle::open(r.clone(), "dave").await.unwrap();
        handle
            .set(vec![KeyPatch {
                category: "pre-key".into(),
                id: "1".into(),
                value: Some(vec![1, 2, 3]),
            }])
            .await;
        let mut creds = handle.creds().await;
        creds.registration_id = 99;
        handle.save_creds(creds).await.unwrap();
        let row = r.load("dave").await.unwrap().unwrap();
        let creds: Creds = serde_json::from_value(row.creds).unwrap();
        assert_eq!(creds.registration_id, 99);
    }

    #[tokio::test]
    async fn remove_session_on_unknown_name_succeeds() {
        let handle = SessionHandle::open(repo(), "ghost").await.unwrap();
        assert!(handle.remove_session().await.is_ok());
    }
}
