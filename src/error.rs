use thiserror::Error;
use uuid::Uuid;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the fleet manager.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("pairing: {0}")]
    Pairing(#[from] PairingError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("binary protocol: {0}")]
    Binary(String),

    #[error("not connected")]
    NotConnected,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("reconnection retry cap exceeded")]
    CapacityExhausted,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Connection-related errors (also doubles as the "ProtocolError" kind from
/// the spec: an upstream protocol failure that surfaces as a close event).
/// Finer-grained reasons for *why* a connection closed live on
/// [`crate::protocol::ConnectFailureReason`], at the protocol client
/// boundary, rather than duplicated here.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("disconnected")]
    Disconnected,
}

/// Pairing-related errors.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("invalid device identity HMAC")]
    InvalidDeviceIdentityHmac,

    #[error("invalid device signature")]
    InvalidDeviceSignature,

    #[error("protocol: {0}")]
    Protocol(String),
}

/// Store (session/registry) errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("save failed: {0}")]
    Save(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Unique-constraint and capacity conflicts raised by `Fleet::create_instance`.
#[derive(Error, Debug)]
pub enum ConflictError {
    #[error("instance name '{0}' is already taken")]
    NameTaken(String),

    #[error("user {0} already owns an instance")]
    UserHasInstance(Uuid),

    #[error("fleet is at capacity ({0} instances)")]
    CapacityExceeded(usize),
}

/// Unknown `instance_id` / `instance_name` lookups.
#[derive(Error, Debug)]
pub enum NotFoundError {
    #[error("instance {0} not found")]
    Instance(Uuid),

    #[error("session '{0}' not found")]
    Session(String),
}
