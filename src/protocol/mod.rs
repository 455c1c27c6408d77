//! The upstream WhatsApp protocol client boundary.
//!
//! Out of scope per spec.md §1: the real Noise handshake, binary XML node
//! encoding and Signal double-ratchet live in `crate::socket`, `crate::binary`
//! and `crate::pairing` (kept from the teacher crate as the `full`-feature
//! production transport). Everything in *this* module is the trait the core
//! — `supervisor::Supervisor` and `fleet::Fleet` — actually depends on, so it
//! can be tested against [`fake::FakeProtocolClient`] without a network
//! (spec.md §9, "Protocol library boundary").

pub mod fake;
#[cfg(feature = "full")]
pub mod real;

use async_trait::async_trait;

use crate::error::{ConnectionError, Result};
use crate::store::session::Creds;

/// Socket identity observed on a successful `connection=open` event: the
/// portion of the socket's user id before the `:` is the phone number
/// (spec.md §4.B).
#[derive(Debug, Clone)]
pub struct SocketIdentity {
    pub user_id: String,
}

impl SocketIdentity {
    pub fn phone_number(&self) -> &str {
        self.user_id
            .split(':')
            .next()
            .unwrap_or(self.user_id.as_str())
    }
}

/// Events the protocol client delivers for one open session.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// A QR challenge string to render and show for pairing.
    Qr { challenge: String },
    /// The connection is authenticated and usable.
    ConnectionOpen { identity: SocketIdentity },
    /// The connection closed; `reason` distinguishes a terminal logout from
    /// a transient disconnect that should be retried.
    ConnectionClose { reason: ConnectFailureReason },
    /// Credentials rotated and must be persisted.
    CredsUpdate { creds: Creds },
}

/// Disconnect reason reported on a close event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureReason {
    LoggedOut,
    Other,
}

impl ConnectFailureReason {
    pub fn is_logged_out(self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

/// A (major, minor, patch) protocol version, as returned by
/// `fetch_latest_version` and consulted on every socket construction.
pub type ProtocolVersion = (u32, u32, u32);

/// A live, owned socket. Dropping or calling [`SocketHandle::close`] tears
/// down the underlying transport without any lifecycle side effects — used
/// by the Supervisor on `close()` and by the Coordinator on shutdown.
#[async_trait]
pub trait SocketHandle: Send + Sync {
    async fn close(&self);
}

/// Configuration passed to [`ProtocolClient::open`].
#[derive(Debug, Clone)]
pub struct OpenConfig {
    pub instance_name: String,
    pub version: ProtocolVersion,
}

/// The upstream protocol library's contract, as consumed by the core
/// (spec.md §9). A production implementation wraps a real socket factory; a
/// test implementation ([`fake::FakeProtocolClient`]) lets tests inject
/// synthetic QR/open/close events deterministically and without I/O.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open a socket for `config.instance_name` using the given credentials.
    /// Returns an event receiver and a handle used to close the socket later.
    async fn open(
        &self,
        config: OpenConfig,
        creds: Creds,
    ) -> Result<(
        tokio::sync::mpsc::UnboundedReceiver<ProtocolEvent>,
        Box<dyn SocketHandle>,
    )>;

    /// Fetch the current protocol version from the upstream library. Callers
    /// should consult [`crate::admission::Admission`]'s 1h cache rather than
    /// calling this directly on every socket construction.
    async fn fetch_latest_version(&self) -> Result<ProtocolVersion>;
}

/// Structured form of an `app-state-sync-key` value, lifted out of its raw
/// bytes per spec.md §4.A ("For the `app-state-sync-key` category, the
/// decoded value must additionally be lifted into the protocol library's
/// structured form").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStateSyncKeyData {
    pub key_id: Vec<u8>,
    pub key_data: Vec<u8>,
    pub fingerprint: Vec<u8>,
    pub timestamp: i64,
}

/// Decode raw app-state-sync-key bytes into their structured form. The real
/// protocol library decodes a protobuf message here; this is a stable,
/// length-prefixed stand-in that the [`fake`] client also uses, so tests
/// don't need a real protobuf toolchain.
pub fn decode_app_state_sync_key(bytes: &[u8]) -> Result<AppStateSyncKeyData> {
    // layout: key_id (32) || fingerprint (32) || timestamp (i64 BE) || key_data (rest)
    if bytes.len() < 32 + 32 + 8 {
        return Err(ConnectionError::WebSocket("app-state-sync-key too short".into()).into());
    }
    let key_id = bytes[0..32].to_vec();
    let fingerprint = bytes[32..64].to_vec();
    let timestamp = i64::from_be_bytes(bytes[64..72].try_into().unwrap());
    let key_data = bytes[72..].to_vec();
    Ok(AppStateSyncKeyData {
        key_id,
        key_data,
        fingerprint,
        timestamp,
    })
}

/// Inverse of [`decode_app_state_sync_key`], used by the fake client and by
/// tests constructing fixtures.
pub fn encode_app_state_sync_key(data: &AppStateSyncKeyData) -> Vec<u8> {
    let mut out = Vec::with_capacity(72 + data.key_data.len());
    out.extend_from_slice(&data.key_id);
    out.extend_from_slice(&data.fingerprint);
    out.extend_from_slice(&data.timestamp.to_be_bytes());
    out.extend_from_slice(&data.key_data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_number_strips_device_suffix() {
        let id = SocketIdentity {
            user_id: "5511999999999:42@s.whatsapp.net".to_string(),
        };
        assert_eq!(id.phone_number(), "5511999999999");
    }

    #[test]
    fn app_state_sync_key_roundtrip() {
        let data = AppStateSyncKeyData {
            key_id: vec![1u8; 32],
            key_data: vec![9, 9, 9],
            fingerprint: vec![2u8; 32],
            timestamp: 1_700_000_000,
        };
        let bytes = encode_app_state_sync_key(&data);
        let decoded = decode_app_state_sync_key(&bytes).unwrap();
        assert_eq!(decoded, data);
    }
}
