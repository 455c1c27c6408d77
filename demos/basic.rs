//! Minimal demo: create one fleet instance against the in-memory fake
//! protocol client and print every lifecycle event it goes through.
//!
//! Run with: `cargo run --bin basic-demo` (not wired as a package target —
//! copy into `src/bin/` if you want to run it).

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use whatsapp_fleet::fleet::Fleet;
use whatsapp_fleet::protocol::fake::FakeProtocolClient;
use whatsapp_fleet::protocol::ProtocolEvent;
use whatsapp_fleet::store::registry::MemoryRegistry;
use whatsapp_fleet::store::session_repo::MemorySessionRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let protocol = Arc::new(FakeProtocolClient::new());
    let fleet = Fleet::new(
        Arc::new(MemoryRegistry::new()),
        Arc::new(MemorySessionRepository::new()),
        protocol.clone(),
        80,
        Duration::from_millis(500),
    );

    let instance = fleet
        .create_instance(
            Uuid::new_v4(),
            "demo-instance".into(),
            "https://n8n.example.com/hook".into(),
        )
        .await?;
    println!("created instance {} in status {:?}", instance.id, instance.connection_status);

    tokio::time::sleep(Duration::from_millis(20)).await;
    protocol
        .inject(
            "demo-instance",
            ProtocolEvent::Qr {
                challenge: "1@abc,def,ghi".into(),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (qr, status) = fleet.get_qr(instance.id).await?;
    println!("status: {status:?}, qr present: {}", qr.is_some());

    fleet.shutdown().await;
    Ok(())
}
