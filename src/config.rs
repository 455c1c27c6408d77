//! Configuration types and CLI/environment parsing for the fleet manager.
//!
//! Every field can be set via command-line flag or the matching environment
//! variable; all but `database_url` have defaults matching spec.md §6.

use clap::{Parser, ValueEnum};
use secrecy::SecretString;

/// The environment the process is running in. Only affects log formatting.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Environment {
    Prod,
    Dev,
}

/// Process-wide configuration for the fleet manager.
#[derive(Parser, Debug)]
#[clap(name = "whatsapp-fleet")]
pub struct FleetConfig {
    /// Node environment, affects log formatting (compact in dev, JSON in prod).
    #[clap(long, env = "NODE_ENVIRONMENT", default_value = "prod")]
    pub environment: Environment,

    /// HTTP listen port.
    #[clap(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Postgres connection string backing the Instance Registry and Session State Store.
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: SecretString,

    /// Hard ceiling on concurrently owned instances.
    #[clap(long, env = "MAX_INSTANCES", default_value = "80")]
    pub max_instances: usize,

    /// Delay between cold-start recovery batches, in milliseconds.
    #[clap(long, env = "STAGGERED_BOOT_DELAY_MS", default_value = "500")]
    pub staggered_boot_delay_ms: u64,

    /// Retention window for the (out-of-scope) message log. Carried as a
    /// typed config field even though the core never reads it, per spec.md §6.
    #[clap(long, env = "MESSAGES_RETENTION_DAYS", default_value = "7")]
    pub messages_retention_days: u32,
}
