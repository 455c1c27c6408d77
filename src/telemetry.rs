//! `tracing` initialization. Called once from `main`.

use crate::config::Environment;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. Compact text in dev, JSON in prod.
pub fn init(environment: Environment) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match environment {
        Environment::Dev => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
        Environment::Prod => {
            fmt().with_env_filter(filter).json().init();
        }
    }
}
