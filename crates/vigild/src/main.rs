use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod account;
mod backup_code;
mod config;
mod dbus_interface;
mod engine;
mod password;
mod repository;
mod service;
mod store;

use account::{LockoutPolicy, SystemClock};
use backup_code::BackupCodeVault;
use config::Config;
use password::SecretHasher;
use service::AuthService;
use store::SqliteUserStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        max_failed_attempts = config.max_failed_attempts,
        lockout_secs = config.lockout.as_secs(),
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let engine = engine::load_engine(&config).context("failed to initialise face engine")?;
    tracing::info!(encoding_dims = engine.encoding_dims(), "face engine ready");

    let store = SqliteUserStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let vault = BackupCodeVault::open(&config.key_path()).context("failed to load backup code key")?;

    let policy = LockoutPolicy {
        max_failed_attempts: config.max_failed_attempts,
        lockout: chrono::Duration::from_std(config.lockout).context("lockout duration out of range")?,
    };
    let service = AuthService::new(
        engine,
        Arc::new(store),
        vault,
        SecretHasher::default(),
        Arc::new(SystemClock),
        policy,
    )
    .context("failed to prepare password hasher")?;

    let interface = dbus_interface::VigilService {
        service: Arc::new(service),
        session_bus: config.session_bus,
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name("org.freedesktop.Vigil1")?
        .serve_at("/org/freedesktop/Vigil1", interface)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        "vigild ready on org.freedesktop.Vigil1"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    Ok(())
}
