use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;

use crate::core::config::AppConfig;
use crate::core::shared::state::AppState;
use crate::core::shared::utils::{create_conn, run_migrations, DbPool};

/// `RUST_LOG` wins; otherwise `info`.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

/// Reads `.env` when present, then the process environment.
pub fn load_config() -> anyhow::Result<AppConfig> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!("Ignoring unreadable .env: {e}");
        }
    }
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    info!(
        "Server configured to listen on {}:{}",
        config.server.host, config.server.port
    );
    Ok(config)
}

pub fn init_database(config: &AppConfig) -> anyhow::Result<DbPool> {
    let pool = create_conn(&config.database).context("Failed to create database pool")?;
    info!("Running database migrations...");
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("Database migrations failed: {e}"))?;
    info!("Database migrations completed successfully");
    Ok(pool)
}

pub async fn create_app_state(config: AppConfig, pool: DbPool) -> anyhow::Result<Arc<AppState>> {
    #[cfg(feature = "drive")]
    let drive_config = config.drive.clone();

    #[allow(unused_mut)]
    let mut state = AppState::from_config(config, pool);

    #[cfg(feature = "drive")]
    {
        if let Some(drive_config) = drive_config {
            let store = crate::drive::s3::S3Store::connect(&drive_config)
                .await
                .context("Failed to initialize object storage")?;
            info!(
                "Object storage ready at {} (bucket {})",
                drive_config.server, drive_config.bucket
            );
            state.drive = Some(Arc::new(store));
        }
    }

    #[cfg(not(feature = "drive"))]
    {
        if state.config.drive.is_some() {
            warn!("DRIVE_* is set but this build has no drive feature; uploads will answer 503");
        }
    }

    if let Some(generator) = &state.llm {
        info!("Text generation via {}", generator.name());
    }

    Ok(Arc::new(state))
}
