use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, StorageBackend};
use crate::db::{self, registry::PgRegistry};
use crate::engine::{BatchEngine, EngineError};
use crate::services::{
    recognition::{Credential, GeminiClient, RecognitionError},
    registry::{DuplicateRegistry, MemoryRegistry},
    storage::{ImageStore, LocalStore, R2Store, StorageError},
};

/// Collaborators shared by the binaries.
#[derive(Clone)]
pub struct AppState {
    /// Present only when `DATABASE_URL` is configured.
    pub db: Option<PgPool>,
    pub store: Arc<dyn ImageStore>,
    pub engine: Arc<BatchEngine>,
}

impl AppState {
    /// Connect to the configured backends and assemble the batch engine.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let store: Arc<dyn ImageStore> = match config.storage_backend {
            StorageBackend::Local => {
                let local = LocalStore::new(
                    &config.success_dir,
                    &config.failed_dir,
                    &config.pending_dir,
                );
                local.ensure_dirs().await?;
                Arc::new(local)
            }
            StorageBackend::R2 => {
                let missing = || StorageError::Config("R2 settings are incomplete".into());
                Arc::new(R2Store::new(
                    config.r2_bucket.as_deref().ok_or_else(missing)?,
                    config.r2_endpoint.as_deref().ok_or_else(missing)?,
                    config.r2_access_key.as_deref().ok_or_else(missing)?,
                    config.r2_secret_key.as_deref().ok_or_else(missing)?,
                )?)
            }
        };

        let (db, registry): (Option<PgPool>, Arc<dyn DuplicateRegistry>) =
            match config.database_url.as_deref() {
                Some(url) => {
                    tracing::info!("Connecting to PostgreSQL");
                    let pool = db::init_pool(url).await?;
                    tracing::info!("Running database migrations");
                    db::run_migrations(&pool).await?;
                    (Some(pool.clone()), Arc::new(PgRegistry::new(pool)))
                }
                None => {
                    tracing::warn!("DATABASE_URL not set, duplicate registry is in-memory only");
                    (None, Arc::new(MemoryRegistry::new()))
                }
            };

        let recognizer =
            GeminiClient::new(Duration::from_secs(config.request_timeout_secs))?;
        let engine = BatchEngine::new(
            config.engine_settings(),
            Arc::new(recognizer),
            Credential::from_keys(&config.api_keys()),
            registry,
            store.clone(),
        )?;

        Ok(Self {
            db,
            store,
            engine: Arc::new(engine),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Storage setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Database setup failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Recognition client setup failed: {0}")]
    Recognition(#[from] RecognitionError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
