use super::{MemoryBackend, PersistenceBackend, RedisBackend, StorageError, StorageResult};
use crate::config::PersistenceConfig;
use std::sync::Arc;
use tracing::info;

/// Persistence backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    Mock,
}

impl BackendKind {
    pub fn parse(name: &str) -> StorageResult<Self> {
        match name {
            "redis" => Ok(BackendKind::Redis),
            "mock" => Ok(BackendKind::Mock),
            other => Err(StorageError::InvalidData(format!(
                "unknown persistence backend '{other}'"
            ))),
        }
    }
}

/// Builds the persistence backend named in configuration
pub struct StorageFactory;

impl StorageFactory {
    pub async fn create_backend(
        config: &PersistenceConfig,
    ) -> StorageResult<Arc<dyn PersistenceBackend>> {
        match BackendKind::parse(&config.backend)? {
            BackendKind::Mock => {
                info!("Using in-memory persistence backend");
                Ok(Arc::new(MemoryBackend::new()))
            }
            BackendKind::Redis => {
                let backend = RedisBackend::new(&config.redis).await?;
                backend.ping().await?;
                info!("Connected to Redis persistence backend");
                Ok(Arc::new(backend))
            }
        }
    }
}
