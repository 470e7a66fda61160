use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
    crypto::CryptoError,
    health::{HealthCheckResult, HealthChecker},
    models::{OauthToken, Session, TokenKind},
};

pub mod expiry_index;
pub mod factory;
pub mod memory;
pub mod redis;
pub mod sessions;
pub mod tokens;

pub use expiry_index::{ExpiryIndex, ExpiryIndexEntry};
pub use factory::StorageFactory;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use sessions::SessionStore;
pub use tokens::TokenStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Encryption error: {0}")]
    Encryption(#[from] CryptoError),
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Logical key layout shared by every backend.
pub mod keys {
    use crate::models::TokenKind;

    pub const EXPIRY_INDEX: &str = "indexExpiringTokens";

    pub fn session(id: &str) -> String {
        format!("session-{id}")
    }

    pub fn token(kind: TokenKind, id: &str) -> String {
        match kind {
            TokenKind::Access => format!("accessTokens-{id}"),
            TokenKind::Refresh => format!("refreshTokens-{id}"),
        }
    }

    pub fn project_tokens(project_id: &str) -> String {
        format!("projectTokens-{project_id}")
    }

    pub fn refresh_claim(token_id: &str, expiry_score: i64) -> String {
        format!("refreshClaim-{token_id}-{expiry_score}")
    }
}

/// Persistence capability behind the session store, token store and expiry index.
///
/// Sorted sets follow Redis semantics: a member appears at most once and
/// re-adding it moves it to the new score.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>>;
    async fn set_session(&self, session: &Session) -> StorageResult<()>;
    /// Idempotent
    async fn remove_session(&self, id: &str) -> StorageResult<()>;

    async fn get_token(&self, kind: TokenKind, id: &str) -> StorageResult<Option<OauthToken>>;
    async fn set_token(&self, token: &OauthToken) -> StorageResult<()>;
    /// Idempotent
    async fn remove_token(&self, kind: TokenKind, id: &str) -> StorageResult<()>;

    async fn zadd(&self, set: &str, score: i64, member: &str) -> StorageResult<()>;
    /// Removes `member` only while it is still stored at `score`.
    async fn zrem_if_score(&self, set: &str, score: i64, member: &str) -> StorageResult<bool>;
    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(
        &self,
        set: &str,
        min: i64,
        max: i64,
    ) -> StorageResult<Vec<(String, i64)>>;

    /// Sets `key` only if absent. Returns whether this caller now holds it.
    async fn try_claim(&self, key: &str, ttl: Duration) -> StorageResult<bool>;
    async fn release_claim(&self, key: &str) -> StorageResult<()>;

    async fn ping(&self) -> StorageResult<()>;
}

/// Reports whether the persistence backend answers.
pub struct PersistenceHealthChecker {
    backend: Arc<dyn PersistenceBackend>,
}

impl PersistenceHealthChecker {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl HealthChecker for PersistenceHealthChecker {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.backend.ping().await {
            Ok(()) => HealthCheckResult::healthy_with_details(serde_json::json!({
                "backend": self.backend.name()
            })),
            Err(e) => HealthCheckResult::unhealthy_with_details(
                "Persistence backend unreachable".to_string(),
                serde_json::json!({
                    "backend": self.backend.name(),
                    "error": e.to_string()
                }),
            ),
        }
    }
}
