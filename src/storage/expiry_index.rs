use super::{PersistenceBackend, StorageResult, keys};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryIndexEntry {
    pub token_id: String,
    /// Epoch seconds
    pub expires_at: i64,
}

/// Access token IDs ordered by expiry, stored under `indexExpiringTokens`.
#[derive(Clone)]
pub struct ExpiryIndex {
    backend: Arc<dyn PersistenceBackend>,
}

impl ExpiryIndex {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    pub async fn add(&self, expires_at: i64, token_id: &str) -> StorageResult<()> {
        self.backend
            .zadd(keys::EXPIRY_INDEX, expires_at, token_id)
            .await
    }

    /// Drops the entry only if it is still at `expires_at`, so a newer
    /// entry written by a refresh is left alone.
    pub async fn remove(&self, expires_at: i64, token_id: &str) -> StorageResult<bool> {
        self.backend
            .zrem_if_score(keys::EXPIRY_INDEX, expires_at, token_id)
            .await
    }

    /// Token IDs expiring within `[start, stop]`, soonest first.
    pub async fn range_by_score(&self, start: i64, stop: i64) -> StorageResult<Vec<String>> {
        Ok(self
            .entries(start, stop)
            .await?
            .into_iter()
            .map(|entry| entry.token_id)
            .collect())
    }

    pub async fn entries(&self, start: i64, stop: i64) -> StorageResult<Vec<ExpiryIndexEntry>> {
        let members = self
            .backend
            .zrange_by_score(keys::EXPIRY_INDEX, start, stop)
            .await?;

        Ok(members
            .into_iter()
            .map(|(token_id, expires_at)| ExpiryIndexEntry {
                token_id,
                expires_at,
            })
            .collect())
    }

    pub async fn expiring_between(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> StorageResult<Vec<ExpiryIndexEntry>> {
        self.entries(start.timestamp(), stop.timestamp()).await
    }
}
