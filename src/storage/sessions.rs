use super::{PersistenceBackend, StorageResult};
use crate::models::Session;
use std::sync::Arc;

/// Canonical copy of every browser session.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn PersistenceBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    /// Expired sessions are reported as absent.
    pub async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        if id.is_empty() {
            return Ok(None);
        }
        self.backend.get_session(id).await
    }

    pub async fn set_session(&self, session: &Session) -> StorageResult<()> {
        self.backend.set_session(session).await
    }

    pub async fn remove_session(&self, id: &str) -> StorageResult<()> {
        self.backend.remove_session(id).await
    }
}
