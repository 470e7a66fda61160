use super::{ExpiryIndex, PersistenceBackend, StorageError, StorageResult, keys};
use crate::{
    crypto::SecretCipher,
    models::{OauthToken, TokenKind},
};
use std::sync::Arc;
use tracing::debug;

/// Access and refresh token records, optionally encrypted at rest.
///
/// Writing an access token with an expiry also indexes it. The token record
/// is always written before the index entry.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn PersistenceBackend>,
    index: ExpiryIndex,
    cipher: Option<SecretCipher>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn PersistenceBackend>, cipher: Option<SecretCipher>) -> Self {
        Self {
            index: ExpiryIndex::new(backend.clone()),
            backend,
            cipher,
        }
    }

    pub fn index(&self) -> &ExpiryIndex {
        &self.index
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    fn seal(&self, token: &OauthToken) -> StorageResult<OauthToken> {
        let mut stored = token.clone();
        if let Some(cipher) = &self.cipher {
            stored.value = cipher.seal_str(&token.value)?;
        }
        Ok(stored)
    }

    fn open(&self, mut stored: OauthToken) -> StorageResult<OauthToken> {
        if let Some(cipher) = &self.cipher {
            stored.value = cipher.open_str(&stored.value)?;
        }
        Ok(stored)
    }

    async fn set_token(&self, expected: TokenKind, token: &OauthToken) -> StorageResult<()> {
        if token.kind != expected {
            return Err(StorageError::InvalidData(format!(
                "expected a {expected} token, got {}",
                token.kind
            )));
        }
        self.backend.set_token(&self.seal(token)?).await
    }

    async fn get_token(&self, kind: TokenKind, id: &str) -> StorageResult<Option<OauthToken>> {
        match self.backend.get_token(kind, id).await? {
            Some(stored) => self.open(stored).map(Some),
            None => Ok(None),
        }
    }

    async fn get_tokens(&self, kind: TokenKind, ids: &[String]) -> StorageResult<Vec<OauthToken>> {
        let mut tokens = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(token) = self.get_token(kind, id).await? {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    pub async fn set_access_token(&self, token: &OauthToken) -> StorageResult<()> {
        self.set_token(TokenKind::Access, token).await?;
        if let Some(score) = token.expiry_score() {
            self.index.add(score, &token.id).await?;
        }
        Ok(())
    }

    pub async fn set_refresh_token(&self, token: &OauthToken) -> StorageResult<()> {
        self.set_token(TokenKind::Refresh, token).await
    }

    pub async fn get_access_token(&self, id: &str) -> StorageResult<Option<OauthToken>> {
        self.get_token(TokenKind::Access, id).await
    }

    pub async fn get_refresh_token(&self, id: &str) -> StorageResult<Option<OauthToken>> {
        self.get_token(TokenKind::Refresh, id).await
    }

    /// Missing IDs are skipped.
    pub async fn get_access_tokens(&self, ids: &[String]) -> StorageResult<Vec<OauthToken>> {
        self.get_tokens(TokenKind::Access, ids).await
    }

    /// Missing IDs are skipped.
    pub async fn get_refresh_tokens(&self, ids: &[String]) -> StorageResult<Vec<OauthToken>> {
        self.get_tokens(TokenKind::Refresh, ids).await
    }

    pub async fn remove_access_token(&self, id: &str) -> StorageResult<()> {
        // the stored record is enough to learn the index score, no decryption needed
        let existing = self.backend.get_token(TokenKind::Access, id).await?;
        self.backend.remove_token(TokenKind::Access, id).await?;

        if let Some(score) = existing.and_then(|token| token.expiry_score()) {
            self.index.remove(score, id).await?;
        }
        Ok(())
    }

    pub async fn remove_refresh_token(&self, id: &str) -> StorageResult<()> {
        self.backend.remove_token(TokenKind::Refresh, id).await
    }

    pub async fn remove_access_tokens(&self, ids: &[String]) -> StorageResult<()> {
        for id in ids {
            self.remove_access_token(id).await?;
        }
        Ok(())
    }

    pub async fn remove_refresh_tokens(&self, ids: &[String]) -> StorageResult<()> {
        for id in ids {
            self.remove_refresh_token(id).await?;
        }
        Ok(())
    }

    /// Associates a token with a project, scored by the token's expiry.
    pub async fn add_project_token(
        &self,
        project_id: &str,
        token: &OauthToken,
    ) -> StorageResult<()> {
        debug!(project_id, token_id = %token.id, "Linking token to project");
        self.backend
            .zadd(
                &keys::project_tokens(project_id),
                token.expiry_score().unwrap_or(0),
                &token.id,
            )
            .await
    }

    pub async fn project_token_ids(&self, project_id: &str) -> StorageResult<Vec<String>> {
        let members = self
            .backend
            .zrange_by_score(&keys::project_tokens(project_id), i64::MIN, i64::MAX)
            .await?;
        Ok(members.into_iter().map(|(id, _)| id).collect())
    }

    pub async fn remove_project_token(
        &self,
        project_id: &str,
        token: &OauthToken,
    ) -> StorageResult<()> {
        self.backend
            .zrem_if_score(
                &keys::project_tokens(project_id),
                token.expiry_score().unwrap_or(0),
                &token.id,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::TokenKind, storage::MemoryBackend};
    use chrono::{DateTime, Utc};

    const KEY: &[u8] = b"abcdefghijklmnopqrstuvwxyz012345";

    fn expiry(secs: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(secs, 0)
    }

    fn store(encrypted: bool) -> (TokenStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let cipher = encrypted.then(|| SecretCipher::new(KEY).unwrap());
        (TokenStore::new(backend.clone(), cipher), backend)
    }

    #[tokio::test]
    async fn test_set_then_get_returns_same_value_and_expiry() {
        for encrypted in [false, true] {
            let (store, _) = store(encrypted);
            let token = OauthToken::access(
                "t1",
                "access-value",
                expiry(1_000),
                "http://idp/token",
                "renku",
            );
            store.set_access_token(&token).await.unwrap();

            let loaded = store.get_access_token("t1").await.unwrap().unwrap();
            assert_eq!(loaded.value, "access-value");
            assert_eq!(loaded.expires_at, token.expires_at);
        }
    }

    #[tokio::test]
    async fn test_encrypted_value_differs_at_rest() {
        let (store, backend) = store(true);
        let token = OauthToken::refresh("t1", "refresh-value", "http://idp/token", "renku");
        store.set_refresh_token(&token).await.unwrap();

        let raw = backend
            .get_token(TokenKind::Refresh, "t1")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(raw.value, "refresh-value");
        assert_eq!(
            store.get_refresh_token("t1").await.unwrap().unwrap().value,
            "refresh-value"
        );
    }

    #[tokio::test]
    async fn test_undecryptable_value_is_an_error() {
        let (plain, backend) = store(false);
        plain
            .set_refresh_token(&OauthToken::refresh("t1", "plaintext", "u", "p"))
            .await
            .unwrap();

        let encrypted = TokenStore::new(backend, Some(SecretCipher::new(KEY).unwrap()));
        assert!(matches!(
            encrypted.get_refresh_token("t1").await,
            Err(StorageError::Encryption(_))
        ));
    }

    #[tokio::test]
    async fn test_access_write_maintains_index() {
        let (store, _) = store(false);
        store
            .set_access_token(&OauthToken::access("t1", "v", expiry(100), "u", "p"))
            .await
            .unwrap();
        store
            .set_access_token(&OauthToken::access("t2", "v", None, "u", "p"))
            .await
            .unwrap();

        assert_eq!(store.index().range_by_score(0, 1_000).await.unwrap(), vec!["t1"]);

        store.remove_access_token("t1").await.unwrap();
        store.remove_access_token("t1").await.unwrap();
        assert!(store.index().range_by_score(0, 1_000).await.unwrap().is_empty());
        assert!(store.get_access_token("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_kind_rejected() {
        let (store, _) = store(false);
        let refresh = OauthToken::refresh("t1", "v", "u", "p");
        assert!(matches!(
            store.set_access_token(&refresh).await,
            Err(StorageError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_batched_reads_and_removes() {
        let (store, _) = store(true);
        for id in ["a", "b"] {
            let access = OauthToken::access(id, format!("{id}-access"), expiry(10), "u", "p");
            store.set_access_token(&access).await.unwrap();
            store
                .set_refresh_token(&OauthToken::refresh(id, format!("{id}-refresh"), "u", "p"))
                .await
                .unwrap();
        }

        let ids = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        let access = store.get_access_tokens(&ids).await.unwrap();
        assert_eq!(
            access.iter().map(|t| t.value.as_str()).collect::<Vec<_>>(),
            vec!["a-access", "b-access"]
        );

        store.remove_refresh_tokens(&ids).await.unwrap();
        assert!(store.get_refresh_tokens(&ids).await.unwrap().is_empty());
        assert_eq!(store.get_access_tokens(&ids).await.unwrap().len(), 2);

        store.remove_access_tokens(&ids).await.unwrap();
        assert!(store.get_access_tokens(&ids).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_project_tokens() {
        let (store, _) = store(false);
        let first = OauthToken::access("t1", "v", expiry(50), "u", "p");
        let second = OauthToken::access("t2", "v", expiry(20), "u", "p");
        store.add_project_token("proj", &first).await.unwrap();
        store.add_project_token("proj", &second).await.unwrap();

        assert_eq!(store.project_token_ids("proj").await.unwrap(), vec!["t2", "t1"]);

        store.remove_project_token("proj", &second).await.unwrap();
        assert_eq!(store.project_token_ids("proj").await.unwrap(), vec!["t1"]);
        assert!(store.project_token_ids("other").await.unwrap().is_empty());
    }
}
