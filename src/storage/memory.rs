use super::{PersistenceBackend, StorageError, StorageResult, keys};
use crate::models::{OauthToken, Session, TokenKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

/// Score-ordered set with unique members.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove_if_score(&mut self, score: i64, member: &str) -> bool {
        if self.scores.get(member) != Some(&score) {
            return false;
        }
        self.scores.remove(member);
        self.ordered.remove(&(score, member.to_string()))
    }

    fn range(&self, min: i64, max: i64) -> Vec<(String, i64)> {
        if min > max {
            return Vec::new();
        }
        self.ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }
}

/// In-process backend with the same observable semantics as Redis.
///
/// Selected with `persistence.backend = "mock"`; also the test double.
#[derive(Default)]
pub struct MemoryBackend {
    sessions: DashMap<String, Session>,
    tokens: DashMap<String, OauthToken>,
    sorted_sets: DashMap<String, SortedSet>,
    claims: DashMap<String, DateTime<Utc>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired_sessions(&self) {
        self.sessions.retain(|_, session| !session.is_expired());
    }

    fn purge_expired_claims(&self, now: DateTime<Utc>) {
        self.claims.retain(|_, expires_at| *expires_at > now);
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let key = keys::session(id);
        let Some(session) = self.sessions.get(&key).map(|entry| entry.clone()) else {
            return Ok(None);
        };

        if session.is_expired() {
            self.sessions.remove(&key);
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn set_session(&self, session: &Session) -> StorageResult<()> {
        self.purge_expired_sessions();
        self.sessions
            .insert(keys::session(&session.id), session.clone());
        Ok(())
    }

    async fn remove_session(&self, id: &str) -> StorageResult<()> {
        self.sessions.remove(&keys::session(id));
        Ok(())
    }

    async fn get_token(&self, kind: TokenKind, id: &str) -> StorageResult<Option<OauthToken>> {
        Ok(self
            .tokens
            .get(&keys::token(kind, id))
            .map(|entry| entry.clone()))
    }

    async fn set_token(&self, token: &OauthToken) -> StorageResult<()> {
        self.tokens
            .insert(keys::token(token.kind, &token.id), token.clone());
        Ok(())
    }

    async fn remove_token(&self, kind: TokenKind, id: &str) -> StorageResult<()> {
        self.tokens.remove(&keys::token(kind, id));
        Ok(())
    }

    async fn zadd(&self, set: &str, score: i64, member: &str) -> StorageResult<()> {
        self.sorted_sets
            .entry(set.to_string())
            .or_default()
            .insert(score, member);
        Ok(())
    }

    async fn zrem_if_score(&self, set: &str, score: i64, member: &str) -> StorageResult<bool> {
        Ok(self
            .sorted_sets
            .get_mut(set)
            .map(|mut sorted| sorted.remove_if_score(score, member))
            .unwrap_or(false))
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: i64,
        max: i64,
    ) -> StorageResult<Vec<(String, i64)>> {
        Ok(self
            .sorted_sets
            .get(set)
            .map(|sorted| sorted.range(min, max))
            .unwrap_or_default())
    }

    async fn try_claim(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::InvalidData(format!("claim ttl out of range: {e}")))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| StorageError::InvalidData("claim ttl out of range".to_string()))?;

        self.purge_expired_claims(now);
        match self.claims.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, key: &str) -> StorageResult<()> {
        self.claims.remove(key);
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_session_round_trip_and_removal() {
        let backend = MemoryBackend::new();
        let mut session = Session::new(ChronoDuration::hours(1));
        session.add_token_id("t1");
        session.login_urls.replace(["http://idp/login", "http://app"]);

        backend.set_session(&session).await.unwrap();
        assert_eq!(backend.get_session(&session.id).await.unwrap(), Some(session.clone()));

        backend.remove_session(&session.id).await.unwrap();
        backend.remove_session(&session.id).await.unwrap();
        assert_eq!(backend.get_session(&session.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_session_is_absent() {
        let backend = MemoryBackend::new();
        let mut session = Session::new(ChronoDuration::hours(1));
        session.expires_at = Utc::now() - ChronoDuration::seconds(1);
        backend.set_session(&session).await.unwrap();

        assert!(backend.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_access_and_refresh_halves_are_independent() {
        let backend = MemoryBackend::new();
        let access = OauthToken::access("t1", "a", None, "http://idp/token", "renku");
        let refresh = OauthToken::refresh("t1", "r", "http://idp/token", "renku");
        backend.set_token(&access).await.unwrap();
        backend.set_token(&refresh).await.unwrap();

        backend.remove_token(TokenKind::Access, "t1").await.unwrap();
        assert!(backend.get_token(TokenKind::Access, "t1").await.unwrap().is_none());
        assert_eq!(
            backend.get_token(TokenKind::Refresh, "t1").await.unwrap(),
            Some(refresh)
        );
    }

    #[tokio::test]
    async fn test_sorted_set_range_is_inclusive_and_ordered() {
        let backend = MemoryBackend::new();
        backend.zadd("idx", 30, "c").await.unwrap();
        backend.zadd("idx", 10, "a").await.unwrap();
        backend.zadd("idx", 20, "b").await.unwrap();
        backend.zadd("idx", 41, "d").await.unwrap();

        let range = backend.zrange_by_score("idx", 10, 40).await.unwrap();
        assert_eq!(
            range,
            vec![
                ("a".to_string(), 10),
                ("b".to_string(), 20),
                ("c".to_string(), 30)
            ]
        );
        assert!(backend.zrange_by_score("idx", 50, 40).await.unwrap().is_empty());
        assert!(backend.zrange_by_score("missing", 0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_readding_member_moves_score() {
        let backend = MemoryBackend::new();
        backend.zadd("idx", 10, "a").await.unwrap();
        backend.zadd("idx", 99, "a").await.unwrap();

        assert!(backend.zrange_by_score("idx", 0, 50).await.unwrap().is_empty());
        assert_eq!(
            backend.zrange_by_score("idx", 0, 100).await.unwrap(),
            vec![("a".to_string(), 99)]
        );
    }

    #[tokio::test]
    async fn test_conditional_remove() {
        let backend = MemoryBackend::new();
        backend.zadd("idx", 10, "a").await.unwrap();

        assert!(!backend.zrem_if_score("idx", 11, "a").await.unwrap());
        assert!(backend.zrem_if_score("idx", 10, "a").await.unwrap());
        assert!(!backend.zrem_if_score("idx", 10, "a").await.unwrap());
        assert!(backend.zrange_by_score("idx", 0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_until_released_or_expired() {
        let backend = MemoryBackend::new();
        assert!(backend.try_claim("k", Duration::from_secs(60)).await.unwrap());
        assert!(!backend.try_claim("k", Duration::from_secs(60)).await.unwrap());

        backend.release_claim("k").await.unwrap();
        assert!(backend.try_claim("k", Duration::from_secs(0)).await.unwrap());
        // zero ttl expires immediately
        assert!(backend.try_claim("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_released_and_expired_claims_are_dropped() {
        let backend = MemoryBackend::new();
        for score in 0..100 {
            let key = keys::refresh_claim("t1", score);
            assert!(backend.try_claim(&key, Duration::from_secs(60)).await.unwrap());
            backend.release_claim(&key).await.unwrap();
        }
        assert!(backend.claims.is_empty());

        for score in 0..100 {
            let key = keys::refresh_claim("t2", score);
            assert!(backend.try_claim(&key, Duration::from_secs(0)).await.unwrap());
        }
        // each claim drops the already expired ones before inserting
        assert_eq!(backend.claims.len(), 1);

        assert!(backend.try_claim("held", Duration::from_secs(60)).await.unwrap());
        assert!(backend.claims.contains_key("held"));
        assert!(!backend.claims.contains_key(&keys::refresh_claim("t2", 99)));
    }

    #[tokio::test]
    async fn test_expired_sessions_are_pruned_on_write() {
        let backend = MemoryBackend::new();
        for _ in 0..10 {
            let mut stale = Session::new(ChronoDuration::hours(1));
            stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
            backend.set_session(&stale).await.unwrap();
        }
        let live = Session::new(ChronoDuration::hours(1));
        backend.set_session(&live).await.unwrap();

        assert_eq!(backend.sessions.len(), 1);
        assert_eq!(backend.get_session(&live.id).await.unwrap(), Some(live));
    }
}
