//! Proactive renewal of access tokens that are about to expire.
//!
//! Every run reads the expiry index for `[now, now + window]` and trades each
//! candidate's refresh token for a new pair. A candidate is claimed before
//! the refresh call with a marker keyed by token ID and expiry score, so a
//! token is refreshed at most once per expiry even when several gateway
//! replicas sweep the same window. Failures stay local to their candidate.

use super::{Job, JobResult};
use crate::{
    config::Config,
    error::AppError,
    models::OauthToken,
    storage::{ExpiryIndexEntry, StorageError, TokenStore, keys},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("No configured provider '{0}' to refresh with")]
    UnknownProvider(String),
    #[error("Refresh request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed refresh response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Deserialize)]
struct RefreshGrantResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Epoch seconds, sent by GitLab
    #[serde(default)]
    created_at: Option<i64>,
}

/// New token values returned by a refresh grant.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// `None` when the provider keeps the current refresh token valid
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

/// Performs `grant_type=refresh_token` against a token's stored endpoint.
#[derive(Clone)]
pub struct RefreshGrantClient {
    http: reqwest::Client,
    credentials: HashMap<String, ClientCredentials>,
    default_expiry_seconds: i64,
}

impl RefreshGrantClient {
    pub fn new(config: &Config) -> Result<Self, RefreshError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(
                config.refresh.request_timeout_seconds,
            ))
            .build()?;

        let credentials = config
            .providers
            .iter()
            .map(|(id, provider)| {
                (
                    id.clone(),
                    ClientCredentials {
                        client_id: provider.client_id.clone(),
                        client_secret: provider.client_secret.clone(),
                    },
                )
            })
            .collect();

        Ok(Self {
            http,
            credentials,
            default_expiry_seconds: i64::try_from(config.refresh.default_expiry_seconds)
                .unwrap_or(i64::MAX),
        })
    }

    pub async fn refresh(&self, refresh: &OauthToken) -> Result<RefreshedTokens, RefreshError> {
        let credentials = self
            .credentials
            .get(&refresh.provider_id)
            .ok_or_else(|| RefreshError::UnknownProvider(refresh.provider_id.clone()))?;

        let response = self
            .http
            .post(&refresh.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.value.as_str()),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RefreshError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let grant: RefreshGrantResponse = serde_json::from_str(&body)
            .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;
        if grant.access_token.is_empty() {
            return Err(RefreshError::MalformedResponse(
                "empty access_token".to_string(),
            ));
        }

        let expires_at = match (grant.expires_in, grant.created_at) {
            (Some(expires_in), Some(created_at)) => {
                DateTime::from_timestamp(created_at.saturating_add(expires_in), 0)
            }
            (Some(expires_in), None) => expires_after(expires_in),
            (None, _) => expires_after(self.default_expiry_seconds),
        }
        .ok_or_else(|| RefreshError::MalformedResponse("expiry out of range".to_string()))?;

        Ok(RefreshedTokens {
            access_token: grant.access_token,
            expires_at,
            refresh_token: grant.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}

fn expires_after(seconds: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(seconds).and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Refreshed,
    Skipped(&'static str),
}

#[derive(Debug, Default)]
struct SweepSummary {
    refreshed: u64,
    skipped: u64,
    failed: u64,
}

pub struct TokenRefreshJob {
    tokens: TokenStore,
    client: RefreshGrantClient,
    window: Duration,
}

impl TokenRefreshJob {
    pub fn new(tokens: TokenStore, client: RefreshGrantClient, window: Duration) -> Self {
        Self {
            tokens,
            client,
            window,
        }
    }

    pub fn from_config(tokens: TokenStore, config: &Config) -> Result<Self, RefreshError> {
        Ok(Self::new(
            tokens,
            RefreshGrantClient::new(config)?,
            Duration::minutes(config.refresh.interval_minutes as i64),
        ))
    }

    async fn sweep(&self) -> Result<SweepSummary, StorageError> {
        let now = Utc::now();
        let candidates = self
            .tokens
            .index()
            .expiring_between(now, now + self.window)
            .await?;
        debug!(candidates = candidates.len(), "Token refresh sweep started");

        let mut summary = SweepSummary::default();
        for entry in candidates {
            match self.refresh_candidate(&entry).await {
                Ok(Outcome::Refreshed) => summary.refreshed += 1,
                Ok(Outcome::Skipped(reason)) => {
                    debug!(token_id = %entry.token_id, reason, "Skipped refresh candidate");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(token_id = %entry.token_id, error = %e, "Failed to refresh token");
                    summary.failed += 1;
                }
            }
        }

        info!(
            refreshed = summary.refreshed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Token refresh sweep finished"
        );
        Ok(summary)
    }

    async fn refresh_candidate(&self, entry: &ExpiryIndexEntry) -> Result<Outcome, RefreshError> {
        let backend = self.tokens.backend();
        let claim = keys::refresh_claim(&entry.token_id, entry.expires_at);
        let claim_ttl = self
            .window
            .to_std()
            .map_err(|e| StorageError::InvalidData(format!("invalid refresh window: {e}")))?;

        if !backend.try_claim(&claim, claim_ttl).await? {
            return Ok(Outcome::Skipped("claimed by another sweep"));
        }

        let result = self.refresh_claimed(entry).await;
        if result.is_err() {
            // let the next sweep retry this expiry
            if let Err(e) = backend.release_claim(&claim).await {
                warn!(token_id = %entry.token_id, error = %e, "Failed to release refresh claim");
            }
        }
        result
    }

    async fn refresh_claimed(&self, entry: &ExpiryIndexEntry) -> Result<Outcome, RefreshError> {
        let Some(access) = self.tokens.get_access_token(&entry.token_id).await? else {
            self.tokens
                .index()
                .remove(entry.expires_at, &entry.token_id)
                .await?;
            return Ok(Outcome::Skipped("access token missing, dropped stale index entry"));
        };

        if access.expiry_score() != Some(entry.expires_at) {
            return Ok(Outcome::Skipped("already refreshed"));
        }

        let refresh = match self.tokens.get_refresh_token(&entry.token_id).await? {
            Some(refresh) if !refresh.value.is_empty() => refresh,
            _ => return Ok(Outcome::Skipped("refresh token missing")),
        };

        let refreshed = self.client.refresh(&refresh).await?;

        let new_access = OauthToken {
            value: refreshed.access_token,
            expires_at: Some(refreshed.expires_at),
            ..access
        };
        let new_refresh = OauthToken {
            value: refreshed.refresh_token.unwrap_or(refresh.value.clone()),
            ..refresh
        };

        self.tokens.set_refresh_token(&new_refresh).await?;
        self.tokens.set_access_token(&new_access).await?;
        if new_access.expiry_score() != Some(entry.expires_at) {
            self.tokens
                .index()
                .remove(entry.expires_at, &entry.token_id)
                .await?;
        }

        debug!(
            token_id = %entry.token_id,
            provider_id = %new_access.provider_id,
            expires_at = %refreshed.expires_at,
            "Refreshed token"
        );
        Ok(Outcome::Refreshed)
    }
}

#[async_trait]
impl Job for TokenRefreshJob {
    fn name(&self) -> &str {
        "token_refresh"
    }

    fn interval(&self) -> std::time::Duration {
        self.window
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60))
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let summary = self.sweep().await?;
        Ok(JobResult {
            success: true,
            message: format!(
                "Refreshed {} tokens ({} skipped, {} failed)",
                summary.refreshed, summary.skipped, summary.failed
            ),
            items_processed: summary.refreshed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ProviderConfig,
        storage::{MemoryBackend, PersistenceBackend},
    };
    use std::sync::Arc;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, method, path},
    };

    fn config() -> Config {
        let mut config = Config::default();
        config.providers.insert(
            "renku".to_string(),
            ProviderConfig {
                kind: "oidc".to_string(),
                client_id: "gateway".to_string(),
                client_secret: "s3cret".to_string(),
                authorization_url: "http://idp/authorize".to_string(),
                token_url: "http://idp/token".to_string(),
                scopes: vec![],
                use_pkce: false,
            },
        );
        config
    }

    struct Fixture {
        job: TokenRefreshJob,
        tokens: TokenStore,
        backend: Arc<MemoryBackend>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let tokens = TokenStore::new(backend.clone(), None);
        let job = TokenRefreshJob::from_config(tokens.clone(), &config()).unwrap();
        Fixture {
            job,
            tokens,
            backend,
        }
    }

    /// Stores a pair expiring `in_secs` from now, returns the expiry score.
    async fn store_pair(tokens: &TokenStore, id: &str, token_url: &str, in_secs: i64) -> i64 {
        let expires_at = DateTime::from_timestamp(Utc::now().timestamp() + in_secs, 0).unwrap();
        tokens
            .set_access_token(&OauthToken::access(
                id,
                format!("{id}-access"),
                Some(expires_at),
                token_url,
                "renku",
            ))
            .await
            .unwrap();
        tokens
            .set_refresh_token(&OauthToken::refresh(
                id,
                format!("{id}-refresh"),
                token_url,
                "renku",
            ))
            .await
            .unwrap();
        expires_at.timestamp()
    }

    async fn mount_success(server: &MockServer, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("client_id=gateway"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "token_type": "bearer",
                "expires_in": 7200,
                "refresh_token": "new-refresh"
            })))
            .expect(expect)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_sweep_refreshes_expiring_token() {
        let server = MockServer::start().await;
        mount_success(&server, 1).await;
        let f = fixture();
        let token_url = format!("{}/token", server.uri());
        let old_score = store_pair(&f.tokens, "t1", &token_url, 60).await;

        let result = f.job.execute().await.unwrap();
        assert_eq!(result.items_processed, 1);

        let access = f.tokens.get_access_token("t1").await.unwrap().unwrap();
        assert_eq!(access.value, "new-access");
        assert!(access.expiry_score().unwrap() > old_score);
        let refresh = f.tokens.get_refresh_token("t1").await.unwrap().unwrap();
        assert_eq!(refresh.value, "new-refresh");

        let entries = f.tokens.index().entries(i64::MIN, i64::MAX).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].token_id, "t1");
        assert_eq!(Some(entries[0].expires_at), access.expiry_score());
        assert!(f.tokens.index().range_by_score(old_score, old_score).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tokens_outside_window_are_left_alone() {
        let server = MockServer::start().await;
        mount_success(&server, 0).await;
        let f = fixture();
        let token_url = format!("{}/token", server.uri());
        store_pair(&f.tokens, "later", &token_url, 3600).await;
        store_pair(&f.tokens, "expired", &token_url, -60).await;

        let result = f.job.execute().await.unwrap();
        assert_eq!(result.items_processed, 0);
        assert_eq!(
            f.tokens.get_access_token("later").await.unwrap().unwrap().value,
            "later-access"
        );
    }

    #[tokio::test]
    async fn test_claimed_candidate_is_skipped() {
        let server = MockServer::start().await;
        mount_success(&server, 0).await;
        let f = fixture();
        let score = store_pair(&f.tokens, "t1", &format!("{}/token", server.uri()), 60).await;

        assert!(
            f.backend
                .try_claim(
                    &keys::refresh_claim("t1", score),
                    std::time::Duration::from_secs(60)
                )
                .await
                .unwrap()
        );

        let summary = f.job.sweep().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.refreshed, 0);
    }

    #[tokio::test]
    async fn test_second_sweep_does_not_refresh_again() {
        let server = MockServer::start().await;
        mount_success(&server, 1).await;
        let f = fixture();
        store_pair(&f.tokens, "t1", &format!("{}/token", server.uri()), 60).await;

        assert_eq!(f.job.sweep().await.unwrap().refreshed, 1);
        // the new expiry lies beyond the window
        assert_eq!(f.job.sweep().await.unwrap().refreshed, 0);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .expect(2)
            .mount(&server)
            .await;
        mount_success(&server, 1).await;

        let f = fixture();
        let broken_score =
            store_pair(&f.tokens, "broken", &format!("{}/broken", server.uri()), 30).await;
        store_pair(&f.tokens, "ok", &format!("{}/token", server.uri()), 60).await;

        let summary = f.job.sweep().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.refreshed, 1);

        let broken = f.tokens.get_access_token("broken").await.unwrap().unwrap();
        assert_eq!(broken.value, "broken-access");
        assert_eq!(
            f.tokens.index().range_by_score(broken_score, broken_score).await.unwrap(),
            vec!["broken"]
        );

        // the claim was released, so the next sweep tries again
        let summary = f.job.sweep().await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_skipped() {
        let f = fixture();
        let expires_at = DateTime::from_timestamp(Utc::now().timestamp() + 60, 0);
        let access = OauthToken::access("t1", "v", expires_at, "http://idp/token", "renku");
        f.tokens.set_access_token(&access).await.unwrap();

        let summary = f.job.sweep().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_stale_index_entry_is_dropped() {
        let f = fixture();
        let score = Utc::now().timestamp() + 60;
        f.tokens.index().add(score, "ghost").await.unwrap();

        let summary = f.job.sweep().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(f.tokens.index().range_by_score(score, score).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_grant_expiry_rules() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/created"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a",
                "expires_in": 100,
                "created_at": 1_700_000_000
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/default"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = RefreshGrantClient::new(&config()).unwrap();
        let token =
            |p: &str| OauthToken::refresh("t", "r", format!("{}/{p}", server.uri()), "renku");

        let created = client.refresh(&token("created")).await.unwrap();
        assert_eq!(created.expires_at.timestamp(), 1_700_000_100);
        assert!(created.refresh_token.is_none());

        let defaulted = client.refresh(&token("default")).await.unwrap();
        assert!(defaulted.expires_at - Utc::now() > Duration::hours(7));

        assert!(matches!(
            client.refresh(&token("garbage")).await,
            Err(RefreshError::MalformedResponse(_))
        ));

        let unknown = OauthToken::refresh("t", "r", format!("{}/created", server.uri()), "gitlab");
        assert!(matches!(
            client.refresh(&unknown).await,
            Err(RefreshError::UnknownProvider(id)) if id == "gitlab"
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_fails_candidate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a",
                "expires_in": 10_000_000_000_000_i64
            })))
            .mount(&server)
            .await;
        let f = fixture();
        let score = store_pair(&f.tokens, "t1", &format!("{}/token", server.uri()), 60).await;

        let summary = f.job.sweep().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.refreshed, 0);
        assert_eq!(
            f.tokens.get_access_token("t1").await.unwrap().unwrap().value,
            "t1-access"
        );
        assert_eq!(
            f.tokens.index().range_by_score(score, score).await.unwrap(),
            vec!["t1"]
        );

        let client = RefreshGrantClient::new(&config()).unwrap();
        let refresh = OauthToken::refresh("t", "r", format!("{}/token", server.uri()), "renku");
        assert!(matches!(
            client.refresh(&refresh).await,
            Err(RefreshError::MalformedResponse(msg)) if msg.contains("out of range")
        ));
    }
}
