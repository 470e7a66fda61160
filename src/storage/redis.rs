use super::{PersistenceBackend, StorageError, StorageResult, keys};
use crate::{
    config::RedisConfig,
    models::{LoginQueue, OauthToken, Session, TokenKind},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, RedisResult, Script, aio::ConnectionManager};
use std::{collections::HashMap, future::Future, time::Duration};
use tokio::time::timeout;

const ZREM_IF_SCORE: &str = r"
local current = redis.call('ZSCORE', KEYS[1], ARGV[2])
if current and tonumber(current) == tonumber(ARGV[1]) then
  return redis.call('ZREM', KEYS[1], ARGV[2])
end
return 0
";

/// Redis backend: sessions and tokens as hashes, the expiry index as a sorted set.
pub struct RedisBackend {
    connection: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
    zrem_script: Script,
}

impl RedisBackend {
    pub async fn new(config: &RedisConfig) -> StorageResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StorageError::Connection(format!("Redis client error: {e}")))?;

        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StorageError::Connection(format!("Redis connection error: {e}")))?;

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_seconds),
            zrem_script: Script::new(ZREM_IF_SCORE),
        })
    }

    fn key(&self, logical: &str) -> String {
        format!("{}{}", self.key_prefix, logical)
    }

    async fn run<T, F>(&self, op: &str, command: F) -> StorageResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        timeout(self.command_timeout, command)
            .await
            .map_err(|_| StorageError::Redis("Command timeout".to_string()))?
            .map_err(|e| StorageError::Redis(format!("Redis {op} error: {e}")))
    }

    async fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        let mut conn = self.connection.clone();
        self.run("HGETALL", async { conn.hgetall(key).await }).await
    }

    async fn del(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.connection.clone();
        self.run("DEL", async { conn.del(key).await }).await
    }
}

fn to_json(values: &LoginQueue) -> StorageResult<String> {
    serde_json::to_string(values)
        .map_err(|e| StorageError::Serialization(format!("Serialization error: {e}")))
}

fn from_json<T: for<'de> serde::Deserialize<'de> + Default>(
    fields: &HashMap<String, String>,
    name: &str,
) -> StorageResult<T> {
    match fields.get(name) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
            .map_err(|e| StorageError::Serialization(format!("Field '{name}': {e}"))),
        _ => Ok(T::default()),
    }
}

fn parse_time(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("bad timestamp '{raw}': {e}")))
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> StorageResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StorageError::InvalidData(format!("missing field '{name}'")))
}

fn session_fields(session: &Session) -> StorageResult<Vec<(&'static str, String)>> {
    Ok(vec![
        ("id", session.id.clone()),
        ("expiresAt", session.expires_at.to_rfc3339()),
        (
            "tokenIds",
            serde_json::to_string(&session.token_ids)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        ),
        ("loginWithProviders", to_json(&session.login_with_providers)?),
        ("loginURLs", to_json(&session.login_urls)?),
        ("codeVerifiers", to_json(&session.code_verifiers)?),
    ])
}

fn session_from_fields(fields: &HashMap<String, String>) -> StorageResult<Session> {
    Ok(Session {
        id: required(fields, "id")?.to_string(),
        expires_at: parse_time(required(fields, "expiresAt")?)?,
        token_ids: from_json(fields, "tokenIds")?,
        login_with_providers: from_json(fields, "loginWithProviders")?,
        login_urls: from_json(fields, "loginURLs")?,
        code_verifiers: from_json(fields, "codeVerifiers")?,
    })
}

fn token_fields(token: &OauthToken) -> Vec<(&'static str, String)> {
    vec![
        ("id", token.id.clone()),
        ("value", token.value.clone()),
        (
            "expiresAt",
            token
                .expires_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        ),
        ("tokenURL", token.token_url.clone()),
        ("providerID", token.provider_id.clone()),
        ("type", token.kind.to_string()),
    ]
}

fn token_from_fields(fields: &HashMap<String, String>) -> StorageResult<OauthToken> {
    let expires_at = match required(fields, "expiresAt")? {
        "" => None,
        raw => Some(parse_time(raw)?),
    };
    let kind = required(fields, "type")?
        .parse::<TokenKind>()
        .map_err(StorageError::InvalidData)?;

    Ok(OauthToken {
        id: required(fields, "id")?.to_string(),
        value: required(fields, "value")?.to_string(),
        expires_at,
        token_url: required(fields, "tokenURL")?.to_string(),
        provider_id: required(fields, "providerID")?.to_string(),
        kind,
    })
}

#[async_trait]
impl PersistenceBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let fields = self.hgetall(&self.key(&keys::session(id))).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let session = session_from_fields(&fields)?;
        if session.is_expired() {
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn set_session(&self, session: &Session) -> StorageResult<()> {
        let key = self.key(&keys::session(&session.id));
        let fields = session_fields(session)?;
        let mut conn = self.connection.clone();

        self.run("HSET", async {
            redis::pipe()
                .atomic()
                .del(&key)
                .ignore()
                .hset_multiple(&key, fields.as_slice())
                .ignore()
                .expire_at(&key, session.expires_at.timestamp())
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn remove_session(&self, id: &str) -> StorageResult<()> {
        self.del(&self.key(&keys::session(id))).await
    }

    async fn get_token(&self, kind: TokenKind, id: &str) -> StorageResult<Option<OauthToken>> {
        let fields = self.hgetall(&self.key(&keys::token(kind, id))).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        token_from_fields(&fields).map(Some)
    }

    async fn set_token(&self, token: &OauthToken) -> StorageResult<()> {
        let key = self.key(&keys::token(token.kind, &token.id));
        let fields = token_fields(token);
        let mut conn = self.connection.clone();

        self.run("HSET", async { conn.hset_multiple(&key, fields.as_slice()).await })
            .await
    }

    async fn remove_token(&self, kind: TokenKind, id: &str) -> StorageResult<()> {
        self.del(&self.key(&keys::token(kind, id))).await
    }

    async fn zadd(&self, set: &str, score: i64, member: &str) -> StorageResult<()> {
        let key = self.key(set);
        let mut conn = self.connection.clone();
        self.run("ZADD", async { conn.zadd(&key, member, score).await })
            .await
    }

    async fn zrem_if_score(&self, set: &str, score: i64, member: &str) -> StorageResult<bool> {
        let key = self.key(set);
        let mut conn = self.connection.clone();
        let mut invocation = self.zrem_script.prepare_invoke();
        invocation.key(&key).arg(score).arg(member);

        let removed: i64 = self
            .run("ZREM", async { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: i64,
        max: i64,
    ) -> StorageResult<Vec<(String, i64)>> {
        let key = self.key(set);
        let mut conn = self.connection.clone();
        let members: Vec<(String, f64)> = self
            .run("ZRANGEBYSCORE", async {
                conn.zrangebyscore_withscores(&key, min, max).await
            })
            .await?;

        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn try_claim(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let key = self.key(key);
        let seconds = ttl.as_secs().max(1);
        let mut conn = self.connection.clone();

        let reply: Option<String> = self
            .run("SET NX", async {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(Utc::now().timestamp())
                    .arg("NX")
                    .arg("EX")
                    .arg(seconds)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn release_claim(&self, key: &str) -> StorageResult<()> {
        self.del(&self.key(key)).await
    }

    async fn ping(&self) -> StorageResult<()> {
        let mut conn = self.connection.clone();
        let _: String = self
            .run("PING", async { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}
