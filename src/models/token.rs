use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TokenKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(TokenKind::Access),
            "refresh" => Ok(TokenKind::Refresh),
            other => Err(format!("unknown token kind '{other}'")),
        }
    }
}

/// One half of a token pair. Both halves share `id`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OauthToken {
    pub id: String,
    pub value: String,
    /// Refresh tokens usually carry no expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider token endpoint, also the refresh target
    pub token_url: String,
    pub provider_id: String,
    pub kind: TokenKind,
}

impl OauthToken {
    pub fn access(
        id: impl Into<String>,
        value: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
        token_url: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            expires_at,
            token_url: token_url.into(),
            provider_id: provider_id.into(),
            kind: TokenKind::Access,
        }
    }

    pub fn refresh(
        id: impl Into<String>,
        value: impl Into<String>,
        token_url: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            expires_at: None,
            token_url: token_url.into(),
            provider_id: provider_id.into(),
            kind: TokenKind::Refresh,
        }
    }

    /// Expiry as the epoch-seconds score used by the expiry index.
    pub fn expiry_score(&self) -> Option<i64> {
        self.expires_at.map(|at| at.timestamp())
    }
}

impl fmt::Debug for OauthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OauthToken")
            .field("id", &self.id)
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("token_url", &self.token_url)
            .field("provider_id", &self.provider_id)
            .field("kind", &self.kind)
            .finish()
    }
}
