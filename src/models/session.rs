use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// FIFO of strings where popping an empty queue yields `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoginQueue(VecDeque<String>);

impl LoginQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any queued entries and replaces them with `items`, in order.
    pub fn replace<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0 = items.into_iter().map(Into::into).collect();
    }

    pub fn push(&mut self, item: impl Into<String>) {
        self.0.push_back(item.into());
    }

    pub fn pop(&mut self) -> String {
        self.0.pop_front().unwrap_or_default()
    }

    pub fn peek(&self) -> Option<&str> {
        self.0.front().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for LoginQueue {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Server-side record of a browser's login progress.
///
/// While a login is pending `login_urls` holds one more entry than
/// `login_with_providers`: the trailing entry is the application redirect
/// consumed by the final step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub token_ids: Vec<String>,
    #[serde(default)]
    pub login_with_providers: LoginQueue,
    #[serde(default)]
    pub login_urls: LoginQueue,
    #[serde(default)]
    pub code_verifiers: LoginQueue,
}

impl Session {
    pub fn new(ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            expires_at: Utc::now() + ttl,
            token_ids: Vec::new(),
            login_with_providers: LoginQueue::new(),
            login_urls: LoginQueue::new(),
            code_verifiers: LoginQueue::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn pop_provider_id(&mut self) -> String {
        self.login_with_providers.pop()
    }

    pub fn pop_login_url(&mut self) -> String {
        self.login_urls.pop()
    }

    pub fn pop_code_verifier(&mut self) -> String {
        self.code_verifiers.pop()
    }

    pub fn add_token_id(&mut self, token_id: impl Into<String>) {
        self.token_ids.push(token_id.into());
    }

    /// True while at least one provider step is outstanding.
    pub fn login_pending(&self) -> bool {
        !self.login_with_providers.is_empty()
    }
}
