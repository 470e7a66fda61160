//! Single-use CSRF state for provider redirects.
//!
//! Every redirect to a provider gets a fresh random `state` and OIDC `nonce`.
//! Their SHA-256 hashes travel in the provider URL while the raw values are
//! sealed with AES-256-GCM into the `<prefix>_csrf` cookie, together with an
//! expiry. A callback is accepted only if the echoed state hashes to the
//! value inside the cookie that is still unexpired.

use chrono::{Duration, Utc};
use cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::CsrfConfig,
    crypto::{CryptoError, SecretCipher, random_token, sha256_b64},
};

const STATE_BYTES: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsrfError {
    #[error("CSRF cookie is malformed")]
    Malformed,
    #[error("CSRF cookie has expired")]
    Expired,
    #[error("CSRF crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// The attempt state sealed inside the CSRF cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCsrf {
    state: String,
    nonce: String,
    /// Epoch seconds
    expires_at: i64,
}

impl LoginCsrf {
    /// Sent to the provider as the OAuth `state` parameter.
    pub fn state_hash(&self) -> String {
        sha256_b64(&self.state)
    }

    /// Sent to the provider as the OIDC `nonce` parameter.
    pub fn nonce_hash(&self) -> String {
        sha256_b64(&self.nonce)
    }

    pub fn check_state(&self, echoed: &str) -> bool {
        !echoed.is_empty() && self.state_hash() == echoed
    }

    pub fn check_nonce(&self, echoed: &str) -> bool {
        !echoed.is_empty() && self.nonce_hash() == echoed
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().timestamp()
    }
}

/// A freshly issued attempt plus the sealed cookie value carrying it.
#[derive(Debug, Clone)]
pub struct IssuedCsrf {
    pub csrf: LoginCsrf,
    pub cookie_value: String,
}

pub struct CsrfProtocol {
    config: CsrfConfig,
    cipher: SecretCipher,
    secure: bool,
}

impl CsrfProtocol {
    pub fn new(config: CsrfConfig, secure: bool) -> Result<Self, CsrfError> {
        let cipher = SecretCipher::new(config.secret.as_bytes())?;
        Ok(Self {
            config,
            cipher,
            secure,
        })
    }

    pub fn cookie_name(&self) -> String {
        self.config.cookie_name()
    }

    pub fn issue(&self) -> Result<IssuedCsrf, CsrfError> {
        let ttl = Duration::minutes(self.config.ttl_minutes as i64);
        let csrf = LoginCsrf {
            state: random_token(STATE_BYTES),
            nonce: random_token(STATE_BYTES),
            expires_at: (Utc::now() + ttl).timestamp(),
        };

        let payload = serde_json::to_vec(&csrf).map_err(|_| CsrfError::Malformed)?;
        let cookie_value = self.cipher.seal(&payload)?;
        Ok(IssuedCsrf { csrf, cookie_value })
    }

    /// Opens a cookie value. Expired cookies are rejected.
    pub fn load(&self, cookie_value: &str) -> Result<LoginCsrf, CsrfError> {
        let payload = self.cipher.open(cookie_value)?;
        let csrf: LoginCsrf =
            serde_json::from_slice(&payload).map_err(|_| CsrfError::Malformed)?;

        if csrf.is_expired() {
            return Err(CsrfError::Expired);
        }
        Ok(csrf)
    }

    /// True only for an unexpired cookie whose state (and nonce, when echoed) match.
    pub fn validate(&self, cookie_value: &str, state: &str, nonce: Option<&str>) -> bool {
        match self.load(cookie_value) {
            Ok(csrf) => csrf.check_state(state) && nonce.is_none_or(|n| csrf.check_nonce(n)),
            Err(_) => false,
        }
    }

    pub fn cookie(&self, value: String, host: Option<&str>) -> Cookie<'static> {
        let mut builder = Cookie::build((self.cookie_name(), value))
            .path(self.config.path.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(cookie::time::Duration::minutes(self.config.ttl_minutes as i64));

        if let Some(domain) = select_cookie_domain(&self.config.domains, host) {
            builder = builder.domain(domain);
        }
        builder.build()
    }

    pub fn removal_cookie(&self, host: Option<&str>) -> Cookie<'static> {
        let mut builder = Cookie::build((self.cookie_name(), ""))
            .path(self.config.path.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(cookie::time::Duration::ZERO);

        if let Some(domain) = select_cookie_domain(&self.config.domains, host) {
            builder = builder.domain(domain);
        }
        builder.build()
    }
}

/// Picks the configured domain the request host belongs to.
///
/// No match means no `Domain` attribute, so the browser scopes the cookie to
/// the exact host.
pub fn select_cookie_domain(domains: &[String], host: Option<&str>) -> Option<String> {
    let host = host?.split(':').next()?.to_ascii_lowercase();

    domains
        .iter()
        .find(|domain| {
            let bare = domain.trim_start_matches('.').to_ascii_lowercase();
            host == bare || host.ends_with(&format!(".{bare}"))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> CsrfProtocol {
        let config = CsrfConfig {
            name_prefix: "_test".to_string(),
            secret: "0123456789abcdef0123456789abcdef".to_string(),
            domains: vec![".example.org".to_string(), "other.net".to_string()],
            path: "/".to_string(),
            ttl_minutes: 5,
        };
        CsrfProtocol::new(config, true).unwrap()
    }

    #[test]
    fn test_issue_then_validate() {
        let protocol = protocol();
        let issued = protocol.issue().unwrap();

        assert!(protocol.validate(&issued.cookie_value, &issued.csrf.state_hash(), None));
        assert!(protocol.validate(
            &issued.cookie_value,
            &issued.csrf.state_hash(),
            Some(&issued.csrf.nonce_hash())
        ));
    }

    #[test]
    fn test_cookie_from_one_step_fails_against_the_next() {
        let protocol = protocol();
        let step1 = protocol.issue().unwrap();
        let step2 = protocol.issue().unwrap();

        assert!(!protocol.validate(&step1.cookie_value, &step2.csrf.state_hash(), None));
        assert!(!protocol.validate(
            &step1.cookie_value,
            &step1.csrf.state_hash(),
            Some(&step2.csrf.nonce_hash())
        ));
        assert!(!protocol.validate(&step2.cookie_value, &step1.csrf.state_hash(), None));
    }

    #[test]
    fn test_raw_state_is_not_accepted() {
        let protocol = protocol();
        let issued = protocol.issue().unwrap();
        assert!(!protocol.validate(&issued.cookie_value, &issued.csrf.state, None));
        assert!(!protocol.validate(&issued.cookie_value, "", None));
    }

    #[test]
    fn test_expired_cookie_fails() {
        let protocol = protocol();
        let mut csrf = protocol.issue().unwrap().csrf;
        csrf.expires_at = Utc::now().timestamp() - 1;
        let sealed = protocol
            .cipher
            .seal(&serde_json::to_vec(&csrf).unwrap())
            .unwrap();

        assert_eq!(protocol.load(&sealed).unwrap_err(), CsrfError::Expired);
        assert!(!protocol.validate(&sealed, &csrf.state_hash(), None));
    }

    #[test]
    fn test_cookie_sealed_with_other_secret_fails() {
        let protocol = protocol();
        let mut config = protocol.config.clone();
        config.secret = "fedcba9876543210fedcba9876543210".to_string();
        let foreign = CsrfProtocol::new(config, true).unwrap().issue().unwrap();

        assert!(!protocol.validate(&foreign.cookie_value, &foreign.csrf.state_hash(), None));
        assert!(protocol.load("not-a-cookie").is_err());
    }

    #[test]
    fn test_cookie_attributes() {
        let protocol = protocol();
        let cookie = protocol.cookie("value".to_string(), Some("app.example.org:8443"));

        assert_eq!(cookie.name(), "_test_csrf");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.domain(), Some("example.org"));
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::minutes(5)));

        let removal = protocol.removal_cookie(None);
        assert_eq!(removal.value(), "");
        assert_eq!(removal.max_age(), Some(cookie::time::Duration::ZERO));
        assert_eq!(removal.domain(), None);
    }

    #[test]
    fn test_select_cookie_domain() {
        let domains = vec![".example.org".to_string(), "other.net".to_string()];
        assert_eq!(
            select_cookie_domain(&domains, Some("other.net")),
            Some("other.net".to_string())
        );
        assert_eq!(
            select_cookie_domain(&domains, Some("a.b.example.org")),
            Some(".example.org".to_string())
        );
        assert_eq!(select_cookie_domain(&domains, Some("notexample.org")), None);
        assert_eq!(select_cookie_domain(&domains, None), None);
    }
}
