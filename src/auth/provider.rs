use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use oauth2::{
    AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, ExtraTokenFields, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl,
    RequestTokenError, Scope, StandardRevocableToken, StandardTokenResponse, TokenResponse,
    TokenUrl,
    basic::{
        BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
        BasicTokenType,
    },
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::csrf::LoginCsrf,
    config::{Config, ProviderConfig},
    crypto::random_token,
    models::OauthToken,
};

/// Bytes of entropy in a PKCE code verifier (128 URL-safe characters).
const CODE_VERIFIER_BYTES: usize = 96;

/// Applied when the provider omits `expires_in` on code redemption.
const DEFAULT_TOKEN_EXPIRY_SECONDS: i64 = 8 * 3600;

/// Token response fields beyond the OAuth2 core that OIDC providers send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

type Oauth2TokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

type Oauth2Client<HasAuthUrl = EndpointSet, HasTokenUrl = EndpointSet> = Client<
    BasicErrorResponse,
    Oauth2TokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    HasAuthUrl,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    HasTokenUrl,
>;

#[derive(Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    nonce: Option<String>,
}

/// Reads the `nonce` claim of an ID token. The signature is not checked.
fn id_token_nonce(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<IdTokenClaims>(&bytes).ok()?.nonce
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    NotFound(String),
    #[error("Identity provider reported an error: {0}")]
    Upstream(String),
    #[error("Authorization code missing from callback")]
    MissingCode,
    #[error("Callback state or ID token nonce does not match the login attempt")]
    CsrfMismatch,
    #[error("Token redemption failed: {0}")]
    Redemption(String),
    #[error("Invalid provider URL: {0}")]
    InvalidUrl(String),
}

/// Query parameters a provider sends back to the callback route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackRequest {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackRequest {
    /// The provider-reported error, with its description when present.
    pub fn upstream_error(&self) -> Option<String> {
        let error = self.error.as_deref().filter(|e| !e.is_empty())?;
        Some(match self.error_description.as_deref() {
            Some(description) if !description.is_empty() => format!("{error}: {description}"),
            _ => error.to_string(),
        })
    }
}

/// Access and refresh halves of one grant, sharing an ID.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: OauthToken,
    pub refresh: OauthToken,
}

/// One login URL per provider plus the trailing application redirect, and
/// one verifier per provider (empty for providers without PKCE).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginUrls {
    pub urls: Vec<String>,
    pub code_verifiers: Vec<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn uses_pkce(&self) -> bool;

    /// The provider's token endpoint, recorded on every token it issues.
    fn token_url(&self) -> &str;

    fn login_url(
        &self,
        callback_url: &str,
        state: &str,
        oidc_nonce_hash: &str,
        code_verifier: Option<&str>,
    ) -> Result<String, ProviderError>;

    async fn redeem_tokens(
        &self,
        request: &CallbackRequest,
        code_verifier: &str,
        callback_url: &str,
        csrf: &LoginCsrf,
    ) -> Result<TokenPair, ProviderError>;
}

pub trait ProviderStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<dyn Provider>>;

    /// Builds the login queue for `provider_ids`, in order. Any unknown ID
    /// rejects the whole batch.
    fn login_urls(
        &self,
        callback_url: &str,
        final_redirect_url: &str,
        oidc_nonce_hash: &str,
        state: &str,
        provider_ids: &[String],
    ) -> Result<LoginUrls, ProviderError> {
        let providers = provider_ids
            .iter()
            .map(|id| self.get(id).ok_or_else(|| ProviderError::NotFound(id.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut login_urls = LoginUrls::default();
        for provider in providers {
            let verifier = if provider.uses_pkce() {
                random_token(CODE_VERIFIER_BYTES)
            } else {
                String::new()
            };

            let url = provider.login_url(
                callback_url,
                state,
                oidc_nonce_hash,
                Some(verifier.as_str()).filter(|v| !v.is_empty()),
            )?;
            login_urls.urls.push(url);
            login_urls.code_verifiers.push(verifier);
        }
        login_urls.urls.push(final_redirect_url.to_string());

        Ok(login_urls)
    }
}

/// OAuth2 authorization-code provider, optionally speaking OIDC.
pub struct OAuth2Provider {
    id: String,
    config: ProviderConfig,
    client: Oauth2Client,
    http: reqwest::Client,
}

impl OAuth2Provider {
    pub fn new(
        id: impl Into<String>,
        config: ProviderConfig,
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let id = id.into();
        let auth_url = AuthUrl::new(config.authorization_url.clone()).map_err(|e| {
            ProviderError::InvalidUrl(format!("authorization URL for provider '{id}': {e}"))
        })?;
        let token_url = TokenUrl::new(config.token_url.clone())
            .map_err(|e| ProviderError::InvalidUrl(format!("token URL for provider '{id}': {e}")))?;

        let client_id = ClientId::new(config.client_id.clone());
        let client = Oauth2Client::<EndpointNotSet, EndpointNotSet>::new(client_id)
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url);

        Ok(Self {
            id,
            config,
            client,
            http,
        })
    }

    fn is_oidc(&self) -> bool {
        self.config.kind == "oidc"
    }

    fn redirect_client(&self, callback_url: &str) -> Result<Oauth2Client, ProviderError> {
        let redirect = RedirectUrl::new(callback_url.to_string())
            .map_err(|e| ProviderError::InvalidUrl(format!("callback URL: {e}")))?;
        Ok(self.client.clone().set_redirect_uri(redirect))
    }
}

#[async_trait]
impl Provider for OAuth2Provider {
    fn id(&self) -> &str {
        &self.id
    }

    fn uses_pkce(&self) -> bool {
        self.config.use_pkce
    }

    fn token_url(&self) -> &str {
        &self.config.token_url
    }

    fn login_url(
        &self,
        callback_url: &str,
        state: &str,
        oidc_nonce_hash: &str,
        code_verifier: Option<&str>,
    ) -> Result<String, ProviderError> {
        let client = self.redirect_client(callback_url)?;
        let state = state.to_string();

        let mut request = client
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(self.config.scopes.iter().map(|s| Scope::new(s.clone())));

        if self.is_oidc() {
            request = request.add_extra_param("nonce", oidc_nonce_hash);
        }

        if let Some(verifier) = code_verifier {
            let verifier = PkceCodeVerifier::new(verifier.to_string());
            request =
                request.set_pkce_challenge(PkceCodeChallenge::from_code_verifier_sha256(&verifier));
        }

        let (url, _) = request.url();
        Ok(url.to_string())
    }

    async fn redeem_tokens(
        &self,
        request: &CallbackRequest,
        code_verifier: &str,
        callback_url: &str,
        csrf: &LoginCsrf,
    ) -> Result<TokenPair, ProviderError> {
        if !csrf.check_state(request.state.as_deref().unwrap_or_default()) {
            return Err(ProviderError::CsrfMismatch);
        }

        let code = request
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or(ProviderError::MissingCode)?;

        let client = self.redirect_client(callback_url)?;
        let mut exchange = client.exchange_code(AuthorizationCode::new(code.to_string()));
        if !code_verifier.is_empty() {
            exchange = exchange.set_pkce_verifier(PkceCodeVerifier::new(code_verifier.to_string()));
        }

        let response = exchange
            .request_async(&self.http)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(body) => {
                    ProviderError::Upstream(body.error().to_string())
                }
                other => ProviderError::Redemption(other.to_string()),
            })?;

        if self.is_oidc() {
            let nonce = response
                .extra_fields()
                .id_token
                .as_deref()
                .and_then(id_token_nonce);
            if !nonce.is_some_and(|nonce| csrf.check_nonce(&nonce)) {
                debug!(provider_id = %self.id, "ID token nonce does not match the login attempt");
                return Err(ProviderError::CsrfMismatch);
            }
        }

        let lifetime = match response.expires_in() {
            Some(expires_in) => Duration::from_std(expires_in).ok(),
            None => Duration::try_seconds(DEFAULT_TOKEN_EXPIRY_SECONDS),
        };
        let expires_at = lifetime
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| ProviderError::Redemption("token expiry out of range".to_string()))?;

        let token_id = Uuid::new_v4().to_string();
        let access = OauthToken::access(
            token_id.clone(),
            response.access_token().secret().clone(),
            Some(expires_at),
            self.config.token_url.clone(),
            self.id.clone(),
        );
        let refresh = OauthToken::refresh(
            token_id,
            response
                .refresh_token()
                .map(|t| t.secret().clone())
                .unwrap_or_default(),
            self.config.token_url.clone(),
            self.id.clone(),
        );

        debug!(provider_id = %self.id, token_id = %access.id, "Redeemed authorization code");
        Ok(TokenPair { access, refresh })
    }
}

/// Every provider named in configuration.
#[derive(Default)]
pub struct ConfiguredProviders {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ConfiguredProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            // Following redirects opens the client up to SSRF vulnerabilities.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(
                config.refresh.request_timeout_seconds,
            ))
            .build()
            .map_err(|e| ProviderError::Redemption(format!("reqwest build error: {e}")))?;

        let mut providers = Self::new();
        for (id, provider_config) in &config.providers {
            providers.insert(Arc::new(OAuth2Provider::new(
                id.clone(),
                provider_config.clone(),
                http.clone(),
            )?));
        }
        Ok(providers)
    }

    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ProviderStore for ConfiguredProviders {
    fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).cloned()
    }
}
