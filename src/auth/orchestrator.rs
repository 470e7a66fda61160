//! Multi-provider login state machine.
//!
//! A login walks the browser through every requested provider in order. The
//! session holds the remaining provider IDs, their login URLs (plus the
//! trailing application redirect) and their PKCE verifiers. Each callback
//! consumes the head of every queue. The orchestrator works on a copy of the
//! session and persists it only once a step has fully succeeded, so a
//! rejected request leaves the stored session untouched.

use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    auth::{
        csrf::{CsrfProtocol, IssuedCsrf, LoginCsrf},
        provider::{CallbackRequest, ProviderError, ProviderStore},
    },
    config::Config,
    error::AppError,
    models::Session,
    storage::{SessionStore, TokenStore},
};

/// What the response should do with the CSRF cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrfCookie {
    /// Sealed value for the next provider step
    Set(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub location: String,
    pub csrf: CsrfCookie,
}

pub struct LoginOrchestrator {
    sessions: SessionStore,
    tokens: TokenStore,
    providers: Arc<dyn ProviderStore>,
    csrf: Arc<CsrfProtocol>,
    callback_url: String,
    default_provider_ids: Vec<String>,
    default_app_redirect_url: String,
}

impl LoginOrchestrator {
    pub fn new(
        config: &Config,
        sessions: SessionStore,
        tokens: TokenStore,
        providers: Arc<dyn ProviderStore>,
        csrf: Arc<CsrfProtocol>,
    ) -> Self {
        Self {
            sessions,
            tokens,
            providers,
            csrf,
            callback_url: config.server.callback_url.clone(),
            default_provider_ids: config.login.default_provider_ids.clone(),
            default_app_redirect_url: config.login.default_app_redirect_url.clone(),
        }
    }

    pub fn csrf(&self) -> &CsrfProtocol {
        &self.csrf
    }

    /// Queues every requested provider and redirects to the first one.
    pub async fn start_login(
        &self,
        session: &mut Session,
        provider_ids: &[String],
        app_redirect_url: Option<&str>,
    ) -> Result<LoginRedirect, AppError> {
        let provider_ids = if provider_ids.is_empty() {
            self.default_provider_ids.as_slice()
        } else {
            provider_ids
        };
        if provider_ids.is_empty() {
            return Err(AppError::BadRequest(
                "no provider requested and no default configured".to_string(),
            ));
        }

        let app_redirect_url = app_redirect_url
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.default_app_redirect_url);

        let issued = self.issue_csrf()?;
        let login = self.providers.login_urls(
            &self.callback_url,
            app_redirect_url,
            &issued.csrf.nonce_hash(),
            &issued.csrf.state_hash(),
            provider_ids,
        )?;

        let mut working = session.clone();
        working.login_with_providers.replace(provider_ids.iter().cloned());
        working.login_urls.replace(login.urls);
        working.code_verifiers.replace(login.code_verifiers);

        let location = next_location(&working)?;
        self.sessions.set_session(&working).await?;
        *session = working;

        info!(
            session_id = %session.id,
            providers = provider_ids.len(),
            "Starting login sequence"
        );

        Ok(LoginRedirect {
            location,
            csrf: CsrfCookie::Set(issued.cookie_value),
        })
    }

    /// Completes the pending provider step and moves to the next one, or to
    /// the application once no provider is left.
    pub async fn handle_callback(
        &self,
        session: &mut Session,
        csrf_cookie: Option<&str>,
        request: &CallbackRequest,
    ) -> Result<LoginRedirect, AppError> {
        if let Some(error) = request.upstream_error() {
            warn!(session_id = %session.id, error = %error, "Identity provider reported an error");
            return Err(ProviderError::Upstream(error).into());
        }

        let csrf = self.verify_csrf(session, csrf_cookie, request)?;

        if request.code.as_deref().is_none_or(str::is_empty) {
            return Err(AppError::MissingCode);
        }

        let mut working = session.clone();
        let provider_id = working.pop_provider_id();
        if provider_id.is_empty() {
            return Err(AppError::BadRequest("no login in progress".to_string()));
        }
        let provider = self
            .providers
            .get(&provider_id)
            .ok_or_else(|| AppError::ProviderNotFound(provider_id.clone()))?;
        let code_verifier = working.pop_code_verifier();

        let pair = provider
            .redeem_tokens(request, &code_verifier, &self.callback_url, &csrf)
            .await?;

        self.tokens.set_refresh_token(&pair.refresh).await?;
        self.tokens.set_access_token(&pair.access).await?;
        working.add_token_id(pair.access.id.clone());
        working.pop_login_url();

        info!(
            session_id = %working.id,
            provider_id = %provider_id,
            token_id = %pair.access.id,
            remaining = working.login_with_providers.len(),
            "Provider login step completed"
        );

        let redirect = if working.login_pending() {
            self.advance(&mut working)?
        } else {
            let location = working.pop_login_url();
            LoginRedirect {
                location: if location.is_empty() {
                    self.default_app_redirect_url.clone()
                } else {
                    location
                },
                csrf: CsrfCookie::Clear,
            }
        };

        self.sessions.set_session(&working).await?;
        *session = working;
        Ok(redirect)
    }

    /// Deletes the session record. Its tokens stay in the token store.
    pub async fn logout(&self, session_id: &str) -> Result<(), AppError> {
        self.sessions.remove_session(session_id).await?;
        info!(session_id, "Session logged out");
        Ok(())
    }

    /// Rebuilds the remaining URLs and verifiers under a fresh CSRF attempt.
    fn advance(&self, working: &mut Session) -> Result<LoginRedirect, AppError> {
        let final_redirect = working
            .login_urls
            .iter()
            .last()
            .map(str::to_string)
            .unwrap_or_else(|| self.default_app_redirect_url.clone());
        let remaining = working.login_with_providers.to_vec();

        let issued = self.issue_csrf()?;
        let login = self.providers.login_urls(
            &self.callback_url,
            &final_redirect,
            &issued.csrf.nonce_hash(),
            &issued.csrf.state_hash(),
            &remaining,
        )?;
        working.login_urls.replace(login.urls);
        working.code_verifiers.replace(login.code_verifiers);

        Ok(LoginRedirect {
            location: next_location(working)?,
            csrf: CsrfCookie::Set(issued.cookie_value),
        })
    }

    fn verify_csrf(
        &self,
        session: &Session,
        csrf_cookie: Option<&str>,
        request: &CallbackRequest,
    ) -> Result<LoginCsrf, AppError> {
        let Some(cookie) = csrf_cookie.filter(|c| !c.is_empty()) else {
            warn!(session_id = %session.id, "Callback without CSRF cookie");
            return Err(AppError::CsrfMismatch("CSRF cookie missing".to_string()));
        };

        let csrf = self.csrf.load(cookie).map_err(|e| {
            warn!(session_id = %session.id, error = %e, "Rejected CSRF cookie");
            AppError::CsrfMismatch(e.to_string())
        })?;

        if !csrf.check_state(request.state.as_deref().unwrap_or_default()) {
            warn!(session_id = %session.id, "Callback state does not match CSRF cookie");
            return Err(AppError::CsrfMismatch(
                "state does not match CSRF cookie".to_string(),
            ));
        }
        Ok(csrf)
    }

    fn issue_csrf(&self) -> Result<IssuedCsrf, AppError> {
        self.csrf
            .issue()
            .map_err(|e| AppError::Internal(format!("failed to issue CSRF cookie: {e}")))
    }
}

fn next_location(session: &Session) -> Result<String, AppError> {
    session
        .login_urls
        .peek()
        .map(str::to_string)
        .ok_or_else(|| AppError::Internal("login queue is empty".to_string()))
}
