use crate::{config::SessionConfig, error::AppError, models::Session, server::Server};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderValue, header::SET_COOKIE, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Duration;
use cookie::{Cookie, SameSite};
use tracing::{debug, warn};

/// The session resolved for the current request.
#[derive(Debug, Clone)]
pub struct RequestSession {
    pub session: Session,
    /// Created for this request, no cookie pointed at a live session
    pub is_new: bool,
}

/// Response marker set by handlers that end the session, so no fresh
/// session cookie is attached on the way out.
#[derive(Debug, Clone, Copy)]
pub struct SessionEnded;

/// Resolves the session cookie to a stored session, or starts an anonymous
/// one, and carries it to the handler as a typed extension.
pub async fn session_middleware(
    State(server): State<Server>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let session_config = &server.config.session;
    let jar = CookieJar::from_headers(request.headers());

    let existing = match jar.get(&session_config.cookie_name) {
        Some(cookie) => server.sessions.get_session(cookie.value()).await?,
        None => None,
    };

    let (session, is_new) = match existing {
        Some(session) => (session, false),
        None => (
            Session::new(Duration::seconds(session_config.ttl_seconds as i64)),
            true,
        ),
    };
    let session_id = session.id.clone();
    debug!(session_id = %session_id, is_new, "Resolved request session");

    request
        .extensions_mut()
        .insert(RequestSession { session, is_new });

    let mut response = next.run(request).await;

    if is_new && response.extensions().get::<SessionEnded>().is_none() {
        let cookie = session_cookie(session_config, session_id);
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!("Failed to encode session cookie: {}", e),
        }
    }

    Ok(response)
}

pub fn session_cookie(config: &SessionConfig, session_id: String) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), session_id))
        .path("/")
        .http_only(true)
        .secure(!config.cookie_not_secure)
        .same_site(SameSite::Lax)
        .max_age(cookie::time::Duration::seconds(config.ttl_seconds as i64))
        .build()
}

pub fn session_removal_cookie(config: &SessionConfig) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), ""))
        .path("/")
        .http_only(true)
        .secure(!config.cookie_not_secure)
        .same_site(SameSite::Lax)
        .max_age(cookie::time::Duration::ZERO)
        .build()
}

/// Extractor for the session resolved by [`session_middleware`].
pub struct CurrentSession(pub Session);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestSession>()
            .map(|resolved| CurrentSession(resolved.session.clone()))
            .ok_or_else(|| AppError::SessionContext("no session resolved for request".to_string()))
    }
}
