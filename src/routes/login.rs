use crate::{
    auth::{
        middleware::{CurrentSession, SessionEnded, session_removal_cookie},
        orchestrator::{CsrfCookie, LoginRedirect},
        provider::CallbackRequest,
    },
    error::AppError,
    server::Server,
};
use axum::{
    Form, Router,
    extract::State,
    http::{
        HeaderMap, StatusCode,
        header::{HOST, LOCATION},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::{CookieJar, Query};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginQuery {
    #[serde(default)]
    pub redirect_url: Option<String>,
    /// Repeatable, one entry per provider in login order
    #[serde(default)]
    pub provider_id: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutQuery {
    #[serde(default)]
    pub redirect_url: Option<String>,
}

/// Create login flow routes
pub fn create_login_routes() -> Router<Server> {
    Router::new()
        .route("/login", get(login))
        .route("/callback", get(callback_query).post(callback_form))
        .route("/logout", get(logout))
}

async fn login(
    State(server): State<Server>,
    CurrentSession(mut session): CurrentSession,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<LoginQuery>,
) -> Result<Response, AppError> {
    let redirect = server
        .orchestrator
        .start_login(
            &mut session,
            &query.provider_id,
            query.redirect_url.as_deref(),
        )
        .await?;

    Ok(redirect_response(&server, request_host(&headers), jar, redirect))
}

async fn callback_query(
    State(server): State<Server>,
    session: CurrentSession,
    headers: HeaderMap,
    jar: CookieJar,
    Query(request): Query<CallbackRequest>,
) -> Response {
    complete_callback(server, session, headers, jar, request).await
}

/// Providers using `response_mode=form_post` deliver the callback as a form.
async fn callback_form(
    State(server): State<Server>,
    session: CurrentSession,
    headers: HeaderMap,
    jar: CookieJar,
    Form(request): Form<CallbackRequest>,
) -> Response {
    complete_callback(server, session, headers, jar, request).await
}

async fn complete_callback(
    server: Server,
    CurrentSession(mut session): CurrentSession,
    headers: HeaderMap,
    jar: CookieJar,
    request: CallbackRequest,
) -> Response {
    let csrf = server.orchestrator.csrf();
    let host = request_host(&headers);
    let csrf_cookie = jar.get(&csrf.cookie_name()).map(|c| c.value().to_string());

    match server
        .orchestrator
        .handle_callback(&mut session, csrf_cookie.as_deref(), &request)
        .await
    {
        Ok(redirect) => redirect_response(&server, host, jar, redirect),
        Err(e) => {
            // a failed login attempt is over, its CSRF state must not be reused
            let jar = jar.add(csrf.removal_cookie(host));
            (jar, e).into_response()
        }
    }
}

async fn logout(
    State(server): State<Server>,
    CurrentSession(session): CurrentSession,
    jar: CookieJar,
    Query(query): Query<LogoutQuery>,
) -> Result<Response, AppError> {
    server.orchestrator.logout(&session.id).await?;

    let location = query
        .redirect_url
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| server.config.login.default_app_redirect_url.clone());
    let jar = jar.add(session_removal_cookie(&server.config.session));

    let mut response = (StatusCode::FOUND, [(LOCATION, location)], jar).into_response();
    response.extensions_mut().insert(SessionEnded);
    Ok(response)
}

fn redirect_response(
    server: &Server,
    host: Option<&str>,
    jar: CookieJar,
    redirect: LoginRedirect,
) -> Response {
    let csrf = server.orchestrator.csrf();
    let jar = match redirect.csrf {
        CsrfCookie::Set(value) => jar.add(csrf.cookie(value, host)),
        CsrfCookie::Clear => jar.add(csrf.removal_cookie(host)),
    };

    (StatusCode::FOUND, [(LOCATION, redirect.location)], jar).into_response()
}

fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers.get(HOST).and_then(|host| host.to_str().ok())
}
