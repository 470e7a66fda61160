#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{
        Request,
        header::{COOKIE, LOCATION, SET_COOKIE},
    },
    response::Response,
};
use gateway_login::{Config, Server, test_utils::TestServerBuilder};
use std::collections::HashMap;
use tower::ServiceExt;
use url::Url;

/// Drives the full router the way a browser would, carrying cookies
/// between requests.
pub struct TestHarness {
    pub server: Server,
    pub app: Router,
    pub cookies: HashMap<String, String>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config<F>(configure: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        let server = TestServerBuilder::new().with_config(configure).build().await;
        let app = server.create_app();

        Self {
            server,
            app,
            cookies: HashMap::new(),
        }
    }

    /// GET `uri` with the cookie jar attached, then apply any Set-Cookie
    pub async fn get(&mut self, uri: &str) -> Response {
        let mut request = Request::get(uri);
        if !self.cookies.is_empty() {
            let header = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header(COOKIE, header);
        }

        let response = self
            .app
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();

        for (name, value, removed) in set_cookies(&response) {
            if removed {
                self.cookies.remove(&name);
            } else {
                self.cookies.insert(name, value);
            }
        }
        response
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.cookie(&self.server.config.session.cookie_name)
    }

    pub fn csrf_cookie(&self) -> Option<&str> {
        self.cookie(&self.server.config.csrf.cookie_name())
    }
}

/// `(name, value, removed)` for every Set-Cookie header
pub fn set_cookies(response: &Response) -> Vec<(String, String, bool)> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| {
            let raw = value.to_str().ok()?;
            let (pair, attributes) = raw.split_once(';').unwrap_or((raw, ""));
            let (name, value) = pair.split_once('=')?;
            let removed = attributes.contains("Max-Age=0");
            Some((name.trim().to_string(), value.trim().to_string(), removed))
        })
        .collect()
}

pub fn location(response: &Response) -> String {
    response
        .headers()
        .get(LOCATION)
        .expect("redirect without Location")
        .to_str()
        .unwrap()
        .to_string()
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

pub fn token_response(
    access_token: &str,
    refresh_token: &str,
    expires_in: i64,
) -> serde_json::Value {
    serde_json::json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "refresh_token": refresh_token,
    })
}
