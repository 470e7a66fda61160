use crate::{
    auth::provider::{ConfiguredProviders, ProviderStore},
    config::{Config, ProviderConfig},
    server::Server,
    storage::{MemoryBackend, PersistenceBackend},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use std::sync::Arc;

pub const TEST_CSRF_SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const TEST_ENCRYPTION_KEY: &str = "abcdefghijklmnopqrstuvwxyz012345";

/// A valid configuration with one `renku` provider and the in-memory backend
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.csrf.secret = TEST_CSRF_SECRET.to_string();
    config.persistence.backend = "mock".to_string();
    config.login.default_provider_ids = vec!["renku".to_string()];
    config.login.default_app_redirect_url = "http://app/health".to_string();
    config.providers.insert(
        "renku".to_string(),
        test_provider_config("http://idp.local/authorize", "http://idp.local/token"),
    );
    config
}

pub fn test_provider_config(authorization_url: &str, token_url: &str) -> ProviderConfig {
    ProviderConfig {
        kind: "oidc".to_string(),
        client_id: "gateway".to_string(),
        client_secret: "gateway-secret".to_string(),
        authorization_url: authorization_url.to_string(),
        token_url: token_url.to_string(),
        scopes: vec!["openid".to_string(), "profile".to_string()],
        use_pkce: true,
    }
}

/// An ID token carrying `nonce`, with a placeholder signature
pub fn unsigned_id_token(nonce: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "iss": "http://idp.local", "sub": "user-1", "nonce": nonce });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

/// Builds a `Server` over the in-memory backend and the configured providers
pub struct TestServerBuilder {
    config: Config,
}

impl TestServerBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
        }
    }

    /// Adjust the test configuration before the server is built
    pub fn with_config<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        configure(&mut self.config);
        self
    }

    pub async fn build(self) -> Server {
        let backend: Arc<dyn PersistenceBackend> = Arc::new(MemoryBackend::new());
        let providers: Arc<dyn ProviderStore> =
            Arc::new(ConfiguredProviders::from_config(&self.config).unwrap());

        Server::from_parts(self.config, backend, providers)
            .await
            .unwrap()
    }
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
