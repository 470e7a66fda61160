use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

/// Length in bytes required for the CSRF secret and the token encryption key.
pub const SECRET_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub refresh: RefreshConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for every route, e.g. `/api/auth`
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Public URL providers redirect back to after authentication
    #[serde(default = "default_callback_url")]
    pub callback_url: String,
    #[serde(default)]
    pub allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    #[serde(default)]
    pub default_provider_ids: Vec<String>,
    #[serde(default = "default_app_redirect_url")]
    pub default_app_redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
    /// Drops the `Secure` attribute, for local development over plain HTTP only
    #[serde(default)]
    pub cookie_not_secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "default_csrf_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default = "default_csrf_ttl_minutes")]
    pub ttl_minutes: u64,
}

impl CsrfConfig {
    pub fn cookie_name(&self) -> String {
        format!("{}_csrf", self.name_prefix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Either `redis` or `mock`
    #[serde(default = "default_persistence_backend")]
    pub backend: String,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// `oidc` or `gitlab`
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub use_pkce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sweep interval, which is also the look-ahead window
    #[serde(default = "default_refresh_interval")]
    pub interval_minutes: u64,
    /// Applied when a provider omits `expires_in`
    #[serde(default = "default_token_expiry")]
    pub default_expiry_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_seconds: u64,
}

fn default_base_path() -> String {
    "/api/auth".to_string()
}

fn default_callback_url() -> String {
    "http://localhost:3000/api/auth/callback".to_string()
}

fn default_app_redirect_url() -> String {
    "/".to_string()
}

fn default_session_cookie_name() -> String {
    "_gateway_session".to_string()
}

fn default_session_ttl() -> u64 {
    86400 // 24 hours
}

fn default_csrf_name_prefix() -> String {
    "_gateway".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_csrf_ttl_minutes() -> u64 {
    5
}

fn default_persistence_backend() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_command_timeout() -> u64 {
    5
}

fn default_provider_kind() -> String {
    "oidc".to_string()
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_token_expiry() -> u64 {
    8 * 3600
}

fn default_request_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            default_provider_ids: Vec::new(),
            default_app_redirect_url: default_app_redirect_url(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_session_cookie_name(),
            ttl_seconds: default_session_ttl(),
            cookie_not_secure: false,
        }
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_csrf_name_prefix(),
            secret: String::new(),
            domains: Vec::new(),
            path: default_cookie_path(),
            ttl_minutes: default_csrf_ttl_minutes(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_persistence_backend(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: String::new(),
            command_timeout_seconds: default_command_timeout(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_refresh_interval(),
            default_expiry_seconds: default_token_expiry(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                base_path: default_base_path(),
                callback_url: default_callback_url(),
                allow_origin: None,
            },
            login: LoginConfig::default(),
            session: SessionConfig::default(),
            csrf: CsrfConfig::default(),
            persistence: PersistenceConfig::default(),
            encryption: EncryptionConfig::default(),
            providers: HashMap::new(),
            refresh: RefreshConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(config::Config::try_from(&Config::default())?);

        if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(environment());

        builder.build()?.try_deserialize()
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(config::Config::try_from(&Config::default())?);

        if path.as_ref().exists() {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        builder = builder.add_source(environment());

        builder.build()?.try_deserialize()
    }

    /// Checks every setting the server cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.csrf.secret.len() != SECRET_KEY_LEN {
            return Err(invalid(format!(
                "csrf.secret must be exactly {SECRET_KEY_LEN} bytes, got {}",
                self.csrf.secret.len()
            )));
        }

        if self.encryption.enabled && self.encryption.secret_key.len() != SECRET_KEY_LEN {
            return Err(invalid(format!(
                "encryption.secret_key must be exactly {SECRET_KEY_LEN} bytes \
                 when encryption is enabled, got {}",
                self.encryption.secret_key.len()
            )));
        }

        match self.persistence.backend.as_str() {
            "redis" | "mock" => {}
            other => {
                return Err(invalid(format!(
                    "unknown persistence backend '{other}', expected 'redis' or 'mock'"
                )));
            }
        }

        if self.providers.is_empty() {
            return Err(invalid("at least one provider must be defined".to_string()));
        }

        for (id, provider) in &self.providers {
            provider.validate(id)?;
        }

        for id in &self.login.default_provider_ids {
            if !self.providers.contains_key(id) {
                return Err(invalid(format!(
                    "default provider '{id}' is not a configured provider"
                )));
            }
        }

        if self.refresh.interval_minutes == 0 {
            return Err(invalid(
                "refresh.interval_minutes must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl ProviderConfig {
    fn validate(&self, id: &str) -> Result<(), ConfigError> {
        if id.is_empty() {
            return Err(invalid("provider id cannot be empty".to_string()));
        }
        if !matches!(self.kind.as_str(), "oidc" | "gitlab") {
            return Err(invalid(format!(
                "provider '{id}' has unsupported kind '{}'",
                self.kind
            )));
        }
        if self.client_id.is_empty() {
            return Err(invalid(format!("provider '{id}' is missing client_id")));
        }
        if self.client_secret.is_empty() {
            return Err(invalid(format!("provider '{id}' is missing client_secret")));
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix("GATEWAY")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("login.default_provider_ids")
        .with_list_parse_key("csrf.domains")
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Message(message)
}
