use crate::{
    auth::{
        csrf::CsrfProtocol,
        middleware::session_middleware,
        orchestrator::LoginOrchestrator,
        provider::{ConfiguredProviders, ProviderStore},
    },
    config::Config,
    crypto::SecretCipher,
    error::AppError,
    health::HealthService,
    jobs::{Job, JobScheduler, TokenRefreshJob},
    routes::{
        apply_allow_origin, create_health_routes, create_login_routes, no_store_headers,
        normalize_base_path,
    },
    shutdown::{JobSchedulerShutdown, ShutdownCoordinator, ShutdownManager},
    storage::{
        PersistenceBackend, PersistenceHealthChecker, SessionStore, StorageFactory, TokenStore,
    },
};
use axum::{
    Router,
    http::HeaderValue,
    middleware::{self},
    response::Response,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Server {
    pub config: Arc<Config>,
    pub backend: Arc<dyn PersistenceBackend>,
    pub sessions: SessionStore,
    pub tokens: TokenStore,
    pub orchestrator: Arc<LoginOrchestrator>,
    pub health_service: Arc<HealthService>,
    pub shutdown_coordinator: Arc<ShutdownCoordinator>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let backend = StorageFactory::create_backend(&config.persistence).await?;
        let providers: Arc<dyn ProviderStore> =
            Arc::new(ConfiguredProviders::from_config(&config)?);
        info!("Configured {} login providers", config.providers.len());

        Self::from_parts(config, backend, providers).await
    }

    /// Wires the stores and the login orchestrator around an existing backend
    /// and provider set.
    pub async fn from_parts(
        config: Config,
        backend: Arc<dyn PersistenceBackend>,
        providers: Arc<dyn ProviderStore>,
    ) -> Result<Self, AppError> {
        let cipher = if config.encryption.enabled {
            let cipher = SecretCipher::new(config.encryption.secret_key.as_bytes())
                .map_err(|e| AppError::Internal(format!("Invalid encryption key: {}", e)))?;
            info!("Token encryption enabled");
            Some(cipher)
        } else {
            None
        };

        let sessions = SessionStore::new(backend.clone());
        let tokens = TokenStore::new(backend.clone(), cipher);

        let csrf = Arc::new(
            CsrfProtocol::new(config.csrf.clone(), !config.session.cookie_not_secure)
                .map_err(|e| AppError::Internal(format!("Invalid CSRF secret: {}", e)))?,
        );
        let orchestrator = Arc::new(LoginOrchestrator::new(
            &config,
            sessions.clone(),
            tokens.clone(),
            providers,
            csrf,
        ));

        let health_service = Arc::new(HealthService::new());
        health_service
            .register(Arc::new(PersistenceHealthChecker::new(backend.clone())))
            .await;

        Ok(Self {
            config: Arc::new(config),
            backend,
            sessions,
            tokens,
            orchestrator,
            health_service,
            shutdown_coordinator: Arc::new(ShutdownCoordinator::new()),
        })
    }

    pub async fn run(&self) -> Result<(), AppError> {
        let mut shutdown_manager =
            ShutdownManager::new(Duration::from_secs(self.config.shutdown.timeout_seconds));

        if self.config.refresh.enabled {
            let refresh_job = TokenRefreshJob::from_config(self.tokens.clone(), &self.config)
                .map_err(|e| AppError::Internal(format!("Failed to create refresh job: {}", e)))?;
            let jobs: Vec<Arc<dyn Job>> = vec![Arc::new(refresh_job)];

            let mut scheduler =
                JobScheduler::with_shutdown_coordinator(self.shutdown_coordinator.subscribe());
            scheduler.start(jobs).await;
            shutdown_manager.register(JobSchedulerShutdown::new(Arc::new(RwLock::new(scheduler))));
        } else {
            info!("Token refresh disabled");
        }

        let app = self.create_app();

        let host = self.config.server.host.as_str();
        let port = self.config.server.port;
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to bind to address: {}", e)))?;

        info!(
            "Server listening on http://{}:{}{}",
            host,
            port,
            normalize_base_path(&self.config.server.base_path)
        );

        // Spawn shutdown signal handler
        let shutdown_coordinator = self.shutdown_coordinator.clone();
        tokio::spawn(async move {
            shutdown_coordinator.wait_for_shutdown_signal().await;
        });

        let shutdown_coordinator = self.shutdown_coordinator.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_coordinator.wait_for_shutdown().await;
                info!("Graceful shutdown initiated");
            })
            .await;

        if let Err(e) = result {
            error!("Server error: {}", e);
        }

        shutdown_manager.shutdown_all().await;
        info!("Server shutdown complete");

        Ok(())
    }

    // Creates an application router
    pub fn create_app(&self) -> Router {
        let routes = self
            .login_routes()
            .merge(create_health_routes().with_state(self.health_service.clone()));

        let base_path = normalize_base_path(&self.config.server.base_path);
        let app = if base_path.is_empty() {
            Router::new().merge(routes)
        } else {
            Router::new().nest(&base_path, routes)
        };

        self.add_conditional_middleware(app)
    }

    /// Login, callback and logout, each with a resolved session
    fn login_routes(&self) -> Router {
        create_login_routes()
            .layer(middleware::from_fn_with_state(
                self.clone(),
                session_middleware,
            ))
            .layer(middleware::map_response(no_store_headers))
            .with_state(self.clone())
    }

    fn add_conditional_middleware(&self, app: Router) -> Router {
        let Some(origin) = self.config.server.allow_origin.as_deref() else {
            return app;
        };

        match HeaderValue::from_str(origin) {
            Ok(origin) => app.layer(middleware::map_response(move |mut response: Response| {
                let origin = origin.clone();
                async move {
                    apply_allow_origin(&mut response, &origin);
                    response
                }
            })),
            Err(e) => {
                warn!("Ignoring invalid allow_origin '{}': {}", origin, e);
                app
            }
        }
    }
}
