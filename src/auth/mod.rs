pub mod csrf;
pub mod middleware;
pub mod orchestrator;
pub mod provider;

pub use csrf::{CsrfProtocol, LoginCsrf};
pub use middleware::{CurrentSession, session_middleware};
pub use orchestrator::{CsrfCookie, LoginOrchestrator, LoginRedirect};
pub use provider::{CallbackRequest, ConfiguredProviders, Provider, ProviderStore};
