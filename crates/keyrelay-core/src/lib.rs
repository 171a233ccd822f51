pub mod bootstrap;
pub mod classify;
pub mod concurrency;
pub mod core;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod handler;
pub mod oauth_orchestrator;
pub mod selector;
pub mod state;
pub mod stream_watch;
pub mod upstream_client;

pub use bootstrap::{Bootstrap, bootstrap_from_env};
pub use core::Core;
pub use error::{EngineError, ProxyError};
pub use executor::{ExecuteRequest, execute_completion};
pub use oauth_orchestrator::OAuthOrchestrator;
pub use state::{CoreState, CredentialCatalog};
