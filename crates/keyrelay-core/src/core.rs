use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::handler;
use crate::state::CoreState;

/// Thin wrapper around the shared state and its axum router. Kept separate
/// from `CoreState` so `apps/keyrelay`'s `main.rs` only has to call
/// `Core::router()` and `axum::serve`.
pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(state: Arc<CoreState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(handler::chat_completions))
            .route("/v1/models", get(handler::list_models))
            .route("/healthz", get(handler::healthz))
            .route("/stats", get(handler::stats))
            .route("/admin/refresh", post(handler::admin_refresh))
            .with_state(self.state.clone())
    }
}
