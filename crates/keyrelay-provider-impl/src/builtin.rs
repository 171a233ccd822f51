use std::sync::Arc;

use keyrelay_provider_core::UpstreamProvider;

use crate::providers::{claude::ClaudeProvider, codex::CodexProvider, openai::OpenAIProvider};

/// One entry per provider this crate ships, used to populate a fresh
/// `ProviderRegistry` without the caller needing to know the concrete types.
pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub provider: Arc<dyn UpstreamProvider>,
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        BuiltinProviderSeed {
            name: "openai",
            provider: Arc::new(OpenAIProvider::new()),
        },
        BuiltinProviderSeed {
            name: "claude",
            provider: Arc::new(ClaudeProvider::new()),
        },
        BuiltinProviderSeed {
            name: "codex",
            provider: Arc::new(CodexProvider::new()),
        },
    ]
}
