use keyrelay_provider_core::ProviderRegistry;

use crate::builtin::builtin_provider_seeds;

/// Registers every built-in provider (openai, claude, codex) into `registry`.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    for seed in builtin_provider_seeds() {
        registry.register(seed.provider);
    }
}
