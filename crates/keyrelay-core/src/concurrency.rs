//! Effective per-credential concurrency cap: `base_concurrency` scaled by the
//! provider's tier-priority multiplier (or a config-level override keyed by
//! credential priority) and, under sequential rotation, the provider's
//! sequential-fallback multiplier.

use keyrelay_provider_core::{Credential, ProviderConfig, RotationMode, UpstreamProvider};

/// `0` means "unlimited" and is returned unchanged: a cap of zero scaled by
/// any multiplier is still "no cap".
pub fn effective_max_concurrent(
    provider: &dyn UpstreamProvider,
    config: &ProviderConfig,
    credential: &Credential,
    rotation_mode: RotationMode,
) -> u32 {
    let base = credential
        .max_concurrent
        .unwrap_or_else(|| config.max_concurrent_per_key().unwrap_or(0));
    if base == 0 {
        return 0;
    }

    let tier_multiplier = credential
        .tier
        .as_deref()
        .and_then(|tier| {
            provider
                .tier_priorities()
                .iter()
                .find(|(t, _)| *t == tier)
                .map(|(_, multiplier)| *multiplier as f64)
        })
        .or_else(|| config.concurrency_multipliers().get(&credential.priority).copied())
        .unwrap_or(1.0);

    let sequential_multiplier = if rotation_mode == RotationMode::Sequential {
        provider.sequential_fallback_multiplier()
    } else {
        1.0
    };

    let scaled = base as f64 * tier_multiplier * sequential_multiplier;
    scaled.round().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keyrelay_protocol::openai::{CreateChatCompletionRequestBody, Model};
    use keyrelay_provider_core::{
        ClaudeConfig, CredentialSecret, DispatchTable, ProviderResult, UpstreamClient,
        UpstreamCtx, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    };

    struct TieredProvider;

    #[async_trait]
    impl UpstreamProvider for TieredProvider {
        fn name(&self) -> &'static str {
            "tiered"
        }

        fn dispatch_table(&self, _config: &ProviderConfig) -> DispatchTable {
            DispatchTable::all_native()
        }

        async fn list_models(
            &self,
            _ctx: &UpstreamCtx,
            _config: &ProviderConfig,
            _credential: &Credential,
        ) -> ProviderResult<Vec<Model>> {
            Ok(vec![])
        }

        async fn execute(
            &self,
            _ctx: &UpstreamCtx,
            _config: &ProviderConfig,
            _credential: &Credential,
            _client: &dyn UpstreamClient,
            _request: &CreateChatCompletionRequestBody,
        ) -> Result<UpstreamHttpResponse, UpstreamFailure> {
            Err(UpstreamFailure::Build("unused".into()))
        }

        fn tier_priorities(&self) -> &'static [(&'static str, i32)] {
            &[("gold", 3), ("silver", 2)]
        }

        fn sequential_fallback_multiplier(&self) -> f64 {
            2.0
        }
    }

    fn credential(tier: Option<&str>, priority: i32, max_concurrent: Option<u32>) -> Credential {
        Credential {
            stable_id: "c1".to_string(),
            accessor: "env://tiered/0".to_string(),
            provider: "tiered".to_string(),
            email: None,
            account_id: None,
            priority,
            tier: tier.map(str::to_string),
            max_concurrent,
            secret: CredentialSecret::ApiKey { api_key: "sk-test".to_string() },
        }
    }

    #[test]
    fn zero_base_stays_unlimited_regardless_of_multiplier() {
        let provider = TieredProvider;
        let config = ProviderConfig::Claude(ClaudeConfig::default());
        let credential = credential(Some("gold"), 0, None);
        assert_eq!(
            effective_max_concurrent(&provider, &config, &credential, RotationMode::Balanced),
            0
        );
    }

    #[test]
    fn tier_multiplier_scales_the_base_concurrency() {
        let provider = TieredProvider;
        let config = ProviderConfig::Claude(ClaudeConfig::default());
        let credential = credential(Some("gold"), 0, Some(2));
        assert_eq!(
            effective_max_concurrent(&provider, &config, &credential, RotationMode::Balanced),
            6
        );
    }

    #[test]
    fn sequential_mode_applies_the_fallback_multiplier() {
        let provider = TieredProvider;
        let config = ProviderConfig::Claude(ClaudeConfig::default());
        let credential = credential(None, 0, Some(2));
        assert_eq!(
            effective_max_concurrent(&provider, &config, &credential, RotationMode::Sequential),
            4
        );
    }
}
