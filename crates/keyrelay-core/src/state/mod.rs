use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::RwLock;

use keyrelay_common::GlobalConfig;
use keyrelay_provider_core::{
    Credential, CredentialId, EventHub, ProviderConfig, ProviderRegistry, UpstreamClient,
};
use keyrelay_provider_core::{CooldownManager, SystemClock, UsageManager};

use crate::oauth_orchestrator::OAuthOrchestrator;

/// Shared, mutable `provider -> credentials` view. Both `CoreState` (reads,
/// for the selector) and `OAuthOrchestrator` (writes, after a refresh or
/// re-auth) hold a handle to the same backing map.
#[derive(Clone)]
pub struct CredentialCatalog {
    inner: Arc<RwLock<HashMap<String, Vec<Credential>>>>,
}

impl CredentialCatalog {
    pub fn new(initial: HashMap<String, Vec<Credential>>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn for_provider(&self, provider: &str) -> Vec<Credential> {
        self.inner.read().await.get(provider).cloned().unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<Credential> {
        self.inner.read().await.values().flatten().cloned().collect()
    }

    pub async fn find(&self, provider: &str, credential_id: &CredentialId) -> Option<Credential> {
        self.inner
            .read()
            .await
            .get(provider)?
            .iter()
            .find(|c| &c.stable_id == credential_id)
            .cloned()
    }

    /// Replaces the credential with the same `stable_id`, inserting it under
    /// its own provider bucket if somehow absent (defensive, shouldn't
    /// happen since refresh/re-auth only ever touch known credentials).
    pub async fn replace(&self, updated: Credential) {
        let mut guard = self.inner.write().await;
        let bucket = guard.entry(updated.provider.clone()).or_default();
        match bucket.iter_mut().find(|c| c.stable_id == updated.stable_id) {
            Some(slot) => *slot = updated,
            None => bucket.push(updated),
        }
    }
}

/// Everything the HTTP surface and the request executor need. Holds no
/// direct IO beyond the shared `UpstreamClient` handle; persistence lives in
/// `UsageManager`/`CredentialCatalog`'s own methods.
pub struct CoreState {
    pub global: ArcSwap<GlobalConfig>,
    pub registry: Arc<ProviderRegistry>,
    pub provider_configs: HashMap<String, ProviderConfig>,
    pub credentials: CredentialCatalog,
    pub cooldowns: CooldownManager,
    pub usage: UsageManager,
    pub events: EventHub,
    pub client: Arc<dyn UpstreamClient>,
    pub oauth: OAuthOrchestrator,
}

impl CoreState {
    pub fn new(
        global: GlobalConfig,
        registry: Arc<ProviderRegistry>,
        provider_configs: HashMap<String, ProviderConfig>,
        credentials: CredentialCatalog,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        let events = EventHub::new(256);
        let clock: Arc<dyn keyrelay_provider_core::Clock> = Arc::new(SystemClock);
        let cooldowns = CooldownManager::new(events.clone(), clock.clone());
        let usage = UsageManager::new(global.data_dir.clone(), clock.clone());
        let oauth = OAuthOrchestrator::new(
            registry.clone(),
            credentials.clone(),
            client.clone(),
            events.clone(),
            provider_configs.clone(),
            usage.clone(),
        );
        Self {
            global: ArcSwap::from_pointee(global),
            registry,
            provider_configs,
            credentials,
            cooldowns,
            usage,
            events,
            client,
            oauth,
        }
    }

    pub fn provider_config(&self, provider: &str) -> ProviderConfig {
        self.provider_configs
            .get(provider)
            .cloned()
            .unwrap_or_else(|| match provider {
                "claude" => ProviderConfig::Claude(Default::default()),
                "codex" => ProviderConfig::Codex(Default::default()),
                _ => ProviderConfig::OpenAI(Default::default()),
            })
    }

    /// Loads persisted usage snapshots, registers every discovered
    /// credential with the usage manager, starts the debounced snapshot
    /// writer, and (unless skipped) runs the OAuth preemptive refresh pass.
    pub async fn bootstrap_runtime(&self) {
        let providers: Vec<String> = self.provider_configs.keys().cloned().collect();
        for provider in &providers {
            let _ = self.usage.load(provider).await;
        }
        for credential in self.credentials.all().await {
            let max_concurrent = match self.registry.get(&credential.provider) {
                Some(provider) => {
                    let config = self.provider_config(&credential.provider);
                    crate::concurrency::effective_max_concurrent(
                        provider.as_ref(),
                        &config,
                        &credential,
                        provider.default_rotation_mode(),
                    )
                }
                None => credential.max_concurrent.unwrap_or(0),
            };
            self.usage
                .ensure_credential(
                    &credential.provider,
                    &credential.stable_id,
                    &credential.accessor,
                    credential.tier.as_deref(),
                    credential.priority,
                    max_concurrent,
                )
                .await;
        }
        self.usage.spawn_debounced_writer(std::time::Duration::from_secs(30));
        if !self.global.load().skip_oauth_init_check {
            self.oauth.refresh_all_on_startup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_provider_core::CredentialSecret;

    fn credential(stable_id: &str, provider: &str) -> Credential {
        Credential {
            stable_id: stable_id.to_string(),
            accessor: format!("env://{provider}/0"),
            provider: provider.to_string(),
            email: None,
            account_id: None,
            priority: 0,
            tier: None,
            max_concurrent: None,
            secret: CredentialSecret::ApiKey {
                api_key: "sk-test".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn for_provider_returns_only_that_providers_credentials() {
        let mut by_provider = HashMap::new();
        by_provider.insert("openai".to_string(), vec![credential("openai:a", "openai")]);
        by_provider.insert("claude".to_string(), vec![credential("claude:a", "claude")]);
        let catalog = CredentialCatalog::new(by_provider);
        let openai = catalog.for_provider("openai").await;
        assert_eq!(openai.len(), 1);
        assert_eq!(openai[0].stable_id, "openai:a");
        assert!(catalog.for_provider("codex").await.is_empty());
    }

    #[tokio::test]
    async fn replace_updates_an_existing_credential_in_place() {
        let mut by_provider = HashMap::new();
        by_provider.insert("openai".to_string(), vec![credential("openai:a", "openai")]);
        let catalog = CredentialCatalog::new(by_provider);

        let mut updated = credential("openai:a", "openai");
        updated.priority = 5;
        catalog.replace(updated).await;

        let found = catalog.find("openai", &"openai:a".to_string()).await.unwrap();
        assert_eq!(found.priority, 5);
        assert_eq!(catalog.for_provider("openai").await.len(), 1);
    }

    #[tokio::test]
    async fn replace_inserts_when_absent() {
        let catalog = CredentialCatalog::new(HashMap::new());
        catalog.replace(credential("openai:new", "openai")).await;
        assert_eq!(catalog.for_provider("openai").await.len(), 1);
    }
}
