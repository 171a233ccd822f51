//! OAuth refresh orchestrator: background refresh queue plus a
//! globally-serialized interactive re-auth queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{info, warn};

use keyrelay_provider_core::{
    Credential, CredentialId, CredentialSecret, EventHub, OperationKind, ProviderConfig,
    ProviderError, ProviderRegistry, UpstreamClient, UpstreamCtx, UsageManager,
};

use crate::state::CredentialCatalog;

const REFRESH_PER_ITEM_TIMEOUT: Duration = Duration::from_secs(20);
const REFRESH_MAX_RETRIES: u32 = 3;
const REFRESH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const REFRESH_BACKOFF_CAP: Duration = Duration::from_secs(300);
const REAUTH_UNAVAILABLE_TTL: Duration = Duration::from_secs(360);
/// Access tokens are refreshed this long before their true expiry so a live
/// request never races a refresh. `is_available` ignores this buffer.
const PROACTIVE_REFRESH_BUFFER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct RefreshJob {
    provider: String,
    credential_id: CredentialId,
    force: bool,
    attempt: u32,
}

struct Backoff {
    failures: u32,
    next_refresh_after: Instant,
}

/// Owns two FIFOs: a per-provider refresh worker and one process-wide
/// interactive re-auth coordinator (only one browser flow runs at a time
/// across all providers).
#[derive(Clone)]
pub struct OAuthOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ProviderRegistry>,
    catalog: CredentialCatalog,
    client: Arc<dyn UpstreamClient>,
    events: EventHub,
    configs: HashMap<String, ProviderConfig>,
    usage: UsageManager,
    unavailable_until: Mutex<HashMap<CredentialId, Instant>>,
    backoff: Mutex<HashMap<CredentialId, Backoff>>,
    refresh_queues: Mutex<HashMap<String, mpsc::Sender<RefreshJob>>>,
    reauth_queue: mpsc::Sender<(String, CredentialId)>,
    reauth_coordinator: Mutex<()>,
}

impl OAuthOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        catalog: CredentialCatalog,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
        configs: HashMap<String, ProviderConfig>,
        usage: UsageManager,
    ) -> Self {
        let (reauth_tx, reauth_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            registry,
            catalog,
            client,
            events,
            configs,
            usage,
            unavailable_until: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            refresh_queues: Mutex::new(HashMap::new()),
            reauth_queue: reauth_tx,
            reauth_coordinator: Mutex::new(()),
        });
        Self::spawn_reauth_worker(inner.clone(), reauth_rx);
        Self { inner }
    }

    /// A credential is available iff not in the re-auth queue (tracked via
    /// `unavailable_until`), not otherwise marked unavailable, and not past
    /// true expiry (the proactive buffer only triggers refresh, it never
    /// blocks selection).
    pub async fn is_available(&self, credential: &Credential) -> bool {
        let now = Instant::now();
        if let Some(until) = self.inner.unavailable_until.lock().await.get(&credential.stable_id)
            && *until > now
        {
            return false;
        }
        if let CredentialSecret::OAuth { expires_at, .. } = &credential.secret
            && *expires_at > 0
        {
            let expiry = SystemTime::UNIX_EPOCH + Duration::from_millis(*expires_at as u64);
            if expiry <= SystemTime::now() {
                return false;
            }
        }
        true
    }

    pub async fn enqueue_refresh(&self, provider: &str, credential_id: &CredentialId, force: bool) {
        let sender = self.get_or_spawn_worker(provider).await;
        let _ = sender
            .send(RefreshJob {
                provider: provider.to_string(),
                credential_id: credential_id.clone(),
                force,
                attempt: 0,
            })
            .await;
    }

    pub async fn enqueue_reauth(&self, provider: &str, credential_id: &CredentialId) {
        self.inner
            .unavailable_until
            .lock()
            .await
            .insert(credential_id.clone(), Instant::now() + REAUTH_UNAVAILABLE_TTL);
        let _ = self.inner.reauth_queue.send((provider.to_string(), credential_id.clone())).await;
    }

    /// Preemptive refresh pass at bootstrap. The caller consults
    /// `GlobalConfig::skip_oauth_init_check` before invoking this at all.
    pub async fn refresh_all_on_startup(&self) {
        for credential in self.inner.catalog.all().await {
            if !credential.is_oauth() {
                continue;
            }
            let CredentialSecret::OAuth { expires_at, .. } = &credential.secret else {
                continue;
            };
            let due_now = *expires_at == 0
                || SystemTime::UNIX_EPOCH + Duration::from_millis(*expires_at as u64)
                    <= SystemTime::now() + PROACTIVE_REFRESH_BUFFER;
            if due_now {
                self.enqueue_refresh(&credential.provider, &credential.stable_id, true).await;
            }
        }
    }

    async fn get_or_spawn_worker(&self, provider: &str) -> mpsc::Sender<RefreshJob> {
        let mut queues = self.inner.refresh_queues.lock().await;
        if let Some(sender) = queues.get(provider) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::channel(64);
        queues.insert(provider.to_string(), tx.clone());
        Self::spawn_refresh_worker(self.inner.clone(), rx);
        tx
    }

    fn spawn_refresh_worker(inner: Arc<Inner>, mut rx: mpsc::Receiver<RefreshJob>) {
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                Inner::run_refresh(&inner, job).await;
            }
        });
    }

    fn spawn_reauth_worker(inner: Arc<Inner>, mut rx: mpsc::Receiver<(String, CredentialId)>) {
        tokio::spawn(async move {
            while let Some((provider, credential_id)) = rx.recv().await {
                let _guard = inner.reauth_coordinator.lock().await;
                Inner::run_reauth(&inner, &provider, &credential_id).await;
            }
        });
    }
}

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

impl Inner {
    // `run_refresh` and `retry_or_give_up` call each other, so as plain
    // `async fn`s their opaque return types would each need to embed the
    // other's, an infinitely-sized cycle. Boxing one side breaks the cycle.
    fn run_refresh<'a>(inner: &'a Arc<Inner>, job: RefreshJob) -> BoxFuture<'a> {
        Box::pin(async move {
            let Some(provider) = inner.registry.get(&job.provider) else {
                warn!(provider = %job.provider, "refresh requested for unknown provider");
                return;
            };
            let Some(credential) = inner
                .catalog
                .find(&job.provider, &job.credential_id)
                .await
            else {
                return;
            };
            if !job.force
                && let CredentialSecret::OAuth { expires_at, .. } = &credential.secret
                && *expires_at > 0
            {
                let expiry = SystemTime::UNIX_EPOCH + Duration::from_millis(*expires_at as u64);
                if expiry > SystemTime::now() + PROACTIVE_REFRESH_BUFFER {
                    return;
                }
            }

            let config = inner
                .configs
                .get(&job.provider)
                .cloned()
                .unwrap_or_else(|| default_config(&job.provider));
            let ctx = UpstreamCtx {
                trace_id: None,
                provider: job.provider.clone(),
                credential_id: Some(job.credential_id.clone()),
                operation: OperationKind::ChatCompletions,
                internal: true,
                attempt_no: job.attempt,
            };

            let result = tokio::time::timeout(
                REFRESH_PER_ITEM_TIMEOUT,
                provider.refresh_token(&ctx, &config, &credential, inner.client.as_ref()),
            )
            .await;

            match result {
                Ok(Ok(updated)) => {
                    inner.catalog.replace(updated).await;
                    inner.backoff.lock().await.remove(&job.credential_id);
                    inner.unavailable_until.lock().await.remove(&job.credential_id);
                    inner.usage.reset_fair_cycle(&job.provider, &job.credential_id).await;
                    info!(provider = %job.provider, credential_id = %job.credential_id, "oauth refresh succeeded");
                }
                Ok(Err(ProviderError::UpstreamStatus { status: 401 | 403, .. })) => {
                    warn!(provider = %job.provider, credential_id = %job.credential_id, "refresh rejected, queuing re-auth");
                    inner
                        .unavailable_until
                        .lock()
                        .await
                        .insert(job.credential_id.clone(), Instant::now() + REAUTH_UNAVAILABLE_TTL);
                    let _ = inner
                        .reauth_queue
                        .clone()
                        .send((job.provider.clone(), job.credential_id.clone()))
                        .await;
                }
                Ok(Err(ProviderError::UpstreamStatus { status: 429, retry_after, .. })) => {
                    warn!(provider = %job.provider, credential_id = %job.credential_id, retry_after = ?retry_after, "refresh rate limited");
                    Self::retry_or_give_up(inner, job, retry_after).await;
                }
                Ok(Err(_)) => {
                    Self::retry_or_give_up(inner, job, None).await;
                }
                Err(_) => {
                    warn!(provider = %job.provider, credential_id = %job.credential_id, "refresh attempt timed out");
                    Self::retry_or_give_up(inner, job, None).await;
                }
            }
        })
    }

    fn retry_or_give_up<'a>(inner: &'a Arc<Inner>, job: RefreshJob, retry_after: Option<Duration>) -> BoxFuture<'a> {
        Box::pin(async move {
            if job.attempt + 1 >= REFRESH_MAX_RETRIES {
                warn!(provider = %job.provider, credential_id = %job.credential_id, "refresh retries exhausted, marking unavailable");
                inner
                    .unavailable_until
                    .lock()
                    .await
                    .insert(job.credential_id.clone(), Instant::now() + REFRESH_BACKOFF_CAP);
                return;
            }
            let mut guard = inner.backoff.lock().await;
            let entry = guard.entry(job.credential_id.clone()).or_insert(Backoff {
                failures: 0,
                next_refresh_after: Instant::now(),
            });
            entry.failures += 1;
            let backoff_delay = (REFRESH_BACKOFF_BASE * 2u32.pow(entry.failures.min(8))).min(REFRESH_BACKOFF_CAP);
            // A server-advertised Retry-After always wins over our own backoff guess.
            let delay = retry_after.unwrap_or(backoff_delay);
            entry.next_refresh_after = Instant::now() + delay;
            drop(guard);

            tokio::time::sleep(delay).await;
            Self::run_refresh(
                inner,
                RefreshJob {
                    attempt: job.attempt + 1,
                    ..job
                },
            )
            .await;
        })
    }

    async fn run_reauth(inner: &Arc<Inner>, provider_name: &str, credential_id: &CredentialId) {
        let Some(provider) = inner.registry.get(provider_name) else {
            return;
        };
        let Some(credential) = inner.catalog.find(provider_name, credential_id).await else {
            return;
        };
        let config = inner
            .configs
            .get(provider_name)
            .cloned()
            .unwrap_or_else(|| default_config(provider_name));
        let ctx = UpstreamCtx {
            trace_id: None,
            provider: provider_name.to_string(),
            credential_id: Some(credential_id.clone()),
            operation: OperationKind::ChatCompletions,
            internal: true,
            attempt_no: 0,
        };
        let result = tokio::time::timeout(
            Duration::from_secs(300),
            provider.interactive_reauth(&ctx, &config, &credential, inner.client.as_ref()),
        )
        .await;
        match result {
            Ok(Ok(updated)) => {
                inner.catalog.replace(updated).await;
                inner.unavailable_until.lock().await.remove(credential_id);
                info!(provider = %provider_name, credential_id = %credential_id, "interactive re-auth succeeded");
            }
            Ok(Err(err)) => {
                warn!(provider = %provider_name, credential_id = %credential_id, error = %err, "interactive re-auth failed");
            }
            Err(_) => {
                warn!(provider = %provider_name, credential_id = %credential_id, "interactive re-auth timed out");
            }
        }
    }
}

fn default_config(provider: &str) -> ProviderConfig {
    match provider {
        "claude" => ProviderConfig::Claude(Default::default()),
        "codex" => ProviderConfig::Codex(Default::default()),
        _ => ProviderConfig::OpenAI(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_provider_core::provider::{UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse};

    struct DeadClient;

    impl UpstreamClient for DeadClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>,
        > {
            Box::pin(async { Err(UpstreamFailure::Build("unused in these tests".into())) })
        }
    }

    fn orchestrator() -> OAuthOrchestrator {
        OAuthOrchestrator::new(
            Arc::new(ProviderRegistry::new()),
            CredentialCatalog::new(HashMap::new()),
            Arc::new(DeadClient),
            EventHub::new(16),
            HashMap::new(),
            UsageManager::new(std::env::temp_dir(), Arc::new(keyrelay_provider_core::SystemClock)),
        )
    }

    fn api_key_credential() -> Credential {
        Credential {
            stable_id: "openai:a".to_string(),
            accessor: "env://openai/0".to_string(),
            provider: "openai".to_string(),
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

    fn oauth_credential(stable_id: &str, expires_at: i64) -> Credential {
        Credential {
            stable_id: stable_id.to_string(),
            accessor: format!("file://{stable_id}.json"),
            provider: "codex".to_string(),
            email: None,
            account_id: None,
            priority: 0,
            tier: None,
            max_concurrent: None,
            secret: CredentialSecret::OAuth {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
                id_token: None,
                expires_at,
                token_uri: "https://example.com/token".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn api_key_credentials_are_always_available() {
        let orchestrator = orchestrator();
        assert!(orchestrator.is_available(&api_key_credential()).await);
    }

    #[tokio::test]
    async fn unexpired_oauth_credential_is_available() {
        let orchestrator = orchestrator();
        let far_future = (SystemTime::now() + Duration::from_secs(3600))
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        assert!(orchestrator.is_available(&oauth_credential("codex:a", far_future)).await);
    }

    #[tokio::test]
    async fn expired_oauth_credential_is_unavailable() {
        let orchestrator = orchestrator();
        let past = (SystemTime::now() - Duration::from_secs(60))
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        assert!(!orchestrator.is_available(&oauth_credential("codex:a", past)).await);
    }

    #[tokio::test]
    async fn oauth_credential_with_no_recorded_expiry_is_available() {
        let orchestrator = orchestrator();
        assert!(orchestrator.is_available(&oauth_credential("codex:a", 0)).await);
    }

    #[tokio::test]
    async fn enqueue_reauth_marks_the_credential_unavailable_immediately() {
        let orchestrator = orchestrator();
        let credential = oauth_credential("codex:a", 0);
        assert!(orchestrator.is_available(&credential).await);
        orchestrator.enqueue_reauth("codex", &credential.stable_id).await;
        assert!(!orchestrator.is_available(&credential).await);
    }

    struct RejectingProvider;

    #[async_trait::async_trait]
    impl keyrelay_provider_core::UpstreamProvider for RejectingProvider {
        fn name(&self) -> &'static str {
            "codex"
        }

        fn dispatch_table(&self, _config: &ProviderConfig) -> keyrelay_provider_core::DispatchTable {
            keyrelay_provider_core::DispatchTable::all_native()
        }

        async fn list_models(
            &self,
            _ctx: &UpstreamCtx,
            _config: &ProviderConfig,
            _credential: &Credential,
        ) -> keyrelay_provider_core::ProviderResult<Vec<keyrelay_protocol::openai::Model>> {
            Ok(Vec::new())
        }

        async fn execute(
            &self,
            _ctx: &UpstreamCtx,
            _config: &ProviderConfig,
            _credential: &Credential,
            _client: &dyn UpstreamClient,
            _request: &keyrelay_protocol::openai::CreateChatCompletionRequestBody,
        ) -> Result<keyrelay_provider_core::provider::UpstreamHttpResponse, keyrelay_provider_core::provider::UpstreamFailure>
        {
            unimplemented!("unused in this test")
        }

        async fn refresh_token(
            &self,
            _ctx: &UpstreamCtx,
            _config: &ProviderConfig,
            _credential: &Credential,
            _client: &dyn UpstreamClient,
        ) -> keyrelay_provider_core::ProviderResult<Credential> {
            Err(ProviderError::UpstreamStatus {
                status: 429,
                retry_after: Some(Duration::from_millis(5)),
                message: "slow down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn refresh_rate_limited_retries_after_the_advertised_delay_then_gives_up() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(RejectingProvider));
        let mut credentials = HashMap::new();
        credentials.insert("codex".to_string(), vec![oauth_credential("codex:a", 0)]);
        let inner = Arc::new(Inner {
            registry: Arc::new(registry),
            catalog: CredentialCatalog::new(credentials),
            client: Arc::new(DeadClient),
            events: EventHub::new(16),
            configs: HashMap::new(),
            usage: UsageManager::new(std::env::temp_dir(), Arc::new(keyrelay_provider_core::SystemClock)),
            unavailable_until: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            refresh_queues: Mutex::new(HashMap::new()),
            reauth_queue: mpsc::channel(1).0,
            reauth_coordinator: Mutex::new(()),
        });

        Inner::run_refresh(
            &inner,
            RefreshJob {
                provider: "codex".to_string(),
                credential_id: "codex:a".to_string(),
                force: true,
                attempt: 0,
            },
        )
        .await;

        // REFRESH_MAX_RETRIES attempts all hit the same 429, so the
        // credential ends up parked in `unavailable_until` rather than
        // looping forever.
        assert!(inner.unavailable_until.lock().await.contains_key(&"codex:a".to_string()));
    }
}
