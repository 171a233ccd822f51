//! Request executor: drives the selector/usage-manager/cooldown loop for a
//! single inbound request until it succeeds, exhausts its deadline, or hits
//! an error that isn't worth retrying elsewhere.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::{info, warn};

use keyrelay_protocol::openai::CreateChatCompletionRequestBody;
use keyrelay_provider_core::provider::{Classification, UpstreamBody, UpstreamHttpResponse};
use keyrelay_provider_core::{CooldownReason, CooldownSource, Credential, Scope, UpstreamCtx};

use crate::error::EngineError;
use crate::selector::{self, SelectorInputs};
use crate::state::CoreState;
use crate::stream_watch::{self, StreamOutcome};

const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const SLEEP_GRANULARITY: Duration = Duration::from_secs(5);

pub struct ExecuteRequest<'a> {
    pub provider: &'a str,
    pub model: String,
    pub body: &'a CreateChatCompletionRequestBody,
    pub deadline: Instant,
    pub trace_id: Option<String>,
    pub operation: keyrelay_provider_core::OperationKind,
}

/// Runs the retry loop for one request, returning the first successful
/// upstream response or the most informative error once every avenue is
/// exhausted.
pub async fn execute_completion(
    state: &CoreState,
    req: ExecuteRequest<'_>,
) -> Result<UpstreamHttpResponse, EngineError> {
    let provider = state
        .registry
        .get(req.provider)
        .ok_or_else(|| EngineError::UnknownProvider(req.provider.to_string()))?;
    let config = state.provider_config(req.provider);
    if !config.is_model_allowed(&req.model) {
        return Err(EngineError::InvalidRequest(format!(
            "model {} is not allowed for provider {}",
            req.model, req.provider
        )));
    }

    let global = state.global.load_full();
    let max_retries = global.max_retries;

    let mut attempts = 0u32;
    let mut most_informative: Option<EngineError> = None;
    let mut attempted: std::collections::HashSet<String> = std::collections::HashSet::new();

    loop {
        if Instant::now() >= req.deadline {
            break;
        }

        let catalog = state.credentials.for_provider(req.provider).await;
        let inputs = SelectorInputs {
            catalog: &catalog,
            cooldowns: &state.cooldowns,
            usage: &state.usage,
            rotation_mode: provider.default_rotation_mode(),
            quota_groups: provider.model_quota_groups(),
            rotation_tolerance: global.rotation_tolerance,
        };

        let candidates = selector::candidates(req.provider, &req.model, &inputs).await;
        let mut next: Option<Credential> = None;
        for candidate in candidates {
            if attempted.contains(&candidate.stable_id) {
                continue;
            }
            if !state.oauth.is_available(&candidate).await {
                continue;
            }
            next = Some(candidate);
            break;
        }

        let Some(credential) = next else {
            let retry_at = selector::earliest_retry(req.provider, &inputs).await;
            match retry_at {
                Some(at) if at < req.deadline => {
                    let sleep_for = at.saturating_duration_since(Instant::now()).min(SLEEP_GRANULARITY);
                    if sleep_for.is_zero() {
                        // cooldown already elapsed but candidate list was
                        // stale; avoid a tight spin
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    } else {
                        tokio::time::sleep(sleep_for).await;
                    }
                    attempted.clear();
                    continue;
                }
                _ => break,
            }
        };

        attempted.insert(credential.stable_id.clone());
        let group = quota_group(provider.model_quota_groups(), &req.model);
        let scope = group.unwrap_or(&req.model);

        let slot = match state.usage.start_request(req.provider, &credential.stable_id).await {
            Ok(slot) => slot,
            Err(_) => continue,
        };

        let ctx = UpstreamCtx {
            trace_id: req.trace_id.clone(),
            provider: req.provider.to_string(),
            credential_id: Some(credential.stable_id.clone()),
            operation: req.operation,
            internal: false,
            attempt_no: attempts,
        };

        let remaining = req.deadline.saturating_duration_since(Instant::now());
        let per_attempt_timeout = remaining.min(Duration::from_secs(global.global_timeout_secs));

        let outcome = tokio::time::timeout(
            per_attempt_timeout,
            provider.execute(&ctx, &config, &credential, state.client.as_ref(), req.body),
        )
        .await;

        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => {
                // Deadline/timeout elapsed mid-attempt: treat as a transient,
                // retryable transport failure so it folds into the same
                // branch as a provider-reported timeout.
                state.usage.record_failure(req.provider, &credential.stable_id, &req.model, group).await;
                drop(slot);
                most_informative = Some(merge(most_informative, EngineError::Transient));
                attempts += 1;
                if attempts >= max_retries {
                    break;
                }
                continue;
            }
        };

        let classification = provider.classify(&outcome);

        match classification {
            Classification::Success { usage } => {
                let response = outcome.map_err(|_| EngineError::Fatal)?;
                let status = response.status;
                let headers = response.headers;
                match response.body {
                    UpstreamBody::Stream(mut stream) => match stream.recv().await {
                        Some(first) => {
                            let (watched, outcome_rx) = stream_watch::watch_with_first(first, stream);
                            let usage_manager = state.usage.clone();
                            let provider_name = req.provider.to_string();
                            let credential_id = credential.stable_id.clone();
                            let model = req.model.clone();
                            tokio::spawn(async move {
                                match outcome_rx.await {
                                    Ok(StreamOutcome::Usage(stream_usage)) => {
                                        usage_manager
                                            .record_success(&provider_name, &credential_id, &model, group, stream_usage, 0.0)
                                            .await;
                                    }
                                    Ok(StreamOutcome::Error { .. }) | Err(_) => {
                                        usage_manager.record_failure(&provider_name, &credential_id, &model, group).await;
                                    }
                                }
                                drop(slot);
                            });
                            return Ok(UpstreamHttpResponse { status, headers, body: UpstreamBody::Stream(watched) });
                        }
                        None => {
                            // Upstream closed the stream before a single chunk
                            // arrived; fall back to the classifier's usage,
                            // same as a non-streaming success.
                            state
                                .usage
                                .record_success(req.provider, &credential.stable_id, &req.model, group, usage, 0.0)
                                .await;
                            drop(slot);
                            return Ok(UpstreamHttpResponse { status, headers, body: UpstreamBody::Stream(stream) });
                        }
                    },
                    UpstreamBody::Bytes(bytes) => {
                        state
                            .usage
                            .record_success(req.provider, &credential.stable_id, &req.model, group, usage, 0.0)
                            .await;
                        drop(slot);
                        return Ok(UpstreamHttpResponse { status, headers, body: UpstreamBody::Bytes(bytes) });
                    }
                }
            }
            Classification::RateLimit { retry_after, scope: cooldown_scope } => {
                state
                    .cooldowns
                    .set(
                        credential.stable_id.clone(),
                        cooldown_scope,
                        CooldownReason::RateLimit,
                        Instant::now() + retry_after,
                        CooldownSource::ProviderHeader,
                    )
                    .await;
                state.usage.record_failure(req.provider, &credential.stable_id, &req.model, group).await;
                drop(slot);
                most_informative = Some(merge(most_informative, EngineError::RateLimit));
            }
            Classification::QuotaExhausted { until, scope: cooldown_scope } => {
                let until_instant = until
                    .and_then(|t| t.duration_since(SystemTime::now()).ok())
                    .map(|d| Instant::now() + d)
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
                state
                    .cooldowns
                    .set(
                        credential.stable_id.clone(),
                        cooldown_scope,
                        CooldownReason::QuotaExceeded,
                        until_instant,
                        CooldownSource::ProviderError,
                    )
                    .await;
                state.usage.record_failure(req.provider, &credential.stable_id, &req.model, group).await;
                drop(slot);
                let reset = state.usage.mark_exhausted(req.provider, &credential.stable_id, scope).await;
                if reset {
                    info!(provider = req.provider, scope, "fair-cycle reset: every credential exhausted");
                    attempted.clear();
                }
                most_informative = Some(merge(most_informative, EngineError::QuotaExhausted));
            }
            Classification::AuthFailure { needs_reauth } => {
                if needs_reauth {
                    state.oauth.enqueue_reauth(req.provider, &credential.stable_id).await;
                } else {
                    state.oauth.enqueue_refresh(req.provider, &credential.stable_id, true).await;
                }
                state.usage.record_failure(req.provider, &credential.stable_id, &req.model, group).await;
                drop(slot);
                most_informative = Some(merge(most_informative, EngineError::AuthFailure));
            }
            Classification::InvalidRequest => {
                state.usage.record_failure(req.provider, &credential.stable_id, &req.model, group).await;
                drop(slot);
                return Err(EngineError::InvalidRequest("rejected by upstream provider".into()));
            }
            Classification::Fatal => {
                state.usage.record_failure(req.provider, &credential.stable_id, &req.model, group).await;
                drop(slot);
                return Err(EngineError::Fatal);
            }
            Classification::Transient { retryable } => {
                let attempt_backoff = attempted.len() as u32;
                let delay = (TRANSIENT_BACKOFF_BASE * 2u32.pow(attempt_backoff.min(6))).min(TRANSIENT_BACKOFF_CAP);
                state
                    .cooldowns
                    .set(
                        credential.stable_id.clone(),
                        Scope::All,
                        CooldownReason::TransientError,
                        Instant::now() + delay,
                        CooldownSource::Synthetic,
                    )
                    .await;
                state.usage.record_failure(req.provider, &credential.stable_id, &req.model, group).await;
                drop(slot);
                if !retryable {
                    return Err(EngineError::Transient);
                }
                most_informative = Some(merge(most_informative, EngineError::Transient));
            }
        }

        attempts += 1;
        if attempts >= max_retries {
            break;
        }
    }

    warn!(provider = req.provider, model = %req.model, attempts, "exhausted retries without success");
    Err(most_informative.unwrap_or(EngineError::NoAvailableCredentials))
}

fn merge(current: Option<EngineError>, candidate: EngineError) -> EngineError {
    match current {
        Some(existing) => existing.most_informative(candidate),
        None => candidate,
    }
}

fn quota_group<'a>(quota_groups: &'a [(&'static str, &'static str)], model: &str) -> Option<&'a str> {
    quota_groups.iter().find(|(m, _)| *m == model).map(|(_, g)| *g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use keyrelay_protocol::openai::Model;
    use keyrelay_provider_core::{
        CredentialSecret, DispatchRule, DispatchTable, EventHub, ProviderConfig, ProviderRegistry,
        ProviderResult, Usage, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
        UpstreamProvider, UpstreamTransportErrorKind,
    };

    use crate::state::{CoreState, CredentialCatalog};

    struct ScriptedClient;

    impl UpstreamClient for ScriptedClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>,
        > {
            Box::pin(async { Err(UpstreamFailure::Build("never called".into())) })
        }
    }

    /// A provider whose `execute` replays a fixed sequence of `Classification`
    /// outcomes, one per call, holding on the last entry once exhausted.
    struct ScriptedProvider {
        outcomes: Vec<Classification>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn dispatch_table(&self, _config: &ProviderConfig) -> DispatchTable {
            DispatchTable::new([DispatchRule::Native; 4])
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
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .get(idx)
                .or_else(|| self.outcomes.last())
                .expect("scripted outcomes must be non-empty");
            match outcome {
                Classification::Success { .. } => Ok(UpstreamHttpResponse {
                    status: 200,
                    headers: vec![],
                    body: UpstreamBody::Bytes(bytes::Bytes::from_static(b"{}")),
                }),
                Classification::RateLimit { .. } => Err(UpstreamFailure::Http {
                    status: 429,
                    headers: vec![],
                    body: bytes::Bytes::new(),
                }),
                _ => Err(UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Other,
                    message: "scripted failure".into(),
                }),
            }
        }

        fn classify(&self, _outcome: &Result<UpstreamHttpResponse, UpstreamFailure>) -> Classification {
            let idx = self.calls.load(Ordering::SeqCst) - 1;
            self.outcomes.get(idx).cloned().unwrap_or(Classification::Fatal)
        }
    }

    fn api_key_credential(stable_id: &str) -> Credential {
        Credential {
            stable_id: stable_id.to_string(),
            accessor: format!("env://scripted/{stable_id}"),
            provider: "scripted".to_string(),
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

    fn chat_body() -> CreateChatCompletionRequestBody {
        serde_json::from_str(r#"{"messages":[],"model":"scripted-model"}"#).expect("valid body")
    }

    async fn state_with(provider: ScriptedProvider, credential_ids: &[&str]) -> CoreState {
        let mut registry = ProviderRegistry::new();
        registry.register(std::sync::Arc::new(provider));
        let registry = std::sync::Arc::new(registry);

        let mut provider_configs = std::collections::HashMap::new();
        provider_configs.insert("scripted".to_string(), ProviderConfig::OpenAI(Default::default()));

        let credentials: Vec<Credential> = credential_ids.iter().map(|id| api_key_credential(id)).collect();
        let mut by_provider = std::collections::HashMap::new();
        by_provider.insert("scripted".to_string(), credentials);
        let catalog = CredentialCatalog::new(by_provider);

        let global = keyrelay_common::GlobalConfigPatch {
            admin_key_hash: Some("test".to_string()),
            data_dir: Some(std::env::temp_dir().to_string_lossy().to_string()),
            ..Default::default()
        }
        .into_config()
        .expect("valid config");

        let state = CoreState::new(
            global,
            registry,
            provider_configs,
            catalog,
            std::sync::Arc::new(ScriptedClient),
        );
        for credential_id in credential_ids {
            state
                .usage
                .ensure_credential("scripted", &credential_id.to_string(), "accessor", None, 0, 0)
                .await;
        }
        state
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let provider = ScriptedProvider {
            outcomes: vec![Classification::Success { usage: Usage::default() }],
            calls: AtomicUsize::new(0),
        };
        let state = state_with(provider, &["scripted:a"]).await;
        let req = ExecuteRequest {
            provider: "scripted",
            model: "scripted-model".to_string(),
            body: &chat_body(),
            deadline: Instant::now() + Duration::from_secs(5),
            trace_id: None,
            operation: keyrelay_provider_core::OperationKind::ChatCompletions,
        };
        let result = execute_completion(&state, req).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rotates_past_a_rate_limited_credential_to_a_healthy_one() {
        // Only one credential, so the second attempt must come from the
        // scripted provider returning Success once the cooldown is observed
        // by the selector's next loop iteration via a second credential.
        let provider = ScriptedProvider {
            outcomes: vec![
                Classification::RateLimit { retry_after: Duration::from_secs(1), scope: Scope::All },
                Classification::Success { usage: Usage::default() },
            ],
            calls: AtomicUsize::new(0),
        };
        let state = state_with(provider, &["scripted:a", "scripted:b"]).await;
        let req = ExecuteRequest {
            provider: "scripted",
            model: "scripted-model".to_string(),
            body: &chat_body(),
            deadline: Instant::now() + Duration::from_secs(5),
            trace_id: None,
            operation: keyrelay_provider_core::OperationKind::ChatCompletions,
        };
        let result = execute_completion(&state, req).await;
        assert!(result.is_ok(), "second credential should absorb the retry");
    }

    #[tokio::test]
    async fn invalid_request_is_not_retried() {
        let provider = ScriptedProvider {
            outcomes: vec![Classification::InvalidRequest],
            calls: AtomicUsize::new(0),
        };
        let state = state_with(provider, &["scripted:a"]).await;
        let req = ExecuteRequest {
            provider: "scripted",
            model: "scripted-model".to_string(),
            body: &chat_body(),
            deadline: Instant::now() + Duration::from_secs(5),
            trace_id: None,
            operation: keyrelay_provider_core::OperationKind::ChatCompletions,
        };
        let result = execute_completion(&state, req).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn unknown_provider_fails_fast() {
        let provider = ScriptedProvider {
            outcomes: vec![Classification::Fatal],
            calls: AtomicUsize::new(0),
        };
        let state = state_with(provider, &["scripted:a"]).await;
        let req = ExecuteRequest {
            provider: "does-not-exist",
            model: "scripted-model".to_string(),
            body: &chat_body(),
            deadline: Instant::now() + Duration::from_secs(5),
            trace_id: None,
            operation: keyrelay_provider_core::OperationKind::ChatCompletions,
        };
        let result = execute_completion(&state, req).await;
        assert!(matches!(result, Err(EngineError::UnknownProvider(_))));
    }
}
