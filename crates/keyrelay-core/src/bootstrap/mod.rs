use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use keyrelay_common::{GlobalConfig, GlobalConfigPatch};
use keyrelay_provider_core::config::{ClaudeConfig, CodexConfig, ModelRecord, ModelTable, OpenAIConfig};
use keyrelay_provider_core::provider::RotationMode;
use keyrelay_provider_core::registry::ProviderRegistry;
use keyrelay_provider_core::ProviderConfig;
use keyrelay_provider_impl::register_builtin_providers;

use crate::discovery::{dedup_by_stable_id, discover_credentials};
use crate::state::{CoreState, CredentialCatalog};
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Parser)]
#[command(name = "keyrelay", version, about = "Multi-provider LLM credential-rotating proxy")]
pub struct CliArgs {
    /// Root directory for oauth_creds/ and per-provider usage JSON files.
    #[arg(long, env = "GPROXY_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Bind host.
    #[arg(long, env = "GPROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "GPROXY_PORT")]
    pub port: Option<String>,

    /// Admin key (plaintext). Stored as a hash in memory/config.
    #[arg(long, env = "GPROXY_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Redact sensitive headers/body fields in emitted events.
    #[arg(long, env = "GPROXY_EVENT_REDACT_SENSITIVE")]
    pub event_redact_sensitive: Option<String>,
}

pub struct Bootstrap {
    pub state: Arc<CoreState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let data_dir = sanitize_optional_env_value(args.data_dir.clone()).unwrap_or_else(|| "./data".to_string());
    let host = sanitize_optional_env_value(args.host.clone());
    let port = parse_u16_env_value(args.port.clone(), "GPROXY_PORT")?;
    let admin_key = sanitize_optional_env_value(args.admin_key.clone());
    let event_redact_sensitive = parse_bool_env_value(
        args.event_redact_sensitive.clone(),
        "GPROXY_EVENT_REDACT_SENSITIVE",
    )?;

    std::fs::create_dir_all(&data_dir).with_context(|| format!("create data dir {data_dir}"))?;

    let admin_key_hash = match admin_key.as_deref() {
        Some(plain) => hash_admin_key(plain),
        None => {
            let generated = generate_admin_key();
            eprintln!("generated admin key: {generated}");
            hash_admin_key(&generated)
        }
    };

    let global_timeout_secs =
        parse_u64_env_value(env_opt("PROXY_GLOBAL_TIMEOUT"), "PROXY_GLOBAL_TIMEOUT")?;
    let max_retries = parse_u32_env_value(env_opt("PROXY_MAX_RETRIES"), "PROXY_MAX_RETRIES")?;
    let rotation_tolerance =
        parse_u64_env_value(env_opt("PROXY_ROTATION_TOLERANCE"), "PROXY_ROTATION_TOLERANCE")?;
    let skip_oauth_init_check =
        parse_bool_env_value(env_opt("SKIP_OAUTH_INIT_CHECK"), "SKIP_OAUTH_INIT_CHECK")?;

    let patch = GlobalConfigPatch {
        host,
        port,
        admin_key_hash: Some(admin_key_hash),
        data_dir: Some(data_dir.clone()),
        event_redact_sensitive,
        global_timeout_secs,
        max_retries,
        rotation_tolerance,
        skip_oauth_init_check,
    };
    let global: GlobalConfig = patch.into_config().context("finalize global config")?;

    let mut registry = ProviderRegistry::new();
    register_builtin_providers(&mut registry);
    let registry = Arc::new(registry);

    let mut provider_configs: HashMap<String, ProviderConfig> = HashMap::new();
    for provider in crate::discovery::KNOWN_PROVIDERS {
        let config = provider_config_from_env(provider).with_context(|| format!("load config for provider {provider}"))?;
        provider_configs.insert(provider.to_string(), config);
    }

    let credentials = dedup_by_stable_id(discover_credentials(&data_dir).await);
    let mut by_provider: HashMap<String, Vec<keyrelay_provider_core::Credential>> = HashMap::new();
    for credential in credentials {
        by_provider.entry(credential.provider.clone()).or_default().push(credential);
    }
    let catalog = CredentialCatalog::new(by_provider);

    let client = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::from_global(&global))
            .context("build upstream http client")?,
    );

    let state = CoreState::new(global, registry, provider_configs, catalog, client);
    state.bootstrap_runtime().await;

    Ok(Bootstrap {
        state: Arc::new(state),
    })
}

/// Builds a provider's config from its slice of the env-var surface:
/// `<PROVIDER>_API_BASE`, `MAX_CONCURRENT_REQUESTS_PER_KEY_<PROVIDER>`,
/// `ROTATION_MODE_<PROVIDER>`, `CONCURRENCY_MULTIPLIER_<PROVIDER>_PRIORITY_<N>`,
/// `IGNORE_MODELS_<PROVIDER>`, `WHITELIST_MODELS_<PROVIDER>`, `<PROVIDER>_MODELS`.
fn provider_config_from_env(provider: &str) -> anyhow::Result<ProviderConfig> {
    let tag = provider.to_ascii_uppercase();

    let base_url = sanitize_optional_env_value(env_opt(&format!("{tag}_API_BASE")));
    let max_concurrent_per_key = parse_u32_env_value(
        env_opt(&format!("MAX_CONCURRENT_REQUESTS_PER_KEY_{tag}")),
        "MAX_CONCURRENT_REQUESTS_PER_KEY",
    )?;
    let rotation_mode =
        parse_rotation_mode_env_value(env_opt(&format!("ROTATION_MODE_{tag}")))?;
    let concurrency_multipliers = concurrency_multipliers_from_env(&tag)?;
    let ignore_models = parse_csv_env_value(env_opt(&format!("IGNORE_MODELS_{tag}")));
    let whitelist_models = parse_csv_env_value(env_opt(&format!("WHITELIST_MODELS_{tag}")));
    let models = parse_model_table_env_value(env_opt(&format!("{tag}_MODELS")))?;

    Ok(match provider {
        "claude" => ProviderConfig::Claude(ClaudeConfig {
            base_url,
            max_concurrent_per_key,
            rotation_mode,
            concurrency_multipliers,
            ignore_models,
            whitelist_models,
            models,
        }),
        "codex" => ProviderConfig::Codex(CodexConfig {
            base_url,
            max_concurrent_per_key,
            rotation_mode,
            concurrency_multipliers,
            ignore_models,
            whitelist_models,
            models,
        }),
        _ => ProviderConfig::OpenAI(OpenAIConfig {
            base_url,
            max_concurrent_per_key,
            rotation_mode,
            concurrency_multipliers,
            ignore_models,
            whitelist_models,
            models,
        }),
    })
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Scans the process environment for `CONCURRENCY_MULTIPLIER_<PROVIDER>_PRIORITY_<N>`
/// since the priority tiers are open-ended and can't be named ahead of time.
fn concurrency_multipliers_from_env(tag: &str) -> anyhow::Result<HashMap<i32, f64>> {
    let prefix = format!("CONCURRENCY_MULTIPLIER_{tag}_PRIORITY_");
    let mut multipliers = HashMap::new();
    for (key, value) in std::env::vars() {
        let Some(suffix) = key.strip_prefix(&prefix) else {
            continue;
        };
        let priority = suffix
            .parse::<i32>()
            .with_context(|| format!("invalid priority suffix in {key}"))?;
        let multiplier = value
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {key} value: {value}"))?;
        multipliers.insert(priority, multiplier);
    }
    Ok(multipliers)
}

fn parse_csv_env_value(value: Option<String>) -> Vec<String> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Vec::new();
    };
    raw.split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn parse_rotation_mode_env_value(value: Option<String>) -> anyhow::Result<Option<RotationMode>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "balanced" => Ok(Some(RotationMode::Balanced)),
        "sequential" => Ok(Some(RotationMode::Sequential)),
        other => Err(anyhow::anyhow!("invalid rotation mode: {other}")),
    }
}

/// `<PROVIDER>_MODELS` is a JSON array of model ids, e.g. `["gpt-4o","gpt-4o-mini"]`.
fn parse_model_table_env_value(value: Option<String>) -> anyhow::Result<ModelTable> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(ModelTable::default());
    };
    let ids: Vec<String> = serde_json::from_str(&raw).context("invalid *_MODELS JSON")?;
    Ok(ModelTable {
        models: ids.into_iter().map(|id| ModelRecord { id, display_name: None }).collect(),
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_u32_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u32>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u32>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_u64_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u64>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u64>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn generate_admin_key() -> String {
    uuid::Uuid::new_v4().to_string()
}
