use std::path::Path;

use keyrelay_provider_core::{Credential, CredentialSecret};
use serde::Deserialize;
use tracing::warn;

/// Every provider this deployment ships. Kept as a flat list rather than
/// sourced from the registry so discovery can run before providers are
/// constructed.
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "claude", "codex"];

#[derive(Debug, Deserialize)]
struct OAuthCredentialFile {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    id_token: Option<String>,
    expiry_date: i64,
    token_uri: String,
    #[serde(default)]
    _proxy_metadata: ProxyMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ProxyMetadata {
    email: Option<String>,
    account_id: Option<String>,
    tier: Option<String>,
    priority: Option<i32>,
}

/// Discovers every credential for every known provider: OAuth JSON files
/// under `<data_dir>/oauth_creds/`, then legacy/numbered env vars, then
/// static `<PROVIDER>_API_KEY[_<N>]` env vars.
pub async fn discover_credentials(data_dir: &str) -> Vec<Credential> {
    let mut out = Vec::new();
    for provider in KNOWN_PROVIDERS {
        out.extend(discover_oauth_files(data_dir, provider).await);
        out.extend(discover_env_oauth(provider));
        out.extend(discover_env_api_keys(provider));
    }
    out
}

async fn discover_oauth_files(data_dir: &str, provider: &str) -> Vec<Credential> {
    let dir = Path::new(data_dir).join("oauth_creds");
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let prefix = format!("{provider}_oauth_");
    let mut out = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.starts_with(&prefix) && name.ends_with(".json")) {
            continue;
        }
        let path = entry.path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(event = "credential_file_unreadable", path = %path.display(), error = %err);
                continue;
            }
        };
        let file: OAuthCredentialFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(err) => {
                warn!(event = "credential_file_invalid", path = %path.display(), error = %err);
                continue;
            }
        };
        let accessor = path.display().to_string();
        let fingerprint = file
            ._proxy_metadata
            .email
            .clone()
            .or_else(|| file._proxy_metadata.account_id.clone())
            .unwrap_or_else(|| accessor.clone());
        out.push(Credential {
            stable_id: format!("{provider}:{fingerprint}"),
            accessor,
            provider: provider.to_string(),
            email: file._proxy_metadata.email,
            account_id: file._proxy_metadata.account_id,
            priority: file._proxy_metadata.priority.unwrap_or(0),
            tier: file._proxy_metadata.tier,
            max_concurrent: None,
            secret: CredentialSecret::OAuth {
                access_token: file.access_token,
                refresh_token: file.refresh_token,
                id_token: file.id_token,
                expires_at: file.expiry_date,
                token_uri: file.token_uri,
            },
        });
    }
    out
}

fn discover_env_oauth(provider: &str) -> Vec<Credential> {
    let upper = provider.to_ascii_uppercase();
    let mut numbered = Vec::new();
    let mut n = 1;
    loop {
        let access = std::env::var(format!("{upper}_{n}_ACCESS_TOKEN")).ok();
        let refresh = std::env::var(format!("{upper}_{n}_REFRESH_TOKEN")).ok();
        let (Some(access_token), Some(refresh_token)) = (access, refresh) else {
            break;
        };
        let accessor = format!("env://{provider}/{n}");
        let email = std::env::var(format!("{upper}_{n}_EMAIL")).ok();
        let account_id = std::env::var(format!("{upper}_{n}_ACCOUNT_ID")).ok();
        let id_token = std::env::var(format!("{upper}_{n}_ID_TOKEN")).ok();
        let expires_at = std::env::var(format!("{upper}_{n}_EXPIRY_DATE"))
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let fingerprint = email.clone().or_else(|| account_id.clone()).unwrap_or_else(|| accessor.clone());
        numbered.push(Credential {
            stable_id: format!("{provider}:{fingerprint}"),
            accessor,
            provider: provider.to_string(),
            email,
            account_id,
            priority: n as i32,
            tier: None,
            max_concurrent: None,
            secret: CredentialSecret::OAuth {
                access_token,
                refresh_token,
                id_token,
                expires_at,
                token_uri: String::new(),
            },
        });
        n += 1;
    }
    if !numbered.is_empty() {
        return numbered;
    }

    // Legacy, unnumbered form.
    let access = std::env::var(format!("{upper}_ACCESS_TOKEN")).ok();
    let refresh = std::env::var(format!("{upper}_REFRESH_TOKEN")).ok();
    let (Some(access_token), Some(refresh_token)) = (access, refresh) else {
        return Vec::new();
    };
    let accessor = format!("env://{provider}/legacy");
    let email = std::env::var(format!("{upper}_EMAIL")).ok();
    let account_id = std::env::var(format!("{upper}_ACCOUNT_ID")).ok();
    let id_token = std::env::var(format!("{upper}_ID_TOKEN")).ok();
    let expires_at = std::env::var(format!("{upper}_EXPIRY_DATE"))
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let fingerprint = email.clone().or_else(|| account_id.clone()).unwrap_or_else(|| accessor.clone());
    vec![Credential {
        stable_id: format!("{provider}:{fingerprint}"),
        accessor,
        provider: provider.to_string(),
        email,
        account_id,
        priority: 0,
        tier: None,
        max_concurrent: None,
        secret: CredentialSecret::OAuth {
            access_token,
            refresh_token,
            id_token,
            expires_at,
            token_uri: String::new(),
        },
    }]
}

fn discover_env_api_keys(provider: &str) -> Vec<Credential> {
    let upper = provider.to_ascii_uppercase();
    let mut out = Vec::new();

    if let Ok(api_key) = std::env::var(format!("{upper}_API_KEY")) {
        out.push(api_key_credential(provider, &format!("env://{provider}/0"), api_key, 0));
    }

    let mut n = 1;
    loop {
        let Ok(api_key) = std::env::var(format!("{upper}_API_KEY_{n}")) else {
            break;
        };
        out.push(api_key_credential(
            provider,
            &format!("env://{provider}/{n}"),
            api_key,
            n as i32,
        ));
        n += 1;
    }
    out
}

fn api_key_credential(provider: &str, accessor: &str, api_key: String, priority: i32) -> Credential {
    Credential {
        stable_id: format!("{provider}:{accessor}"),
        accessor: accessor.to_string(),
        provider: provider.to_string(),
        email: None,
        account_id: None,
        priority,
        tier: None,
        max_concurrent: None,
        secret: CredentialSecret::ApiKey { api_key },
    }
}

/// Deduplicates credentials that reached the catalog via two distinct
/// accessors but share a `stable_id` (§8 boundary behaviour).
pub fn dedup_by_stable_id(credentials: Vec<Credential>) -> Vec<Credential> {
    let mut seen = std::collections::HashSet::new();
    credentials
        .into_iter()
        .filter(|c| seen.insert(c.stable_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence() {
        let a = api_key_credential("openai", "env://openai/0", "sk-a".to_string(), 0);
        let mut b = api_key_credential("openai", "env://openai/1", "sk-b".to_string(), 1);
        b.stable_id = a.stable_id.clone();
        let out = dedup_by_stable_id(vec![a.clone(), b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].accessor, a.accessor);
    }
}
