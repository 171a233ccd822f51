use keyrelay_provider_core::{CooldownManager, Credential, RotationMode, UsageManager};

/// A provider's static catalog plus the dynamic bits the selector consults.
pub struct SelectorInputs<'a> {
    pub catalog: &'a [Credential],
    pub cooldowns: &'a CooldownManager,
    pub usage: &'a UsageManager,
    pub rotation_mode: RotationMode,
    pub quota_groups: &'a [(&'static str, &'static str)],
    /// Request counts within this many of each other are treated as tied in
    /// `RotationMode::Balanced`; the tie is then broken by least-recently-used.
    /// `0` means "exact count match only".
    pub rotation_tolerance: u64,
}

fn quota_group(quota_groups: &[(&'static str, &'static str)], model: &str) -> Option<&'static str> {
    quota_groups
        .iter()
        .find(|(m, _)| *m == model)
        .map(|(_, g)| *g)
}

/// Builds an ordered, finite candidate sequence for `(provider, model)`.
/// Unavailable-via-cooldown and over-concurrency candidates are
/// filtered out up front; everything else is a lazy-enough ordering since
/// the executor stops consuming on the first success.
pub async fn candidates(
    provider: &str,
    model: &str,
    inputs: &SelectorInputs<'_>,
) -> Vec<Credential> {
    let now = tokio::time::Instant::now();
    let group = quota_group(inputs.quota_groups, model);
    let scope = group.unwrap_or(model);

    let mut eligible = Vec::new();
    for credential in inputs.catalog {
        if credential.provider != provider {
            continue;
        }
        if inputs
            .cooldowns
            .is_active_now(&credential.stable_id, model, group, now)
            .await
        {
            continue;
        }
        if inputs.usage.is_at_capacity(provider, &credential.stable_id).await {
            continue;
        }
        eligible.push(credential.clone());
    }

    match inputs.rotation_mode {
        RotationMode::Sequential => {
            eligible.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.stable_id.cmp(&b.stable_id)));
        }
        RotationMode::Balanced => {
            let mut with_keys = Vec::with_capacity(eligible.len());
            for credential in eligible {
                let count = inputs
                    .usage
                    .primary_window_request_count(provider, &credential.stable_id, scope)
                    .await;
                let last_used_at = inputs
                    .usage
                    .primary_window_last_used_at(provider, &credential.stable_id, scope)
                    .await;
                with_keys.push((credential, count, last_used_at));
            }
            // Counts within `rotation_tolerance` of each other bucket together so
            // near-equally-used credentials rotate by recency instead of the raw
            // count ordering pinning one credential in front forever.
            let bucket = |count: u64| {
                if inputs.rotation_tolerance > 0 {
                    count / inputs.rotation_tolerance
                } else {
                    count
                }
            };
            with_keys.sort_by(|(a, a_count, a_used), (b, b_count, b_used)| {
                a.priority
                    .cmp(&b.priority)
                    .then(bucket(*a_count).cmp(&bucket(*b_count)))
                    .then(a_used.cmp(b_used))
                    .then(a_count.cmp(b_count))
                    .then(a.stable_id.cmp(&b.stable_id))
            });
            eligible = with_keys.into_iter().map(|(c, ..)| c).collect();
        }
    }

    eligible
}

/// Earliest moment any cooldowned-out candidate for this provider will
/// become available again, used by the executor to sleep instead of
/// failing immediately with `NoAvailableCredentials`.
pub async fn earliest_retry(
    provider: &str,
    inputs: &SelectorInputs<'_>,
) -> Option<tokio::time::Instant> {
    let mut earliest = None;
    for credential in inputs.catalog.iter().filter(|c| c.provider == provider) {
        if let Some(end) = inputs.cooldowns.earliest_end(&credential.stable_id).await {
            earliest = Some(match earliest {
                Some(current) if current <= end => current,
                _ => end,
            });
        }
    }
    earliest
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_provider_core::{Credential, CredentialSecret, EventHub, Scope, SystemClock};
    use std::sync::Arc;

    fn api_key_credential(stable_id: &str, priority: i32) -> Credential {
        Credential {
            stable_id: stable_id.to_string(),
            accessor: format!("env://openai/{stable_id}"),
            provider: "openai".to_string(),
            email: None,
            account_id: None,
            priority,
            tier: None,
            max_concurrent: None,
            secret: CredentialSecret::ApiKey {
                api_key: "sk-test".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn sequential_orders_by_priority_then_stable_id() {
        let catalog = vec![
            api_key_credential("openai:b", 1),
            api_key_credential("openai:a", 1),
            api_key_credential("openai:c", 0),
        ];
        let cooldowns = CooldownManager::new(EventHub::new(16), Arc::new(SystemClock));
        let usage = UsageManager::new(std::env::temp_dir(), Arc::new(SystemClock));
        let inputs = SelectorInputs {
            catalog: &catalog,
            cooldowns: &cooldowns,
            usage: &usage,
            rotation_mode: RotationMode::Sequential,
            quota_groups: &[],
            rotation_tolerance: 0,
        };
        let ordered = candidates("openai", "gpt-4", &inputs).await;
        let ids: Vec<&str> = ordered.iter().map(|c| c.stable_id.as_str()).collect();
        assert_eq!(ids, vec!["openai:c", "openai:a", "openai:b"]);
    }

    #[tokio::test]
    async fn balanced_mode_breaks_near_equal_counts_by_recency() {
        let catalog = vec![api_key_credential("openai:a", 0), api_key_credential("openai:b", 0)];
        let cooldowns = CooldownManager::new(EventHub::new(16), Arc::new(SystemClock));
        let usage = UsageManager::new(std::env::temp_dir(), Arc::new(SystemClock));
        usage
            .ensure_credential("openai", &"openai:a".to_string(), "env://openai/a", None, 0, 0)
            .await;
        usage
            .ensure_credential("openai", &"openai:b".to_string(), "env://openai/b", None, 0, 0)
            .await;
        // "a" has 10 requests recorded just now; "b" has 9, recorded a moment
        // earlier. With a tolerance of 2 they're treated as tied, so the
        // least-recently-used one ("b") should be preferred.
        for _ in 0..9 {
            usage
                .record_success(
                    "openai",
                    &"openai:b".to_string(),
                    "gpt-4",
                    None,
                    keyrelay_provider_core::Usage::default(),
                    0.0,
                )
                .await;
        }
        for _ in 0..10 {
            usage
                .record_success(
                    "openai",
                    &"openai:a".to_string(),
                    "gpt-4",
                    None,
                    keyrelay_provider_core::Usage::default(),
                    0.0,
                )
                .await;
        }
        let inputs = SelectorInputs {
            catalog: &catalog,
            cooldowns: &cooldowns,
            usage: &usage,
            rotation_mode: RotationMode::Balanced,
            quota_groups: &[],
            rotation_tolerance: 2,
        };
        let ordered = candidates("openai", "gpt-4", &inputs).await;
        let ids: Vec<&str> = ordered.iter().map(|c| c.stable_id.as_str()).collect();
        assert_eq!(ids, vec!["openai:b", "openai:a"]);
    }

    #[tokio::test]
    async fn filters_out_other_providers_and_active_cooldowns() {
        let catalog = vec![
            api_key_credential("openai:a", 0),
            Credential {
                provider: "claude".to_string(),
                ..api_key_credential("claude:x", 0)
            },
        ];
        let cooldowns = CooldownManager::new(EventHub::new(16), Arc::new(SystemClock));
        cooldowns
            .set(
                "openai:a".to_string(),
                Scope::All,
                keyrelay_provider_core::CooldownReason::RateLimit,
                tokio::time::Instant::now() + std::time::Duration::from_secs(30),
                keyrelay_provider_core::CooldownSource::ProviderHeader,
            )
            .await;
        let usage = UsageManager::new(std::env::temp_dir(), Arc::new(SystemClock));
        let inputs = SelectorInputs {
            catalog: &catalog,
            cooldowns: &cooldowns,
            usage: &usage,
            rotation_mode: RotationMode::Sequential,
            quota_groups: &[],
            rotation_tolerance: 0,
        };
        let ordered = candidates("openai", "gpt-4", &inputs).await;
        assert!(ordered.is_empty(), "the only openai credential is cooling down");
    }

    #[tokio::test]
    async fn earliest_retry_reports_the_soonest_cooldown_end() {
        let catalog = vec![api_key_credential("openai:a", 0)];
        let cooldowns = CooldownManager::new(EventHub::new(16), Arc::new(SystemClock));
        let until = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        cooldowns
            .set(
                "openai:a".to_string(),
                Scope::All,
                keyrelay_provider_core::CooldownReason::RateLimit,
                until,
                keyrelay_provider_core::CooldownSource::ProviderHeader,
            )
            .await;
        let usage = UsageManager::new(std::env::temp_dir(), Arc::new(SystemClock));
        let inputs = SelectorInputs {
            catalog: &catalog,
            cooldowns: &cooldowns,
            usage: &usage,
            rotation_mode: RotationMode::Sequential,
            quota_groups: &[],
            rotation_tolerance: 0,
        };
        let retry_at = earliest_retry("openai", &inputs).await;
        assert_eq!(retry_at, Some(until));
    }
}
