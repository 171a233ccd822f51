use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::credential::CredentialId;

const SCHEMA_VERSION: u32 = 2;
const PRIMARY_WINDOW: &str = "primary";
const DEFAULT_WINDOW_SECONDS: u64 = 86_400;

/// Token/cost accounting surfaced by a plugin on `Classification::Success`.
///
/// Fields beyond prompt/completion/total are best-effort: a provider that
/// doesn't report them leaves them `None` rather than `Some(0)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl TotalStats {
    fn record_success(&mut self, usage: &Usage, cost: f64) {
        self.requests += 1;
        self.successes += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.cost += cost;
    }

    fn record_failure(&mut self) {
        self.requests += 1;
        self.failures += 1;
    }
}

/// A rolling counter over a fixed duration. Rolled in place whenever
/// `now >= reset_at`; `max_recorded_requests` is an all-time high-water mark
/// and is intentionally never reset across rollovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageWindow {
    pub started_at: SystemTime,
    pub reset_at: SystemTime,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub first_used_at: SystemTime,
    pub last_used_at: SystemTime,
    pub max_recorded_requests: u64,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl UsageWindow {
    fn new(duration: Duration, now: SystemTime) -> Self {
        Self {
            started_at: now,
            reset_at: now + duration,
            duration,
            requests: 0,
            successes: 0,
            failures: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            first_used_at: now,
            last_used_at: now,
            max_recorded_requests: 0,
        }
    }

    /// Rolls the window in place if `now >= reset_at`. `first_used_at` and
    /// `max_recorded_requests` survive the roll.
    fn roll_if_needed(&mut self, now: SystemTime) {
        if now < self.reset_at {
            return;
        }
        self.started_at = now;
        self.reset_at = now + self.duration;
        self.requests = 0;
        self.successes = 0;
        self.failures = 0;
        self.prompt_tokens = 0;
        self.completion_tokens = 0;
        self.total_tokens = 0;
        self.cost = 0.0;
    }

    fn record_success(&mut self, now: SystemTime, usage: &Usage, cost: f64) {
        self.roll_if_needed(now);
        self.requests += 1;
        self.successes += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.cost += cost;
        self.last_used_at = now;
        self.max_recorded_requests = self.max_recorded_requests.max(self.requests);
    }

    fn record_failure(&mut self, now: SystemTime) {
        self.roll_if_needed(now);
        self.requests += 1;
        self.failures += 1;
        self.last_used_at = now;
        self.max_recorded_requests = self.max_recorded_requests.max(self.requests);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeStats {
    pub windows: HashMap<String, UsageWindow>,
    pub totals: TotalStats,
}

impl ScopeStats {
    fn new(now: SystemTime) -> Self {
        let mut windows = HashMap::new();
        windows.insert(
            PRIMARY_WINDOW.to_string(),
            UsageWindow::new(Duration::from_secs(DEFAULT_WINDOW_SECONDS), now),
        );
        Self {
            windows,
            totals: TotalStats::default(),
        }
    }

    fn primary_request_count(&self, now: SystemTime) -> u64 {
        self.windows
            .get(PRIMARY_WINDOW)
            .map(|w| if now >= w.reset_at { 0 } else { w.requests })
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FairCycleExhaustReason {
    QuotaExhausted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FairCycleEntry {
    pub exhausted: bool,
    pub exhausted_at: Option<SystemTime>,
    pub exhausted_reason: Option<FairCycleExhaustReason>,
    pub cycle_request_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialState {
    pub accessor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub priority: i32,
    pub model_usage: HashMap<String, ScopeStats>,
    pub group_usage: HashMap<String, ScopeStats>,
    pub totals: TotalStats,
    pub fair_cycle: HashMap<String, FairCycleEntry>,
    #[serde(skip)]
    pub active_requests: u32,
    pub max_concurrent: u32,
}

impl CredentialState {
    fn new(accessor: String, tier: Option<String>, priority: i32, max_concurrent: u32) -> Self {
        Self {
            accessor,
            tier,
            priority,
            model_usage: HashMap::new(),
            group_usage: HashMap::new(),
            totals: TotalStats::default(),
            fair_cycle: HashMap::new(),
            active_requests: 0,
            max_concurrent,
        }
    }
}

/// Returned when a selection attempt would exceed `effective_max_concurrent`.
#[derive(Debug, Clone, Copy)]
pub struct Rejected;

/// RAII guard returned by `start_request`; its `Drop` decrements
/// `active_requests` so a cancelled or panicking task never leaks a slot.
/// `end_request` (an explicit early drop) is idempotent.
pub struct SlotHandle {
    manager: UsageManager,
    provider: String,
    credential_id: CredentialId,
    released: std::sync::atomic::AtomicBool,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if self
            .released
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let manager = self.manager.clone();
        let provider = self.provider.clone();
        let credential_id = self.credential_id.clone();
        tokio::spawn(async move {
            manager.end_request_inner(&provider, &credential_id).await;
        });
    }
}

#[derive(Serialize, Deserialize, Default)]
struct ProviderSnapshotFile {
    schema_version: u32,
    updated_at: Option<SystemTime>,
    credentials: HashMap<CredentialId, CredentialState>,
    accessor_index: HashMap<String, CredentialId>,
}

/// Holds `provider -> stable_id -> CredentialState`. Mutations go
/// through `start_request`/`end_request`/`record_success`/`record_failure`;
/// `get_stats` is a read-only snapshot for admin endpoints.
#[derive(Clone)]
pub struct UsageManager {
    inner: Arc<UsageManagerInner>,
}

struct UsageManagerInner {
    data_dir: PathBuf,
    providers: Mutex<HashMap<String, HashMap<CredentialId, CredentialState>>>,
    clock: Arc<dyn Clock>,
}

impl UsageManager {
    pub fn new(data_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(UsageManagerInner {
                data_dir: data_dir.into(),
                providers: Mutex::new(HashMap::new()),
                clock,
            }),
        }
    }

    fn snapshot_path(&self, provider: &str) -> PathBuf {
        self.inner.data_dir.join(format!("usage_{provider}.json"))
    }

    pub async fn ensure_credential(
        &self,
        provider: &str,
        credential_id: &CredentialId,
        accessor: &str,
        tier: Option<&str>,
        priority: i32,
        max_concurrent: u32,
    ) {
        let mut guard = self.inner.providers.lock().await;
        let creds = guard.entry(provider.to_string()).or_default();
        creds.entry(credential_id.clone()).or_insert_with(|| {
            CredentialState::new(
                accessor.to_string(),
                tier.map(|s| s.to_string()),
                priority,
                max_concurrent,
            )
        });
    }

    /// Mirrors `start_request`'s cap check without claiming a slot; used by
    /// the selector to skip over-capacity credentials before attempting one.
    pub async fn is_at_capacity(&self, provider: &str, credential_id: &CredentialId) -> bool {
        let guard = self.inner.providers.lock().await;
        guard
            .get(provider)
            .and_then(|m| m.get(credential_id))
            .is_some_and(|state| state.max_concurrent > 0 && state.active_requests >= state.max_concurrent)
    }

    pub async fn start_request(
        &self,
        provider: &str,
        credential_id: &CredentialId,
    ) -> Result<SlotHandle, Rejected> {
        {
            let mut guard = self.inner.providers.lock().await;
            let Some(state) = guard
                .get_mut(provider)
                .and_then(|m| m.get_mut(credential_id))
            else {
                return Err(Rejected);
            };
            if state.max_concurrent > 0 && state.active_requests >= state.max_concurrent {
                return Err(Rejected);
            }
            state.active_requests += 1;
        }
        Ok(SlotHandle {
            manager: self.clone(),
            provider: provider.to_string(),
            credential_id: credential_id.clone(),
            released: std::sync::atomic::AtomicBool::new(false),
        })
    }

    async fn end_request_inner(&self, provider: &str, credential_id: &CredentialId) {
        let mut guard = self.inner.providers.lock().await;
        if let Some(state) = guard
            .get_mut(provider)
            .and_then(|m| m.get_mut(credential_id))
        {
            state.active_requests = state.active_requests.saturating_sub(1);
        }
    }

    pub async fn record_success(
        &self,
        provider: &str,
        credential_id: &CredentialId,
        model: &str,
        group: Option<&str>,
        usage: Usage,
        cost: f64,
    ) {
        let now = self.inner.clock.now();
        let mut guard = self.inner.providers.lock().await;
        let Some(state) = guard
            .get_mut(provider)
            .and_then(|m| m.get_mut(credential_id))
        else {
            return;
        };
        state
            .model_usage
            .entry(model.to_string())
            .or_insert_with(|| ScopeStats::new(now))
            .windows
            .entry(PRIMARY_WINDOW.to_string())
            .or_insert_with(|| UsageWindow::new(Duration::from_secs(DEFAULT_WINDOW_SECONDS), now))
            .record_success(now, &usage, cost);
        state
            .model_usage
            .get_mut(model)
            .expect("inserted above")
            .totals
            .record_success(&usage, cost);
        if let Some(group) = group {
            let scope = state
                .group_usage
                .entry(group.to_string())
                .or_insert_with(|| ScopeStats::new(now));
            scope
                .windows
                .entry(PRIMARY_WINDOW.to_string())
                .or_insert_with(|| {
                    UsageWindow::new(Duration::from_secs(DEFAULT_WINDOW_SECONDS), now)
                })
                .record_success(now, &usage, cost);
            scope.totals.record_success(&usage, cost);
        }
        state.totals.record_success(&usage, cost);
    }

    pub async fn record_failure(
        &self,
        provider: &str,
        credential_id: &CredentialId,
        model: &str,
        group: Option<&str>,
    ) {
        let now = self.inner.clock.now();
        let mut guard = self.inner.providers.lock().await;
        let Some(state) = guard
            .get_mut(provider)
            .and_then(|m| m.get_mut(credential_id))
        else {
            return;
        };
        state
            .model_usage
            .entry(model.to_string())
            .or_insert_with(|| ScopeStats::new(now))
            .windows
            .entry(PRIMARY_WINDOW.to_string())
            .or_insert_with(|| UsageWindow::new(Duration::from_secs(DEFAULT_WINDOW_SECONDS), now))
            .record_failure(now);
        if let Some(group) = group {
            state
                .group_usage
                .entry(group.to_string())
                .or_insert_with(|| ScopeStats::new(now))
                .windows
                .entry(PRIMARY_WINDOW.to_string())
                .or_insert_with(|| {
                    UsageWindow::new(Duration::from_secs(DEFAULT_WINDOW_SECONDS), now)
                })
                .record_failure(now);
        }
        state.totals.record_failure();
    }

    /// `scope` is the quota-group if defined, else the model itself.
    pub async fn primary_window_request_count(
        &self,
        provider: &str,
        credential_id: &CredentialId,
        scope: &str,
    ) -> u64 {
        let now = self.inner.clock.now();
        let guard = self.inner.providers.lock().await;
        let Some(state) = guard.get(provider).and_then(|m| m.get(credential_id)) else {
            return 0;
        };
        state
            .group_usage
            .get(scope)
            .or_else(|| state.model_usage.get(scope))
            .map(|s| s.primary_request_count(now))
            .unwrap_or(0)
    }

    /// `scope` is the quota-group if defined, else the model itself. `None`
    /// if the credential has never recorded a success/failure in this scope.
    pub async fn primary_window_last_used_at(
        &self,
        provider: &str,
        credential_id: &CredentialId,
        scope: &str,
    ) -> Option<SystemTime> {
        let guard = self.inner.providers.lock().await;
        let state = guard.get(provider).and_then(|m| m.get(credential_id))?;
        state
            .group_usage
            .get(scope)
            .or_else(|| state.model_usage.get(scope))
            .and_then(|s| s.windows.get(PRIMARY_WINDOW))
            .map(|w| w.last_used_at)
    }

    pub async fn active_requests(&self, provider: &str, credential_id: &CredentialId) -> u32 {
        let guard = self.inner.providers.lock().await;
        guard
            .get(provider)
            .and_then(|m| m.get(credential_id))
            .map(|s| s.active_requests)
            .unwrap_or(0)
    }

    /// Marks `(credential, scope)` exhausted. If every credential for
    /// `(provider, scope)` is now exhausted, atomically clears all of their
    /// `exhausted` flags (fair-cycle reset) and returns `true`.
    pub async fn mark_exhausted(
        &self,
        provider: &str,
        credential_id: &CredentialId,
        scope: &str,
    ) -> bool {
        let now = self.inner.clock.now();
        let mut guard = self.inner.providers.lock().await;
        let Some(creds) = guard.get_mut(provider) else {
            return false;
        };
        if let Some(state) = creds.get_mut(credential_id) {
            let entry = state.fair_cycle.entry(scope.to_string()).or_default();
            entry.exhausted = true;
            entry.exhausted_at = Some(now);
            entry.exhausted_reason = Some(FairCycleExhaustReason::QuotaExhausted);
        }
        let all_exhausted = !creds.is_empty()
            && creds
                .values()
                .all(|s| s.fair_cycle.get(scope).is_some_and(|e| e.exhausted));
        if all_exhausted {
            for state in creds.values_mut() {
                if let Some(entry) = state.fair_cycle.get_mut(scope) {
                    entry.exhausted = false;
                    entry.exhausted_at = None;
                    entry.exhausted_reason = None;
                }
            }
        }
        all_exhausted
    }

    /// Clears every fair-cycle exhaustion flag recorded for this credential.
    /// Called after a successful OAuth refresh: a freshly refreshed
    /// credential shouldn't stay marked exhausted from before the refresh.
    pub async fn reset_fair_cycle(&self, provider: &str, credential_id: &CredentialId) {
        let mut guard = self.inner.providers.lock().await;
        if let Some(state) = guard.get_mut(provider).and_then(|m| m.get_mut(credential_id)) {
            for entry in state.fair_cycle.values_mut() {
                entry.exhausted = false;
                entry.exhausted_at = None;
                entry.exhausted_reason = None;
            }
        }
    }

    pub async fn is_exhausted(
        &self,
        provider: &str,
        credential_id: &CredentialId,
        scope: &str,
    ) -> bool {
        let guard = self.inner.providers.lock().await;
        guard
            .get(provider)
            .and_then(|m| m.get(credential_id))
            .and_then(|s| s.fair_cycle.get(scope))
            .is_some_and(|e| e.exhausted)
    }

    /// Read-only view for `/stats`. `provider: None` returns every provider.
    pub async fn get_stats(&self, provider: Option<&str>) -> serde_json::Value {
        let guard = self.inner.providers.lock().await;
        let mut out = serde_json::Map::new();
        for (name, creds) in guard.iter() {
            if let Some(filter) = provider
                && filter != name
            {
                continue;
            }
            let value = serde_json::to_value(creds).unwrap_or(serde_json::Value::Null);
            out.insert(name.clone(), value);
        }
        serde_json::Value::Object(out)
    }

    /// Atomically persists the given provider's state (write-to-temp, rename).
    pub async fn persist(&self, provider: &str) -> std::io::Result<()> {
        let snapshot = {
            let guard = self.inner.providers.lock().await;
            guard.get(provider).cloned().unwrap_or_default()
        };
        let accessor_index = snapshot
            .iter()
            .map(|(id, state)| (state.accessor.clone(), id.clone()))
            .collect();
        let file = ProviderSnapshotFile {
            schema_version: SCHEMA_VERSION,
            updated_at: Some(self.inner.clock.now()),
            credentials: snapshot,
            accessor_index,
        };
        let path = self.snapshot_path(provider);
        write_json_atomic(&path, &file).await
    }

    /// Loads a previously persisted snapshot, resetting `active_requests` to
    /// 0 and rolling any window whose `reset_at <= now`.
    pub async fn load(&self, provider: &str) -> std::io::Result<()> {
        let path = self.snapshot_path(provider);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        let file: ProviderSnapshotFile = serde_json::from_slice(&bytes)?;
        let now = self.inner.clock.now();
        let mut credentials = file.credentials;
        for state in credentials.values_mut() {
            state.active_requests = 0;
            for scope in state
                .model_usage
                .values_mut()
                .chain(state.group_usage.values_mut())
            {
                for window in scope.windows.values_mut() {
                    window.roll_if_needed(now);
                }
            }
        }
        let mut guard = self.inner.providers.lock().await;
        guard.insert(provider.to_string(), credentials);
        Ok(())
    }

    /// Spawns a background loop that persists every provider every
    /// `interval`. Best-effort: write failures are swallowed (the next tick
    /// retries).
    pub fn spawn_debounced_writer(&self, interval: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let providers: Vec<String> = {
                    let guard = manager.inner.providers.lock().await;
                    guard.keys().cloned().collect()
                };
                for provider in providers {
                    let _ = manager.persist(&provider).await;
                }
            }
        });
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &body).await?;
    fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FakeClock, SystemClock};

    #[tokio::test]
    async fn start_request_rejects_over_capacity() {
        let manager = UsageManager::new(std::env::temp_dir(), Arc::new(SystemClock));
        manager
            .ensure_credential("openai", &"c1".to_string(), "env://openai/0", None, 0, 1)
            .await;
        let first = manager.start_request("openai", &"c1".to_string()).await;
        assert!(first.is_ok());
        let second = manager.start_request("openai", &"c1".to_string()).await;
        assert!(second.is_err());
        drop(first);
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn record_success_updates_model_and_group_windows() {
        let manager = UsageManager::new(std::env::temp_dir(), Arc::new(SystemClock));
        manager
            .ensure_credential("openai", &"c1".to_string(), "env://openai/0", None, 0, 0)
            .await;
        manager
            .record_success(
                "openai",
                &"c1".to_string(),
                "gpt-4",
                Some("gpt4-group"),
                Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                    ..Default::default()
                },
                0.001,
            )
            .await;
        let count = manager
            .primary_window_request_count("openai", &"c1".to_string(), "gpt4-group")
            .await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn fair_cycle_resets_when_all_exhausted() {
        let manager = UsageManager::new(std::env::temp_dir(), Arc::new(SystemClock));
        manager
            .ensure_credential("openai", &"c1".to_string(), "env://openai/0", None, 0, 0)
            .await;
        manager
            .ensure_credential("openai", &"c2".to_string(), "env://openai/1", None, 0, 0)
            .await;
        assert!(!manager.mark_exhausted("openai", &"c1".to_string(), "g1").await);
        assert!(manager.mark_exhausted("openai", &"c2".to_string(), "g1").await);
        assert!(!manager.is_exhausted("openai", &"c1".to_string(), "g1").await);
        assert!(!manager.is_exhausted("openai", &"c2".to_string(), "g1").await);
    }

    #[tokio::test]
    async fn primary_window_rolls_over_once_its_duration_elapses() {
        let clock = FakeClock::new(SystemTime::now());
        let manager = UsageManager::new(std::env::temp_dir(), Arc::new(clock.clone()));
        manager
            .ensure_credential("openai", &"c1".to_string(), "env://openai/0", None, 0, 0)
            .await;
        manager
            .record_success(
                "openai",
                &"c1".to_string(),
                "gpt-4",
                None,
                Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                    ..Default::default()
                },
                0.0,
            )
            .await;
        assert_eq!(
            manager
                .primary_window_request_count("openai", &"c1".to_string(), "gpt-4")
                .await,
            1
        );

        clock.advance(Duration::from_secs(DEFAULT_WINDOW_SECONDS + 1));
        manager
            .record_success(
                "openai",
                &"c1".to_string(),
                "gpt-4",
                None,
                Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                    ..Default::default()
                },
                0.0,
            )
            .await;

        // The window rolled: it sees only the post-roll request...
        assert_eq!(
            manager
                .primary_window_request_count("openai", &"c1".to_string(), "gpt-4")
                .await,
            1
        );
        // ...but the all-time high-water mark from before the roll survives.
        let guard = manager.inner.providers.lock().await;
        let window = guard["openai"][&"c1".to_string()].model_usage["gpt-4"]
            .windows
            .get(PRIMARY_WINDOW)
            .unwrap();
        assert_eq!(window.max_recorded_requests, 1);
        // `started_at` moved forward with the roll; `first_used_at` didn't.
        assert!(window.first_used_at < window.started_at);
    }
}
