use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::EventHub;
use crate::clock::Clock;
use crate::events::{CooldownStartEvent, Event, OperationalEvent};

use super::cooldown_queue::CooldownQueue;
use super::state::{Cooldown, CooldownReason, CooldownSource, CredentialId, Scope};

type CooldownKey = (CredentialId, Scope);

/// In-memory `(credential, scope) -> Cooldown` map. Not persisted: cooldown
/// state is short-lived and providers re-report it on reconnection.
pub struct CooldownManager {
    cooldowns: Arc<RwLock<HashMap<CooldownKey, Cooldown>>>,
    events: EventHub,
    queue: Arc<CooldownQueue>,
    clock: Arc<dyn Clock>,
}

impl CooldownManager {
    pub fn new(events: EventHub, clock: Arc<dyn Clock>) -> Self {
        let cooldowns = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(CooldownQueue::new());
        queue
            .clone()
            .spawn_recover_task(cooldowns.clone(), events.clone(), clock.clone());
        Self {
            cooldowns,
            events,
            queue,
            clock,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Sets a cooldown, superseding any existing one on the same key by
    /// keeping the later `until`.
    pub async fn set(
        &self,
        credential_id: CredentialId,
        scope: Scope,
        reason: CooldownReason,
        until: Instant,
        source: CooldownSource,
    ) {
        let key = (credential_id.clone(), scope.clone());
        let mut backoff_count = 0;
        {
            let mut guard = self.cooldowns.write().await;
            if let Some(existing) = guard.get(&key) {
                backoff_count = existing.backoff_count;
                if existing.until >= until {
                    return;
                }
            }
            guard.insert(
                key,
                Cooldown {
                    reason,
                    started_at: self.clock.now(),
                    until,
                    backoff_count: backoff_count + 1,
                    source,
                },
            );
        }
        self.queue.push(until, credential_id.clone(), scope.clone()).await;

        let until_wall = self
            .clock
            .now()
            .checked_add(until.saturating_duration_since(Instant::now()))
            .unwrap_or_else(|| self.clock.now());
        self.events
            .emit(Event::Operational(OperationalEvent::CooldownStart(
                CooldownStartEvent {
                    at: self.clock.now(),
                    credential_id,
                    scope,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    /// True if any cooldown on scope `*`, `model`, or `group` blocks this
    /// credential right now. Expired entries are lazily dropped.
    pub async fn is_active_now(
        &self,
        credential_id: &CredentialId,
        model: &str,
        group: Option<&str>,
        now: Instant,
    ) -> bool {
        let mut candidates = vec![Scope::All, Scope::Model(model.to_string())];
        if let Some(group) = group {
            candidates.push(Scope::Group(group.to_string()));
        }
        let guard = self.cooldowns.read().await;
        candidates.into_iter().any(|scope| {
            guard
                .get(&(credential_id.clone(), scope))
                .is_some_and(|cooldown| cooldown.until > now)
        })
    }

    pub async fn earliest_end(&self, credential_id: &CredentialId) -> Option<Instant> {
        let guard = self.cooldowns.read().await;
        guard
            .iter()
            .filter(|((id, _), _)| id == credential_id)
            .map(|(_, cooldown)| cooldown.until)
            .min()
    }

    pub async fn clear(&self, credential_id: &CredentialId, scope: &Scope) {
        self.cooldowns
            .write()
            .await
            .remove(&(credential_id.clone(), scope.clone()));
    }
}
