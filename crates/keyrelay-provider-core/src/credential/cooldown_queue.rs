use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Instant, sleep_until};

use crate::EventHub;
use crate::clock::Clock;
use crate::events::{CooldownEndEvent, Event, OperationalEvent};

use super::state::{Cooldown, CredentialId, Scope};

type CooldownKey = (CredentialId, Scope);

#[derive(Debug)]
pub struct CooldownQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, CredentialId, Scope)>>>,
    notify: Notify,
}

impl CooldownQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, until: Instant, credential_id: CredentialId, scope: Scope) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until, credential_id, scope)));
        }
        // Always notify: the background task will re-compute the next deadline.
        self.notify.notify_one();
    }

    pub fn spawn_recover_task(
        self: Arc<Self>,
        cooldowns: Arc<RwLock<HashMap<CooldownKey, Cooldown>>>,
        events: EventHub,
        clock: Arc<dyn Clock>,
    ) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek()
                        .map(|Reverse((t, id, scope))| (*t, id.clone(), scope.clone()))
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _, _)) => {
                        sleep_until(deadline).await;
                    }
                }

                let now = Instant::now();
                let mut due: Vec<(CredentialId, Scope)> = Vec::new();

                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, _, _))) = heap.peek()
                        && *t <= now
                    {
                        let Reverse((_, id, scope)) = heap.pop().expect("peeked above");
                        due.push((id, scope));
                    }
                }

                if due.is_empty() {
                    continue;
                }

                // Remove due entries, but guard against stale queue entries
                // (a superseding `set()` may have pushed a later deadline).
                let mut guard = cooldowns.write().await;
                for (id, scope) in due {
                    let key = (id.clone(), scope.clone());
                    let should_clear = match guard.get(&key) {
                        Some(cooldown) => cooldown.until <= now,
                        None => false,
                    };
                    if should_clear {
                        guard.remove(&key);
                        events
                            .emit(Event::Operational(OperationalEvent::CooldownEnd(
                                CooldownEndEvent {
                                    at: clock.now(),
                                    credential_id: id,
                                    scope,
                                },
                            )))
                            .await;
                    }
                }
            }
        });
    }
}
