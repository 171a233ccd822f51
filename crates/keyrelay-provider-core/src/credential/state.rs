use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub type CredentialId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    RateLimit,
    QuotaExceeded,
    TransientError,
    AuthFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownSource {
    ProviderHeader,
    ProviderError,
    Synthetic,
}

/// What a cooldown blocks: one model, a quota-group, or everything (`*`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    Model(String),
    Group(String),
    All,
}

impl Scope {
    pub fn blocks(&self, model: &str, group: Option<&str>) -> bool {
        match self {
            Scope::All => true,
            Scope::Model(m) => m == model,
            Scope::Group(g) => group == Some(g.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cooldown {
    pub reason: CooldownReason,
    pub started_at: SystemTime,
    pub until: Instant,
    pub backoff_count: u32,
    pub source: CooldownSource,
}
