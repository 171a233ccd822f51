mod cooldown;
mod cooldown_queue;
mod state;

pub use cooldown::CooldownManager;
pub use state::{Cooldown, CooldownReason, CooldownSource, CredentialId, Scope};

use serde::{Deserialize, Serialize};

/// A discovered credential: identity + rotation attributes, plus its secret.
///
/// Discovered at startup from OAuth JSON files, numbered/legacy env vars, or
/// static API keys (see `keyrelay-core`'s discovery module). Priority/tier may
/// change on reauth; credentials are never deleted at runtime, only disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub stable_id: CredentialId,
    pub accessor: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    pub secret: CredentialSecret,
}

impl Credential {
    pub fn is_oauth(&self) -> bool {
        matches!(self.secret, CredentialSecret::OAuth { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSecret {
    ApiKey {
        api_key: String,
    },
    OAuth {
        access_token: String,
        refresh_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id_token: Option<String>,
        /// Unix millis.
        expires_at: i64,
        token_uri: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_credential_round_trips() {
        let cred = Credential {
            stable_id: "codex:alice@example.com".to_string(),
            accessor: "/data/oauth_creds/codex_oauth_1.json".to_string(),
            provider: "codex".to_string(),
            email: Some("alice@example.com".to_string()),
            account_id: Some("acct_1".to_string()),
            priority: 0,
            tier: None,
            max_concurrent: None,
            secret: CredentialSecret::OAuth {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
                id_token: None,
                expires_at: 0,
                token_uri: "https://example.com/token".to_string(),
            },
        };
        let value = serde_json::to_value(&cred).expect("serializes");
        let back: Credential = serde_json::from_value(value).expect("deserializes");
        assert_eq!(back.stable_id, cred.stable_id);
        assert!(back.is_oauth());
    }

    #[test]
    fn api_key_credential_is_not_oauth() {
        let cred = Credential {
            stable_id: "openai:env://openai/0".to_string(),
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
        };
        assert!(!cred.is_oauth());
    }
}
