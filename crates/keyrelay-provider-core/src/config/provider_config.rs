use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ModelTable;
use crate::provider::RotationMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "channel_settings", rename_all = "lowercase")]
pub enum ProviderConfig {
    OpenAI(OpenAIConfig),
    Claude(ClaudeConfig),
    Codex(CodexConfig),
}

impl ProviderConfig {
    pub fn base_url(&self) -> Option<&str> {
        match self {
            ProviderConfig::OpenAI(c) => c.base_url.as_deref(),
            ProviderConfig::Claude(c) => c.base_url.as_deref(),
            ProviderConfig::Codex(c) => c.base_url.as_deref(),
        }
    }

    pub fn max_concurrent_per_key(&self) -> Option<u32> {
        match self {
            ProviderConfig::OpenAI(c) => c.max_concurrent_per_key,
            ProviderConfig::Claude(c) => c.max_concurrent_per_key,
            ProviderConfig::Codex(c) => c.max_concurrent_per_key,
        }
    }

    pub fn rotation_mode(&self) -> Option<RotationMode> {
        match self {
            ProviderConfig::OpenAI(c) => c.rotation_mode,
            ProviderConfig::Claude(c) => c.rotation_mode,
            ProviderConfig::Codex(c) => c.rotation_mode,
        }
    }

    pub fn concurrency_multipliers(&self) -> &HashMap<i32, f64> {
        match self {
            ProviderConfig::OpenAI(c) => &c.concurrency_multipliers,
            ProviderConfig::Claude(c) => &c.concurrency_multipliers,
            ProviderConfig::Codex(c) => &c.concurrency_multipliers,
        }
    }

    pub fn is_model_allowed(&self, model: &str) -> bool {
        let (ignore, whitelist) = match self {
            ProviderConfig::OpenAI(c) => (&c.ignore_models, &c.whitelist_models),
            ProviderConfig::Claude(c) => (&c.ignore_models, &c.whitelist_models),
            ProviderConfig::Codex(c) => (&c.ignore_models, &c.whitelist_models),
        };
        if !whitelist.is_empty() {
            return whitelist.iter().any(|m| m == model);
        }
        !ignore.iter().any(|m| m == model)
    }

    /// Operator-supplied model catalog override (`<PROVIDER>_MODELS`). Empty
    /// unless the operator configured one; providers that hit a live models
    /// endpoint ignore this.
    pub fn models(&self) -> &ModelTable {
        match self {
            ProviderConfig::OpenAI(c) => &c.models,
            ProviderConfig::Claude(c) => &c.models,
            ProviderConfig::Codex(c) => &c.models,
        }
    }
}

/// `CONCURRENCY_MULTIPLIER_<PROVIDER>_PRIORITY_<N>`, `IGNORE_MODELS_<PROVIDER>`,
/// `WHITELIST_MODELS_<PROVIDER>` and friends are per-provider, but every
/// provider carries the same shape, so each config struct repeats these
/// fields rather than introducing a shared base type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAIConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_per_key: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_mode: Option<RotationMode>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub concurrency_multipliers: HashMap<i32, f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ignore_models: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub whitelist_models: Vec<String>,
    #[serde(skip_serializing_if = "is_empty_model_table", default)]
    pub models: ModelTable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaudeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_per_key: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_mode: Option<RotationMode>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub concurrency_multipliers: HashMap<i32, f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ignore_models: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub whitelist_models: Vec<String>,
    #[serde(skip_serializing_if = "is_empty_model_table", default)]
    pub models: ModelTable,
}

fn is_empty_model_table(table: &ModelTable) -> bool {
    table.models.is_empty()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodexConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_per_key: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_mode: Option<RotationMode>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub concurrency_multipliers: HashMap<i32, f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ignore_models: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub whitelist_models: Vec<String>,
    #[serde(skip_serializing_if = "is_empty_model_table", default)]
    pub models: ModelTable,
}
