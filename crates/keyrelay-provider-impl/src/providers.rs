pub mod claude;
pub mod codex;
pub mod openai;

pub(crate) mod oauth_common;

use keyrelay_protocol::openai::Model;
use keyrelay_provider_core::ProviderConfig;

/// Builds the `list_models` response from an operator-supplied `<PROVIDER>_MODELS`
/// override. Providers with a live models endpoint don't call this.
pub(crate) fn models_from_table(config: &ProviderConfig) -> Vec<Model> {
    config
        .models()
        .models
        .iter()
        .map(|record| Model {
            id: record.id.clone(),
            object: "model".to_string(),
            created: 0,
            owned_by: "keyrelay".to_string(),
        })
        .collect()
}
