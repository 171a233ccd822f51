use bytes::Bytes;

use keyrelay_protocol::openai::{CreateChatCompletionRequestBody, Model};
use keyrelay_provider_core::{
    Credential, CredentialSecret, DispatchTable, HttpMethod, ProviderConfig, UpstreamClient,
    UpstreamCtx, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse, UpstreamProvider,
};

use crate::auth_extractor;
use crate::providers::models_from_table;

const PROVIDER_NAME: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Default)]
pub struct OpenAIProvider;

impl OpenAIProvider {
    pub fn new() -> Self {
        Self
    }

    fn base_url<'a>(&self, config: &'a ProviderConfig) -> &'a str {
        match config {
            ProviderConfig::OpenAI(cfg) => cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            _ => DEFAULT_BASE_URL,
        }
    }

    fn api_key<'a>(&self, credential: &'a Credential) -> Result<&'a str, UpstreamFailure> {
        match &credential.secret {
            CredentialSecret::ApiKey { api_key } => Ok(api_key.as_str()),
            CredentialSecret::OAuth { .. } => Err(UpstreamFailure::Build(
                "openai provider requires an API key credential".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn dispatch_table(&self, _config: &ProviderConfig) -> DispatchTable {
        DispatchTable::all_native()
    }

    async fn list_models(
        &self,
        _ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
    ) -> keyrelay_provider_core::ProviderResult<Vec<Model>> {
        let _ = (self.base_url(config), self.api_key(credential));
        // Model listing for the OpenAI-compatible surface is served from the
        // configured model table rather than a live upstream call; plugins
        // that want a live catalog override this.
        Ok(models_from_table(config))
    }

    async fn execute(
        &self,
        _ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
        client: &dyn UpstreamClient,
        request: &CreateChatCompletionRequestBody,
    ) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        let api_key = self.api_key(credential)?;
        let base_url = self.base_url(config).trim_end_matches('/');
        let url = format!("{base_url}/v1/chat/completions");
        let is_stream = request.stream.unwrap_or(false);
        let body = serde_json::to_vec(request)
            .map_err(|err| UpstreamFailure::Build(err.to_string()))?;

        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, api_key);
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);

        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(Bytes::from(body)),
            is_stream,
        };
        client.send(req).await
    }
}
