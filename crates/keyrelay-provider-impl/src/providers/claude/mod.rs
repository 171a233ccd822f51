mod translate;

use bytes::Bytes;

use keyrelay_protocol::openai::CreateChatCompletionRequestBody;
use keyrelay_provider_core::{
    Credential, CredentialSecret, DispatchTable, HttpMethod, ProviderConfig, UpstreamBody,
    UpstreamClient, UpstreamCtx, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider,
};

use crate::auth_extractor;
use crate::providers::models_from_table;

const PROVIDER_NAME: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Default)]
pub struct ClaudeProvider;

impl ClaudeProvider {
    pub fn new() -> Self {
        Self
    }

    fn base_url<'a>(&self, config: &'a ProviderConfig) -> &'a str {
        match config {
            ProviderConfig::Claude(cfg) => cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            _ => DEFAULT_BASE_URL,
        }
    }

    fn api_key<'a>(&self, credential: &'a Credential) -> Result<&'a str, UpstreamFailure> {
        match &credential.secret {
            CredentialSecret::ApiKey { api_key } => Ok(api_key.as_str()),
            CredentialSecret::OAuth { .. } => Err(UpstreamFailure::Build(
                "claude provider requires an API key credential".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn dispatch_table(&self, _config: &ProviderConfig) -> DispatchTable {
        DispatchTable::streaming_via_translator()
    }

    async fn list_models(
        &self,
        _ctx: &UpstreamCtx,
        config: &ProviderConfig,
        _credential: &Credential,
    ) -> keyrelay_provider_core::ProviderResult<Vec<keyrelay_protocol::openai::Model>> {
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
        let url = format!("{base_url}/v1/messages");
        let is_stream = request.stream.unwrap_or(false);

        let native = translate::request_to_anthropic(request);
        let body = serde_json::to_vec(&native).map_err(|err| UpstreamFailure::Build(err.to_string()))?;

        let mut headers = Vec::new();
        auth_extractor::set_header(&mut headers, "x-api-key", api_key);
        auth_extractor::set_header(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);

        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(Bytes::from(body)),
            is_stream,
        };
        let response = client.send(req).await?;
        if !is_stream {
            return Ok(response);
        }
        match response.body {
            UpstreamBody::Stream(upstream) => Ok(UpstreamHttpResponse {
                status: response.status,
                headers: response.headers,
                body: UpstreamBody::Stream(translate::spawn_stream_translator(
                    upstream,
                    request.model.clone(),
                )),
            }),
            other => Ok(UpstreamHttpResponse {
                status: response.status,
                headers: response.headers,
                body: other,
            }),
        }
    }
}
