mod oauth;
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

const PROVIDER_NAME: &str = "codex";
const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";

#[derive(Debug, Default)]
pub struct CodexProvider;

impl CodexProvider {
    pub fn new() -> Self {
        Self
    }

    fn base_url<'a>(&self, config: &'a ProviderConfig) -> &'a str {
        match config {
            ProviderConfig::Codex(cfg) => cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            _ => DEFAULT_BASE_URL,
        }
    }

    fn oauth<'a>(
        &self,
        credential: &'a Credential,
    ) -> Result<(&'a str, &'a str), UpstreamFailure> {
        match &credential.secret {
            CredentialSecret::OAuth { access_token, .. } => {
                let account_id = credential.account_id.as_deref().ok_or_else(|| {
                    UpstreamFailure::Build("codex credential is missing account_id".to_string())
                })?;
                Ok((access_token.as_str(), account_id))
            }
            CredentialSecret::ApiKey { .. } => Err(UpstreamFailure::Build(
                "codex provider requires an OAuth credential".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for CodexProvider {
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
        credential: &Credential,
    ) -> keyrelay_provider_core::ProviderResult<Vec<keyrelay_protocol::openai::Model>> {
        let _ = (self.base_url(config), self.oauth(credential));
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
        let (access_token, account_id) = self.oauth(credential)?;
        let base_url = self.base_url(config).trim_end_matches('/');
        let url = format!("{base_url}/responses");
        let is_stream = request.stream.unwrap_or(false);

        let native = translate::request_to_responses(request);
        let body = serde_json::to_vec(&native).map_err(|err| UpstreamFailure::Build(err.to_string()))?;

        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, access_token);
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);
        auth_extractor::set_header(&mut headers, "chatgpt-account-id", account_id);

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

    async fn refresh_token(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        credential: &Credential,
        client: &dyn UpstreamClient,
    ) -> keyrelay_provider_core::ProviderResult<Credential> {
        oauth::refresh_token(credential, client).await
    }

    async fn interactive_reauth(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        credential: &Credential,
        client: &dyn UpstreamClient,
    ) -> keyrelay_provider_core::ProviderResult<Credential> {
        oauth::interactive_reauth(credential, client).await
    }
}

