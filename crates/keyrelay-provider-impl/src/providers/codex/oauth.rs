use bytes::Bytes;
use rand::RngCore;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::Digest;
use tokio::net::TcpListener;

use keyrelay_provider_core::{
    Credential, CredentialSecret, HttpMethod, ProviderError, ProviderResult, UpstreamClient,
    UpstreamHttpRequest,
};

use crate::auth_extractor;
use crate::providers::oauth_common::extract_code_state_from_callback_url;

const DEFAULT_ISSUER: &str = "https://auth.openai.com";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const LOOPBACK_ADDR: &str = "127.0.0.1:1455";
const OAUTH_SCOPE: &str = "openid profile email offline_access";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Default)]
struct IdTokenClaims {
    email: Option<String>,
    account_id: Option<String>,
}

pub(super) async fn refresh_token(
    credential: &Credential,
    client: &dyn UpstreamClient,
) -> ProviderResult<Credential> {
    let CredentialSecret::OAuth {
        refresh_token,
        token_uri,
        ..
    } = &credential.secret
    else {
        return Err(ProviderError::InvalidConfig(
            "refresh_token requires an OAuth credential".to_string(),
        ));
    };

    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}",
        urlencoding::encode(refresh_token),
        urlencoding::encode(CLIENT_ID),
    );
    let tokens = exchange(client, token_uri, body).await?;
    apply_tokens(credential, tokens, refresh_token.clone())
}

pub(super) async fn interactive_reauth(
    credential: &Credential,
    client: &dyn UpstreamClient,
) -> ProviderResult<Credential> {
    let code_verifier = generate_code_verifier();
    let code_challenge = generate_code_challenge(&code_verifier);
    let state = generate_state();
    let redirect_uri = format!("http://{LOOPBACK_ADDR}/auth/callback");
    let auth_url = build_authorize_url(&redirect_uri, &code_challenge, &state);

    tracing::info!(url = %auth_url, "open this URL to finish codex sign-in");

    let code = await_loopback_code(&state).await?;
    let body = format!(
        "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&code_verifier={}",
        urlencoding::encode(&code),
        urlencoding::encode(&redirect_uri),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(&code_verifier),
    );
    let tokens = exchange(client, &format!("{DEFAULT_ISSUER}/oauth/token"), body).await?;

    let claims = tokens
        .id_token
        .as_deref()
        .map(parse_id_token_claims)
        .unwrap_or_default();
    let account_id = claims
        .account_id
        .ok_or_else(|| ProviderError::Other("codex callback missing account_id".to_string()))?;
    let refresh_token = tokens
        .refresh_token
        .clone()
        .ok_or_else(|| ProviderError::Other("codex callback missing refresh_token".to_string()))?;

    Ok(Credential {
        stable_id: format!("codex:{}", claims.email.clone().unwrap_or(account_id.clone())),
        accessor: credential.accessor.clone(),
        provider: "codex".to_string(),
        email: claims.email,
        account_id: Some(account_id),
        priority: credential.priority,
        tier: credential.tier.clone(),
        max_concurrent: credential.max_concurrent,
        secret: CredentialSecret::OAuth {
            access_token: tokens.access_token,
            refresh_token,
            id_token: tokens.id_token,
            expires_at: 0,
            token_uri: format!("{DEFAULT_ISSUER}/oauth/token"),
        },
    })
}

fn apply_tokens(
    credential: &Credential,
    tokens: TokenResponse,
    previous_refresh_token: String,
) -> ProviderResult<Credential> {
    let mut updated = credential.clone();
    let CredentialSecret::OAuth {
        access_token,
        refresh_token,
        id_token,
        ..
    } = &mut updated.secret
    else {
        unreachable!("checked by caller");
    };
    *access_token = tokens.access_token;
    *refresh_token = tokens.refresh_token.unwrap_or(previous_refresh_token);
    if let Some(new_id_token) = tokens.id_token {
        let claims = parse_id_token_claims(&new_id_token);
        if updated.email.is_none() {
            updated.email = claims.email;
        }
        *id_token = Some(new_id_token);
    }
    Ok(updated)
}

async fn exchange(
    client: &dyn UpstreamClient,
    url: &str,
    form_body: String,
) -> ProviderResult<TokenResponse> {
    let mut headers = Vec::new();
    auth_extractor::set_header(&mut headers, "Content-Type", "application/x-www-form-urlencoded");
    let req = UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: url.to_string(),
        headers,
        body: Some(Bytes::from(form_body)),
        is_stream: false,
    };
    let response = client
        .send(req)
        .await
        .map_err(|err| ProviderError::Other(format!("token exchange failed: {err:?}")))?;
    let body = match response.body {
        keyrelay_provider_core::UpstreamBody::Bytes(bytes) => bytes,
        keyrelay_provider_core::UpstreamBody::Stream(_) => {
            return Err(ProviderError::Other(
                "token endpoint returned a stream".to_string(),
            ));
        }
    };
    if !(200..300).contains(&response.status) {
        let text = String::from_utf8_lossy(&body).to_string();
        let retry_after = keyrelay_provider_core::header_get(&response.headers, "retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        return Err(ProviderError::UpstreamStatus {
            status: response.status,
            retry_after,
            message: text,
        });
    }
    serde_json::from_slice::<TokenResponse>(&body).map_err(|err| ProviderError::Other(err.to_string()))
}

async fn await_loopback_code(expected_state: &str) -> ProviderResult<String> {
    let listener = TcpListener::bind(LOOPBACK_ADDR)
        .await
        .map_err(|err| ProviderError::Other(format!("bind loopback callback: {err}")))?;
    let (mut socket, _) = listener
        .accept()
        .await
        .map_err(|err| ProviderError::Other(format!("accept loopback callback: {err}")))?;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut buf = vec![0u8; 8192];
    let n = socket
        .read(&mut buf)
        .await
        .map_err(|err| ProviderError::Other(format!("read loopback callback: {err}")))?;
    let request_line = String::from_utf8_lossy(&buf[..n]);
    let path = request_line
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");
    let (code, state) = extract_code_state_from_callback_url(path);

    let response_body = "<html><body>codex sign-in complete, you may close this tab.</body></html>";
    let http_response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{response_body}",
        response_body.len()
    );
    let _ = socket.write_all(http_response.as_bytes()).await;

    if let Some(state) = state
        && state != expected_state
    {
        return Err(ProviderError::Other("oauth callback state mismatch".to_string()));
    }
    code.ok_or_else(|| ProviderError::Other("oauth callback missing code".to_string()))
}

fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

fn generate_code_challenge(code_verifier: &str) -> String {
    let digest = sha2::Sha256::digest(code_verifier.as_bytes());
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, digest)
}

fn build_authorize_url(redirect_uri: &str, code_challenge: &str, state: &str) -> String {
    let query = [
        ("response_type", "code"),
        ("client_id", CLIENT_ID),
        ("redirect_uri", redirect_uri),
        ("scope", OAUTH_SCOPE),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
        ("state", state),
    ]
    .into_iter()
    .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
    .collect::<Vec<_>>()
    .join("&");
    format!("{DEFAULT_ISSUER}/oauth/authorize?{query}")
}

fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let mut parts = id_token.split('.');
    let (_h, payload_b64, _s) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if !h.is_empty() && !p.is_empty() && !s.is_empty() => (h, p, s),
        _ => return claims,
    };
    let payload_bytes = match base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload_b64) {
        Ok(bytes) => bytes,
        Err(_) => return claims,
    };
    let payload = match serde_json::from_slice::<JsonValue>(&payload_bytes) {
        Ok(value) => value,
        Err(_) => return claims,
    };

    claims.email = payload
        .get("email")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    claims.account_id = payload
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    claims
}
