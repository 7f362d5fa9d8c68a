//! OpenAI Codex/ChatGPT backend, reached via OAuth 2.0 + PKCE rather than a
//! static API key. Grounded on `dfft546-gproxy`'s `provider/codex/{mod.rs,
//! oauth.rs}` (request shape, header building, 401-retry-once) and
//! `provider/claudecode/refresh.rs` (single-slot token cache with a 60s
//! expiry buffer).

use crate::common;
use ai_proxy_core::error::ProxyError;
use ai_proxy_core::provider::*;
use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use sha2::Digest;
use std::collections::HashMap;
use tokio::sync::RwLock;

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const CODEX_USER_AGENT: &str = "codex_cli_rs/0.1.0";
/// 60-second buffer before the token's actual expiry, so a request never
/// starts against a token that could expire mid-flight.
const EXPIRY_BUFFER_SECS: i64 = 60;

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    account_id: Option<String>,
    expires_at: i64,
}

pub struct CodexExecutor {
    global_proxy: Option<String>,
    cache: RwLock<HashMap<String, CachedToken>>,
}

impl CodexExecutor {
    pub fn new(global_proxy: Option<String>) -> Self {
        Self {
            global_proxy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve an access token for `auth`, refreshing under the cache lock
    /// if there's no cached token or it's within the expiry buffer.
    async fn get_access_token(&self, auth: &AuthRecord) -> Result<(String, Option<String>), ProxyError> {
        let oauth = auth
            .oauth
            .as_ref()
            .ok_or_else(|| ProxyError::Config("codex credential missing oauth config".into()))?;

        if let Some(cached) = self.cache.read().await.get(&auth.id).cloned()
            && !is_expired(cached.expires_at)
        {
            return Ok((cached.access_token, cached.account_id));
        }

        self.refresh(auth, oauth).await
    }

    /// Force a token refresh and update the cache, returning the new
    /// (access_token, account_id).
    async fn refresh(
        &self,
        auth: &AuthRecord,
        oauth: &CodexOAuthConfig,
    ) -> Result<(String, Option<String>), ProxyError> {
        let client = common::build_client(auth, self.global_proxy.as_deref())?;

        let token_url = format!("{}/oauth/token", oauth.issuer.trim_end_matches('/'));
        let body = format!(
            "grant_type=refresh_token&client_id={}&refresh_token={}",
            urlencode(&oauth.client_id),
            urlencode(&oauth.refresh_token),
        );

        let resp = client
            .post(token_url)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        if status >= 400 {
            return Err(ProxyError::Upstream {
                status,
                body: String::from_utf8_lossy(&bytes).to_string(),
                retry_after_secs: None,
                rate_limit: None,
            });
        }

        let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
        let access_token = raw
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::Auth("refresh response missing access_token".into()))?
            .to_string();
        let expires_in = raw.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);
        let expires_at = now_secs() + expires_in;

        let account_id = oauth.account_id.clone().or_else(|| {
            raw.get("id_token")
                .and_then(|v| v.as_str())
                .and_then(parse_account_id_from_id_token)
        });

        let cached = CachedToken {
            access_token: access_token.clone(),
            account_id: account_id.clone(),
            expires_at,
        };
        self.cache.write().await.insert(auth.id.clone(), cached);

        Ok((access_token, account_id))
    }

    /// Invalidate a cached token (used after an upstream 401) so the next
    /// call re-enters `refresh` instead of reusing a token the backend just
    /// rejected.
    async fn invalidate(&self, auth_id: &str) {
        self.cache.write().await.remove(auth_id);
    }

    fn build_headers(
        &self,
        req: reqwest::RequestBuilder,
        access_token: &str,
        account_id: Option<&str>,
        request: &ProviderRequest,
        auth: &AuthRecord,
    ) -> reqwest::RequestBuilder {
        let mut req = req
            .header("authorization", format!("Bearer {access_token}"))
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .header("openai-beta", "responses=experimental")
            .header("user-agent", CODEX_USER_AGENT);
        if let Some(account_id) = account_id {
            req = req.header("chatgpt-account-id", account_id);
        }
        common::apply_headers(req, &request.headers, auth)
    }

    /// Codex's backend only accepts streamed `/responses` requests; force
    /// `stream`/`store` to the values it expects and drop the one field it
    /// 400s on.
    fn normalize_payload(&self, payload: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let mut value: serde_json::Value = serde_json::from_slice(payload)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("stream".to_string(), serde_json::Value::Bool(true));
            obj.insert("store".to_string(), serde_json::Value::Bool(false));
            obj.remove("max_output_tokens");
        }
        Ok(serde_json::to_vec(&value)?)
    }

    async fn send(
        &self,
        auth: &AuthRecord,
        request: &ProviderRequest,
        body: &[u8],
    ) -> Result<reqwest::Response, ProxyError> {
        let base_url = auth.base_url_or_default(DEFAULT_BASE_URL);
        let url = format!("{base_url}/responses");

        let (access_token, account_id) = self.get_access_token(auth).await?;
        let client = common::build_client(auth, self.global_proxy.as_deref())?;
        let req = self.build_headers(
            client.post(&url),
            &access_token,
            account_id.as_deref(),
            request,
            auth,
        );
        let resp = req.body(body.to_vec()).send().await?;

        if resp.status().as_u16() == 401 {
            self.invalidate(&auth.id).await;
            let (access_token, account_id) = self.get_access_token(auth).await?;
            let client = common::build_client(auth, self.global_proxy.as_deref())?;
            let req = self.build_headers(
                client.post(&url),
                &access_token,
                account_id.as_deref(),
                request,
                auth,
            );
            return Ok(req.body(body.to_vec()).send().await?);
        }

        Ok(resp)
    }
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn identifier(&self) -> &str {
        "codex"
    }

    fn native_format(&self) -> Format {
        Format::Codex
    }

    fn default_base_url(&self) -> &str {
        DEFAULT_BASE_URL
    }

    async fn execute(
        &self,
        auth: &AuthRecord,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProxyError> {
        // The Codex backend only ever answers `/responses` with an SSE
        // stream (that's why `normalize_payload` forces `stream: true`
        // regardless of what the caller asked for), so a non-streaming
        // caller still goes through `execute_stream` and gets the final
        // `response.completed`/`response.failed` event's full object.
        let stream_result = self.execute_stream(auth, request).await?;
        let headers = stream_result.headers.clone();
        let payload = aggregate_responses_stream(stream_result).await?;
        Ok(ProviderResponse { payload, headers })
    }

    async fn execute_stream(
        &self,
        auth: &AuthRecord,
        request: ProviderRequest,
    ) -> Result<StreamResult, ProxyError> {
        let body = self.normalize_payload(&request.payload)?;
        let resp = self.send(auth, &request, &body).await?;
        common::handle_stream_response(resp).await
    }

    fn supported_models(&self, auth: &AuthRecord) -> Vec<ModelInfo> {
        common::supported_models_from_auth(auth, "codex", "openai")
    }
}

/// Fold a Codex Responses SSE stream down to a single JSON object, for
/// callers that asked for a non-streaming response. The terminal
/// `response.completed` (or `.failed`/`.incomplete`) event's `response`
/// field already *is* the full object OpenAI would return from a
/// non-streaming call, so aggregation is just "find that event".
async fn aggregate_responses_stream(stream_result: StreamResult) -> Result<bytes::Bytes, ProxyError> {
    use tokio_stream::StreamExt;

    let mut stream = stream_result.stream;
    let mut final_response: Option<serde_json::Value> = None;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        if chunk.data == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&chunk.data) else {
            continue;
        };
        let event_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .or(chunk.event_type.as_deref());
        if matches!(
            event_type,
            Some("response.completed") | Some("response.failed") | Some("response.incomplete")
        ) && let Some(response) = value.get("response")
        {
            final_response = Some(response.clone());
        }
    }

    let value = final_response.ok_or_else(|| ProxyError::Upstream {
        status: 502,
        body: "codex stream ended without a terminal response event".to_string(),
        retry_after_secs: None,
        rate_limit: None,
    })?;
    Ok(bytes::Bytes::from(serde_json::to_vec(&value)?))
}

fn is_expired(expires_at: i64) -> bool {
    now_secs() >= expires_at - EXPIRY_BUFFER_SECS
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn urlencode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Parse the unverified JWT payload of an ID token to pull out
/// `chatgpt_account_id`. The proxy trusts the issuer (it just performed the
/// token exchange against it), so there's no need to verify the signature.
fn parse_account_id_from_id_token(id_token: &str) -> Option<String> {
    let payload_b64 = id_token.split('.').nth(1)?;
    let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes).ok()?;
    payload
        .get("https://api.openai.com/auth")?
        .get("chatgpt_account_id")?
        .as_str()
        .map(|s| s.to_string())
}

/// PKCE code generation (RFC 7636, S256). The spec calls for a 32-byte
/// verifier; `claudecode/refresh.rs`'s own PKCE helpers agree (the
/// `codex/oauth.rs` example uses 64, but 32 is consistent with the rest of
/// the corpus and with RFC 7636's own minimum).
pub struct PkceCodes {
    pub code_verifier: String,
    pub code_challenge: String,
}

pub fn generate_pkce() -> PkceCodes {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let code_verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = sha2::Sha256::digest(code_verifier.as_bytes());
    let code_challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    PkceCodes {
        code_verifier,
        code_challenge,
    }
}

/// Build the `/oauth/authorize` URL for the PKCE authorization-code leg of
/// the flow. The proxy only consumes refresh tokens in normal operation;
/// this helper exists so an operator's own out-of-band login flow can mint
/// one against the same client ID this executor refreshes with.
pub fn build_authorize_url(
    issuer: &str,
    client_id: &str,
    redirect_uri: &str,
    code_challenge: &str,
    state: &str,
) -> String {
    let params = [
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("scope", "openid email profile offline_access"),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
        ("prompt", "login"),
        ("id_token_add_organizations", "true"),
        ("codex_cli_simplified_flow", "true"),
        ("state", state),
    ];
    let qs = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}/oauth/authorize?{qs}", issuer.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_matches_verifier() {
        let pkce = generate_pkce();
        let digest = sha2::Sha256::digest(pkce.code_verifier.as_bytes());
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        assert_eq!(pkce.code_challenge, expected);
    }

    #[test]
    fn pkce_verifier_is_32_bytes_decoded() {
        let pkce = generate_pkce();
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&pkce.code_verifier)
            .unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn authorize_url_carries_pkce_params() {
        let url = build_authorize_url(
            "https://auth.openai.com",
            "app_client",
            "http://localhost:1455/auth/callback",
            "challenge123",
            "state456",
        );
        assert!(url.starts_with("https://auth.openai.com/oauth/authorize?"));
        assert!(url.contains("code_challenge=challenge123"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=state456"));
    }

    #[test]
    fn expiry_buffer_treats_near_future_as_expired() {
        let almost_now = now_secs() + 30;
        assert!(is_expired(almost_now));
        let well_future = now_secs() + 3600;
        assert!(!is_expired(well_future));
    }

    #[test]
    fn id_token_claims_extract_account_id() {
        let payload = serde_json::json!({
            "https://api.openai.com/auth": {
                "chatgpt_account_id": "acct_123",
                "chatgpt_plan_type": "pro",
            }
        });
        let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&payload).unwrap());
        let id_token = format!("header.{payload_b64}.sig");
        assert_eq!(
            parse_account_id_from_id_token(&id_token),
            Some("acct_123".to_string())
        );
    }
}
