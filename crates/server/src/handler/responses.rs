use crate::AppState;
use crate::dispatch::{DispatchRequest, dispatch};
use ai_proxy_core::error::ProxyError;
use ai_proxy_core::provider::Format;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use bytes::Bytes;

/// OpenAI Responses API (/v1/responses). Routes through the shared
/// executor/retry pipeline like every other endpoint; Codex (ChatGPT OAuth)
/// is the primary backend for this wire shape, with plain OpenAI/OpenAI-
/// compatible credentials as a fallback for providers that speak it too.
pub async fn responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ProxyError> {
    let req_value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ProxyError::BadRequest(e.to_string()))?;

    let model = req_value
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| ProxyError::BadRequest("missing model field".into()))?
        .to_string();

    // Codex's backend only ever streams; default to true unless the client
    // explicitly opted out.
    let stream = req_value
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(true);

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    dispatch(
        &state,
        DispatchRequest {
            source_format: Format::Codex,
            model,
            models: None,
            stream,
            body,
            allowed_formats: Some(vec![Format::Codex, Format::OpenAI, Format::OpenAICompat]),
            user_agent,
            debug: false,
        },
    )
    .await
}
