use crate::AppState;
use crate::streaming::build_sse_response;
use ai_proxy_core::error::ProxyError;
use ai_proxy_core::provider::{AuthRecord, Format, ProviderRequest, ProviderResponse, StreamChunk};
use ai_proxy_core::proxy_request::{
    AttemptStatus, ProxyRequest, ProxyRequestRepository, ProxyUpstreamAttempt, RequestStatus,
};
use ai_proxy_translator::TranslateState;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A dispatch request encapsulating all information needed to route and execute an API call.
pub struct DispatchRequest {
    /// The API format of the incoming request (e.g., OpenAI, Claude).
    pub source_format: Format,
    /// The requested model name (may include prefix/alias).
    pub model: String,
    /// Fallback model chain: try models in order until one succeeds.
    pub models: Option<Vec<String>>,
    /// Whether the client requested streaming.
    pub stream: bool,
    /// The raw request body.
    pub body: Bytes,
    /// Restrict to specific provider formats. `None` means auto-resolve from model.
    pub allowed_formats: Option<Vec<Format>>,
    /// Client User-Agent header (used for cloak auto-mode detection).
    pub user_agent: Option<String>,
    /// Debug mode: return routing details in response headers.
    pub debug: bool,
}

/// Debug information collected during dispatch for x-debug response headers.
#[derive(Debug, Default)]
struct DispatchDebug {
    provider: Option<String>,
    model: Option<String>,
    credential_name: Option<String>,
    attempts: Vec<String>,
}

/// Metadata about a dispatched request, stored in response extensions
/// so the logging middleware can populate log entries.
#[derive(Clone, Debug)]
pub struct DispatchMeta {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost: Option<f64>,
}

/// Extract the model name a non-streaming response echoed back, if any —
/// what upstream actually served, as opposed to the `mapped_model` the
/// executor asked for. Pricing and the top-level request record both prefer
/// this over the mapped model when present (§3 invariant f).
fn extract_response_model(payload: &str) -> Option<String> {
    let val: serde_json::Value = serde_json::from_str(payload).ok()?;
    val.get("model")?.as_str().map(|s| s.to_string())
}

/// Extract token usage from a single parsed response body (any format).
fn extract_usage_from_value(val: &serde_json::Value) -> (Option<u64>, Option<u64>) {
    // OpenAI/Claude format: usage.prompt_tokens / usage.input_tokens
    if let Some(usage) = val.get("usage") {
        let input = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .or_else(|| usage.get("input_tokens").and_then(|v| v.as_u64()));
        let output = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .or_else(|| usage.get("output_tokens").and_then(|v| v.as_u64()));
        if input.is_some() || output.is_some() {
            return (input, output);
        }
    }
    // Gemini format: usageMetadata
    if let Some(usage) = val.get("usageMetadata") {
        let input = usage.get("promptTokenCount").and_then(|v| v.as_u64());
        let output = usage.get("candidatesTokenCount").and_then(|v| v.as_u64());
        return (input, output);
    }
    (None, None)
}

/// Extract token usage from a response payload (any format).
fn extract_usage(payload: &str) -> (Option<u64>, Option<u64>) {
    let val: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return (None, None),
    };
    extract_usage_from_value(&val)
}

/// Extract token usage from an accumulated SSE transcript: every `data: `
/// line is parsed independently and the last non-null input/output count
/// wins, since usage typically only appears on the final chunk (OpenAI's
/// `stream_options.include_usage` trailer) or grows cumulatively across
/// `message_delta` events (Claude). `[DONE]` and non-JSON lines are skipped.
fn extract_usage_from_sse(transcript: &str) -> (Option<u64>, Option<u64>) {
    let mut input = None;
    let mut output = None;
    for line in transcript.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(val) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        let (i, o) = extract_usage_from_value(&val);
        if i.is_some() {
            input = i;
        }
        if o.is_some() {
            output = o;
        }
    }
    (input, output)
}

/// Extract the model an upstream streaming response echoed back, if any
/// chunk in the transcript carries a top-level `"model"` field. Mirrors
/// [`extract_response_model`] for the non-streaming case.
fn extract_response_model_from_sse(transcript: &str) -> Option<String> {
    for line in transcript.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        if let Ok(val) = serde_json::from_str::<serde_json::Value>(data)
            && let Some(model) = val.get("model").and_then(|v| v.as_str())
        {
            return Some(model.to_string());
        }
    }
    None
}

/// Inject dispatch metadata into response extensions for request logging.
fn inject_dispatch_meta(
    response: &mut Response,
    debug: &DispatchDebug,
    translated_payload: &str,
    cost_calculator: &ai_proxy_core::cost::CostCalculator,
    metrics: &ai_proxy_core::metrics::Metrics,
) {
    let (input_tokens, output_tokens) = extract_usage(translated_payload);
    let model = debug.model.as_deref();
    let cost = match (model, input_tokens, output_tokens) {
        (Some(m), Some(inp), Some(out)) => cost_calculator.calculate(m, inp, out),
        _ => None,
    };
    // Record tokens and cost in global metrics
    if let (Some(inp), Some(out)) = (input_tokens, output_tokens) {
        metrics.record_tokens(inp, out);
    }
    if let (Some(m), Some(c)) = (model, cost) {
        metrics.record_cost(m, c);
    }
    response.extensions_mut().insert(DispatchMeta {
        provider: debug.provider.clone(),
        model: debug.model.clone(),
        input_tokens,
        output_tokens,
        cost,
    });
}

/// Inject debug headers into a response if debug mode is enabled.
fn inject_debug_headers(response: &mut Response, debug: &DispatchDebug) {
    let headers = response.headers_mut();
    if let Some(ref provider) = debug.provider {
        headers.insert("x-debug-provider", provider.parse().unwrap());
    }
    if let Some(ref model) = debug.model {
        headers.insert("x-debug-model", model.parse().unwrap());
    }
    if let Some(ref name) = debug.credential_name {
        headers.insert("x-debug-credential", name.parse().unwrap());
    }
    if !debug.attempts.is_empty() {
        headers.insert(
            "x-debug-attempts",
            debug.attempts.join(", ").parse().unwrap(),
        );
    }
}

/// Tracks a request's top-level [`ProxyRequest`] record plus the current
/// in-flight [`ProxyUpstreamAttempt`], persisting both to the repository on
/// every state transition.
///
/// Dropped while still `InProgress` — the enclosing future was cancelled
/// before `dispatch` returned, i.e. the client disconnected mid-request —
/// both the dangling attempt and the request are finalized `Cancelled`
/// without touching the cooldown engine, mirroring the PID-file guard in
/// `lifecycle::pid_file` that cleans up on drop rather than requiring every
/// exit path to remember to call it explicitly.
struct RequestTracker {
    repo: Arc<dyn ProxyRequestRepository>,
    request: ProxyRequest,
    current_attempt: Option<ProxyUpstreamAttempt>,
    retention_secs: i64,
}

impl RequestTracker {
    fn new(
        repo: Arc<dyn ProxyRequestRepository>,
        instance_id: &str,
        client_type: Format,
        requested_model: &str,
        retention_secs: i64,
    ) -> Self {
        let request = ProxyRequest::start(instance_id, client_type.as_str(), requested_model);
        repo.save_request(request.clone());
        Self {
            repo,
            request,
            current_attempt: None,
            retention_secs,
        }
    }

    /// Attach the captured upstream request to the in-flight attempt, if
    /// any. Immediately cleared back out under `retention_secs == 0` —
    /// there's no point holding it in memory even momentarily.
    fn record_request_detail(&mut self, info: ai_proxy_core::proxy_request::RequestInfo) {
        if self.retention_secs == 0 {
            return;
        }
        if let Some(attempt) = self.current_attempt.as_mut() {
            attempt.request_info = Some(info);
        }
    }

    /// Attach the captured upstream response to the in-flight attempt.
    fn record_response_detail(&mut self, info: ai_proxy_core::proxy_request::ResponseInfo) {
        if self.retention_secs == 0 {
            return;
        }
        if let Some(attempt) = self.current_attempt.as_mut() {
            attempt.response_info = Some(info);
        }
    }

    /// Record the start of a new upstream attempt. Any still-open attempt
    /// (shouldn't normally happen — every attempt is finished before the
    /// next starts) is swept closed first so `attempt_count` stays accurate.
    fn start_attempt(&mut self, provider: &str, credential_id: &str, mapped_model: &str) {
        self.finish_dangling_attempt();
        let attempt = ProxyUpstreamAttempt::start(&self.request.id, provider, credential_id, mapped_model);
        self.repo.save_attempt(attempt.clone());
        self.current_attempt = Some(attempt);
    }

    fn finish_attempt(&mut self, status: AttemptStatus, error: Option<String>) {
        if let Some(mut attempt) = self.current_attempt.take() {
            attempt.finish(status, error);
            attempt.apply_retention(self.retention_secs);
            self.request.attempt_count += 1;
            if status == AttemptStatus::Completed {
                self.request.final_attempt_id = Some(attempt.id.clone());
            }
            self.repo.save_attempt(attempt);
        }
    }

    fn finish_dangling_attempt(&mut self) {
        if self.current_attempt.is_some() {
            self.finish_attempt(AttemptStatus::Cancelled, None);
        }
    }

    /// Record the model upstream actually echoed back, on both the current
    /// attempt and the top-level request. A no-op when `model` is `None` —
    /// absence means "use the mapped model", not "overwrite with nothing".
    fn set_response_model(&mut self, model: Option<String>) {
        let Some(model) = model else { return };
        if let Some(attempt) = self.current_attempt.as_mut() {
            attempt.response_model = Some(model.clone());
        }
        self.request.response_model = Some(model);
    }

    /// Record token counts and cost directly on the in-flight attempt and
    /// the top-level request. Used by the non-streaming paths, which still
    /// hold `&mut self` at the point usage is known; the streaming paths go
    /// through the repository instead (see [`instrument_usage`]) since the
    /// attempt is already handed off by the time the transcript completes.
    fn set_usage(&mut self, input_tokens: Option<u64>, output_tokens: Option<u64>, cost: Option<f64>) {
        if let Some(attempt) = self.current_attempt.as_mut() {
            if input_tokens.is_some() {
                attempt.input_tokens = input_tokens;
            }
            if output_tokens.is_some() {
                attempt.output_tokens = output_tokens;
            }
            if cost.is_some() {
                attempt.cost = cost;
            }
        }
        if input_tokens.is_some() {
            self.request.input_tokens = input_tokens;
        }
        if output_tokens.is_some() {
            self.request.output_tokens = output_tokens;
        }
        if cost.is_some() {
            self.request.cost = cost;
        }
    }

    /// `(attempt_id, attempt_start_time_ms)` for the in-flight attempt, if
    /// any — captured before a streaming response is handed back to the
    /// client so the first-byte-to-client time can be attributed to it
    /// after [`finish_attempt`] has already taken `current_attempt`.
    fn attempt_snapshot(&self) -> Option<(String, i64)> {
        self.current_attempt
            .as_ref()
            .map(|a| (a.id.clone(), a.start_time))
    }

    fn repo(&self) -> Arc<dyn ProxyRequestRepository> {
        self.repo.clone()
    }

    fn finish_request(&mut self, status: RequestStatus) {
        self.finish_dangling_attempt();
        self.request.finish(status);
        self.repo.save_request(self.request.clone());
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        if !self.request.status.is_terminal() {
            self.finish_request(RequestStatus::Cancelled);
        }
    }
}

/// Unified dispatch: resolves providers, picks credentials, translates, executes, retries.
///
/// Supports model fallback chains via `req.models` and debug mode via `req.debug`.
/// The retry loop iterates across all provider formats on each attempt, ensuring that
/// quota exhaustion (429) on one provider automatically falls through to the next (5B).
pub async fn dispatch(state: &AppState, req: DispatchRequest) -> Result<Response, ProxyError> {
    let mut tracker = RequestTracker::new(
        state.proxy_requests.clone(),
        &state.instance_id,
        req.source_format,
        &req.model,
        state.config.load().request_detail_retention_secs,
    );
    let result = dispatch_inner(state, req, &mut tracker).await;
    match &result {
        Ok(_) => tracker.finish_request(RequestStatus::Completed),
        Err(ProxyError::Cancelled) => tracker.finish_request(RequestStatus::Cancelled),
        Err(_) => tracker.finish_request(RequestStatus::Failed),
    }
    result
}

async fn dispatch_inner(
    state: &AppState,
    req: DispatchRequest,
    tracker: &mut RequestTracker,
) -> Result<Response, ProxyError> {
    let start = Instant::now();
    let config = state.config.load();

    // Build the model fallback chain
    let model_chain: Vec<String> = if let Some(ref models) = req.models {
        if models.is_empty() {
            vec![req.model.clone()]
        } else {
            models.clone()
        }
    } else {
        vec![req.model.clone()]
    };

    let mut debug_info = DispatchDebug::default();
    let mut last_error: Option<ProxyError> = None;

    // Outer loop: try each model in the fallback chain
    'model: for current_model in &model_chain {
        // Enforce model prefix requirement
        if config.force_model_prefix && !state.router.model_has_prefix(current_model) {
            debug_info
                .attempts
                .push(format!("{current_model}: prefix_required"));
            continue;
        }

        let providers = match req.allowed_formats {
            Some(ref formats) => formats.clone(),
            None => state.router.resolve_providers(current_model),
        };

        if providers.is_empty() {
            debug_info
                .attempts
                .push(format!("{current_model}: no_provider"));
            continue;
        }

        let retry_cfg = &config.retry;
        let max_retries = retry_cfg.max_retries;
        let bootstrap_limit = config.streaming.bootstrap_retries;
        let keepalive_secs = config.non_stream_keepalive_secs;

        let mut tried: Vec<String> = Vec::new();
        let mut bootstrap_attempts = 0u32;

        // Rewrite request body to use current_model (for fallback)
        let body = if current_model != &req.model {
            rewrite_model_in_body(&req.body, current_model)
        } else {
            req.body.clone()
        };

        // Route loop: pick a credential, then retry *that same* credential up
        // to `max_retries` times (per-route retry, §4.5) before giving up on
        // it and picking the next one. `tried` only grows when a credential
        // is abandoned (retries exhausted or a non-retryable failure).
        'route: loop {
            let Some((auth, target_format)) = providers
                .iter()
                .find_map(|&f| state.router.pick(f, current_model, &tried).map(|a| (a, f)))
            else {
                break 'route;
            };

            // Scoped model-mapping rules (config-level, operator-controlled)
            // are checked ahead of the credential's own alias table: they
            // express "for this client type/provider, rewrite model X to
            // Y" independent of how any one credential's `models[]` is set
            // up.
            let mapping_scope = ai_proxy_core::modelmatch::MappingScope {
                client_type: req.source_format.as_str(),
                provider_type: target_format.as_str(),
                provider_id: &auth.id,
            };
            let mapped_model = ai_proxy_core::modelmatch::resolve_mapped_model(
                &config.model_mapping,
                &mapping_scope,
                current_model,
            )
            .unwrap_or_else(|| current_model.clone());
            let actual_model = auth.resolve_model_id(&mapped_model);

            let executor = match state.executors.get_by_format(target_format) {
                Some(e) => e,
                None => {
                    tried.push(auth.id.clone());
                    continue 'route;
                }
            };

            for attempt in 0..=max_retries {
                debug_info
                    .attempts
                    .push(format!("{}@{}", actual_model, target_format.as_str()));
                tracker.start_attempt(target_format.as_str(), &auth.id, &actual_model);

                // Record metrics
                state
                    .metrics
                    .record_request(&actual_model, target_format.as_str());

                // Translate request (source → target format)
                let translated_payload = state.translators.translate_request(
                    req.source_format,
                    target_format,
                    &actual_model,
                    &body,
                    req.stream,
                )?;

                // Apply payload manipulation rules
                let translated_payload = {
                    let mut payload_value: serde_json::Value =
                        serde_json::from_slice(&translated_payload)
                            .unwrap_or(serde_json::Value::Null);
                    if payload_value.is_object() {
                        ai_proxy_core::payload::apply_payload_rules(
                            &mut payload_value,
                            &config.payload,
                            &actual_model,
                            Some(target_format.as_str()),
                        );
                        serde_json::to_vec(&payload_value).unwrap_or(translated_payload)
                    } else {
                        translated_payload
                    }
                };

                // Apply cloaking for Claude targets
                let translated_payload = if target_format == Format::Claude {
                    if let Some(ref cloak_cfg) = auth.cloak {
                        if ai_proxy_core::cloak::should_cloak(cloak_cfg, req.user_agent.as_deref())
                        {
                            let mut val: serde_json::Value =
                                serde_json::from_slice(&translated_payload)
                                    .unwrap_or(serde_json::Value::Null);
                            if val.is_object() {
                                ai_proxy_core::cloak::apply_cloak(
                                    &mut val,
                                    cloak_cfg,
                                    &auth.api_key,
                                );
                                serde_json::to_vec(&val).unwrap_or(translated_payload)
                            } else {
                                translated_payload
                            }
                        } else {
                            translated_payload
                        }
                    } else {
                        translated_payload
                    }
                } else {
                    translated_payload
                };

                // Build request headers — inject claude-header-defaults when cloaking
                let mut request_headers: std::collections::HashMap<String, String> =
                    Default::default();
                if target_format == Format::Claude
                    && let Some(ref cloak_cfg) = auth.cloak
                    && ai_proxy_core::cloak::should_cloak(cloak_cfg, req.user_agent.as_deref())
                {
                    for (k, v) in &config.claude_header_defaults {
                        request_headers.insert(k.clone(), v.clone());
                    }
                }

                tracker.record_request_detail(ai_proxy_core::proxy_request::RequestInfo {
                    method: "POST".to_string(),
                    url: auth.base_url.clone().unwrap_or_default(),
                    headers: request_headers.clone(),
                    body: String::from_utf8_lossy(&translated_payload).to_string(),
                });

                let provider_request = ProviderRequest {
                    model: actual_model.clone(),
                    payload: Bytes::from(translated_payload),
                    source_format: req.source_format,
                    stream: req.stream,
                    headers: request_headers,
                    original_request: Some(body.clone()),
                };

                // Update debug info for successful routing
                debug_info.provider = Some(target_format.as_str().to_string());
                debug_info.model = Some(actual_model.clone());
                debug_info.credential_name = auth.name().map(|s| s.to_string());

                if req.stream {
                    // ── Streaming path with bootstrap retry limit (4D) ──
                    match executor.execute_stream(&auth, provider_request).await {
                        Ok(stream_result) => {
                            state.metrics.record_latency_ms(start.elapsed().as_millis());

                            let need_translate = state
                                .translators
                                .has_response_translator(req.source_format, target_format);

                            let keepalive = config.streaming.keepalive_seconds;

                            // For streaming, we can't easily inject headers after the fact.
                            // Debug info is not available for streaming responses.
                            if !need_translate {
                                if matches!(req.source_format, Format::Claude | Format::Codex) {
                                    let ttft_ctx = tracker
                                        .attempt_snapshot()
                                        .map(|(id, start)| (tracker.repo(), id, start));
                                    let usage_ctx = tracker.attempt_snapshot().map(|(id, _)| {
                                        UsageCtx::new(
                                            tracker.repo(),
                                            tracker.request.id.clone(),
                                            id,
                                            actual_model.clone(),
                                            state.cost_calculator.clone(),
                                            state.metrics.clone(),
                                        )
                                    });
                                    let data_stream = tokio_stream::StreamExt::map(
                                        stream_result.stream,
                                        |result| {
                                            result.map(|chunk| {
                                                if let Some(ref event_type) = chunk.event_type {
                                                    format!(
                                                        "event: {event_type}\ndata: {}",
                                                        chunk.data
                                                    )
                                                } else {
                                                    chunk.data
                                                }
                                            })
                                        },
                                    );
                                    let data_stream = instrument_ttft(data_stream, ttft_ctx);
                                    let data_stream = instrument_usage(data_stream, usage_ctx);
                                    let mut resp =
                                        build_sse_response(data_stream, keepalive).into_response();
                                    resp.extensions_mut().insert(DispatchMeta {
                                        provider: debug_info.provider.clone(),
                                        model: debug_info.model.clone(),
                                        input_tokens: None,
                                        output_tokens: None,
                                        cost: None,
                                    });
                                    if req.debug {
                                        inject_debug_headers(&mut resp, &debug_info);
                                    }
                                    state.cooldown.record_success(&auth.id, target_format.as_str());
                                    tracker.finish_attempt(AttemptStatus::Completed, None);
                                    return Ok(resp);
                                }
                                let ttft_ctx = tracker
                                    .attempt_snapshot()
                                    .map(|(id, start)| (tracker.repo(), id, start));
                                let usage_ctx = tracker.attempt_snapshot().map(|(id, _)| {
                                    UsageCtx::new(
                                        tracker.repo(),
                                        tracker.request.id.clone(),
                                        id,
                                        actual_model.clone(),
                                        state.cost_calculator.clone(),
                                        state.metrics.clone(),
                                    )
                                });
                                let data_stream =
                                    tokio_stream::StreamExt::map(stream_result.stream, |result| {
                                        result.map(|chunk| chunk.data)
                                    });
                                let data_stream = instrument_ttft(data_stream, ttft_ctx);
                                let data_stream = instrument_usage(data_stream, usage_ctx);
                                let mut resp =
                                    build_sse_response(data_stream, keepalive).into_response();
                                resp.extensions_mut().insert(DispatchMeta {
                                    provider: debug_info.provider.clone(),
                                    model: debug_info.model.clone(),
                                    input_tokens: None,
                                    output_tokens: None,
                                    cost: None,
                                });
                                if req.debug {
                                    inject_debug_headers(&mut resp, &debug_info);
                                }
                                state.cooldown.record_success(&auth.id, target_format.as_str());
                                tracker.finish_attempt(AttemptStatus::Completed, None);
                                return Ok(resp);
                            }

                            let ttft_ctx = tracker
                                .attempt_snapshot()
                                .map(|(id, start)| (tracker.repo(), id, start));
                            let usage_ctx = tracker.attempt_snapshot().map(|(id, _)| {
                                UsageCtx::new(
                                    tracker.repo(),
                                    tracker.request.id.clone(),
                                    id,
                                    actual_model.clone(),
                                    state.cost_calculator.clone(),
                                    state.metrics.clone(),
                                )
                            });
                            let translated_stream = translate_stream(
                                stream_result.stream,
                                state.translators.clone(),
                                req.source_format,
                                target_format,
                                actual_model.clone(),
                                body.clone(),
                            );
                            let translated_stream = instrument_ttft(translated_stream, ttft_ctx);
                            let translated_stream = instrument_usage(translated_stream, usage_ctx);

                            let mut resp =
                                build_sse_response(translated_stream, keepalive).into_response();
                            resp.extensions_mut().insert(DispatchMeta {
                                provider: debug_info.provider.clone(),
                                model: debug_info.model.clone(),
                                input_tokens: None,
                                output_tokens: None,
                                cost: None,
                            });
                            if req.debug {
                                inject_debug_headers(&mut resp, &debug_info);
                            }
                            state.cooldown.record_success(&auth.id, target_format.as_str());
                            tracker.finish_attempt(AttemptStatus::Completed, None);
                            return Ok(resp);
                        }
                        Err(e) => {
                            bootstrap_attempts += 1;
                            handle_retry_error(state, &auth, target_format, &e);
                            if let ProxyError::Upstream { status, body, .. } = &e {
                                tracker.record_response_detail(
                                    ai_proxy_core::proxy_request::ResponseInfo {
                                        status: *status,
                                        headers: Default::default(),
                                        body: body.clone(),
                                    },
                                );
                            }
                            tracker.finish_attempt(AttemptStatus::Failed, Some(e.to_string()));

                            if bootstrap_attempts > bootstrap_limit {
                                tracing::warn!(
                                    "Streaming bootstrap retry limit reached ({bootstrap_limit}), giving up"
                                );
                                state.metrics.record_error();
                                state.metrics.record_latency_ms(start.elapsed().as_millis());
                                // For fallback: continue to next model instead of returning error
                                last_error = Some(e);
                                continue 'model;
                            }

                            let retryable = e.retryable();
                            last_error = Some(e);
                            if retryable && attempt < max_retries {
                                tokio::time::sleep(retry_cfg.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            tried.push(auth.id.clone());
                            continue 'route;
                        }
                    }
                } else if keepalive_secs > 0 {
                    // ── Non-stream with keepalive (5A) ──
                    let (result_tx, result_rx) =
                        tokio::sync::oneshot::channel::<Result<ProviderResponse, ProxyError>>();
                    let exec = executor.clone();
                    let auth_clone = auth.clone();
                    tokio::spawn(async move {
                        let result = exec.execute(&auth_clone, provider_request).await;
                        let _ = result_tx.send(result);
                    });

                    let mut result_rx = Box::pin(result_rx);

                    tokio::select! {
                        result = &mut result_rx => {
                            match result {
                                Ok(Ok(response)) => {
                                    state.metrics.record_latency_ms(start.elapsed().as_millis());

                                    let translated = state.translators.translate_non_stream(
                                        req.source_format,
                                        target_format,
                                        &actual_model,
                                        &body,
                                        &response.payload,
                                    )?;

                                    let mut builder = axum::http::Response::builder()
                                        .header(axum::http::header::CONTENT_TYPE, "application/json");

                                    for header_name in &config.passthrough_headers {
                                        if let Some(val) = response.headers.get(header_name) {
                                            builder = builder.header(header_name.as_str(), val.as_str());
                                        }
                                    }

                                    let mut resp = builder
                                        .body(axum::body::Body::from(translated.clone()))
                                        .map_err(|e| ProxyError::Internal(format!("failed to build response: {e}")))?
                                        .into_response();
                                    inject_dispatch_meta(
                                        &mut resp,
                                        &debug_info,
                                        &translated,
                                        &state.cost_calculator,
                                        &state.metrics,
                                    );
                                    if req.debug {
                                        inject_debug_headers(&mut resp, &debug_info);
                                    }
                                    state.cooldown.record_success(&auth.id, target_format.as_str());
                                    tracker.set_response_model(extract_response_model(&translated));
                                    let (input_tokens, output_tokens) =
                                        extract_usage(&String::from_utf8_lossy(&translated));
                                    let usage_model = tracker
                                        .request
                                        .response_model
                                        .clone()
                                        .unwrap_or_else(|| actual_model.clone());
                                    let usage_cost = match (input_tokens, output_tokens) {
                                        (Some(i), Some(o)) => {
                                            state.cost_calculator.calculate(&usage_model, i, o)
                                        }
                                        _ => None,
                                    };
                                    tracker.set_usage(input_tokens, output_tokens, usage_cost);
                                    tracker.record_response_detail(ai_proxy_core::proxy_request::ResponseInfo {
                                        status: 200,
                                        headers: response.headers.clone(),
                                        body: String::from_utf8_lossy(&translated).to_string(),
                                    });
                                    tracker.finish_attempt(AttemptStatus::Completed, None);
                                    return Ok(resp);
                                }
                                Ok(Err(e)) => {
                                    handle_retry_error(state, &auth, target_format, &e);
                                    if let ProxyError::Upstream { status, body, .. } = &e {
                                        tracker.record_response_detail(
                                            ai_proxy_core::proxy_request::ResponseInfo {
                                                status: *status,
                                                headers: Default::default(),
                                                body: body.clone(),
                                            },
                                        );
                                    }
                                    tracker.finish_attempt(AttemptStatus::Failed, Some(e.to_string()));
                                    let retryable = e.retryable();
                                    last_error = Some(e);
                                    if retryable && attempt < max_retries {
                                        tokio::time::sleep(retry_cfg.delay_for_attempt(attempt)).await;
                                        continue;
                                    }
                                    tried.push(auth.id.clone());
                                    continue 'route;
                                }
                                Err(_) => {
                                    tracker.finish_attempt(
                                        AttemptStatus::Failed,
                                        Some("upstream execute task failed".to_string()),
                                    );
                                    last_error = Some(ProxyError::Internal(
                                        "upstream execute task failed".into(),
                                    ));
                                    tried.push(auth.id.clone());
                                    continue 'route;
                                }
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_secs(keepalive_secs)) => {
                            tracing::debug!(
                                "Non-stream request exceeded {keepalive_secs}s, enabling keepalive"
                            );
                            state.metrics.record_latency_ms(start.elapsed().as_millis());

                            let keepalive_body = build_keepalive_body(
                                result_rx,
                                keepalive_secs,
                                state.translators.clone(),
                                req.source_format,
                                target_format,
                                actual_model.clone(),
                                body.clone(),
                            );

                            let mut resp = axum::http::Response::builder()
                                .header(axum::http::header::CONTENT_TYPE, "application/json")
                                .body(keepalive_body)
                                .map_err(|e| ProxyError::Internal(format!("failed to build response: {e}")))?
                                .into_response();
                            if req.debug {
                                inject_debug_headers(&mut resp, &debug_info);
                            }
                            return Ok(resp);
                        }
                    }
                } else {
                    // ── Non-stream without keepalive (standard path) ──
                    match executor.execute(&auth, provider_request).await {
                        Ok(response) => {
                            state.metrics.record_latency_ms(start.elapsed().as_millis());

                            let translated = state.translators.translate_non_stream(
                                req.source_format,
                                target_format,
                                &actual_model,
                                &body,
                                &response.payload,
                            )?;

                            let mut builder = axum::http::Response::builder()
                                .header(axum::http::header::CONTENT_TYPE, "application/json");

                            for header_name in &config.passthrough_headers {
                                if let Some(val) = response.headers.get(header_name) {
                                    builder = builder.header(header_name.as_str(), val.as_str());
                                }
                            }

                            let mut resp = builder
                                .body(axum::body::Body::from(translated.clone()))
                                .map_err(|e| {
                                    ProxyError::Internal(format!("failed to build response: {e}"))
                                })?
                                .into_response();
                            inject_dispatch_meta(
                                &mut resp,
                                &debug_info,
                                &translated,
                                &state.cost_calculator,
                                &state.metrics,
                            );
                            if req.debug {
                                inject_debug_headers(&mut resp, &debug_info);
                            }
                            state.cooldown.record_success(&auth.id, target_format.as_str());
                            tracker.set_response_model(extract_response_model(&translated));
                            let (input_tokens, output_tokens) =
                                extract_usage(&String::from_utf8_lossy(&translated));
                            let usage_model = tracker
                                .request
                                .response_model
                                .clone()
                                .unwrap_or_else(|| actual_model.clone());
                            let usage_cost = match (input_tokens, output_tokens) {
                                (Some(i), Some(o)) => {
                                    state.cost_calculator.calculate(&usage_model, i, o)
                                }
                                _ => None,
                            };
                            tracker.set_usage(input_tokens, output_tokens, usage_cost);
                            tracker.record_response_detail(ai_proxy_core::proxy_request::ResponseInfo {
                                status: 200,
                                headers: response.headers.clone(),
                                body: String::from_utf8_lossy(&translated).to_string(),
                            });
                            tracker.finish_attempt(AttemptStatus::Completed, None);
                            return Ok(resp);
                        }
                        Err(e) => {
                            handle_retry_error(state, &auth, target_format, &e);
                            if let ProxyError::Upstream { status, body, .. } = &e {
                                tracker.record_response_detail(
                                    ai_proxy_core::proxy_request::ResponseInfo {
                                        status: *status,
                                        headers: Default::default(),
                                        body: body.clone(),
                                    },
                                );
                            }
                            tracker.finish_attempt(AttemptStatus::Failed, Some(e.to_string()));
                            let retryable = e.retryable();
                            last_error = Some(e);
                            if retryable && attempt < max_retries {
                                tokio::time::sleep(retry_cfg.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            tried.push(auth.id.clone());
                            continue 'route;
                        }
                    }
                }
            }
        }
    }

    state.metrics.record_error();
    state.metrics.record_latency_ms(start.elapsed().as_millis());

    Err(last_error.unwrap_or_else(|| ProxyError::NoCredentials {
        provider: "all".to_string(),
        model: model_chain.join(","),
    }))
}

// ─── Model rewriting for fallback ──────────────────────────────────────────

/// Rewrite the `model` field in a JSON request body to use a different model name.
fn rewrite_model_in_body(body: &Bytes, new_model: &str) -> Bytes {
    if let Ok(mut val) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(obj) = val.as_object_mut()
    {
        obj.insert(
            "model".to_string(),
            serde_json::Value::String(new_model.to_string()),
        );
        if let Ok(bytes) = serde_json::to_vec(&val) {
            return Bytes::from(bytes);
        }
    }
    body.clone()
}

// ─── Non-stream keepalive body ─────────────────────────────────────────────

type ProviderResult = Result<ProviderResponse, ProxyError>;

/// Build a chunked response body that sends periodic whitespace while waiting
/// for the upstream response. Leading whitespace is valid JSON and is ignored
/// by parsers, so the client receives ` ` ` ` `{"choices":[...]}`.
fn build_keepalive_body(
    result_rx: std::pin::Pin<Box<tokio::sync::oneshot::Receiver<ProviderResult>>>,
    interval_secs: u64,
    translators: std::sync::Arc<ai_proxy_translator::TranslatorRegistry>,
    source_format: Format,
    target_format: Format,
    model: String,
    original_body: Bytes,
) -> axum::body::Body {
    struct KeepaliveState {
        rx: Option<std::pin::Pin<Box<tokio::sync::oneshot::Receiver<ProviderResult>>>>,
        interval_secs: u64,
        translators: std::sync::Arc<ai_proxy_translator::TranslatorRegistry>,
        source_format: Format,
        target_format: Format,
        model: String,
        original_body: Bytes,
    }

    let state = KeepaliveState {
        rx: Some(result_rx),
        interval_secs,
        translators,
        source_format,
        target_format,
        model,
        original_body,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        let mut rx = state.rx.take()?;

        tokio::select! {
            result = &mut rx => {
                let data = match result {
                    Ok(Ok(response)) => {
                        match state.translators.translate_non_stream(
                            state.source_format,
                            state.target_format,
                            &state.model,
                            &state.original_body,
                            &response.payload,
                        ) {
                            Ok(translated) => translated,
                            Err(e) => keepalive_error_json(&e.to_string()),
                        }
                    }
                    Ok(Err(e)) => keepalive_error_json(&e.to_string()),
                    Err(_) => keepalive_error_json("internal error"),
                };
                // rx is consumed; stream will end on the next call (rx = None)
                Some((Ok::<Bytes, std::convert::Infallible>(Bytes::from(data)), state))
            }
            _ = tokio::time::sleep(Duration::from_secs(state.interval_secs)) => {
                // Put the receiver back for the next iteration
                state.rx = Some(rx);
                Some((Ok(Bytes::from_static(b" ")), state))
            }
        }
    });

    axum::body::Body::from_stream(stream)
}

fn keepalive_error_json(msg: &str) -> String {
    serde_json::json!({
        "error": {"message": msg, "type": "server_error"}
    })
    .to_string()
}

// ─── Time-to-first-token instrumentation ───────────────────────────────────

/// Wrap a stream so that the first item pulled from it stamps the attempt's
/// TTFT: time from attempt start to the first byte made available to the
/// client, not to the first byte read off the upstream socket — this is
/// what the client actually observes (§4.5).
fn instrument_ttft<S>(
    stream: S,
    ctx: Option<(Arc<dyn ProxyRequestRepository>, String, i64)>,
) -> impl tokio_stream::Stream<Item = S::Item> + Send
where
    S: tokio_stream::Stream + Send + 'static,
{
    let mut ctx = ctx;
    tokio_stream::StreamExt::map(stream, move |item| {
        if let Some((repo, attempt_id, start_ms)) = ctx.take() {
            let ttft_ms = (chrono::Utc::now().timestamp_millis() - start_ms).max(0) as u64;
            repo.record_ttft(&attempt_id, ttft_ms);
        }
        item
    })
}

// ─── Streaming usage accounting ────────────────────────────────────────────

/// Carries what's needed to extract usage/model from an accumulated SSE
/// transcript and write it back once the stream completes — the attempt is
/// already handed off to the repository by the time axum finishes draining
/// the body, so this can't go through `&mut RequestTracker` the way the
/// non-streaming success path does.
struct UsageCtx {
    repo: Arc<dyn ProxyRequestRepository>,
    request_id: String,
    attempt_id: String,
    model: String,
    cost_calculator: Arc<ai_proxy_core::cost::CostCalculator>,
    metrics: Arc<ai_proxy_core::metrics::Metrics>,
}

impl UsageCtx {
    fn new(
        repo: Arc<dyn ProxyRequestRepository>,
        request_id: String,
        attempt_id: String,
        model: String,
        cost_calculator: Arc<ai_proxy_core::cost::CostCalculator>,
        metrics: Arc<ai_proxy_core::metrics::Metrics>,
    ) -> Self {
        Self {
            repo,
            request_id,
            attempt_id,
            model,
            cost_calculator,
            metrics,
        }
    }

    /// Parse the full accumulated transcript and persist tokens/cost/model.
    fn finish(self, transcript: &str) {
        if let Some(response_model) = extract_response_model_from_sse(transcript) {
            self.repo
                .record_response_model(&self.attempt_id, &self.request_id, &response_model);
        }
        let (input_tokens, output_tokens) = extract_usage_from_sse(transcript);
        let cost = match (input_tokens, output_tokens) {
            (Some(i), Some(o)) => {
                self.metrics.record_tokens(i, o);
                let cost = self.cost_calculator.calculate(&self.model, i, o);
                if let Some(c) = cost {
                    self.metrics.record_cost(&self.model, c);
                }
                cost
            }
            _ => None,
        };
        self.repo.record_usage(
            &self.attempt_id,
            &self.request_id,
            input_tokens,
            output_tokens,
            cost,
        );
    }
}

/// Accumulate every chunk pulled from `stream` (the same bytes handed to the
/// client, after format translation) into an in-memory transcript, and on
/// stream completion parse it for tokens/model/cost (§4.3 item 6: "accumulate
/// the entire stream in an in-memory buffer for later token and model
/// extraction"). A no-op pass-through when `ctx` is `None` (e.g. the attempt
/// was never started, which shouldn't happen but mirrors `instrument_ttft`'s
/// defensiveness).
fn instrument_usage(
    stream: impl tokio_stream::Stream<Item = Result<String, ProxyError>> + Send + 'static,
    ctx: Option<UsageCtx>,
) -> impl tokio_stream::Stream<Item = Result<String, ProxyError>> + Send {
    futures::stream::unfold(
        (Box::pin(stream), String::new(), ctx),
        |(mut stream, mut transcript, ctx)| async move {
            use tokio_stream::StreamExt;
            match stream.next().await {
                Some(Ok(text)) => {
                    transcript.push_str(&text);
                    transcript.push('\n');
                    Some((Ok(text), (stream, transcript, ctx)))
                }
                Some(Err(e)) => Some((Err(e), (stream, transcript, ctx))),
                None => {
                    if let Some(ctx) = ctx {
                        ctx.finish(&transcript);
                    }
                    None
                }
            }
        },
    )
}

// ─── Stream translation ────────────────────────────────────────────────────

fn translate_stream(
    upstream: std::pin::Pin<
        Box<dyn tokio_stream::Stream<Item = Result<StreamChunk, ProxyError>> + Send>,
    >,
    translators: std::sync::Arc<ai_proxy_translator::TranslatorRegistry>,
    from: Format,
    to: Format,
    model: String,
    orig_req: Bytes,
) -> impl tokio_stream::Stream<Item = Result<String, ProxyError>> + Send {
    futures::stream::unfold(
        (upstream, TranslateState::default(), true),
        move |(mut stream, mut state, active)| {
            let translators = translators.clone();
            let model = model.clone();
            let orig_req = orig_req.clone();
            async move {
                if !active {
                    return None;
                }

                use tokio_stream::StreamExt;
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        match translators.translate_stream(
                            from,
                            to,
                            &model,
                            &orig_req,
                            chunk.event_type.as_deref(),
                            chunk.data.as_bytes(),
                            &mut state,
                        ) {
                            Ok(lines) => {
                                let has_done = lines.iter().any(|l| l == "[DONE]");
                                let combined = lines.join("\n");
                                if combined.is_empty() {
                                    Some((Ok(String::new()), (stream, state, !has_done)))
                                } else {
                                    Some((Ok(combined), (stream, state, !has_done)))
                                }
                            }
                            Err(e) => Some((Err(e), (stream, state, false))),
                        }
                    }
                    Some(Err(e)) => Some((Err(e), (stream, state, false))),
                    None => None,
                }
            }
        },
    )
}

// ─── Retry error handling ──────────────────────────────────────────────────

/// Classify `error` into a cooldown reason and record the failure against the
/// credential's `(auth_id, target_format)` cooldown bucket, deriving an
/// exponentially-growing, reason-ceilinged deadline from `state.cooldown`.
/// A structured rate-limit reset time takes precedence over a bare
/// `Retry-After` header, which in turn takes precedence over the engine's
/// own backoff growth (see `ProxyError::explicit_until`). The
/// computed deadline is then mirrored into the router's per-credential
/// availability gate so routing actually skips the credential.
fn handle_retry_error(state: &AppState, auth: &AuthRecord, target_format: Format, error: &ProxyError) {
    state.metrics.record_error();

    let Some(reason) = error.cooldown_reason() else {
        return;
    };

    let explicit_until = error.explicit_until();

    let until =
        state
            .cooldown
            .record_failure(&auth.id, target_format.as_str(), reason, explicit_until);

    let remaining = (until - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    state.router.mark_unavailable(&auth.id, remaining);
    tracing::warn!(
        "{reason:?} on {}@{}, cooling down until {until} ({remaining:?})",
        auth.id,
        target_format.as_str()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_proxy_core::proxy_request::InMemoryProxyRequestRepository;

    #[tokio::test]
    async fn instrument_ttft_stamps_only_the_first_item() {
        let repo: Arc<dyn ProxyRequestRepository> =
            Arc::new(InMemoryProxyRequestRepository::new(10));
        let attempt = ProxyUpstreamAttempt::start("req-1", "openai", "cred-1", "gpt-4o");
        let attempt_id = attempt.id.clone();
        let start_time = attempt.start_time;
        repo.save_attempt(attempt);

        let source = tokio_stream::iter(vec![
            Ok::<String, ProxyError>("a".to_string()),
            Ok("b".to_string()),
            Ok("c".to_string()),
        ]);
        let ctx = Some((repo.clone(), attempt_id.clone(), start_time));
        let instrumented = instrument_ttft(source, ctx);

        let collected: Vec<_> = tokio_stream::StreamExt::collect(instrumented).await;
        assert_eq!(collected.len(), 3);

        let attempts = repo.attempts_for("req-1");
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].ttft_ms.is_some());
    }

    #[tokio::test]
    async fn instrument_ttft_is_a_noop_without_context() {
        let source = tokio_stream::iter(vec![Ok::<String, ProxyError>("a".to_string())]);
        let instrumented = instrument_ttft(source, None);
        let collected: Vec<_> = tokio_stream::StreamExt::collect(instrumented).await;
        assert_eq!(collected.len(), 1);
    }

    #[test]
    fn extract_usage_from_sse_keeps_last_non_null_counts() {
        let transcript = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":42,\"completion_tokens\":17}}\n",
            "data: [DONE]\n",
        );
        assert_eq!(extract_usage_from_sse(transcript), (Some(42), Some(17)));
    }

    #[test]
    fn extract_usage_from_sse_ignores_non_json_and_done_lines() {
        let transcript = "event: ping\ndata: [DONE]\n";
        assert_eq!(extract_usage_from_sse(transcript), (None, None));
    }

    #[test]
    fn extract_response_model_from_sse_finds_first_model_field() {
        let transcript = concat!(
            "data: {\"id\":\"1\",\"model\":\"claude-sonnet-4-5-20250929\"}\n",
            "data: [DONE]\n",
        );
        assert_eq!(
            extract_response_model_from_sse(transcript),
            Some("claude-sonnet-4-5-20250929".to_string())
        );
    }

    #[tokio::test]
    async fn instrument_usage_records_tokens_and_cost_on_stream_end() {
        let repo: Arc<dyn ProxyRequestRepository> =
            Arc::new(InMemoryProxyRequestRepository::new(10));
        let request = ProxyRequest::start("instance-1", "openai", "gpt-4o");
        let request_id = request.id.clone();
        repo.save_request(request);
        let attempt = ProxyUpstreamAttempt::start(&request_id, "openai", "cred-1", "gpt-4o");
        let attempt_id = attempt.id.clone();
        repo.save_attempt(attempt);

        let cost_calculator = Arc::new(ai_proxy_core::cost::CostCalculator::new(
            &std::collections::HashMap::new(),
        ));
        let metrics = Arc::new(ai_proxy_core::metrics::Metrics::new());
        let ctx = Some(UsageCtx::new(
            repo.clone(),
            request_id.clone(),
            attempt_id.clone(),
            "gpt-4o".to_string(),
            cost_calculator,
            metrics,
        ));

        let source = tokio_stream::iter(vec![
            Ok::<String, ProxyError>(
                "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}".to_string(),
            ),
            Ok("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":8,\"completion_tokens\":4}}"
                .to_string()),
        ]);
        let instrumented = instrument_usage(source, ctx);
        let collected: Vec<_> = tokio_stream::StreamExt::collect(instrumented).await;
        assert_eq!(collected.len(), 2);

        let attempts = repo.attempts_for(&request_id);
        assert_eq!(attempts[0].input_tokens, Some(8));
        assert_eq!(attempts[0].output_tokens, Some(4));
        let request = repo.get_request(&request_id).unwrap();
        assert_eq!(request.input_tokens, Some(8));
        assert_eq!(request.output_tokens, Some(4));
    }
}
