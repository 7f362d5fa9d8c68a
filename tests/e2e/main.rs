//! Full-stack end-to-end tests: a real TCP listener running the built
//! router, driven with `reqwest`, proxying to a locally bound mock
//! upstream (also a tiny axum app) instead of a live provider.

use ai_proxy_core::config::{Config, ProviderKeyEntry};
use ai_proxy_core::cost::CostCalculator;
use ai_proxy_core::metrics::Metrics;
use ai_proxy_core::rate_limit::RateLimiter;
use ai_proxy_core::request_log::RequestLogStore;
use ai_proxy_provider::build_registry;
use ai_proxy_provider::routing::CredentialRouter;
use ai_proxy_server::{AppState, build_router};
use arc_swap::ArcSwap;
use axum::Json;
use axum::extract::State;
use axum::routing::post;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Spawn a minimal OpenAI-compatible mock upstream and return its base URL.
async fn spawn_mock_upstream() -> String {
    spawn_mock_upstream_with_reply("pong").await
}

/// Same as [`spawn_mock_upstream`] but with a caller-chosen reply string, so
/// a test can tell which of several upstreams actually answered.
async fn spawn_mock_upstream_with_reply(reply: &'static str) -> String {
    async fn chat_completions(
        State((calls, reply)): State<(Arc<std::sync::atomic::AtomicUsize>, &'static str)>,
        Json(_body): Json<Value>,
    ) -> Json<Value> {
        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": reply},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
        }))
    }

    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let app = axum::Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state((calls, reply));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A mock upstream that always answers `500`, to drive the failover path.
async fn spawn_failing_mock_upstream() -> String {
    async fn chat_completions(Json(_body): Json<Value>) -> axum::response::Response {
        use axum::response::IntoResponse;
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"message": "upstream exploded", "type": "server_error"}})),
        )
            .into_response()
    }

    let app = axum::Router::new().route("/v1/chat/completions", post(chat_completions));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Build an `AppState` wired to the given config and spawn it on a real
/// TCP listener. Returns the base URL the proxy is reachable at and a
/// handle onto its request/attempt repository for assertions.
async fn spawn_proxy(
    config: Config,
) -> (String, Arc<dyn ai_proxy_core::proxy_request::ProxyRequestRepository>) {
    let credential_router = Arc::new(CredentialRouter::new(config.routing.strategy.clone()));
    credential_router.update_from_config(&config);

    let executors = Arc::new(build_registry(config.proxy_url.clone()));
    let translators = Arc::new(ai_proxy_translator::build_registry());
    let metrics = Arc::new(Metrics::new());
    let request_logs = Arc::new(RequestLogStore::new(config.dashboard.request_log_capacity));
    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let cost_calculator = Arc::new(CostCalculator::new(&config.model_prices));
    let cooldown = Arc::new(ai_proxy_core::cooldown::CooldownEngine::new());
    let proxy_requests: Arc<dyn ai_proxy_core::proxy_request::ProxyRequestRepository> = Arc::new(
        ai_proxy_core::proxy_request::InMemoryProxyRequestRepository::new(
            config.dashboard.request_log_capacity,
        ),
    );
    let proxy_requests_handle = proxy_requests.clone();
    let config_arc = Arc::new(ArcSwap::from_pointee(config));

    let state = AppState {
        config: config_arc,
        router: credential_router.clone(),
        executors,
        translators,
        metrics,
        request_logs,
        config_path: Arc::new(Mutex::new("unused.yaml".to_string())),
        credential_router,
        rate_limiter,
        cost_calculator,
        cooldown,
        proxy_requests,
        start_time: Instant::now(),
        instance_id: Arc::new("e2e-instance".to_string()),
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), proxy_requests_handle)
}

fn compat_entry(base_url: String) -> ProviderKeyEntry {
    ProviderKeyEntry {
        api_key: "mock-upstream-key".to_string(),
        base_url: Some(base_url),
        proxy_url: None,
        prefix: None,
        models: vec![ai_proxy_core::config::ModelMapping {
            id: "gpt-4o-mini".to_string(),
            alias: None,
        }],
        excluded_models: vec![],
        headers: Default::default(),
        disabled: false,
        name: Some("mock".to_string()),
        cloak: Default::default(),
        wire_api: ai_proxy_core::provider::WireApi::default(),
        weight: 1,
        sort_hint: None,
    }
}

#[tokio::test]
async fn health_endpoint_is_reachable_without_auth() {
    let (base, _proxy_requests) = spawn_proxy(Config::default()).await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn chat_completion_round_trips_through_a_mock_upstream() {
    let upstream = spawn_mock_upstream().await;
    let mut config = Config::default();
    config.openai_compatibility = vec![compat_entry(upstream)];
    let (base, _proxy_requests) = spawn_proxy(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
}

#[tokio::test]
async fn missing_model_is_a_client_error_not_a_panic() {
    let (base, _proxy_requests) = spawn_proxy(Config::default()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"messages": [{"role": "user", "content": "ping"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn unconfigured_model_returns_service_unavailable() {
    let upstream = spawn_mock_upstream().await;
    let mut config = Config::default();
    config.openai_compatibility = vec![compat_entry(upstream)];
    let (base, _proxy_requests) = spawn_proxy(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "model-nobody-configured",
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn api_key_auth_rejects_missing_and_accepts_valid_key() {
    let upstream = spawn_mock_upstream().await;
    let mut config = Config::default();
    config.api_keys = vec!["client-secret".to_string()];
    config.api_keys_set = config.api_keys.iter().cloned().collect();
    config.openai_compatibility = vec![compat_entry(upstream)];
    let (base, _proxy_requests) = spawn_proxy(config).await;

    let client = reqwest::Client::new();

    let unauthenticated = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), 401);

    let authenticated = client
        .post(format!("{base}/v1/chat/completions"))
        .header("authorization", "Bearer client-secret")
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(authenticated.status(), 200);
}

#[tokio::test]
async fn model_list_reflects_configured_providers() {
    let upstream = spawn_mock_upstream().await;
    let mut config = Config::default();
    config.openai_compatibility = vec![compat_entry(upstream)];
    let (base, _proxy_requests) = spawn_proxy(config).await;

    let resp = reqwest::get(format!("{base}/v1/models")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gpt-4o-mini"));
}

#[tokio::test]
async fn plain_non_stream_success_records_exactly_one_completed_attempt() {
    let upstream = spawn_mock_upstream().await;
    let mut config = Config::default();
    config.openai_compatibility = vec![compat_entry(upstream)];
    let (base, proxy_requests) = spawn_proxy(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let _ = resp.bytes().await.unwrap();

    let recent = proxy_requests.recent_requests(10);
    assert_eq!(recent.len(), 1, "expected exactly one recorded request");
    let request = &recent[0];
    assert_eq!(request.status, ai_proxy_core::proxy_request::RequestStatus::Completed);

    let attempts = proxy_requests.attempts_for(&request.id);
    assert_eq!(attempts.len(), 1, "expected exactly one attempt");
    assert_eq!(
        attempts[0].status,
        ai_proxy_core::proxy_request::AttemptStatus::Completed,
        "a successful plain non-stream request must not have its attempt \
         overwritten to Cancelled by the dangling-attempt sweep"
    );
}

#[tokio::test]
async fn failover_retries_a_second_credential_after_a_500() {
    let bad_upstream = spawn_failing_mock_upstream().await;
    let good_upstream = spawn_mock_upstream_with_reply("pong-from-the-good-one").await;

    let mut config = Config::default();
    config.openai_compatibility = vec![compat_entry(bad_upstream), compat_entry(good_upstream)];
    let (base, _proxy_requests) = spawn_proxy(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "pong-from-the-good-one"
    );
}
