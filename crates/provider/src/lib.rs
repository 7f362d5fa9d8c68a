pub mod claude;
pub mod codex;
pub mod common;
pub mod gemini;
pub mod openai;
pub mod openai_compat;
pub mod routing;
pub mod sse;

use ai_proxy_core::provider::{Format, ProviderExecutor};
use std::collections::HashMap;
use std::sync::Arc;

/// Extract response headers from a reqwest Response into a HashMap.
pub fn extract_headers(resp: &reqwest::Response) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in resp.headers().iter() {
        if let Ok(v) = value.to_str() {
            headers.insert(key.as_str().to_string(), v.to_string());
        }
    }
    headers
}

/// Parse the `Retry-After` header value as seconds.
/// Handles integer seconds only (ignores HTTP-date format).
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.parse::<u64>().ok())
}

/// Parse the reset time of a header's value, handling both an RFC3339
/// timestamp (Anthropic's `anthropic-ratelimit-*-reset`) and a bare duration
/// like `"6m0s"` or `"30s"` (OpenAI's `x-ratelimit-reset-*`), relative to now.
fn parse_reset_header(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&chrono::Utc));
    }
    // Duration shorthand: optional "Xm" then optional "Ys" / "Y.Zs".
    let mut secs = 0f64;
    let mut rest = value.trim();
    if let Some(idx) = rest.find('m') {
        let (mins, tail) = rest.split_at(idx);
        secs += mins.parse::<f64>().ok()? * 60.0;
        rest = &tail[1..];
    }
    rest = rest.trim_end_matches('s');
    if !rest.is_empty() {
        secs += rest.parse::<f64>().ok()?;
    } else if secs == 0.0 {
        return None;
    }
    Some(chrono::Utc::now() + chrono::Duration::milliseconds((secs * 1000.0) as i64))
}

/// Recover structured rate-limit reset info from a 429 response's headers.
/// Anthropic's request/token windows and OpenAI's request/token windows are
/// both "two concurrently-reported windows" shapes; the shorter-lived one
/// (requests) is treated as primary, the other as secondary — see
/// [`ai_proxy_core::error::RateLimitInfo`] for why secondary is informational
/// only.
pub fn parse_rate_limit_info(
    headers: &HashMap<String, String>,
    body: &str,
) -> Option<ai_proxy_core::error::RateLimitInfo> {
    let primary = headers
        .get("anthropic-ratelimit-requests-reset")
        .or_else(|| headers.get("x-ratelimit-reset-requests"))
        .and_then(|v| parse_reset_header(v));
    let secondary = headers
        .get("anthropic-ratelimit-tokens-reset")
        .or_else(|| headers.get("x-ratelimit-reset-tokens"))
        .and_then(|v| parse_reset_header(v));

    if primary.is_none() && secondary.is_none() {
        return None;
    }

    let lower = body.to_lowercase();
    let quota_exhausted = lower.contains("insufficient_quota")
        || lower.contains("quota_exceeded")
        || headers
            .get("x-ratelimit-remaining-requests")
            .is_some_and(|v| v == "0");

    Some(ai_proxy_core::error::RateLimitInfo {
        primary_reset: primary,
        secondary_reset: secondary,
        quota_exhausted,
    })
}

pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
}

impl ExecutorRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn get_by_format(&self, format: Format) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors
            .values()
            .find(|e| e.native_format() == format)
            .cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &Arc<dyn ProviderExecutor>)> {
        self.executors.iter()
    }
}

pub fn build_registry(global_proxy: Option<String>) -> ExecutorRegistry {
    let mut executors: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();

    // OpenAI executor (OpenAI-compatible with OpenAI defaults)
    let openai = openai::new_openai_executor(global_proxy.clone());
    executors.insert("openai".to_string(), Arc::new(openai));

    // Claude executor
    let claude = claude::ClaudeExecutor::new(global_proxy.clone());
    executors.insert("claude".to_string(), Arc::new(claude));

    // Gemini executor
    let gemini = gemini::GeminiExecutor::new(global_proxy.clone());
    executors.insert("gemini".to_string(), Arc::new(gemini));

    // OpenAI-compatible generic executor (no default base_url - users must provide base-url in config)
    let compat = openai_compat::OpenAICompatExecutor {
        name: "openai-compat".to_string(),
        default_base_url: String::new(),
        format: Format::OpenAICompat,
        global_proxy: global_proxy.clone(),
    };
    executors.insert("openai-compat".to_string(), Arc::new(compat));

    // Codex (ChatGPT OAuth) executor
    let codex = codex::CodexExecutor::new(global_proxy.clone());
    executors.insert("codex".to_string(), Arc::new(codex));

    ExecutorRegistry { executors }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reset_header_handles_rfc3339_and_duration_shorthand() {
        let future = chrono::Utc::now() + chrono::Duration::minutes(10);
        let rfc3339 = future.to_rfc3339();
        let parsed = parse_reset_header(&rfc3339).unwrap();
        assert!((parsed - future).num_seconds().abs() <= 1);

        let parsed = parse_reset_header("6m0s").unwrap();
        let expect = chrono::Utc::now() + chrono::Duration::seconds(360);
        assert!((parsed - expect).num_seconds().abs() <= 1);

        let parsed = parse_reset_header("30s").unwrap();
        let expect = chrono::Utc::now() + chrono::Duration::seconds(30);
        assert!((parsed - expect).num_seconds().abs() <= 1);
    }

    #[test]
    fn rate_limit_info_flags_quota_exhaustion() {
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-reset-requests".to_string(), "30s".to_string());
        headers.insert("x-ratelimit-remaining-requests".to_string(), "0".to_string());
        let info = parse_rate_limit_info(&headers, "{}").unwrap();
        assert!(info.quota_exhausted);
        assert!(info.primary_reset.is_some());
    }

    #[test]
    fn rate_limit_info_absent_without_reset_headers() {
        let headers = HashMap::new();
        assert!(parse_rate_limit_info(&headers, "{}").is_none());
    }
}
