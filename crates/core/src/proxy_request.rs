use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Captured client- or upstream-facing request, subject to the retention
/// policy (`Config::request_detail_retention_secs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    /// First value wins per header name, mirroring how a client or upstream
    /// would actually observe a repeated header.
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Captured client- or upstream-facing response. For a streamed response,
/// `body` accumulates the full SSE transcript for post-hoc parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Lifecycle status of a top-level proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Rejected
        )
    }
}

/// Lifecycle status of one try against one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One try against one upstream provider/credential.
///
/// `mapped_model` is what was actually sent upstream; `response_model` is
/// whatever the upstream echoed back, if different — pricing prefers the
/// latter when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyUpstreamAttempt {
    pub id: String,
    pub request_id: String,
    pub provider: String,
    pub credential_id: String,
    pub status: AttemptStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<u64>,
    pub mapped_model: String,
    pub response_model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost: Option<f64>,
    pub ttft_ms: Option<u64>,
    pub error: Option<String>,
    /// Captured upstream request, cleared per the retention policy.
    pub request_info: Option<RequestInfo>,
    /// Captured upstream response, cleared per the retention policy.
    pub response_info: Option<ResponseInfo>,
}

impl ProxyUpstreamAttempt {
    pub fn start(request_id: &str, provider: &str, credential_id: &str, mapped_model: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            provider: provider.to_string(),
            credential_id: credential_id.to_string(),
            status: AttemptStatus::InProgress,
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: None,
            duration_ms: None,
            mapped_model: mapped_model.to_string(),
            response_model: None,
            input_tokens: None,
            output_tokens: None,
            cost: None,
            ttft_ms: None,
            error: None,
            request_info: None,
            response_info: None,
        }
    }

    /// Move the attempt to a terminal status, recording end time and
    /// duration. A no-op if already terminal — the first finalization wins.
    pub fn finish(&mut self, status: AttemptStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        let now = chrono::Utc::now().timestamp_millis();
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).max(0) as u64);
    }

    /// Apply the retention policy to the captured request/response detail:
    /// `0` clears both immediately, `>0` clears them once `end_time` is
    /// further than `retention_secs` in the past, `<0` keeps them forever.
    pub fn apply_retention(&mut self, retention_secs: i64) {
        if retention_secs == 0 {
            self.request_info = None;
            self.response_info = None;
            return;
        }
        if retention_secs < 0 {
            return;
        }
        let Some(end_time) = self.end_time else {
            return;
        };
        let age_secs = (chrono::Utc::now().timestamp_millis() - end_time) / 1000;
        if age_secs >= retention_secs {
            self.request_info = None;
            self.response_info = None;
        }
    }
}

/// Top-level record for one client-facing proxied request.
///
/// `attempt_count` equals the number of [`ProxyUpstreamAttempt`] records
/// filed against `final_attempt_id`'s request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub id: String,
    pub instance_id: String,
    pub session_id: Option<String>,
    /// The client-facing wire format the request arrived in (pre-conversion).
    pub client_type: String,
    pub requested_model: String,
    pub response_model: Option<String>,
    pub status: RequestStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost: Option<f64>,
    pub attempt_count: u32,
    pub final_attempt_id: Option<String>,
}

impl ProxyRequest {
    pub fn start(instance_id: &str, client_type: &str, requested_model: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            session_id: None,
            client_type: client_type.to_string(),
            requested_model: requested_model.to_string(),
            response_model: None,
            status: RequestStatus::InProgress,
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
            cost: None,
            attempt_count: 0,
            final_attempt_id: None,
        }
    }

    pub fn finish(&mut self, status: RequestStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        let now = chrono::Utc::now().timestamp_millis();
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).max(0) as u64);
    }
}

/// Storage contract for requests/attempts, so the in-memory ring buffer
/// used today can later be swapped for a persistent store without
/// touching callers.
pub trait ProxyRequestRepository: Send + Sync {
    fn save_request(&self, request: ProxyRequest);
    fn save_attempt(&self, attempt: ProxyUpstreamAttempt);
    fn get_request(&self, id: &str) -> Option<ProxyRequest>;
    fn attempts_for(&self, request_id: &str) -> Vec<ProxyUpstreamAttempt>;
    /// Record time-to-first-token for an already-saved attempt. A no-op if
    /// the attempt is unknown or already has a TTFT (first byte wins).
    fn record_ttft(&self, attempt_id: &str, ttft_ms: u64);
    /// Record token counts and cost on an already-saved attempt, and mirror
    /// the same totals onto its parent request (§3: "pricing prefers
    /// `responseModel`" applies to the model chosen beforehand; this just
    /// carries whatever counts were finally extracted). A no-op for fields
    /// that are `None` — callers pass only what they actually parsed.
    fn record_usage(
        &self,
        attempt_id: &str,
        request_id: &str,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        cost: Option<f64>,
    );
    /// Record the model an upstream streaming response echoed back, once
    /// the transcript has been fully parsed (the non-streaming case is
    /// handled inline by [`ProxyUpstreamAttempt`]'s caller instead, since it
    /// already has the full body in hand before the attempt is finished).
    fn record_response_model(&self, attempt_id: &str, request_id: &str, model: &str);
    /// Most recently saved requests, newest last, for dashboard/monitoring
    /// views and tests — mirrors [`crate::request_log::RequestLogStore::query`].
    fn recent_requests(&self, limit: usize) -> Vec<ProxyRequest>;

    /// Boot-time sweep: transition every still-`InProgress` request to
    /// `Failed` if it belongs to a different instance (a previous process
    /// that crashed mid-request) or has been in flight for more than 30
    /// minutes regardless of instance (this process's own stale leftovers,
    /// e.g. from an abrupt non-graceful kill). Returns the number of
    /// requests transitioned.
    fn mark_stale_as_failed(&self, current_instance_id: &str) -> usize;
}

/// In-memory ring buffer, mirroring [`crate::request_log::RequestLogStore`]'s
/// capacity-bounded `VecDeque` shape but keyed to upsert by id (a request's
/// record is written multiple times as it moves through its lifecycle).
pub struct InMemoryProxyRequestRepository {
    requests: RwLock<VecDeque<ProxyRequest>>,
    attempts: RwLock<VecDeque<ProxyUpstreamAttempt>>,
    capacity: usize,
}

impl InMemoryProxyRequestRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: RwLock::new(VecDeque::with_capacity(capacity)),
            attempts: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }
}

impl ProxyRequestRepository for InMemoryProxyRequestRepository {
    fn save_request(&self, request: ProxyRequest) {
        let mut requests = self.requests.write().unwrap();
        if let Some(existing) = requests.iter_mut().find(|r| r.id == request.id) {
            *existing = request;
            return;
        }
        if requests.len() >= self.capacity {
            requests.pop_front();
        }
        requests.push_back(request);
    }

    fn save_attempt(&self, attempt: ProxyUpstreamAttempt) {
        let mut attempts = self.attempts.write().unwrap();
        if let Some(existing) = attempts.iter_mut().find(|a| a.id == attempt.id) {
            *existing = attempt;
            return;
        }
        if attempts.len() >= self.capacity {
            attempts.pop_front();
        }
        attempts.push_back(attempt);
    }

    fn get_request(&self, id: &str) -> Option<ProxyRequest> {
        self.requests
            .read()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    fn attempts_for(&self, request_id: &str) -> Vec<ProxyUpstreamAttempt> {
        self.attempts
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect()
    }

    fn record_ttft(&self, attempt_id: &str, ttft_ms: u64) {
        if let Ok(mut attempts) = self.attempts.write()
            && let Some(attempt) = attempts.iter_mut().find(|a| a.id == attempt_id)
            && attempt.ttft_ms.is_none()
        {
            attempt.ttft_ms = Some(ttft_ms);
        }
    }

    fn record_usage(
        &self,
        attempt_id: &str,
        request_id: &str,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        cost: Option<f64>,
    ) {
        if let Ok(mut attempts) = self.attempts.write()
            && let Some(attempt) = attempts.iter_mut().find(|a| a.id == attempt_id)
        {
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
        if let Ok(mut requests) = self.requests.write()
            && let Some(request) = requests.iter_mut().find(|r| r.id == request_id)
        {
            if input_tokens.is_some() {
                request.input_tokens = input_tokens;
            }
            if output_tokens.is_some() {
                request.output_tokens = output_tokens;
            }
            if cost.is_some() {
                request.cost = cost;
            }
        }
    }

    fn record_response_model(&self, attempt_id: &str, request_id: &str, model: &str) {
        if let Ok(mut attempts) = self.attempts.write()
            && let Some(attempt) = attempts.iter_mut().find(|a| a.id == attempt_id)
        {
            attempt.response_model = Some(model.to_string());
        }
        if let Ok(mut requests) = self.requests.write()
            && let Some(request) = requests.iter_mut().find(|r| r.id == request_id)
        {
            request.response_model = Some(model.to_string());
        }
    }

    fn recent_requests(&self, limit: usize) -> Vec<ProxyRequest> {
        let requests = self.requests.read().unwrap();
        requests.iter().rev().take(limit).rev().cloned().collect()
    }

    fn mark_stale_as_failed(&self, current_instance_id: &str) -> usize {
        const STALE_AFTER_MS: i64 = 30 * 60 * 1000;
        let now = chrono::Utc::now().timestamp_millis();
        let mut requests = self.requests.write().unwrap();
        let mut count = 0;
        for request in requests.iter_mut() {
            if request.status.is_terminal() {
                continue;
            }
            let other_instance = request.instance_id != current_instance_id;
            let too_old = now.saturating_sub(request.start_time) > STALE_AFTER_MS;
            if other_instance || too_old {
                request.finish(RequestStatus::Failed);
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_count_matches_filed_attempts() {
        let repo = InMemoryProxyRequestRepository::new(100);
        let mut request = ProxyRequest::start("instance-1", "claude", "claude-sonnet-4-5");

        let mut a1 = ProxyUpstreamAttempt::start(&request.id, "claude", "cred-1", "claude-sonnet-4-5");
        a1.finish(AttemptStatus::Failed, Some("server_error".to_string()));
        repo.save_attempt(a1);
        request.attempt_count += 1;

        let mut a2 = ProxyUpstreamAttempt::start(&request.id, "claude", "cred-2", "claude-sonnet-4-5");
        a2.finish(AttemptStatus::Completed, None);
        request.final_attempt_id = Some(a2.id.clone());
        repo.save_attempt(a2);
        request.attempt_count += 1;

        request.finish(RequestStatus::Completed);
        repo.save_request(request.clone());

        assert_eq!(repo.attempts_for(&request.id).len(), request.attempt_count as usize);
        assert_eq!(repo.get_request(&request.id).unwrap().status, RequestStatus::Completed);
    }

    #[test]
    fn finish_is_idempotent_first_writer_wins() {
        let mut attempt = ProxyUpstreamAttempt::start("req-1", "openai", "cred-1", "gpt-4o");
        attempt.finish(AttemptStatus::Completed, None);
        let end_time = attempt.end_time;
        attempt.finish(AttemptStatus::Failed, Some("late error".to_string()));
        assert_eq!(attempt.status, AttemptStatus::Completed);
        assert_eq!(attempt.end_time, end_time);
    }

    #[test]
    fn ttft_recorded_once_first_byte_wins() {
        let repo = InMemoryProxyRequestRepository::new(100);
        let attempt = ProxyUpstreamAttempt::start("req-1", "claude", "cred-1", "claude-sonnet-4-5");
        let id = attempt.id.clone();
        repo.save_attempt(attempt);

        repo.record_ttft(&id, 120);
        repo.record_ttft(&id, 9999);

        let attempts = repo.attempts_for("req-1");
        assert_eq!(attempts[0].ttft_ms, Some(120));
    }

    #[test]
    fn mark_stale_as_failed_sweeps_other_instance_in_progress_requests() {
        let repo = InMemoryProxyRequestRepository::new(10);
        let mut stale = ProxyRequest::start("old-instance", "claude", "claude-sonnet-4-5");
        stale.status = RequestStatus::InProgress;
        let stale_id = stale.id.clone();
        repo.save_request(stale);

        let mut fresh = ProxyRequest::start("new-instance", "claude", "claude-sonnet-4-5");
        fresh.status = RequestStatus::InProgress;
        let fresh_id = fresh.id.clone();
        repo.save_request(fresh);

        let swept = repo.mark_stale_as_failed("new-instance");
        assert_eq!(swept, 1);
        assert_eq!(
            repo.get_request(&stale_id).unwrap().status,
            RequestStatus::Failed
        );
        assert_eq!(
            repo.get_request(&fresh_id).unwrap().status,
            RequestStatus::InProgress
        );
    }

    #[test]
    fn record_usage_updates_attempt_and_request() {
        let repo = InMemoryProxyRequestRepository::new(100);
        let request = ProxyRequest::start("instance-1", "claude", "claude-sonnet-4-5");
        let request_id = request.id.clone();
        repo.save_request(request);

        let attempt =
            ProxyUpstreamAttempt::start(&request_id, "claude", "cred-1", "claude-sonnet-4-5");
        let attempt_id = attempt.id.clone();
        repo.save_attempt(attempt);

        repo.record_usage(&attempt_id, &request_id, Some(42), Some(17), Some(0.0123));

        let attempt = repo.attempts_for(&request_id).into_iter().next().unwrap();
        assert_eq!(attempt.input_tokens, Some(42));
        assert_eq!(attempt.output_tokens, Some(17));
        assert_eq!(attempt.cost, Some(0.0123));

        let request = repo.get_request(&request_id).unwrap();
        assert_eq!(request.input_tokens, Some(42));
        assert_eq!(request.output_tokens, Some(17));
        assert_eq!(request.cost, Some(0.0123));
    }

    #[test]
    fn record_response_model_updates_attempt_and_request() {
        let repo = InMemoryProxyRequestRepository::new(100);
        let request = ProxyRequest::start("instance-1", "codex", "gpt-5-codex");
        let request_id = request.id.clone();
        repo.save_request(request);

        let attempt = ProxyUpstreamAttempt::start(&request_id, "codex", "cred-1", "gpt-5-codex");
        let attempt_id = attempt.id.clone();
        repo.save_attempt(attempt);

        repo.record_response_model(&attempt_id, &request_id, "gpt-5-codex-2025-06-01");

        let attempt = repo.attempts_for(&request_id).into_iter().next().unwrap();
        assert_eq!(
            attempt.response_model.as_deref(),
            Some("gpt-5-codex-2025-06-01")
        );
        assert_eq!(
            repo.get_request(&request_id)
                .unwrap()
                .response_model
                .as_deref(),
            Some("gpt-5-codex-2025-06-01")
        );
    }

    #[test]
    fn mark_stale_as_failed_leaves_terminal_requests_alone() {
        let repo = InMemoryProxyRequestRepository::new(10);
        let mut done = ProxyRequest::start("old-instance", "claude", "claude-sonnet-4-5");
        done.finish(RequestStatus::Completed);
        let id = done.id.clone();
        repo.save_request(done);

        assert_eq!(repo.mark_stale_as_failed("new-instance"), 0);
        assert_eq!(
            repo.get_request(&id).unwrap().status,
            RequestStatus::Completed
        );
    }

    #[test]
    fn capacity_eviction_drops_oldest() {
        let repo = InMemoryProxyRequestRepository::new(2);
        for i in 0..5 {
            let request = ProxyRequest::start("instance-1", "claude", &format!("model-{i}"));
            repo.save_request(request);
        }
        assert_eq!(repo.requests.read().unwrap().len(), 2);
    }
}
