//! Reason-classified cooldown engine.
//!
//! Tracks consecutive failures per `(provider_id, client_type)` pair and
//! computes an exponentially growing cooldown deadline capped by a
//! per-reason ceiling. The deadline only ever moves forward in time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CooldownReason {
    RateLimit,
    QuotaExhausted,
    ConcurrentLimit,
    ServerError,
    NetworkError,
    Unknown,
}

impl CooldownReason {
    /// `(base_secs, cap_secs)` for the exponential backoff this reason drives.
    fn ceiling(self) -> (u64, u64) {
        match self {
            CooldownReason::NetworkError => (5, 60),
            CooldownReason::ServerError => (10, 300),
            CooldownReason::RateLimit => (30, 1800),
            CooldownReason::QuotaExhausted => (300, 21_600),
            CooldownReason::ConcurrentLimit => (5, 120),
            CooldownReason::Unknown => (10, 600),
        }
    }

    /// `base * 2^(counter-1)` clamped to the cap, for `counter >= 1`.
    fn duration_for(self, counter: u32) -> Duration {
        let (base, cap) = self.ceiling();
        let exp = counter.saturating_sub(1).min(32);
        let secs = base.saturating_mul(1u64 << exp).min(cap);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Default)]
struct CooldownState {
    consecutive_failures: u32,
    until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    provider_id: String,
    client_type: String,
}

/// Thread-safe cooldown tracker keyed by `(provider_id, client_type)`.
#[derive(Default)]
pub struct CooldownEngine {
    state: DashMap<CooldownKey, CooldownState>,
}

impl CooldownEngine {
    pub fn new() -> Self {
        Self {
            state: DashMap::new(),
        }
    }

    /// Clear the failure counter and any active deadline.
    pub fn record_success(&self, provider_id: &str, client_type: &str) {
        let key = CooldownKey {
            provider_id: provider_id.to_string(),
            client_type: client_type.to_string(),
        };
        self.state.remove(&key);
    }

    /// Register a failure. If `explicit_until` is supplied (e.g. from an
    /// upstream-reported reset time or `Retry-After` header) the deadline is
    /// set to it directly; otherwise it is computed from the reason's policy
    /// table and the running consecutive-failure counter. The deadline never
    /// moves backward.
    pub fn record_failure(
        &self,
        provider_id: &str,
        client_type: &str,
        reason: CooldownReason,
        explicit_until: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let key = CooldownKey {
            provider_id: provider_id.to_string(),
            client_type: client_type.to_string(),
        };
        let mut entry = self.state.entry(key).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        let computed = explicit_until
            .unwrap_or_else(|| Utc::now() + reason.duration_for(entry.consecutive_failures));

        let new_until = match entry.until {
            Some(existing) if existing >= computed => existing,
            _ => computed,
        };
        entry.until = Some(new_until);
        new_until
    }

    /// Late-binding update from an asynchronous channel an adapter may return
    /// alongside its error (e.g. a rate-limit reset discovered after the
    /// initial response headers were parsed). Only moves the deadline forward.
    pub fn update_cooldown(&self, provider_id: &str, client_type: &str, new_until: DateTime<Utc>) {
        let key = CooldownKey {
            provider_id: provider_id.to_string(),
            client_type: client_type.to_string(),
        };
        let mut entry = self.state.entry(key).or_default();
        if entry.until.is_none_or(|existing| new_until > existing) {
            entry.until = Some(new_until);
        }
    }

    pub fn is_cooling_down(&self, provider_id: &str, client_type: &str) -> bool {
        let key = CooldownKey {
            provider_id: provider_id.to_string(),
            client_type: client_type.to_string(),
        };
        match self.state.get(&key) {
            Some(entry) => entry.until.is_some_and(|until| Utc::now() < until),
            None => false,
        }
    }

    pub fn until(&self, provider_id: &str, client_type: &str) -> Option<DateTime<Utc>> {
        let key = CooldownKey {
            provider_id: provider_id.to_string(),
            client_type: client_type.to_string(),
        };
        self.state.get(&key).and_then(|e| e.until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_clears_state() {
        let engine = CooldownEngine::new();
        engine.record_failure("p1", "claude", CooldownReason::NetworkError, None);
        assert!(engine.is_cooling_down("p1", "claude"));
        engine.record_success("p1", "claude");
        assert!(!engine.is_cooling_down("p1", "claude"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let engine = CooldownEngine::new();
        let mut last = None;
        for _ in 0..10 {
            let until = engine.record_failure("p1", "claude", CooldownReason::NetworkError, None);
            if let Some(prev) = last {
                assert!(until >= prev);
            }
            last = Some(until);
        }
        // base=5s cap=60s; after many failures it should be clamped near the cap.
        let until = last.unwrap();
        let secs = (until - Utc::now()).num_seconds();
        assert!(secs <= 60);
    }

    #[test]
    fn deadline_never_moves_backward() {
        let engine = CooldownEngine::new();
        let far_future = Utc::now() + chrono::Duration::hours(1);
        engine.update_cooldown("p1", "claude", far_future);
        let reduced = Utc::now() + chrono::Duration::seconds(5);
        engine.update_cooldown("p1", "claude", reduced);
        assert_eq!(engine.until("p1", "claude"), Some(far_future));
    }

    #[test]
    fn explicit_until_respected() {
        let engine = CooldownEngine::new();
        let explicit = Utc::now() + chrono::Duration::seconds(600);
        let got = engine.record_failure("p1", "claude", CooldownReason::RateLimit, Some(explicit));
        assert_eq!(got, explicit);
    }

    #[test]
    fn different_client_types_are_independent() {
        let engine = CooldownEngine::new();
        engine.record_failure("p1", "claude", CooldownReason::NetworkError, None);
        assert!(engine.is_cooling_down("p1", "claude"));
        assert!(!engine.is_cooling_down("p1", "openai"));
    }
}
