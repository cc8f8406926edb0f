//! Circuit breaker over a list of forwarding proxies
//!
//! Each proxy carries its own failure count, cooldown and block window; the
//! breaker as a whole also counts failed calls in a row and suspends itself
//! once they reach the configured threshold.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ProxyConfig, ProxyEndpoint, ProxyPolicy};
use crate::service::{HttpFetch, SourceError};

/// Why a single proxy attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyFailure {
    #[error("HTTP {0}")]
    Http(u16),
    #[error("non-json response")]
    InvalidPayload,
    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Network,
    Abort,
    Forbidden,
    Other,
}

impl TransportKind {
    fn classify(message: &str) -> Self {
        const NETWORK: [&str; 5] = ["failed to fetch", "dns", "name_not_resolved", "timeout", "connect"];
        if NETWORK.iter().any(|needle| message.contains(needle)) {
            TransportKind::Network
        } else if message.contains("abort") {
            TransportKind::Abort
        } else if message.contains("403") {
            TransportKind::Forbidden
        } else {
            TransportKind::Other
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ProxyState {
    blocked_until: Option<Instant>,
    cooling_until: Option<Instant>,
    fail_count: u32,
}

impl ProxyState {
    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    fn is_cooling(&self, now: Instant) -> bool {
        self.cooling_until.is_some_and(|until| now < until)
    }

    fn is_usable(&self, now: Instant) -> bool {
        !self.is_blocked(now) && !self.is_cooling(now)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    proxies: HashMap<String, ProxyState>,
    last_success: Option<String>,
    failure_streak: u32,
    suspended_until: Option<Instant>,
}

/// Outcome of one pass over the proxy list
struct Pass {
    tried: usize,
    payload: Option<Value>,
}

pub struct ProxyCircuitBreaker {
    http: Arc<dyn HttpFetch>,
    config: ProxyConfig,
    state: Mutex<BreakerState>,
}

impl ProxyCircuitBreaker {
    pub fn new(http: Arc<dyn HttpFetch>, config: ProxyConfig) -> Self {
        Self {
            http,
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Fetch `base_url` through the first usable proxy and parse the body as JSON.
    ///
    /// Returns `None` while suspended, or when every proxy failed even after a
    /// single reset of all block state.
    pub async fn fetch_through_best_proxy(&self, base_url: &str) -> Option<Value> {
        if let Some(until) = self.suspended_until() {
            tracing::debug!(
                "Proxy lookups suspended for another {:?}",
                until.saturating_duration_since(Instant::now())
            );
            return None;
        }

        let mut errors = Vec::new();
        let mut reset_available = true;

        loop {
            let pass = self.run_pass(base_url, &mut errors).await;
            if let Some(payload) = pass.payload {
                self.state.lock().failure_streak = 0;
                return Some(payload);
            }

            if reset_available && (pass.tried == 0 || self.all_blocked()) {
                reset_available = false;
                self.reset(if pass.tried == 0 {
                    "no-available-proxy"
                } else {
                    "all-blocked-retry"
                });
                continue;
            }
            break;
        }

        if !errors.is_empty() {
            let mut state = self.state.lock();
            state.failure_streak += 1;
            if state.failure_streak >= self.config.failure_threshold {
                let suspend = Duration::from_millis(self.config.suspend_ms);
                state.suspended_until = Some(Instant::now() + suspend);
                tracing::warn!(
                    "Suspending proxy lookups for {}s after {} failed calls",
                    suspend.as_secs(),
                    state.failure_streak
                );
            }
        }

        let summary = if errors.is_empty() {
            "no proxies available".to_string()
        } else {
            errors.join(" | ")
        };
        tracing::warn!("Proxy fetch failed: {}", summary);
        None
    }

    async fn run_pass(&self, base_url: &str, errors: &mut Vec<String>) -> Pass {
        let mut tried = 0;

        for endpoint in self.ordered_endpoints() {
            let id = endpoint.id.as_str();
            let usable = {
                let state = self.state.lock();
                state
                    .proxies
                    .get(id)
                    .map_or(true, |proxy| proxy.is_usable(Instant::now()))
            };
            if !usable {
                continue;
            }

            tried += 1;
            let policy = self.config.policy(id);
            let url = endpoint
                .url_template
                .replace("{url}", &urlencoding::encode(base_url));
            let timeout = Duration::from_millis(policy.timeout_ms);

            let response = match tokio::time::timeout(timeout, self.http.get(&url, timeout, &[]))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout),
            };

            let failure = match response {
                Ok(response) if response.is_success() => {
                    match parse_payload(&response.body, policy.extract_embedded_json) {
                        Some(payload) => {
                            self.record_success(id);
                            tracing::debug!("Proxy {} answered", id);
                            return Pass {
                                tried,
                                payload: Some(payload),
                            };
                        }
                        None => ProxyFailure::InvalidPayload,
                    }
                }
                Ok(response) => ProxyFailure::Http(response.status),
                Err(e) => ProxyFailure::Transport(e.to_string()),
            };

            if let Some(reported) = self.record_failure(id, &policy, &failure) {
                errors.push(format!("{}: {}", id, reported));
            }
        }

        Pass {
            tried,
            payload: None,
        }
    }

    /// Endpoints in priority order, last successful one first
    fn ordered_endpoints(&self) -> Vec<ProxyEndpoint> {
        let mut endpoints = self.config.endpoints.clone();
        let last = self.state.lock().last_success.clone();
        if let Some(last) = last {
            if let Some(pos) = endpoints.iter().position(|e| e.id == last) {
                let promoted = endpoints.remove(pos);
                endpoints.insert(0, promoted);
            }
        }
        endpoints
    }

    fn record_success(&self, id: &str) {
        let mut state = self.state.lock();
        state.last_success = Some(id.to_string());
        if let Some(proxy) = state.proxies.get_mut(id) {
            proxy.fail_count = 0;
        }
    }

    /// Count a failure against `id`; returns the text to report, if any
    fn record_failure(
        &self,
        id: &str,
        policy: &ProxyPolicy,
        failure: &ProxyFailure,
    ) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let proxy = state.proxies.entry(id.to_string()).or_default();
        let block_window = Duration::from_millis(self.config.block_ms);

        match failure {
            ProxyFailure::Http(status) => {
                proxy.fail_count += 1;
                let count = proxy.fail_count;
                if *status == 429 {
                    proxy.cooling_until =
                        Some(now + Duration::from_millis(self.config.rate_limit_cooldown_ms));
                }
                let should_block = matches!(status, 429 | 408)
                    || (*status == 403 && count >= policy.block_403_after)
                    || count >= policy.block_after;
                if should_block {
                    block(id, proxy, policy, &failure.to_string(), now + block_window);
                }
                if policy.silent_statuses.contains(status) {
                    return None;
                }
            }
            ProxyFailure::InvalidPayload => {
                proxy.fail_count += 1;
                if !policy.tolerate_invalid_payload && proxy.fail_count >= 2 {
                    let window = Duration::from_millis(self.config.invalid_payload_block_ms);
                    block(id, proxy, policy, "invalid-json", now + window);
                }
            }
            ProxyFailure::Transport(message) => {
                let message = message.to_lowercase();
                if policy
                    .ignored_errors
                    .iter()
                    .any(|ignored| message.contains(&ignored.to_lowercase()))
                {
                    tracing::debug!("Proxy {}: {} (ignored)", id, message);
                    return None;
                }

                proxy.fail_count += 1;
                let count = proxy.fail_count;
                let should_block = match TransportKind::classify(&message) {
                    TransportKind::Network => count >= policy.transport_block_after,
                    TransportKind::Abort => count >= policy.abort_block_after,
                    TransportKind::Forbidden => {
                        policy.transport_403_blocks && count >= policy.block_403_after
                    }
                    TransportKind::Other => false,
                };
                if should_block {
                    block(id, proxy, policy, &message, now + block_window);
                }
            }
        }

        Some(failure.to_string())
    }

    fn all_blocked(&self) -> bool {
        let now = Instant::now();
        let state = self.state.lock();
        self.config.endpoints.iter().all(|endpoint| {
            state
                .proxies
                .get(&endpoint.id)
                .is_some_and(|proxy| proxy.is_blocked(now))
        })
    }

    fn suspended_until(&self) -> Option<Instant> {
        let mut state = self.state.lock();
        match state.suspended_until {
            Some(until) if Instant::now() < until => Some(until),
            Some(_) => {
                state.suspended_until = None;
                None
            }
            None => None,
        }
    }

    /// Clear every block, cooldown, failure count and the suspension
    pub fn reset(&self, reason: &str) {
        let mut state = self.state.lock();
        state.proxies.clear();
        state.suspended_until = None;
        tracing::warn!("Reset proxies ({})", reason);
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.state
            .lock()
            .proxies
            .get(id)
            .is_some_and(|proxy| proxy.is_blocked(Instant::now()))
    }

    pub fn is_cooling(&self, id: &str) -> bool {
        self.state
            .lock()
            .proxies
            .get(id)
            .is_some_and(|proxy| proxy.is_cooling(Instant::now()))
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_until().is_some()
    }

    pub fn last_success(&self) -> Option<String> {
        self.state.lock().last_success.clone()
    }
}

fn block(id: &str, proxy: &mut ProxyState, policy: &ProxyPolicy, reason: &str, until: Instant) {
    let reason = reason.to_lowercase();
    if policy
        .lenient_reasons
        .iter()
        .any(|lenient| reason.contains(&lenient.to_lowercase()))
    {
        return;
    }
    if let Some(required) = &policy.block_only_on {
        if !reason.contains(&required.to_lowercase()) {
            return;
        }
    }

    proxy.blocked_until = Some(until);
    tracing::warn!(
        "Blocked proxy {} for {}s ({})",
        id,
        until.saturating_duration_since(Instant::now()).as_secs(),
        reason
    );
}

/// Parse a proxy body as JSON, unwrapping a `contents` envelope
fn parse_payload(body: &str, extract_embedded: bool) -> Option<Value> {
    if let Some(value) = parse_json_text(body) {
        return Some(value);
    }
    if !extract_embedded {
        return None;
    }

    let first = body.find('{')?;
    let last = body.rfind('}')?;
    if last <= first {
        return None;
    }
    parse_json_text(&body[first..=last])
}

fn parse_json_text(text: &str) -> Option<Value> {
    let text = text.trim();
    if !text.starts_with('{') && !text.starts_with('[') {
        return None;
    }

    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("contents") {
        Some(Value::String(inner)) => serde_json::from_str(inner).ok(),
        Some(Value::Null) | None => Some(value),
        Some(inner) => Some(inner.clone()),
    }
}
