//! Retries and circuit breaking around upstream dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde_json::{Map, Value as JsonValue};
use tokio::time::Instant;

use crate::config::{self, RetryPolicy};
use crate::core::{metrics, CallError};

use super::circuit::CircuitBreaker;
use super::plan::PlannedCall;
use super::upstream::UpstreamPool;

/// Owns one circuit breaker per service and the named retry policies.
///
/// Breakers are created on first use and live for the whole process.
pub struct FaultPolicyController {
    circuits: DashMap<String, Arc<CircuitBreaker>>,
    policies: HashMap<String, RetryPolicy>,
}

impl FaultPolicyController {
    pub fn new(policies: &[RetryPolicy]) -> Self {
        Self {
            circuits: DashMap::new(),
            policies: policies
                .iter()
                .map(|p| (p.id.clone(), p.clone()))
                .collect(),
        }
    }

    pub fn from_config(config: &config::Config) -> Self {
        Self::new(&config.retry_policies)
    }

    pub fn circuit(&self, service: &config::Service) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(service.id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&service.id, service.circuit.clone())))
            .clone()
    }

    /// Runs `call` to completion under its retry policy and its service's
    /// circuit breaker. No attempt outlives `deadline`.
    pub async fn execute(
        &self,
        pool: &UpstreamPool,
        call: &PlannedCall,
        inputs: &Map<String, JsonValue>,
        headers: &[(String, String)],
        deadline: Instant,
    ) -> Result<JsonValue, CallError> {
        let service = pool.get(&call.spec.service).ok_or_else(|| {
            CallError::ConnectionFailure(format!("unknown service '{}'", call.spec.service))
        })?;
        let circuit = self.circuit(&service.inner);
        let policy = call
            .spec
            .retry_policy
            .as_ref()
            .and_then(|id| self.policies.get(id));

        let retries = match policy {
            Some(policy) if call.idempotent => policy.max_retries,
            _ => 0,
        };
        let deadline = deadline.min(Instant::now() + call.timeout() * (1 + retries));

        let mut attempt = 0u32;
        let mut last_error: Option<CallError> = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CallError::Timeout);
            }
            let attempt_deadline = deadline.min(Instant::now() + call.timeout());

            let result = match circuit.try_acquire() {
                Ok(permit) => {
                    let started = Instant::now();
                    let result = service
                        .dispatch(&call.spec.operation, inputs, headers, attempt_deadline)
                        .await;
                    metrics::observe_upstream(
                        service.id(),
                        outcome(&result),
                        started.elapsed().as_secs_f64(),
                    );
                    match &result {
                        Err(e) if e.is_rejection() => drop(permit),
                        Err(e) if !e.is_client_error() => permit.record_failure(),
                        _ => permit.record_success(),
                    }
                    result
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(payload) => return Ok(payload),
                // a refused retry reports what the upstream last did
                Err(err) if err.is_rejection() => return Err(last_error.unwrap_or(err)),
                Err(err) => err,
            };

            let policy = match policy {
                Some(policy) if attempt < retries => policy,
                _ => return Err(err),
            };
            if !is_retryable(&err, policy) {
                return Err(err);
            }

            let backoff = backoff(policy, attempt);
            if Instant::now() + backoff >= deadline {
                log::debug!(
                    "call '{}' not retried, backoff {:?} exceeds the request deadline",
                    call.id(),
                    backoff
                );
                return Err(err);
            }

            attempt += 1;
            log::info!(
                "retrying call '{}' ({}/{}) after {:?}: {}",
                call.id(),
                attempt,
                policy.max_retries,
                backoff,
                err
            );
            last_error = Some(err);
            tokio::time::sleep(backoff).await;
        }
    }
}

fn outcome(result: &Result<JsonValue, CallError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

fn is_retryable(err: &CallError, policy: &RetryPolicy) -> bool {
    match err {
        CallError::UpstreamError { status } => {
            !(400..500).contains(status) && policy.retry_on_status.contains(status)
        }
        err => err.is_transient(),
    }
}

/// Exponential backoff for the retry after `attempt`, optionally with full jitter.
fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_backoff_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(policy.max_backoff_ms);
    let ms = if policy.jitter && exp > 0 {
        rand::thread_rng().gen_range(0..=exp)
    } else {
        exp
    };
    Duration::from_millis(ms)
}
