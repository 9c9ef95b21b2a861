use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::info;
use once_cell::sync::Lazy;
use pingora::services::background::GenBackgroundService;
use pingora_error::Result;
use pingora_load_balancing::{selection::RoundRobin, LoadBalancer};
use regex::{Captures, Regex};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::config::{self, Operation};
use crate::core::CallError;

use super::transport::{encode_path_segment, HttpTransport, UpstreamRequest, UpstreamTransport};

static PATH_PARAM_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("Invalid regex pattern for path params"));

/// Renders an operation into a request: `{name}` path placeholders take
/// their bound input, the rest go to the query string or the JSON body.
pub fn render_request(
    operation: &Operation,
    inputs: &Map<String, JsonValue>,
    headers: &[(String, String)],
) -> Result<UpstreamRequest, CallError> {
    let mut remaining = inputs.clone();
    let mut missing = None;

    let path = PATH_PARAM_REGEX.replace_all(&operation.path, |caps: &Captures| {
        let name = &caps[1];
        match remaining.remove(name) {
            Some(value) => encode_path_segment(&scalar_to_string(&value)),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(CallError::MissingInput(name));
    }

    let (query, body) = if operation.method.uses_query() {
        let query = remaining
            .iter()
            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
            .collect();
        (query, None)
    } else {
        let body = serde_json::to_vec(&JsonValue::Object(remaining))
            .map_err(|e| CallError::InvalidPayload(e.to_string()))?;
        (Vec::new(), Some(Bytes::from(body)))
    };

    Ok(UpstreamRequest {
        method: operation.method,
        path: path.into_owned(),
        query,
        headers: headers.to_vec(),
        body,
    })
}

fn scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Keeps the in-flight counter in step with the admission permit.
struct InFlight<'a> {
    _permit: SemaphorePermit<'a>,
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Client for one upstream core service.
///
/// Bounds concurrent calls to `max_in_flight`; callers beyond the bound
/// wait up to `queue_timeout_ms` for a slot.
pub struct UpstreamService {
    pub inner: config::Service,
    transport: Arc<dyn UpstreamTransport>,
    slots: Semaphore,
    in_flight: AtomicUsize,
}

impl UpstreamService {
    pub fn new(inner: config::Service, transport: Arc<dyn UpstreamTransport>) -> Self {
        let slots = Semaphore::new(inner.max_in_flight);
        Self {
            inner,
            transport,
            slots,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn admit(&self) -> Result<InFlight<'_>, CallError> {
        let wait = Duration::from_millis(self.inner.queue_timeout_ms);
        match tokio::time::timeout(wait, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(InFlight {
                    _permit: permit,
                    counter: &self.in_flight,
                })
            }
            _ => {
                log::warn!(
                    "service '{}' overloaded, {} calls in flight",
                    self.id(),
                    self.in_flight()
                );
                Err(CallError::Overloaded(self.inner.id.clone()))
            }
        }
    }

    /// Performs one attempt of `operation`. Waiting for a slot and the
    /// exchange itself both end at `deadline`.
    pub async fn dispatch(
        &self,
        operation: &str,
        inputs: &Map<String, JsonValue>,
        headers: &[(String, String)],
        deadline: Instant,
    ) -> Result<JsonValue, CallError> {
        let op = self.inner.operations.get(operation).ok_or_else(|| {
            CallError::ConnectionFailure(format!(
                "service '{}' has no operation '{operation}'",
                self.id()
            ))
        })?;
        let request = render_request(op, inputs, headers)?;

        let attempt = async {
            let _slot = self.admit().await?;
            self.transport.send(request).await
        };
        let response = match tokio::time::timeout_at(deadline, attempt).await {
            Ok(response) => response?,
            Err(_) => return Err(CallError::Timeout),
        };

        if !(200..300).contains(&response.status) {
            return Err(CallError::UpstreamError {
                status: response.status,
            });
        }
        if response.body.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&response.body).map_err(|e| CallError::InvalidPayload(e.to_string()))
    }
}

/// One client per configured service id, shared read-only by all requests.
#[derive(Default)]
pub struct UpstreamPool {
    services: HashMap<String, Arc<UpstreamService>>,
}

pub type DiscoveryService = GenBackgroundService<LoadBalancer<RoundRobin>>;

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: UpstreamService) {
        self.services
            .insert(service.id().to_string(), Arc::new(service));
    }

    pub fn get(&self, id: &str) -> Option<Arc<UpstreamService>> {
        self.services.get(id).cloned()
    }

    /// Builds HTTP clients for every configured service, together with the
    /// discovery services the server has to run for them.
    pub fn from_config(config: &config::Config) -> Result<(Self, Vec<DiscoveryService>)> {
        let mut pool = Self::new();
        let mut discoveries = Vec::with_capacity(config.services.len());

        for service in &config.services {
            info!("Configuring upstream service: {}", service.id);
            let (transport, discovery) = HttpTransport::new(service).map_err(|e| {
                log::error!("Failed to configure service {}: {}", service.id, e);
                e
            })?;
            pool.insert(UpstreamService::new(service.clone(), Arc::new(transport)));
            discoveries.push(discovery);
        }

        Ok((pool, discoveries))
    }
}
