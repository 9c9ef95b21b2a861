//! Scripted upstream transport for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::config::{self, HttpMethod, Operation};
use crate::core::CallError;

use super::transport::{UpstreamRequest, UpstreamResponse, UpstreamTransport};

#[derive(Clone, Debug)]
pub enum Step {
    Respond(u16, Bytes),
    Delay(Duration, Box<Step>),
    Fail(CallError),
    Hang,
}

impl Step {
    pub fn json(status: u16, body: JsonValue) -> Self {
        Step::Respond(status, Bytes::from(body.to_string()))
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Step::Respond(status, Bytes::from(body.to_string()))
    }

    pub fn delayed(ms: u64, step: Step) -> Self {
        Step::Delay(Duration::from_millis(ms), Box::new(step))
    }
}

struct CancelGuard<'a> {
    cancelled: &'a AtomicUsize,
    done: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Answers each path with its script; the last step repeats once the
/// script runs out.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<UpstreamRequest>>,
    cancelled: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, path: &str, steps: Vec<Step>) {
        self.scripts.lock().unwrap().insert(path.to_string(), steps);
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests dropped before their step finished.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn next_step(&self, path: &str) -> Step {
        let mut calls = self.calls.lock().unwrap();
        let count = calls.entry(path.to_string()).or_insert(0);
        let scripts = self.scripts.lock().unwrap();
        let step = match scripts.get(path) {
            Some(steps) if !steps.is_empty() => steps[(*count).min(steps.len() - 1)].clone(),
            _ => Step::json(404, serde_json::json!({"error": "unscripted"})),
        };
        *count += 1;
        step
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, CallError> {
        let mut step = self.next_step(&request.path);
        self.requests.lock().unwrap().push(request);

        let mut guard = CancelGuard {
            cancelled: &self.cancelled,
            done: false,
        };
        let result = loop {
            match step {
                Step::Respond(status, body) => break Ok(UpstreamResponse { status, body }),
                Step::Fail(err) => break Err(err),
                Step::Delay(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
                Step::Hang => std::future::pending::<()>().await,
            }
        };
        guard.done = true;
        result
    }
}

/// A service whose operations are named after their paths, all GET.
pub fn service_config(id: &str, paths: &[&str]) -> config::Service {
    let mut service: config::Service = serde_yaml::from_str(&format!(
        r#"
id: {id}
nodes:
  "127.0.0.1:80": 1
operations: {{}}
"#
    ))
    .unwrap();
    for path in paths {
        service.operations.insert(
            path.to_string(),
            Operation {
                method: HttpMethod::GET,
                path: path.to_string(),
                idempotent: None,
            },
        );
    }
    service
}
