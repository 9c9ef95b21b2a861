//! Fan-out of one aggregation plan and merge of its results.
//!
//! Every call of the plan becomes a shared future that first awaits the
//! futures of its predecessors, so independent calls run concurrently and
//! dependent calls start as soon as their inputs exist. All of them are
//! driven on the request's task and dropped together, which cancels
//! whatever is still in flight.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tokio::time::Instant;

use crate::core::{AggregationError, CallError};

use super::fault::FaultPolicyController;
use super::normalize::{normalize, Normalized};
use super::plan::{AggregationPlan, PlannedCall};
use super::profile::ClientProfile;
use super::router::InboundRequest;
use super::upstream::UpstreamPool;

type CallResult = Result<Arc<Normalized>, CallError>;
type SharedCall<'a> = Shared<BoxFuture<'a, CallResult>>;

/// A canonical field after merge, with what shaping needs to know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedField {
    pub name: String,
    pub value: JsonValue,
    pub entity: String,
    pub priority: u32,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResponse {
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
    pub partial: bool,
    #[serde(rename = "degradedFields")]
    pub degraded_fields: BTreeSet<String>,
}

impl AggregatedResponse {
    pub fn new(fields: &[MergedField], partial: bool, degraded_fields: BTreeSet<String>) -> Self {
        Self {
            fields: fields
                .iter()
                .map(|f| (f.name.clone(), f.value.clone()))
                .collect(),
            partial,
            degraded_fields,
        }
    }

    /// Size of the JSON body sent to the client.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |body| body.len())
    }
}

pub struct AggregationEngine {
    pool: Arc<UpstreamPool>,
    faults: Arc<FaultPolicyController>,
}

impl AggregationEngine {
    pub fn new(pool: Arc<UpstreamPool>, faults: Arc<FaultPolicyController>) -> Self {
        Self { pool, faults }
    }

    /// Runs `plan` for one inbound request within the profile's timeout budget.
    pub async fn execute(
        &self,
        plan: &AggregationPlan,
        profile: &ClientProfile,
        request: &InboundRequest,
    ) -> Result<AggregatedResponse, AggregationError> {
        let deadline = Instant::now() + profile.timeout_budget();
        // declared before the futures borrowing it
        let headers = profile.forwarded_headers(&request.headers);

        let mut slots: Vec<Option<SharedCall<'_>>> = vec![None; plan.calls.len()];
        for &i in plan.execution_order() {
            let call = &plan.calls[i];
            let predecessors: Vec<(usize, SharedCall<'_>)> = call
                .predecessors
                .iter()
                .filter_map(|&p| slots[p].clone().map(|fut| (p, fut)))
                .collect();
            let fut = self
                .run_call(plan, call, predecessors, &request.params, &headers, deadline)
                .boxed()
                .shared();
            slots[i] = Some(fut);
        }

        let mut pending: FuturesUnordered<_> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.clone().map(|fut| async move { (i, fut.await) }))
            .collect();
        let mut results: Vec<Option<CallResult>> = vec![None; plan.calls.len()];

        let drive = async {
            while let Some((i, result)) = pending.next().await {
                let call = &plan.calls[i];
                if let Err(reason) = &result {
                    if call.required() && !failed_on_required(plan, reason) {
                        return Err(AggregationError::AggregationFailed {
                            causing_call: call.id().to_string(),
                            reason: reason.clone(),
                        });
                    }
                }
                results[i] = Some(result);
            }
            Ok(())
        };

        let outcome = tokio::time::timeout_at(deadline, drive).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::warn!(
                    "operation '{}' for profile '{}' aborted: {}",
                    plan.operation,
                    profile.id(),
                    err
                );
                return Err(err);
            }
            Err(_) => {
                if let Some(call) = plan
                    .calls
                    .iter()
                    .find(|c| c.required() && results[c.index].is_none())
                {
                    log::warn!(
                        "operation '{}' for profile '{}' ran out of its {:?} budget waiting for '{}'",
                        plan.operation,
                        profile.id(),
                        profile.timeout_budget(),
                        call.id()
                    );
                    return Err(AggregationError::AggregationFailed {
                        causing_call: call.id().to_string(),
                        reason: CallError::Timeout,
                    });
                }
            }
        }
        // cancel optional calls still running
        drop(pending);
        drop(slots);

        let mut merged: Vec<MergedField> = Vec::new();
        let mut degraded: Vec<(String, String)> = Vec::new();
        let mut partial = false;

        for call in &plan.calls {
            let entity = call.spec.entity();
            match results[call.index].take() {
                Some(Ok(normalized)) => {
                    for (name, value) in &normalized.fields {
                        let mapping = call.spec.fields.iter().find(|m| &m.name == name);
                        upsert(
                            &mut merged,
                            MergedField {
                                name: name.clone(),
                                value: value.clone(),
                                entity: entity.to_string(),
                                priority: mapping.map_or(0, |m| m.priority),
                                required: mapping
                                    .and_then(|m| m.required)
                                    .unwrap_or_else(|| call.required()),
                            },
                        );
                    }
                    for name in &normalized.degraded {
                        partial = true;
                        degraded.push((entity.to_string(), name.clone()));
                    }
                }
                failed => {
                    let reason = failed
                        .and_then(Result::err)
                        .unwrap_or(CallError::Timeout);
                    log::info!(
                        "optional call '{}' of operation '{}' degraded: {}",
                        call.id(),
                        plan.operation,
                        reason
                    );
                    partial = true;
                    degraded.extend(
                        call.spec
                            .fields
                            .iter()
                            .map(|m| (entity.to_string(), m.name.clone())),
                    );
                }
            }
        }

        profile.shape(merged, degraded, partial)
    }

    async fn run_call<'a>(
        &'a self,
        plan: &'a AggregationPlan,
        call: &'a PlannedCall,
        predecessors: Vec<(usize, SharedCall<'a>)>,
        params: &'a Map<String, JsonValue>,
        headers: &'a [(String, String)],
        deadline: Instant,
    ) -> CallResult {
        let mut upstream = Vec::with_capacity(predecessors.len());
        for (index, fut) in predecessors {
            match fut.await {
                Ok(normalized) => upstream.push((index, normalized)),
                Err(_) => {
                    return Err(CallError::DependencyFailed(
                        plan.calls[index].id().to_string(),
                    ))
                }
            }
        }

        let upstream: Vec<(usize, &Normalized)> =
            upstream.iter().map(|(i, n)| (*i, n.as_ref())).collect();
        let inputs = call.bind_inputs(params, &upstream)?;

        let payload = self
            .faults
            .execute(&self.pool, call, &inputs, headers, deadline)
            .await?;

        normalize(&payload, &call.spec.fields, call.required())
            .map(Arc::new)
            .map_err(|e| CallError::Normalization(e.to_string()))
    }
}

/// A required call that failed because a required predecessor failed is
/// left for the predecessor to report.
fn failed_on_required(plan: &AggregationPlan, reason: &CallError) -> bool {
    match reason {
        CallError::DependencyFailed(id) => plan.calls.iter().any(|c| c.id() == id && c.required()),
        _ => false,
    }
}

/// Inserts `field`, or overwrites the value of an earlier field of the same
/// name while keeping its position.
fn upsert(merged: &mut Vec<MergedField>, field: MergedField) {
    match merged.iter_mut().find(|f| f.name == field.name) {
        Some(existing) => *existing = field,
        None => merged.push(field),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::{self, RetryPolicy};
    use crate::proxy::testing::{service_config, ScriptedTransport, Step};
    use crate::proxy::upstream::UpstreamService;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        engine: AggregationEngine,
        services: Vec<config::Service>,
    }

    impl Fixture {
        fn new(paths: &[&str]) -> Self {
            init_log();
            let transport = Arc::new(ScriptedTransport::new());
            let service = service_config("core", paths);
            let mut pool = UpstreamPool::new();
            pool.insert(UpstreamService::new(service.clone(), transport.clone()));
            let faults = FaultPolicyController::new(&[RetryPolicy {
                id: "standard".to_string(),
                max_retries: 2,
                base_backoff_ms: 5,
                max_backoff_ms: 20,
                jitter: false,
                retry_on_status: vec![503],
            }]);
            Self {
                transport,
                engine: AggregationEngine::new(Arc::new(pool), Arc::new(faults)),
                services: vec![service],
            }
        }

        fn plan(&self, yaml: &str) -> AggregationPlan {
            let plan: config::Plan = serde_yaml::from_str(yaml).unwrap();
            AggregationPlan::compile(&plan, &self.services).unwrap()
        }

        async fn run(
            &self,
            plan: &AggregationPlan,
            profile: &ClientProfile,
        ) -> Result<AggregatedResponse, AggregationError> {
            let request = InboundRequest {
                operation: plan.operation.clone(),
                profile: Some(profile.id().to_string()),
                params: json!({"userId": "u-1"}).as_object().cloned().unwrap(),
                headers: vec![],
            };
            self.engine.execute(plan, profile, &request).await
        }
    }

    fn profile(budget_ms: u64) -> ClientProfile {
        ClientProfile::new(config::ClientProfile {
            id: "web".to_string(),
            timeout_budget_ms: budget_ms,
            ..Default::default()
        })
    }

    const TWO_OPTIONAL: &str = r#"
operation: home
calls:
  - id: a
    service: core
    operation: /a
    timeout_ms: 100
    fields:
      - name: name
        source: /name
  - id: b
    service: core
    operation: /b
    timeout_ms: 100
    fields:
      - name: recommendations
        source: /items
"#;

    #[tokio::test(start_paused = true)]
    async fn test_optional_timeout_degrades() {
        let fx = Fixture::new(&["/a", "/b"]);
        fx.transport.script("/a", vec![Step::json(200, json!({"name": "x"}))]);
        fx.transport.script("/b", vec![Step::Hang]);

        let response = fx.run(&fx.plan(TWO_OPTIONAL), &profile(1_000)).await.unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"name": "x", "partial": true, "degradedFields": ["recommendations"]})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_optional_failures_still_respond() {
        let fx = Fixture::new(&["/a", "/b"]);
        fx.transport.script("/a", vec![Step::json(500, json!({}))]);
        fx.transport.script(
            "/b",
            vec![Step::Fail(CallError::ConnectionFailure("refused".into()))],
        );

        let response = fx.run(&fx.plan(TWO_OPTIONAL), &profile(1_000)).await.unwrap();
        assert!(response.fields.is_empty());
        assert!(response.partial);
        assert_eq!(
            response.degraded_fields.into_iter().collect::<Vec<_>>(),
            vec!["name".to_string(), "recommendations".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_aborts_and_cancels_siblings() {
        let fx = Fixture::new(&["/a", "/b"]);
        let plan = fx.plan(&TWO_OPTIONAL.replace(
            "operation: /a\n",
            "operation: /a\n    required: true\n    retry_policy: standard\n",
        ));
        fx.transport
            .script("/a", vec![Step::delayed(10, Step::json(500, json!({})))]);
        fx.transport
            .script("/b", vec![Step::delayed(80, Step::json(200, json!({"items": []})))]);

        let started = Instant::now();
        let err = fx.run(&plan, &profile(1_000)).await.unwrap_err();
        assert_eq!(
            err,
            AggregationError::AggregationFailed {
                causing_call: "a".to_string(),
                reason: CallError::UpstreamError { status: 500 },
            }
        );
        assert_eq!(err.status(), http::StatusCode::BAD_GATEWAY);
        // 500 is not in the retry list
        assert_eq!(fx.transport.calls("/a"), 1);
        assert_eq!(fx.transport.cancelled(), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_call_over_request_budget() {
        let fx = Fixture::new(&["/a", "/b"]);
        let plan = fx.plan(
            &TWO_OPTIONAL
                .replace("operation: /a\n", "operation: /a\n    required: true\n")
                .replace("timeout_ms: 100", "timeout_ms: 5000"),
        );
        fx.transport.script("/a", vec![Step::Hang]);
        fx.transport.script("/b", vec![Step::json(200, json!({"items": [1]}))]);

        let started = Instant::now();
        let err = fx.run(&plan, &profile(300)).await.unwrap_err();
        assert_eq!(
            err,
            AggregationError::AggregationFailed {
                causing_call: "a".to_string(),
                reason: CallError::Timeout,
            }
        );
        assert!(started.elapsed() <= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_call_receives_bound_input() {
        let fx = Fixture::new(&["/user", "/orders/{account}"]);
        let plan = fx.plan(
            r#"
operation: home
calls:
  - id: orders
    service: core
    operation: "/orders/{account}"
    inputs:
      account: { call: user, field: accountId }
    fields:
      - name: orderCount
        source: total
        coerce: integer
  - id: user
    service: core
    operation: /user
    required: true
    inputs:
      id: { request: userId }
    fields:
      - name: accountId
        source: /account/id
      - name: name
        source: /name
"#,
        );
        fx.transport.script(
            "/user",
            vec![Step::json(200, json!({"account": {"id": "acc-9"}, "name": "x"}))],
        );
        fx.transport
            .script("/orders/acc-9", vec![Step::json(200, json!({"total": "3"}))]);

        let response = fx.run(&plan, &profile(1_000)).await.unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "orderCount": 3,
                "accountId": "acc-9",
                "name": "x",
                "partial": false,
                "degradedFields": []
            })
        );
        let requests = fx.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path, "/user");
        assert_eq!(requests[0].query, vec![("id".to_string(), "u-1".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dependency_degrades_dependent() {
        let fx = Fixture::new(&["/a", "/b"]);
        let plan = fx.plan(&TWO_OPTIONAL.replace(
            "operation: /b\n",
            "operation: /b\n    depends_on: [a]\n",
        ));
        fx.transport.script("/a", vec![Step::json(503, json!({}))]);
        fx.transport.script("/b", vec![Step::json(200, json!({"items": [1]}))]);

        let response = fx.run(&plan, &profile(1_000)).await.unwrap();
        assert!(response.partial);
        assert_eq!(response.degraded_fields.len(), 2);
        // b never ran
        assert_eq!(fx.transport.calls("/b"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_ignores_completion_order() {
        let plan_yaml = TWO_OPTIONAL.replace("source: /items", "source: /items\n      - name: name\n        source: /title");

        let mut bodies = Vec::new();
        for (delay_a, delay_b) in [(10, 50), (50, 10)] {
            let fx = Fixture::new(&["/a", "/b"]);
            fx.transport.script(
                "/a",
                vec![Step::delayed(delay_a, Step::json(200, json!({"name": "from-a"})))],
            );
            fx.transport.script(
                "/b",
                vec![Step::delayed(
                    delay_b,
                    Step::json(200, json!({"items": [1, 2], "title": "from-b"})),
                )],
            );
            let response = fx.run(&fx.plan(&plan_yaml), &profile(1_000)).await.unwrap();
            bodies.push(serde_json::to_string(&response).unwrap());
        }

        assert_eq!(bodies[0], bodies[1]);
        // b is declared later, its value wins while the first position is kept
        assert_eq!(
            bodies[0],
            r#"{"name":"from-b","recommendations":[1,2],"partial":false,"degradedFields":[]}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_normalization_failure() {
        let fx = Fixture::new(&["/a", "/b"]);
        let plan = fx.plan(
            &TWO_OPTIONAL
                .replace("operation: /a\n", "operation: /a\n    required: true\n")
                .replace("source: /name", "source: /name\n        coerce: integer"),
        );
        fx.transport.script("/a", vec![Step::json(200, json!({"name": "x"}))]);
        fx.transport.script("/b", vec![Step::json(200, json!({"items": []}))]);

        let err = fx.run(&plan, &profile(1_000)).await.unwrap_err();
        assert!(matches!(
            err,
            AggregationError::AggregationFailed { ref causing_call, reason: CallError::Normalization(_) }
                if causing_call == "a"
        ));
    }
}
