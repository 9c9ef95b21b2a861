//! Compiled aggregation plans: call graph order and input binding.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};

use crate::config::{self, InputBinding};
use crate::core::CallError;

use super::normalize::Normalized;

/// Orders `calls` so every call comes after its predecessors.
///
/// Independent calls keep their declared relative order. Fails on duplicate
/// ids, references to undeclared calls or fields, and cycles.
pub fn topological_order(calls: &[config::UpstreamCall]) -> Result<Vec<usize>, String> {
    let mut index = HashMap::with_capacity(calls.len());
    for (i, call) in calls.iter().enumerate() {
        if index.insert(call.id.as_str(), i).is_some() {
            return Err(format!("duplicate call id '{}'", call.id));
        }
    }

    let mut in_degree = vec![0usize; calls.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); calls.len()];
    for (i, call) in calls.iter().enumerate() {
        for pred in call.predecessors() {
            let p = *index
                .get(pred)
                .ok_or_else(|| format!("call '{}' depends on unknown call '{pred}'", call.id))?;
            if p == i {
                return Err(format!("call '{}' depends on itself", call.id));
            }
            in_degree[i] += 1;
            dependents[p].push(i);
        }

        for binding in call.inputs.values() {
            if let InputBinding::Call { call: source, field } = binding {
                let declared = calls[index[source.as_str()]]
                    .fields
                    .iter()
                    .any(|f| &f.name == field);
                if !declared {
                    return Err(format!(
                        "call '{}' binds field '{field}' which call '{source}' does not produce",
                        call.id
                    ));
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..calls.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(calls.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() != calls.len() {
        let stuck: Vec<&str> = (0..calls.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| calls[i].id.as_str())
            .collect();
        return Err(format!("dependency cycle among calls {stuck:?}"));
    }

    Ok(order)
}

#[derive(Debug, Clone)]
enum BoundInput {
    Request {
        param: String,
        default: Option<JsonValue>,
    },
    Call {
        index: usize,
        field: String,
    },
    Literal(JsonValue),
}

/// One upstream call with its graph edges resolved to plan indexes.
#[derive(Debug, Clone)]
pub struct PlannedCall {
    pub index: usize,
    pub spec: config::UpstreamCall,
    pub predecessors: Vec<usize>,
    pub idempotent: bool,
    inputs: Vec<(String, BoundInput)>,
}

impl PlannedCall {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn required(&self) -> bool {
        self.spec.required
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.spec.timeout_ms)
    }

    /// Builds the upstream parameters from the inbound request and the
    /// normalized results of predecessor calls.
    pub fn bind_inputs(
        &self,
        params: &Map<String, JsonValue>,
        upstream: &[(usize, &Normalized)],
    ) -> Result<Map<String, JsonValue>, CallError> {
        let mut bound = Map::new();
        for (name, input) in &self.inputs {
            let value = match input {
                BoundInput::Request { param, default } => {
                    params.get(param).or(default.as_ref()).cloned()
                }
                BoundInput::Call { index, field } => upstream
                    .iter()
                    .find(|(i, _)| i == index)
                    .and_then(|(_, normalized)| normalized.get(field))
                    .cloned(),
                BoundInput::Literal(value) => Some(value.clone()),
            };
            let value = value.ok_or_else(|| CallError::MissingInput(name.clone()))?;
            bound.insert(name.clone(), value);
        }
        Ok(bound)
    }
}

/// Process-wide, read-only plan for one (operation, profile) pair.
#[derive(Debug)]
pub struct AggregationPlan {
    pub operation: String,
    pub profile: Option<String>,
    pub calls: Vec<PlannedCall>,
    order: Vec<usize>,
}

impl AggregationPlan {
    pub fn compile(plan: &config::Plan, services: &[config::Service]) -> Result<Self, String> {
        let order = topological_order(&plan.calls)?;
        let index: HashMap<&str, usize> = plan
            .calls
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        let mut calls = Vec::with_capacity(plan.calls.len());
        for (i, call) in plan.calls.iter().enumerate() {
            let operation = services
                .iter()
                .find(|s| s.id == call.service)
                .and_then(|s| s.operations.get(&call.operation))
                .ok_or_else(|| {
                    format!(
                        "call '{}' references unknown operation {}.{}",
                        call.id, call.service, call.operation
                    )
                })?;

            let inputs = call
                .inputs
                .iter()
                .map(|(name, binding)| {
                    let input = match binding {
                        InputBinding::Request { request, default } => BoundInput::Request {
                            param: request.clone(),
                            default: default.clone(),
                        },
                        InputBinding::Call { call, field } => BoundInput::Call {
                            index: index[call.as_str()],
                            field: field.clone(),
                        },
                        InputBinding::Literal { value } => BoundInput::Literal(value.clone()),
                    };
                    (name.clone(), input)
                })
                .collect();

            calls.push(PlannedCall {
                index: i,
                spec: call.clone(),
                predecessors: call.predecessors().iter().map(|p| index[p]).collect(),
                idempotent: call
                    .idempotent
                    .or(operation.idempotent)
                    .unwrap_or_else(|| operation.method.is_idempotent()),
                inputs,
            });
        }

        Ok(Self {
            operation: plan.operation.clone(),
            profile: plan.profile.clone(),
            calls,
            order,
        })
    }

    /// Call indexes in dependency order.
    pub fn execution_order(&self) -> &[usize] {
        &self.order
    }
}
