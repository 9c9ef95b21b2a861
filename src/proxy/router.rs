use std::collections::HashMap;
use std::sync::Arc;

use pingora_error::{ErrorType::ReadError, OrErr, Result};
use serde_json::{Map, Value as JsonValue};

use crate::config::Config;
use crate::core::AggregationError;

use super::aggregate::{AggregatedResponse, AggregationEngine};
use super::plan::AggregationPlan;
use super::profile::ClientProfile;

/// What the router needs from an inbound client request.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub operation: String,
    pub profile: Option<String>,
    pub params: Map<String, JsonValue>,
    pub headers: Vec<(String, String)>,
}

#[derive(Default)]
struct OperationPlans {
    default: Option<Arc<AggregationPlan>>,
    by_profile: HashMap<String, Arc<AggregationPlan>>,
}

/// Resolves the client profile and the plan of each request, then hands
/// both to the aggregation engine. Holds no per-request state.
pub struct BffRouter {
    profiles: HashMap<String, Arc<ClientProfile>>,
    plans: HashMap<String, OperationPlans>,
    engine: AggregationEngine,
}

impl BffRouter {
    pub fn new(engine: AggregationEngine) -> Self {
        Self {
            profiles: HashMap::new(),
            plans: HashMap::new(),
            engine,
        }
    }

    pub fn from_config(config: &Config, engine: AggregationEngine) -> Result<Self> {
        let mut router = Self::new(engine);

        for profile in &config.profiles {
            router.add_profile(ClientProfile::new(profile.clone()));
        }

        for plan in &config.plans {
            log::info!(
                "Compiling plan for operation '{}' ({})",
                plan.operation,
                plan.profile.as_deref().unwrap_or("default")
            );
            let compiled = AggregationPlan::compile(plan, &config.services)
                .or_err_with(ReadError, || {
                    format!("Unable to compile plan for operation {}", plan.operation)
                })?;
            router.add_plan(compiled);
        }

        Ok(router)
    }

    pub fn add_profile(&mut self, profile: ClientProfile) {
        self.profiles
            .insert(profile.id().to_string(), Arc::new(profile));
    }

    pub fn add_plan(&mut self, plan: AggregationPlan) {
        let entry = self.plans.entry(plan.operation.clone()).or_default();
        match plan.profile.clone() {
            Some(profile) => {
                entry.by_profile.insert(profile, Arc::new(plan));
            }
            None => entry.default = Some(Arc::new(plan)),
        }
    }

    pub fn plan_count(&self) -> usize {
        self.plans
            .values()
            .map(|p| p.by_profile.len() + usize::from(p.default.is_some()))
            .sum()
    }

    /// Finds the profile, then the profile's own plan for `operation` or
    /// the operation's default plan.
    pub fn resolve(
        &self,
        profile: Option<&str>,
        operation: &str,
    ) -> Result<(Arc<ClientProfile>, Arc<AggregationPlan>), AggregationError> {
        let profile_id = profile.unwrap_or_default();
        let profile = self
            .profiles
            .get(profile_id)
            .cloned()
            .ok_or_else(|| AggregationError::UnknownClientProfile(profile_id.to_string()))?;

        let plan = self
            .plans
            .get(operation)
            .and_then(|plans| {
                plans
                    .by_profile
                    .get(profile.id())
                    .or(plans.default.as_ref())
            })
            .cloned()
            .ok_or_else(|| AggregationError::UnknownOperation(operation.to_string()))?;

        Ok((profile, plan))
    }

    pub async fn handle(
        &self,
        request: &InboundRequest,
    ) -> Result<AggregatedResponse, AggregationError> {
        let (profile, plan) = self.resolve(request.profile.as_deref(), &request.operation)?;
        self.engine.execute(&plan, &profile, request).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config;
    use crate::proxy::fault::FaultPolicyController;
    use crate::proxy::testing::{service_config, ScriptedTransport, Step};
    use crate::proxy::upstream::{UpstreamPool, UpstreamService};

    fn router(transport: Arc<ScriptedTransport>) -> BffRouter {
        let service = service_config("core", &["/user", "/lite"]);
        let mut pool = UpstreamPool::new();
        pool.insert(UpstreamService::new(service.clone(), transport));
        let engine = AggregationEngine::new(
            Arc::new(pool),
            Arc::new(FaultPolicyController::new(&[])),
        );

        let mut router = BffRouter::new(engine);
        for (id, deny) in [("web", vec![]), ("mobile", vec!["email".to_string()])] {
            let mut rules = HashMap::new();
            rules.insert(
                "*".to_string(),
                config::FieldRule { allow: None, deny },
            );
            router.add_profile(ClientProfile::new(config::ClientProfile {
                id: id.to_string(),
                timeout_budget_ms: 500,
                field_rules: rules,
                ..Default::default()
            }));
        }

        for yaml in [
            r#"
operation: profile
calls:
  - id: user
    service: core
    operation: /user
    required: true
    fields:
      - { name: name, source: /name }
      - { name: email, source: /email }
"#,
            r#"
operation: profile
profile: tv
calls:
  - id: user
    service: core
    operation: /lite
    fields:
      - { name: name, source: /name }
"#,
        ] {
            let plan: config::Plan = serde_yaml::from_str(yaml).unwrap();
            router.add_plan(AggregationPlan::compile(&plan, &[service.clone()]).unwrap());
        }
        router
    }

    fn request(profile: Option<&str>, operation: &str) -> InboundRequest {
        InboundRequest {
            operation: operation.to_string(),
            profile: profile.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve() {
        let router = router(Arc::new(ScriptedTransport::new()));
        assert_eq!(router.plan_count(), 2);

        let (profile, plan) = router.resolve(Some("web"), "profile").unwrap();
        assert_eq!(profile.id(), "web");
        assert_eq!(plan.profile, None);

        assert!(matches!(
            router.resolve(Some("tv"), "profile"),
            Err(AggregationError::UnknownClientProfile(id)) if id == "tv"
        ));
        assert!(matches!(
            router.resolve(None, "profile"),
            Err(AggregationError::UnknownClientProfile(_))
        ));
        assert!(matches!(
            router.resolve(Some("web"), "checkout"),
            Err(AggregationError::UnknownOperation(op)) if op == "checkout"
        ));
    }

    #[test]
    fn test_resolve_profile_plan_first() {
        let mut router = router(Arc::new(ScriptedTransport::new()));
        router.add_profile(ClientProfile::new(config::ClientProfile {
            id: "tv".to_string(),
            timeout_budget_ms: 500,
            ..Default::default()
        }));
        let (_, plan) = router.resolve(Some("tv"), "profile").unwrap();
        assert_eq!(plan.profile.as_deref(), Some("tv"));
    }

    #[tokio::test]
    async fn test_handle_shapes_per_profile() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "/user",
            vec![Step::json(200, json!({"name": "x", "email": "x@y"}))],
        );
        let router = router(transport);

        let web = router.handle(&request(Some("web"), "profile")).await.unwrap();
        assert_eq!(web.fields.len(), 2);

        let mobile = router
            .handle(&request(Some("mobile"), "profile"))
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&mobile).unwrap(),
            json!({"name": "x", "partial": false, "degradedFields": []})
        );
    }
}
