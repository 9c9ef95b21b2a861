use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::net::SocketAddr;

use log::{debug, trace};
use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use crate::proxy::plan::topological_order;

/// Field names the response envelope uses for itself.
pub const RESERVED_FIELDS: &[&str] = &["partial", "degradedFields"];

static NODE_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]|[a-z0-9.-]+)(?::\d+)?$")
        .expect("Invalid regex pattern for node keys")
});

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_references"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[serde(default)]
    #[validate(nested)]
    pub pingbff: Pingbff,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub profiles: Vec<ClientProfile>,
    #[validate(nested)]
    #[serde(default)]
    pub retry_policies: Vec<RetryPolicy>,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub services: Vec<Service>,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub plans: Vec<Plan>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_references(&self) -> Result<(), ValidationError> {
        let profile_ids = unique_ids(self.profiles.iter().map(|p| p.id.as_str()), "profile")?;
        let policy_ids = unique_ids(
            self.retry_policies.iter().map(|p| p.id.as_str()),
            "retry_policy",
        )?;
        let services: HashMap<&str, &Service> =
            self.services.iter().map(|s| (s.id.as_str(), s)).collect();
        if services.len() != self.services.len() {
            return Err(ValidationError::new("duplicate_service_id"));
        }

        let mut plan_keys = HashSet::new();
        for plan in &self.plans {
            if let Some(profile) = &plan.profile {
                if !profile_ids.contains(profile.as_str()) {
                    return Err(reference_error("unknown_profile", profile));
                }
            }
            if !plan_keys.insert((plan.operation.as_str(), plan.profile.as_deref())) {
                return Err(reference_error("duplicate_plan", &plan.operation));
            }

            for call in &plan.calls {
                let service = services
                    .get(call.service.as_str())
                    .ok_or_else(|| reference_error("unknown_service", &call.service))?;
                if !service.operations.contains_key(&call.operation) {
                    return Err(reference_error("unknown_operation", &call.operation));
                }
                if let Some(policy) = &call.retry_policy {
                    if !policy_ids.contains(policy.as_str()) {
                        return Err(reference_error("unknown_retry_policy", policy));
                    }
                }
                for field in &call.fields {
                    if RESERVED_FIELDS.contains(&field.name.as_str()) {
                        return Err(reference_error("reserved_field_name", &field.name));
                    }
                }
            }
        }

        Ok(())
    }
}

fn unique_ids<'a>(
    ids: impl Iterator<Item = &'a str>,
    kind: &'static str,
) -> Result<HashSet<&'a str>, ValidationError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            let mut err = ValidationError::new("duplicate_id");
            err.add_param("kind".into(), &kind);
            err.add_param("id".into(), &id);
            return Err(err);
        }
    }
    Ok(seen)
}

fn reference_error(code: &'static str, value: &str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.add_param("value".into(), &value.to_string());
    err.with_message(Cow::Owned(format!("{code}: {value}")))
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Pingbff {
    #[serde(default = "Pingbff::default_profile_header")]
    #[validate(length(min = 1))]
    pub profile_header: String,
    pub log: Option<Log>,
    pub status: Option<Status>,
}

impl Pingbff {
    fn default_profile_header() -> String {
        "X-Client-Profile".to_string()
    }
}

impl Default for Pingbff {
    fn default() -> Self {
        Self {
            profile_header: Self::default_profile_header(),
            log: None,
            status: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

/// A consuming frontend and the payload shape it accepts.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct ClientProfile {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(range(min = 2))]
    pub max_payload_bytes: Option<usize>,
    /// Keyed by entity type, `"*"` covers entities without their own rule.
    #[serde(default)]
    pub field_rules: HashMap<String, FieldRule>,
    #[validate(range(min = 1))]
    pub timeout_budget_ms: u64,
    #[serde(default)]
    pub forward_headers: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "RetryPolicy::validate_retry_statuses"))]
pub struct RetryPolicy {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default)]
    #[validate(range(max = 10))]
    pub max_retries: u32,
    #[serde(default = "RetryPolicy::default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "RetryPolicy::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "RetryPolicy::default_jitter")]
    pub jitter: bool,
    /// Upstream statuses treated as transient. Client errors are never retried.
    #[serde(default)]
    pub retry_on_status: Vec<u16>,
}

impl RetryPolicy {
    fn default_base_backoff_ms() -> u64 {
        20
    }

    fn default_max_backoff_ms() -> u64 {
        1000
    }

    fn default_jitter() -> bool {
        true
    }

    fn validate_retry_statuses(&self) -> Result<(), ValidationError> {
        for status in &self.retry_on_status {
            if (400..500).contains(status) {
                let mut err = ValidationError::new("client_error_not_retryable");
                err.add_param("status".into(), status);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// An upstream core service and the operations it exposes.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Service::validate_operations"))]
pub struct Service {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1), custom(function = "Service::validate_nodes_keys"))]
    pub nodes: HashMap<String, u32>,
    #[serde(default)]
    pub scheme: UpstreamScheme,
    /// Host header sent upstream, defaults to the node address.
    pub host: Option<String>,
    #[serde(default = "Service::default_max_in_flight")]
    #[validate(range(min = 1))]
    pub max_in_flight: usize,
    #[serde(default = "Service::default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "Service::default_keepalive_ms")]
    pub keepalive_ms: u64,
    /// Seconds between DNS refreshes of hostname nodes.
    pub discovery_interval: Option<u64>,
    #[serde(default)]
    #[validate(nested)]
    pub circuit: CircuitConfig,
    #[validate(length(min = 1))]
    pub operations: HashMap<String, Operation>,
}

impl Service {
    fn default_max_in_flight() -> usize {
        128
    }

    fn default_queue_timeout_ms() -> u64 {
        50
    }

    fn default_keepalive_ms() -> u64 {
        60_000
    }

    fn validate_nodes_keys(nodes: &HashMap<String, u32>) -> Result<(), ValidationError> {
        for key in nodes.keys() {
            if !NODE_KEY_REGEX.is_match(key) {
                let mut err = ValidationError::new("invalid_node_key");
                err.add_param("key".into(), &key.to_string());
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate_operations(&self) -> Result<(), ValidationError> {
        for (name, op) in &self.operations {
            if !op.path.starts_with('/') {
                return Err(reference_error("operation_path_must_be_absolute", name));
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    HTTP,
    HTTPS,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "CircuitConfig::validate_cooldowns"))]
pub struct CircuitConfig {
    #[serde(default = "CircuitConfig::default_failure_ratio")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_ratio: f64,
    #[serde(default = "CircuitConfig::default_window_ms")]
    #[validate(range(min = 1))]
    pub window_ms: u64,
    #[serde(default = "CircuitConfig::default_min_requests")]
    #[validate(range(min = 1))]
    pub min_requests: u32,
    #[serde(default = "CircuitConfig::default_cooldown_ms")]
    #[validate(range(min = 1))]
    pub cooldown_ms: u64,
    #[serde(default = "CircuitConfig::default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
    #[serde(default = "CircuitConfig::default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
}

impl CircuitConfig {
    fn default_failure_ratio() -> f64 {
        0.5
    }

    fn default_window_ms() -> u64 {
        10_000
    }

    fn default_min_requests() -> u32 {
        5
    }

    fn default_cooldown_ms() -> u64 {
        5_000
    }

    fn default_max_cooldown_ms() -> u64 {
        60_000
    }

    fn default_backoff_multiplier() -> f64 {
        2.0
    }

    fn validate_cooldowns(&self) -> Result<(), ValidationError> {
        if self.max_cooldown_ms < self.cooldown_ms {
            Err(ValidationError::new("max_cooldown_below_cooldown"))
        } else {
            Ok(())
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_ratio: Self::default_failure_ratio(),
            window_ms: Self::default_window_ms(),
            min_requests: Self::default_min_requests(),
            cooldown_ms: Self::default_cooldown_ms(),
            max_cooldown_ms: Self::default_max_cooldown_ms(),
            backoff_multiplier: Self::default_backoff_multiplier(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub method: HttpMethod,
    /// Request path, `{name}` placeholders are filled from bound inputs.
    pub path: String,
    pub idempotent: Option<bool>,
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
}

impl HttpMethod {
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            HttpMethod::GET | HttpMethod::HEAD | HttpMethod::PUT | HttpMethod::DELETE
        )
    }

    /// Whether inputs left over after path rendering travel in the query string.
    pub fn uses_query(&self) -> bool {
        matches!(self, HttpMethod::GET | HttpMethod::HEAD | HttpMethod::DELETE)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::HEAD => "HEAD",
        };
        write!(f, "{}", method)
    }
}

/// Upstream calls to make for one operation, optionally bound to one profile.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Plan::validate_graph"))]
pub struct Plan {
    #[validate(length(min = 1))]
    pub operation: String,
    /// `None` marks the default plan used by every profile without its own.
    pub profile: Option<String>,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub calls: Vec<UpstreamCall>,
}

impl Plan {
    fn validate_graph(&self) -> Result<(), ValidationError> {
        topological_order(&self.calls).map(|_| ()).map_err(|msg| {
            let mut err = ValidationError::new("invalid_call_graph");
            err.add_param("operation".into(), &self.operation);
            err.with_message(Cow::Owned(msg))
        })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpstreamCall {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub service: String,
    #[validate(length(min = 1))]
    pub operation: String,
    #[serde(default)]
    pub required: bool,
    /// Entity type the profile field rules apply to, defaults to the call id.
    pub entity: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBinding>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "UpstreamCall::default_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    pub retry_policy: Option<String>,
    pub idempotent: Option<bool>,
    #[serde(default)]
    #[validate(nested)]
    pub fields: Vec<FieldMapping>,
}

impl UpstreamCall {
    fn default_timeout_ms() -> u64 {
        1000
    }

    pub fn entity(&self) -> &str {
        self.entity.as_deref().unwrap_or(&self.id)
    }

    /// Ids of every call this one waits for, explicit or implied by bindings.
    pub fn predecessors(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.depends_on.iter().map(String::as_str).collect();
        for binding in self.inputs.values() {
            if let InputBinding::Call { call, .. } = binding {
                if !deps.contains(&call.as_str()) {
                    deps.push(call);
                }
            }
        }
        deps
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputBinding {
    Call {
        call: String,
        field: String,
    },
    Request {
        request: String,
        #[serde(default)]
        default: Option<JsonValue>,
    },
    Literal {
        value: JsonValue,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct FieldMapping {
    #[validate(length(min = 1))]
    pub name: String,
    /// JSON pointer (`/data/0/name`) or dotted path (`data.0.name`).
    #[validate(length(min = 1))]
    pub source: String,
    pub coerce: Option<Coercion>,
    pub required: Option<bool>,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coercion {
    String,
    Integer,
    Number,
    Boolean,
}
