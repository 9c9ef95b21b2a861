use std::collections::BTreeSet;
use std::time::Duration;

use crate::config;
use crate::core::AggregationError;

use super::aggregate::{AggregatedResponse, MergedField};

/// Entity key whose rule covers entities without a rule of their own.
const ANY_ENTITY: &str = "*";

/// Runtime view of a configured client profile.
#[derive(Debug)]
pub struct ClientProfile {
    pub inner: config::ClientProfile,
}

impl ClientProfile {
    pub fn new(inner: config::ClientProfile) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn timeout_budget(&self) -> Duration {
        Duration::from_millis(self.inner.timeout_budget_ms)
    }

    /// Whether `field` of an `entity` may reach this client.
    pub fn allows(&self, entity: &str, field: &str) -> bool {
        let rule = match self
            .inner
            .field_rules
            .get(entity)
            .or_else(|| self.inner.field_rules.get(ANY_ENTITY))
        {
            Some(rule) => rule,
            None => return true,
        };

        if rule.deny.iter().any(|f| f == field) {
            return false;
        }
        match &rule.allow {
            Some(allow) => allow.iter().any(|f| f == field),
            None => true,
        }
    }

    /// Inbound headers this profile forwards upstream, matched case-insensitively.
    pub fn forwarded_headers(&self, headers: &[(String, String)]) -> Vec<(String, String)> {
        headers
            .iter()
            .filter(|(name, _)| {
                self.inner
                    .forward_headers
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect()
    }

    /// Applies the field rules and the payload budget to the merged fields.
    ///
    /// `degraded` holds `(entity, field)` pairs. Over budget, optional fields
    /// are dropped lowest priority first, the latest merged first among
    /// equals, and reported as degraded.
    pub fn shape(
        &self,
        fields: Vec<MergedField>,
        degraded: Vec<(String, String)>,
        partial: bool,
    ) -> Result<AggregatedResponse, AggregationError> {
        let mut kept: Vec<MergedField> = fields
            .into_iter()
            .filter(|f| {
                let allowed = self.allows(&f.entity, &f.name);
                if !allowed {
                    log::trace!(
                        "profile '{}' strips field '{}' of entity '{}'",
                        self.id(),
                        f.name,
                        f.entity
                    );
                }
                allowed
            })
            .collect();

        let mut degraded: BTreeSet<String> = degraded
            .into_iter()
            .filter(|(entity, name)| self.allows(entity, name))
            .map(|(_, name)| name)
            .collect();
        degraded.retain(|name| !kept.iter().any(|f| &f.name == name));

        let mut partial = partial;
        let limit = match self.inner.max_payload_bytes {
            Some(limit) => limit,
            None => return Ok(AggregatedResponse::new(&kept, partial, degraded)),
        };

        loop {
            let response = AggregatedResponse::new(&kept, partial, degraded.clone());
            let size = response.encoded_len();
            if size <= limit {
                return Ok(response);
            }

            let victim = kept
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.required)
                .min_by(|(i, a), (j, b)| a.priority.cmp(&b.priority).then(j.cmp(i)))
                .map(|(i, _)| i);

            match victim {
                Some(i) => {
                    let field = kept.remove(i);
                    log::debug!(
                        "payload of {size} bytes over the {limit} byte budget of profile '{}', dropping '{}'",
                        self.id(),
                        field.name
                    );
                    degraded.insert(field.name);
                    partial = true;
                }
                None => return Err(AggregationError::PayloadBudgetExceeded { size, limit }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::{json, Value as JsonValue};

    use super::*;
    use crate::config::FieldRule;

    fn profile(max_payload_bytes: Option<usize>, rules: &[(&str, FieldRule)]) -> ClientProfile {
        ClientProfile::new(config::ClientProfile {
            id: "mobile".to_string(),
            max_payload_bytes,
            field_rules: rules
                .iter()
                .map(|(e, r)| (e.to_string(), r.clone()))
                .collect::<HashMap<_, _>>(),
            timeout_budget_ms: 500,
            forward_headers: vec!["Authorization".to_string()],
        })
    }

    fn allow(fields: &[&str]) -> FieldRule {
        FieldRule {
            allow: Some(fields.iter().map(|f| f.to_string()).collect()),
            deny: vec![],
        }
    }

    fn deny(fields: &[&str]) -> FieldRule {
        FieldRule {
            allow: None,
            deny: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn field(entity: &str, name: &str, value: JsonValue, priority: u32, required: bool) -> MergedField {
        MergedField {
            name: name.to_string(),
            value,
            entity: entity.to_string(),
            priority,
            required,
        }
    }

    #[test]
    fn test_rules_per_entity_with_fallback() {
        let profile = profile(None, &[("user", allow(&["name"])), ("*", deny(&["internal"]))]);
        assert!(profile.allows("user", "name"));
        assert!(!profile.allows("user", "email"));
        // the user rule replaces the fallback
        assert!(!profile.allows("user", "internal"));
        assert!(profile.allows("orders", "items"));
        assert!(!profile.allows("orders", "internal"));

        let open = self::profile(None, &[]);
        assert!(open.allows("anything", "at_all"));
    }

    #[test]
    fn test_forwarded_headers() {
        let profile = profile(None, &[]);
        let headers = vec![
            ("authorization".to_string(), "Bearer t".to_string()),
            ("cookie".to_string(), "a=b".to_string()),
        ];
        assert_eq!(
            profile.forwarded_headers(&headers),
            vec![("authorization".to_string(), "Bearer t".to_string())]
        );
    }

    #[test]
    fn test_shape_strips_excluded_fields() {
        let profile = profile(None, &[("user", deny(&["email"]))]);
        let response = profile
            .shape(
                vec![
                    field("user", "name", json!("x"), 0, true),
                    field("user", "email", json!("x@y"), 0, true),
                ],
                vec![("user".to_string(), "email".to_string())],
                true,
            )
            .unwrap();
        assert_eq!(response.fields, json!({"name": "x"}).as_object().cloned().unwrap());
        assert!(response.degraded_fields.is_empty());
        assert!(response.partial);
    }

    #[test]
    fn test_shape_drops_lowest_priority_first() {
        let fields = vec![
            field("user", "name", json!("x"), 0, true),
            field("feed", "feed", json!("a".repeat(40)), 2, false),
            field("ads", "ads", json!("b".repeat(40)), 1, false),
            field("promo", "promo", json!("c".repeat(40)), 1, false),
        ];
        // {"name":"x","feed":"<40>","partial":true,"degradedFields":["ads","promo"]}
        let profile = profile(Some(110), &[]);
        let response = profile.shape(fields, vec![], false).unwrap();

        assert!(response.encoded_len() <= 110);
        assert!(response.fields.contains_key("name"));
        assert!(response.fields.contains_key("feed"));
        assert!(response.partial);
        assert_eq!(
            response.degraded_fields.into_iter().collect::<Vec<_>>(),
            vec!["ads".to_string(), "promo".to_string()]
        );
    }

    #[test]
    fn test_shape_ties_drop_latest_merged() {
        let fields = vec![
            field("a", "first", json!("a".repeat(20)), 0, false),
            field("b", "second", json!("b".repeat(20)), 0, false),
        ];
        let profile = profile(Some(80), &[]);
        let response = profile.shape(fields, vec![], false).unwrap();
        assert!(response.fields.contains_key("first"));
        assert!(!response.fields.contains_key("second"));
    }

    #[test]
    fn test_shape_required_over_budget() {
        let profile = profile(Some(20), &[]);
        let err = profile
            .shape(
                vec![
                    field("user", "name", json!("a".repeat(50)), 0, true),
                    field("ads", "ads", json!("b"), 0, false),
                ],
                vec![],
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AggregationError::PayloadBudgetExceeded { limit: 20, size } if size > 20
        ));
    }
}
