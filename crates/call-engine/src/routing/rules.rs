//! Routing rules and call attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::routing::profile::SkillTier;

/// What the engine decides to do with a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    AutoResolve,
    Transfer,
    Escalate,
    Callback,
    EndCall,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteAction::AutoResolve => "auto_resolve",
            RouteAction::Transfer => "transfer",
            RouteAction::Escalate => "escalate",
            RouteAction::Callback => "callback",
            RouteAction::EndCall => "end_call",
        }
    }
}

impl std::fmt::Display for RouteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The routing factors derived for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttributes {
    pub priority: String,
    pub category: String,
    pub complexity: String,
    pub sentiment: String,
    pub business_hours: bool,
    pub language: String,
}

impl Default for CallAttributes {
    fn default() -> Self {
        CallAttributes {
            priority: "normal".to_string(),
            category: "general".to_string(),
            complexity: "low".to_string(),
            sentiment: "neutral".to_string(),
            business_hours: true,
            language: "en".to_string(),
        }
    }
}

impl CallAttributes {
    /// Look up an attribute by its condition key.
    fn get(&self, key: &str) -> Option<Value> {
        match key {
            "priority" => Some(json!(self.priority)),
            "category" => Some(json!(self.category)),
            "complexity" => Some(json!(self.complexity)),
            "sentiment" => Some(json!(self.sentiment)),
            "business_hours" => Some(json!(self.business_hours)),
            "language" => Some(json!(self.language)),
            _ => None,
        }
    }
}

/// A predicate-action pair, evaluated in ascending priority order.
///
/// A rule matches only when every declared condition key names a known
/// attribute and the values are equal; an unknown key means the rule
/// cannot match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub rule_id: String,
    pub name: String,
    /// attribute key -> required value. BTreeMap keeps serialization stable.
    pub conditions: BTreeMap<String, Value>,
    pub action: RouteAction,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tier: Option<SkillTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_specialization: Option<String>,
}

impl RoutingRule {
    pub fn matches(&self, attributes: &CallAttributes) -> bool {
        self.conditions.iter().all(|(key, expected)| {
            attributes.get(key).map_or(false, |actual| actual == *expected)
        })
    }
}

/// The built-in rule set.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule {
            rule_id: "R001".into(),
            name: "High Priority Escalation".into(),
            conditions: BTreeMap::from([
                ("priority".into(), json!("urgent")),
                ("sentiment".into(), json!("negative")),
            ]),
            action: RouteAction::Escalate,
            priority: 1,
            target_tier: Some(SkillTier::Supervisor),
            target_specialization: None,
        },
        RoutingRule {
            rule_id: "R002".into(),
            name: "Technical Issues".into(),
            conditions: BTreeMap::from([
                ("category".into(), json!("technical")),
                ("complexity".into(), json!("high")),
            ]),
            action: RouteAction::Transfer,
            priority: 2,
            target_tier: Some(SkillTier::Specialist),
            target_specialization: Some("technical_support".into()),
        },
        RoutingRule {
            rule_id: "R003".into(),
            name: "Billing Inquiries".into(),
            conditions: BTreeMap::from([("category".into(), json!("billing"))]),
            action: RouteAction::Transfer,
            priority: 3,
            target_tier: None,
            target_specialization: Some("billing".into()),
        },
        RoutingRule {
            rule_id: "R004".into(),
            name: "Simple FAQ".into(),
            conditions: BTreeMap::from([
                ("complexity".into(), json!("low")),
                ("category".into(), json!("general")),
            ]),
            action: RouteAction::AutoResolve,
            priority: 4,
            target_tier: None,
            target_specialization: None,
        },
        RoutingRule {
            rule_id: "R005".into(),
            name: "After Hours".into(),
            conditions: BTreeMap::from([("business_hours".into(), json!(false))]),
            action: RouteAction::Callback,
            priority: 5,
            target_tier: None,
            target_specialization: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matches_only_when_every_condition_holds() {
        let rules = default_rules();
        let escalation = &rules[0];

        let mut attrs = CallAttributes {
            priority: "urgent".into(),
            sentiment: "negative".into(),
            ..Default::default()
        };
        assert!(escalation.matches(&attrs));

        attrs.sentiment = "neutral".into();
        assert!(!escalation.matches(&attrs));
    }

    #[test]
    fn unknown_condition_key_never_matches() {
        let rule = RoutingRule {
            rule_id: "X1".into(),
            name: "Bad Key".into(),
            conditions: BTreeMap::from([("moon_phase".into(), json!("full"))]),
            action: RouteAction::EndCall,
            priority: 1,
            target_tier: None,
            target_specialization: None,
        };
        assert!(!rule.matches(&CallAttributes::default()));
    }

    #[test]
    fn after_hours_rule_matches_boolean_attribute() {
        let after_hours = &default_rules()[4];
        let attrs = CallAttributes {
            business_hours: false,
            ..Default::default()
        };
        assert!(after_hours.matches(&attrs));
        assert!(!after_hours.matches(&CallAttributes::default()));
    }

    #[test]
    fn rules_deserialize_from_toml() {
        let rule: RoutingRule = toml::from_str(
            r#"
            rule_id = "C001"
            name = "VIP Line"
            action = "transfer"
            priority = 1
            target_tier = "senior"

            [conditions]
            priority = "urgent"
            "#,
        )
        .unwrap();
        assert_eq!(rule.action, RouteAction::Transfer);
        assert_eq!(rule.target_tier, Some(SkillTier::Senior));
    }
}
