//! Wire and evaluation models for the A/B protocol.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

/// Parsed variant parameter payload.
pub type VariantParams = Map<String, Value>;

pub const VARIANT_ID_PASS: &str = "pass";
pub const VARIANT_ID_FAIL: &str = "fail";

/// Spec type discriminants. The wire carries a raw integer so unknown types
/// (and dependency-only types like Layer/Holdout) pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SpecType {
    Gate = 1,
    Config = 2,
    Experiment = 3,
    Layer = 4,
    Holdout = 5,
}

impl SpecType {
    /// Whether this type matches a spec's raw `typ` field.
    pub fn matches(self, typ: i32) -> bool {
        self as i32 == typ
    }
}

impl std::fmt::Display for SpecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpecType::Gate => "Gate",
            SpecType::Config => "Config",
            SpecType::Experiment => "Experiment",
            SpecType::Layer => "Layer",
            SpecType::Holdout => "Holdout",
        };
        f.write_str(name)
    }
}

/// Rule classes, applied in this order during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleClass {
    Override,
    Traffic,
    Gate,
    Group,
}

impl RuleClass {
    /// Wire form used as the key of [`AbSpec::rules`].
    pub const fn as_str(self) -> &'static str {
        match self {
            RuleClass::Override => "OVERRIDE",
            RuleClass::Traffic => "TRAFFIC",
            RuleClass::Gate => "GATE",
            RuleClass::Group => "GROUP",
        }
    }
}

/// A single unit of A/B configuration: a feature gate, dynamic config or
/// experiment, plus dependency-only types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbSpec {
    #[serde(default)]
    pub id: i64,
    /// Feature key, unique within a snapshot.
    #[serde(default)]
    pub key: String,
    /// Human label.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub typ: i32,
    /// Declared but not acted on by evaluation ("1:client" / "2:server").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub traffic: String,
    /// Which user attribute identifies the subject: `anon_id`, `login_id`,
    /// or a key into the user's A/B properties.
    #[serde(default)]
    pub subject_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub salt: String,
    /// Incremented on each update.
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub disable_impress: bool,
    /// Rule table keyed by rule class ([`RuleClass::as_str`]).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rules: HashMap<String, Vec<Rule>>,
    /// Raw variant payloads as served. Parsed into `variant_values` at
    /// snapshot build time and discarded.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variant_payloads: HashMap<String, Box<RawValue>>,
    /// Parsed variant parameter tables. Never mutated after snapshot build.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variant_values: HashMap<String, VariantParams>,
}

impl AbSpec {
    pub(crate) fn class_rules(&self, class: RuleClass) -> Option<&[Rule]> {
        self.rules.get(class.as_str()).map(Vec::as_slice)
    }

    pub(crate) fn variant_params(&self, variant_id: &str) -> VariantParams {
        self.variant_values
            .get(variant_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Unique id.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub salt: String,
    /// Percentage in [0.0, 100.0].
    #[serde(default)]
    pub rollout: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Variant chosen when the rule decides: "pass"/"fail"/variant id.
    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_variant: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    /// "COMMON" "FFUSER" "PROPS" "TARGET" "DEFAULT"
    #[serde(default)]
    pub field_class: String,
    #[serde(default)]
    pub field: String,
    /// Operator, e.g. "ANY_OF_CASE_SENSITIVE" "IS_TRUE" "GATE_PASS"...
    #[serde(default)]
    pub opt: String,
    /// Target literal.
    #[serde(default)]
    pub value: Value,
}

/// An A/B evaluation result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbResult {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub typ: i32,
    /// "pass"/"fail" for gates, the chosen variant for configs and
    /// experiments, a holdout variant, or `None`.
    #[serde(default, rename = "vid", skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Variant parameter values (read-only).
    #[serde(default, rename = "value", skip_serializing_if = "Map::is_empty")]
    pub variant_param_value: VariantParams,
    #[serde(default)]
    pub disable_impress: bool,
}

impl AbResult {
    /// `true` iff the result indicates a "pass" for a gate.
    pub fn check_feature_gate(&self) -> bool {
        self.variant_id.as_deref() == Some(VARIANT_ID_PASS)
    }

    /// The variant parameter values as raw JSON.
    pub fn json_payload(&self) -> Vec<u8> {
        serde_json::to_vec(&self.variant_param_value).unwrap_or_default()
    }

    /// String parameter by key, or `fallback` if absent or not a string.
    pub fn get_string(&self, key: &str, fallback: &str) -> String {
        match self.variant_param_value.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => fallback.to_owned(),
        }
    }

    /// Numeric parameter by key, or `fallback` if absent or not a number.
    pub fn get_number(&self, key: &str, fallback: f64) -> f64 {
        self.variant_param_value
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(fallback)
    }

    /// Boolean parameter by key, or `fallback` if absent or not a boolean.
    pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
        self.variant_param_value
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(fallback)
    }

    /// List parameter by key, or `fallback` if absent or not a list.
    pub fn get_slice(&self, key: &str, fallback: Vec<Value>) -> Vec<Value> {
        match self.variant_param_value.get(key) {
            Some(Value::Array(values)) => values.clone(),
            _ => fallback,
        }
    }

    /// Object parameter by key, or `fallback` if absent or not an object.
    pub fn get_map(&self, key: &str, fallback: Map<String, Value>) -> Map<String, Value> {
        match self.variant_param_value.get(key) {
            Some(Value::Object(map)) => map.clone(),
            _ => fallback,
        }
    }
}

/// Environment-level flags shared by all specs in a snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AbEnv {
    /// Track exposure even when evaluation does not pass. More accurate
    /// analysis at a higher event volume, default false.
    #[serde(default)]
    pub always_track: bool,
}

/// The metadata envelope returned by a [`crate::meta_loader::MetaLoader`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaEnvelope {
    /// Server-side hint that the spec set changed.
    #[serde(default)]
    pub update: bool,
    /// Millisecond epoch of the served spec set.
    #[serde(default)]
    pub update_time: i64,
    #[serde(default)]
    pub ab_env: AbEnv,
    #[serde(default)]
    pub ab_specs: Vec<AbSpec>,
}

/// Top-level response of the metadata endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct MetaResponse {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: MetaEnvelope,
}

/// Sticky cache value: the JSON form `{"v": "<variant-id>"}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StickyResultCache {
    #[serde(default, rename = "v", skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn spec_type_matches_raw_typ() {
        assert!(SpecType::Gate.matches(1));
        assert!(SpecType::Experiment.matches(3));
        assert!(!SpecType::Config.matches(3));
        assert_eq!(SpecType::Holdout.to_string(), "Holdout");
    }

    #[test]
    fn result_accessors_fall_back_on_type_mismatch() {
        let mut result = AbResult::default();
        result.variant_param_value = json!({
            "color": "blue",
            "limit": 3,
            "on": true,
            "tags": ["a"],
            "nested": {"k": 1},
        })
        .as_object()
        .unwrap()
        .clone();

        assert_eq!(result.get_string("color", "red"), "blue");
        assert_eq!(result.get_string("limit", "red"), "red");
        assert_eq!(result.get_number("limit", 0.0), 3.0);
        assert_eq!(result.get_number("color", 7.0), 7.0);
        assert!(result.get_bool("on", false));
        assert!(result.get_bool("missing", true));
        assert_eq!(result.get_slice("tags", vec![]), vec![json!("a")]);
        assert_eq!(result.get_map("nested", Map::new())["k"], json!(1));
    }

    #[test]
    fn check_feature_gate_requires_pass_variant() {
        let mut result = AbResult::default();
        assert!(!result.check_feature_gate());
        result.variant_id = Some(VARIANT_ID_FAIL.to_owned());
        assert!(!result.check_feature_gate());
        result.variant_id = Some(VARIANT_ID_PASS.to_owned());
        assert!(result.check_feature_gate());
    }

    #[test]
    fn spec_parses_from_wire_json() {
        // raw payloads only deserialize from JSON text, not from a Value
        let spec: AbSpec = serde_json::from_str(
            r#"{
                "id": 7,
                "key": "TestSpec",
                "name": "test",
                "typ": 1,
                "subject_id": "login_id",
                "enabled": true,
                "salt": "s",
                "rules": {
                    "GATE": [{
                        "id": "r1",
                        "rollout": 100.0,
                        "conditions": [
                            {"field_class": "COMMON", "field": "public", "opt": "IS_TRUE"}
                        ]
                    }]
                },
                "variant_payloads": {"v1": {"color":"blue"}}
            }"#,
        )
        .unwrap();

        assert_eq!(spec.id, 7);
        assert!(SpecType::Gate.matches(spec.typ));
        let rules = spec.class_rules(RuleClass::Gate).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].conditions[0].opt, "IS_TRUE");
        assert_eq!(spec.variant_payloads["v1"].get(), r#"{"color":"blue"}"#);
    }
}
