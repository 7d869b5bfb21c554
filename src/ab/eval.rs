//! The spec evaluator: subject resolution, the four rule classes, sticky
//! read-through/write-back and recursive gate dependencies.
//!
//! Evaluation is stateless apart from the snapshot handed in at the entry
//! point, so any number of callers can evaluate concurrently. The same
//! snapshot reference is threaded through dependency recursion, so a
//! mid-evaluation swap can never mix two spec sets.
use serde_json::Value;

use crate::ab::conditions::{
    eval_array_match, eval_basic_match, eval_number_match, eval_time_match, eval_version_match,
    value_to_string,
};
use crate::ab::models::{
    AbResult, AbSpec, Condition, Rule, RuleClass, SpecType, StickyResultCache, VARIANT_ID_FAIL,
    VARIANT_ID_PASS,
};
use crate::ab::snapshot::Snapshot;
use crate::ab::{AbCore, MAX_RECURSION_DEPTH};
use crate::error::{Error, Result};
use crate::hash::{hash_u64, BucketBitmap, BUCKET_BITS};
use crate::user::User;

impl AbCore {
    /// Core evaluation logic for a single spec.
    pub(crate) fn eval_spec(
        &self,
        snapshot: &Snapshot,
        user: &User,
        spec: &AbSpec,
        depth: usize,
    ) -> Result<AbResult> {
        if depth >= MAX_RECURSION_DEPTH {
            return Ok(AbResult::default());
        }
        let depth = depth + 1;
        if !spec.enabled {
            return Ok(AbResult::default());
        }

        let subject = subject_value(user, spec);
        if subject.is_empty() {
            return Ok(AbResult::default());
        }

        let mut result = AbResult::default();
        let mut sticky_key = None;
        if spec.sticky {
            let handler = self
                .sticky_handler
                .as_ref()
                .ok_or(Error::AbWithoutSticky)?;
            let key = format!("{}-{}", spec.id, subject);
            let cached = handler
                .get_sticky_result(&key)
                .map_err(|err| Error::StickyHandler(err.into()))?;
            if let Some(cached) = cached.filter(|value| !value.is_empty()) {
                if let Ok(cache) = serde_json::from_str::<StickyResultCache>(&cached) {
                    seed_result(&mut result, spec);
                    if let Some(variant_id) = cache.variant_id {
                        result.variant_param_value = spec.variant_params(&variant_id);
                        result.variant_id = Some(variant_id);
                    }
                    return Ok(result);
                }
            }
            sticky_key = Some((handler.clone(), key));
        }

        seed_result(&mut result, spec);
        self.eval_rules(snapshot, user, spec, &subject, depth, &mut result)?;

        // write-back only after an error-free evaluation that chose a variant
        if let (Some((handler, key)), Some(variant_id)) = (sticky_key, &result.variant_id) {
            let cache = StickyResultCache {
                variant_id: Some(variant_id.clone()),
            };
            if let Ok(payload) = serde_json::to_string(&cache) {
                handler
                    .set_sticky_result(&key, &payload)
                    .map_err(|err| Error::StickyHandler(err.into()))?;
            }
        }
        Ok(result)
    }

    fn eval_rules(
        &self,
        snapshot: &Snapshot,
        user: &User,
        spec: &AbSpec,
        subject: &str,
        depth: usize,
        result: &mut AbResult,
    ) -> Result<()> {
        let mut pass = false;
        let outcome = self.eval_rule_classes(snapshot, user, spec, subject, depth, result, &mut pass);

        // gate variant ids are standardized to "pass"/"fail" on every exit
        if SpecType::Gate.matches(spec.typ) && result.variant_id.is_none() {
            result.variant_id = Some(if pass { VARIANT_ID_PASS } else { VARIANT_ID_FAIL }.to_owned());
        }
        outcome
    }

    fn eval_rule_classes(
        &self,
        snapshot: &Snapshot,
        user: &User,
        spec: &AbSpec,
        subject: &str,
        depth: usize,
        result: &mut AbResult,
        pass: &mut bool,
    ) -> Result<()> {
        // 1. override rules take absolute priority
        if self.eval_overrides(snapshot, user, spec, subject, depth, result)? {
            return Ok(());
        }

        // 2. traffic rules (holdout + bucket)
        if self.eval_traffic(snapshot, user, spec, subject, depth, result)? {
            return Ok(());
        }

        // 3. gate rules
        if self.eval_gates(snapshot, user, spec, subject, depth, result)? {
            *pass = true;
        }

        if !SpecType::Experiment.matches(spec.typ) || !*pass || result.variant_id.is_some() {
            return Ok(());
        }

        // 4. group rules split passing experiment subjects across variants
        self.eval_groups(snapshot, user, spec, subject, depth, result)
    }

    /// First passing override rule with a variant wins and ends evaluation.
    fn eval_overrides(
        &self,
        snapshot: &Snapshot,
        user: &User,
        spec: &AbSpec,
        subject: &str,
        depth: usize,
        result: &mut AbResult,
    ) -> Result<bool> {
        for rule in spec.class_rules(RuleClass::Override).unwrap_or_default() {
            if self.eval_rule(snapshot, user, rule, subject, depth)? {
                if let Some(variant_id) = &rule.override_variant {
                    result.variant_param_value = spec.variant_params(variant_id);
                    result.variant_id = Some(variant_id.clone());
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// The first traffic rule the subject falls out of is decisive: its
    /// override (e.g. a holdout variant) is applied and evaluation ends.
    fn eval_traffic(
        &self,
        snapshot: &Snapshot,
        user: &User,
        spec: &AbSpec,
        subject: &str,
        depth: usize,
        result: &mut AbResult,
    ) -> Result<bool> {
        for rule in spec.class_rules(RuleClass::Traffic).unwrap_or_default() {
            if !self.eval_rule(snapshot, user, rule, subject, depth)? {
                if let Some(variant_id) = &rule.override_variant {
                    result.variant_id = Some(variant_id.clone());
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn eval_gates(
        &self,
        snapshot: &Snapshot,
        user: &User,
        spec: &AbSpec,
        subject: &str,
        depth: usize,
        result: &mut AbResult,
    ) -> Result<bool> {
        for rule in spec.class_rules(RuleClass::Gate).unwrap_or_default() {
            if self.eval_rule(snapshot, user, rule, subject, depth)? {
                if let Some(variant_id) = &rule.override_variant {
                    result.variant_param_value = spec.variant_params(variant_id);
                    result.variant_id = Some(variant_id.clone());
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn eval_groups(
        &self,
        snapshot: &Snapshot,
        user: &User,
        spec: &AbSpec,
        subject: &str,
        depth: usize,
        result: &mut AbResult,
    ) -> Result<()> {
        for rule in spec.class_rules(RuleClass::Group).unwrap_or_default() {
            if self.eval_rule(snapshot, user, rule, subject, depth)? {
                if let Some(variant_id) = &rule.override_variant {
                    result.variant_param_value = spec.variant_params(variant_id);
                    result.variant_id = Some(variant_id.clone());
                }
                break;
            }
        }
        Ok(())
    }

    /// A rule passes when its rollout is non-zero, every condition passes,
    /// and the subject hashes under the rollout threshold.
    fn eval_rule(
        &self,
        snapshot: &Snapshot,
        user: &User,
        rule: &Rule,
        subject: &str,
        depth: usize,
    ) -> Result<bool> {
        if rule.rollout == 0.0 {
            return Ok(false);
        }
        for condition in &rule.conditions {
            if !self.eval_condition(snapshot, user, condition, subject, depth)? {
                return Ok(false);
            }
        }
        if rule.rollout == 100.0 {
            return Ok(true);
        }
        Ok(hash_u64(subject, &rule.salt) % 10000 < (rule.rollout * 100.0) as u64)
    }

    fn eval_condition(
        &self,
        snapshot: &Snapshot,
        user: &User,
        condition: &Condition,
        subject: &str,
        depth: usize,
    ) -> Result<bool> {
        let class = condition.field_class.as_str();
        if class.eq_ignore_ascii_case("common") {
            return if condition.field.eq_ignore_ascii_case("public") {
                Ok(true)
            } else {
                Err(Error::UnknownCommonField(condition.field.clone()))
            };
        }

        let left = if class.eq_ignore_ascii_case("ffuser") {
            if condition.field.eq_ignore_ascii_case("login_id") && !user.login_id.is_empty() {
                Value::String(user.login_id.clone())
            } else if condition.field.eq_ignore_ascii_case("anon_id") && !user.anon_id.is_empty() {
                Value::String(user.anon_id.clone())
            } else {
                Value::Null
            }
        } else if class.eq_ignore_ascii_case("props") {
            user.ab_properties
                .get(&condition.field)
                .cloned()
                .unwrap_or(Value::Null)
        } else if class.eq_ignore_ascii_case("target") {
            self.target_value(subject, &condition.field)
        } else {
            Value::String(condition.field.clone())
        };

        self.eval_condition_match(snapshot, user, condition, &left, subject, depth)
    }

    fn eval_condition_match(
        &self,
        snapshot: &Snapshot,
        user: &User,
        condition: &Condition,
        left: &Value,
        subject: &str,
        depth: usize,
    ) -> Result<bool> {
        let right = &condition.value;
        let op = condition.opt.to_lowercase();
        match op.as_str() {
            "gt" | "gte" | "lt" | "lte" => Ok(eval_number_match(&op, left, right)),
            "is_null" | "is_not_null" | "is_true" | "is_false" | "eq" | "neq" => {
                Ok(eval_basic_match(&op, left, right))
            }
            "before" | "after" => Ok(eval_time_match(&op, left, right)),
            "bucket_set" => {
                let Some(encoded) = right.as_str() else {
                    return Err(Error::BucketSetValue(format!(
                        "unknown bucket_set type: {right}"
                    )));
                };
                let bucket = (hash_u64(subject, &condition.field) % BUCKET_BITS as u64) as usize;
                let mut bitmap = BucketBitmap::new(BUCKET_BITS);
                bitmap.load_hex_string(encoded)?;
                Ok(bitmap.get_bit(bucket) == 1)
            }
            "gate_pass" => self.eval_gate_match(snapshot, user, &condition.field, depth, false),
            "gate_fail" => self.eval_gate_match(snapshot, user, &condition.field, depth, true),
            _ if op.starts_with("version_") => Ok(eval_version_match(&op, left, right)),
            _ if op.contains("_of_") => Ok(eval_array_match(&op, left, right)),
            _ => Err(Error::UnknownOperator(condition.opt.clone())),
        }
    }

    /// Recursively evaluate the dependent spec named by `field`. A missing
    /// dependency counts as a failing gate, not an error.
    fn eval_gate_match(
        &self,
        snapshot: &Snapshot,
        user: &User,
        field: &str,
        depth: usize,
        invert: bool,
    ) -> Result<bool> {
        let Some(dependency) = snapshot.get_spec(field) else {
            return Ok(false);
        };
        let result = self.eval_spec(snapshot, user, dependency, depth)?;
        let pass = result.check_feature_gate();
        Ok(if invert { !pass } else { pass })
    }

    /// Cohort/tag classification lookup.
    // TODO: integrate cohort/tag handlers; absent handlers resolve to null
    // so comparisons against target values stay null-valued.
    fn target_value(&self, _subject: &str, _target_key: &str) -> Value {
        Value::Null
    }
}

/// Resolve which user attribute identifies the subject for this spec.
fn subject_value(user: &User, spec: &AbSpec) -> String {
    if spec.subject_id.eq_ignore_ascii_case("anon_id") {
        user.anon_id.clone()
    } else if spec.subject_id.eq_ignore_ascii_case("login_id") {
        user.login_id.clone()
    } else {
        user.ab_properties
            .get(&spec.subject_id)
            .map(value_to_string)
            .unwrap_or_default()
    }
}

fn seed_result(result: &mut AbResult, spec: &AbSpec) {
    result.id = spec.id;
    result.key = spec.key.clone();
    result.typ = spec.typ;
    result.disable_impress = spec.disable_impress;
}
