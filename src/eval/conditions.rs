use chrono::{DateTime, TimeZone, Utc};
use semver::Version;

use crate::{
    eval::{
        evaluator::{evaluate, EvalContext},
        result::{EvalResult, SecondaryExposure},
    },
    hashing::{Bucketer, Sha256Bucketer, USER_BUCKET_COUNT},
    specs::models::{CompiledPattern, Condition},
    DynamicValue,
};

/// Outcome of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConditionOutcome {
    Pass,
    Fail,
    /// Condition type or operator is not part of the supported set.
    Unsupported,
}

impl From<bool> for ConditionOutcome {
    fn from(value: bool) -> Self {
        if value {
            ConditionOutcome::Pass
        } else {
            ConditionOutcome::Fail
        }
    }
}

/// Accumulates what nested gate evaluation produced while walking one rule.
#[derive(Debug, Default)]
pub(crate) struct RuleScratch {
    pub secondary_exposures: Vec<SecondaryExposure>,
    pub derived_device_metadata: Option<crate::eval::DerivedDeviceMetadata>,
}

impl Condition {
    pub(crate) fn eval(
        &self,
        ctx: &EvalContext,
        depth: u16,
        scratch: &mut RuleScratch,
    ) -> ConditionOutcome {
        let condition_type = self.condition_type.to_ascii_lowercase();
        let value = match condition_type.as_str() {
            "public" => return ConditionOutcome::Pass,
            "pass_gate" | "fail_gate" => {
                let Some(gate) = self.target_value.as_ref().and_then(DynamicValue::as_str) else {
                    return ConditionOutcome::Unsupported;
                };
                let result = eval_gate_reference(ctx, gate, depth, scratch);
                if result.unsupported {
                    return ConditionOutcome::Unsupported;
                }
                let passed = result.bool_value;
                return (if condition_type == "pass_gate" { passed } else { !passed }).into();
            }
            "multi_pass_gate" | "multi_fail_gate" => {
                let Some(gates) = self.target_value.as_ref().and_then(DynamicValue::as_array)
                else {
                    return ConditionOutcome::Unsupported;
                };
                let want_pass = condition_type == "multi_pass_gate";
                for gate in gates.iter().filter_map(DynamicValue::as_str) {
                    let result = eval_gate_reference(ctx, gate, depth, scratch);
                    if result.unsupported {
                        return ConditionOutcome::Unsupported;
                    }
                    if result.bool_value == want_pass {
                        return ConditionOutcome::Pass;
                    }
                }
                return ConditionOutcome::Fail;
            }
            "user_field" => self.field.as_deref().and_then(|f| ctx.user.get_field(f)),
            "environment_field" => self
                .field
                .as_deref()
                .and_then(|f| ctx.user.get_environment_field(f))
                .map(DynamicValue::from),
            "current_time" => Some(DynamicValue::from(ctx.now.timestamp_millis())),
            "user_bucket" => {
                let salt = self
                    .additional_values
                    .as_ref()
                    .and_then(|v| v.get("salt"))
                    .and_then(DynamicValue::as_str)
                    .unwrap_or_default();
                let unit_id = ctx.user.get_unit_id(&self.id_type).unwrap_or_default();
                let bucket =
                    Sha256Bucketer.get_bucket(format!("{salt}.{unit_id}"), USER_BUCKET_COUNT);
                Some(DynamicValue::from(bucket as i64))
            }
            "unit_id" => ctx
                .user
                .get_unit_id(&self.id_type)
                .map(DynamicValue::from),
            "ip_based" => self.ip_based_value(ctx, scratch),
            "ua_based" => self.ua_based_value(ctx, scratch),
            "target_app" => ctx.app_id.map(DynamicValue::from),
            _ => {
                log::debug!(target: "featuregate",
                            condition_type;
                            "unsupported condition type");
                return ConditionOutcome::Unsupported;
            }
        };

        let Some(operator) = self.operator.as_deref() else {
            return ConditionOutcome::Unsupported;
        };
        match apply_operator(
            ctx,
            operator,
            value.as_ref(),
            self.target_value.as_ref(),
            &self.pattern,
        ) {
            Some(passed) => passed.into(),
            None => ConditionOutcome::Unsupported,
        }
    }

    fn ip_based_value(&self, ctx: &EvalContext, scratch: &mut RuleScratch) -> Option<DynamicValue> {
        let field = self.field.as_deref()?;
        if let Some(value) = ctx.user.get_field(field) {
            return Some(value);
        }
        if !field.eq_ignore_ascii_case("country") {
            return None;
        }
        let ip = ctx.user.ip.as_deref()?;
        let country = ctx.providers.country_lookup.as_ref()?.lookup(ip)?;
        scratch
            .derived_device_metadata
            .get_or_insert_with(Default::default)
            .country = Some(country.clone());
        Some(DynamicValue::from(country))
    }

    fn ua_based_value(&self, ctx: &EvalContext, scratch: &mut RuleScratch) -> Option<DynamicValue> {
        let field = self.field.as_deref()?;
        if let Some(value) = ctx.user.get_field(field) {
            return Some(value);
        }
        let ua = ctx.user.user_agent.as_deref()?;
        let parsed = ctx.providers.user_agent_parser.as_ref()?.parse(ua)?;
        let value = match field.to_ascii_lowercase().as_str() {
            "os_name" | "osname" => parsed.os_name.clone(),
            "os_version" | "osversion" => parsed.os_version.clone(),
            "browser_name" | "browsername" => parsed.browser_name.clone(),
            "browser_version" | "browserversion" => parsed.browser_version.clone(),
            _ => None,
        };
        let metadata = scratch
            .derived_device_metadata
            .get_or_insert_with(Default::default);
        metadata.os_name = parsed.os_name;
        metadata.os_version = parsed.os_version;
        metadata.browser_name = parsed.browser_name;
        metadata.browser_version = parsed.browser_version;
        value.map(DynamicValue::from)
    }
}

/// Evaluate a referenced gate or segment one level deeper and record the secondary exposure.
pub(crate) fn eval_gate_reference(
    ctx: &EvalContext,
    gate: &str,
    depth: u16,
    scratch: &mut RuleScratch,
) -> EvalResult {
    let result = match ctx.snapshot.get_gate(gate) {
        Some(spec) => evaluate(ctx, spec, depth + 1),
        None => EvalResult::default(),
    };

    scratch
        .secondary_exposures
        .extend(result.secondary_exposures.iter().cloned());
    if !gate.starts_with("segment:") {
        scratch.secondary_exposures.push(SecondaryExposure::new(
            gate,
            result.bool_value,
            &result.rule_id,
        ));
    }
    result
}

/// Apply `operator`. Returns `None` for unknown operators; a missing or mistyped value is a plain
/// mismatch.
fn apply_operator(
    ctx: &EvalContext,
    operator: &str,
    value: Option<&DynamicValue>,
    target: Option<&DynamicValue>,
    compiled: &CompiledPattern,
) -> Option<bool> {
    let operator = operator.to_ascii_lowercase();
    Some(match operator.as_str() {
        "gt" | "gte" | "lt" | "lte" => {
            let (Some(v), Some(t)) = (
                value.and_then(DynamicValue::to_comparable_f64),
                target.and_then(DynamicValue::to_comparable_f64),
            ) else {
                return Some(false);
            };
            match operator.as_str() {
                "gt" => v > t,
                "gte" => v >= t,
                "lt" => v < t,
                _ => v <= t,
            }
        }

        "version_gt" | "version_gte" | "version_lt" | "version_lte" | "version_eq"
        | "version_neq" => {
            let (Some(v), Some(t)) = (
                value.and_then(DynamicValue::to_comparable_string),
                target.and_then(DynamicValue::to_comparable_string),
            ) else {
                return Some(false);
            };
            let Some(ordering) = compare_versions(&v, &t) else {
                return Some(false);
            };
            use std::cmp::Ordering::*;
            match operator.as_str() {
                "version_gt" => ordering == Greater,
                "version_gte" => ordering != Less,
                "version_lt" => ordering == Less,
                "version_lte" => ordering != Greater,
                "version_eq" => ordering == Equal,
                _ => ordering != Equal,
            }
        }

        "any" | "none" | "any_case_sensitive" | "none_case_sensitive" => {
            let case_sensitive = operator.ends_with("case_sensitive");
            let found = value
                .and_then(DynamicValue::to_comparable_string)
                .map(|v| {
                    target_strings(target)
                        .iter()
                        .any(|t| eq_str(&v, t, case_sensitive))
                })
                .unwrap_or(false);
            if operator.starts_with("any") {
                found
            } else {
                !found
            }
        }

        "str_starts_with_any" | "str_ends_with_any" | "str_contains_any"
        | "str_contains_none" => {
            let Some(v) = value.and_then(DynamicValue::to_comparable_string) else {
                return Some(operator == "str_contains_none");
            };
            let v = v.to_lowercase();
            let targets = target_strings(target);
            let mut candidates = targets.iter().map(|t| t.to_lowercase());
            match operator.as_str() {
                "str_starts_with_any" => candidates.any(|t| v.starts_with(&t)),
                "str_ends_with_any" => candidates.any(|t| v.ends_with(&t)),
                "str_contains_any" => candidates.any(|t| v.contains(&t)),
                _ => !candidates.any(|t| v.contains(&t)),
            }
        }

        "str_matches" => {
            let (Some(v), Some(pattern)) = (
                value.and_then(DynamicValue::to_comparable_string),
                target.and_then(DynamicValue::as_str),
            ) else {
                return Some(false);
            };
            compiled
                .get_or_compile(pattern)
                .is_some_and(|regex| regex.is_match(&v))
        }

        "eq" => value.unwrap_or(&DynamicValue::Null) == target.unwrap_or(&DynamicValue::Null),
        "neq" => value.unwrap_or(&DynamicValue::Null) != target.unwrap_or(&DynamicValue::Null),

        "before" | "after" | "on" => {
            let (Some(v), Some(t)) = (value.and_then(to_time), target.and_then(to_time)) else {
                return Some(false);
            };
            match operator.as_str() {
                "before" => v < t,
                "after" => v > t,
                _ => v.date_naive() == t.date_naive(),
            }
        }

        "in_segment_list" | "not_in_segment_list" => {
            let list_name = target.and_then(DynamicValue::as_str)?;
            let contained = match (
                value.and_then(DynamicValue::to_comparable_string),
                ctx.snapshot.get_id_list(list_name),
            ) {
                (Some(v), Some(list)) => list.contains(&v),
                _ => false,
            };
            if operator == "in_segment_list" {
                contained
            } else {
                !contained
            }
        }

        "array_contains_any" | "array_contains_none" | "array_contains_all"
        | "not_array_contains_all" => {
            let Some(values) = value.and_then(DynamicValue::as_array) else {
                return Some(operator == "array_contains_none");
            };
            let values = values
                .iter()
                .filter_map(DynamicValue::to_comparable_string)
                .collect::<Vec<_>>();
            let targets = target_strings(target);
            let contains = |t: &String| values.iter().any(|v| v == t);
            match operator.as_str() {
                "array_contains_any" => targets.iter().any(contains),
                "array_contains_none" => !targets.iter().any(contains),
                "array_contains_all" => targets.iter().all(contains),
                _ => !targets.iter().all(contains),
            }
        }

        _ => {
            log::debug!(target: "featuregate", operator:display = operator; "unsupported operator");
            return None;
        }
    })
}

fn target_strings(target: Option<&DynamicValue>) -> Vec<String> {
    match target {
        Some(DynamicValue::Array(items)) => items
            .iter()
            .filter_map(DynamicValue::to_comparable_string)
            .collect(),
        Some(single) => single.to_comparable_string().into_iter().collect(),
        None => Vec::new(),
    }
}

fn eq_str(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
    }
}

/// Compare two versions. Full semver strings use semver ordering; otherwise the dot-separated
/// numeric parts before any `-` suffix are compared, padding the shorter one with zeros.
fn compare_versions(a: &str, b: &str) -> Option<std::cmp::Ordering> {
    if let (Ok(a), Ok(b)) = (Version::parse(a), Version::parse(b)) {
        return Some(a.cmp(&b));
    }
    fn parts(v: &str) -> Option<Vec<u64>> {
        let core = v.split('-').next()?.trim();
        if core.is_empty() {
            return None;
        }
        core.split('.').map(|p| p.parse().ok()).collect()
    }
    let (mut a, mut b) = (parts(a)?, parts(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}

/// Timestamps are milliseconds, or seconds when small enough to be a plausible unix time in
/// seconds. Strings may also be RFC 3339.
fn to_time(value: &DynamicValue) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    let raw = value.to_comparable_f64()? as i64;
    let millis = if raw.abs() < 100_000_000_000 {
        raw * 1000
    } else {
        raw
    };
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        eval::{evaluator::EvalContext, MetadataProviders},
        specs::store::StoreSnapshot,
        User,
    };

    fn check(operator: &str, value: Option<DynamicValue>, target: DynamicValue) -> Option<bool> {
        let snapshot = StoreSnapshot::default();
        let user = User::default();
        let providers = MetadataProviders::default();
        let ctx = EvalContext::new(&user, &snapshot, &providers);
        apply_operator(
            &ctx,
            operator,
            value.as_ref(),
            Some(&target),
            &CompiledPattern::default(),
        )
    }

    fn list(items: &[&str]) -> DynamicValue {
        DynamicValue::Array(items.iter().map(|s| DynamicValue::from(*s)).collect())
    }

    #[test]
    fn numeric_comparisons() {
        assert_eq!(check("gt", Some(19i64.into()), 18i64.into()), Some(true));
        assert_eq!(check("gte", Some("18".into()), 18i64.into()), Some(true));
        assert_eq!(check("lt", Some(18i64.into()), 18i64.into()), Some(false));
        assert_eq!(check("lte", None, 18i64.into()), Some(false));
    }

    #[test]
    fn version_comparisons() {
        assert_eq!(check("version_gt", Some("1.10.0".into()), "1.2.0".into()), Some(true));
        assert_eq!(check("version_gte", Some("1.2".into()), "1.2.0".into()), Some(true));
        assert_eq!(check("version_lt", Some("1.2.0-beta".into()), "1.2.1".into()), Some(true));
        assert_eq!(check("version_eq", Some("2.0".into()), "2.0.0".into()), Some(true));
        assert_eq!(check("version_neq", Some("2.0.1".into()), "2.0.0".into()), Some(true));
        assert_eq!(check("version_gt", Some("abc".into()), "1.0".into()), Some(false));
    }

    #[test]
    fn set_membership() {
        let targets = list(&["US", "CA"]);
        assert_eq!(check("any", Some("us".into()), targets.clone()), Some(true));
        assert_eq!(check("any_case_sensitive", Some("us".into()), targets.clone()), Some(false));
        assert_eq!(check("none", Some("MX".into()), targets.clone()), Some(true));
        assert_eq!(check("none_case_sensitive", Some("us".into()), targets), Some(true));
        assert_eq!(check("any", Some(42i64.into()), list(&["42"])), Some(true));
    }

    #[test]
    fn string_operators() {
        assert_eq!(check("str_starts_with_any", Some("Hello".into()), list(&["he"])), Some(true));
        assert_eq!(check("str_ends_with_any", Some("a@corp.com".into()), list(&["@corp.com"])), Some(true));
        assert_eq!(check("str_contains_any", Some("abc".into()), list(&["x", "B"])), Some(true));
        assert_eq!(check("str_contains_none", Some("abc".into()), list(&["x"])), Some(true));
        assert_eq!(check("str_matches", Some("test@example.com".into()), "^test.*".into()), Some(true));
        assert_eq!(check("str_matches", Some("x".into()), "(".into()), Some(false));
    }

    #[test]
    fn str_matches_compiles_once_per_condition() {
        let condition: Condition = serde_json::from_value(serde_json::json!({
            "type": "user_field",
            "field": "email",
            "operator": "str_matches",
            "targetValue": "@example\\.com$",
        }))
        .unwrap();
        let snapshot = StoreSnapshot::default();
        let providers = MetadataProviders::default();
        let user = User {
            email: Some("dev@example.com".to_owned()),
            ..User::default()
        };
        let ctx = EvalContext::new(&user, &snapshot, &providers);

        for _ in 0..2 {
            let outcome = condition.eval(&ctx, 0, &mut RuleScratch::default());
            assert!(matches!(outcome, ConditionOutcome::Pass));
        }
        let compiled = condition.pattern.get_or_compile("unused").unwrap();
        assert_eq!(compiled.as_str(), "@example\\.com$");
    }

    #[test]
    fn time_operators() {
        let ms = 1_700_000_000_000i64;
        assert_eq!(check("before", Some(ms.into()), (ms + 1).into()), Some(true));
        assert_eq!(check("after", Some((ms / 1000 + 10).into()), ms.into()), Some(true));
        assert_eq!(check("on", Some(ms.into()), (ms + 1_000).into()), Some(true));
        assert_eq!(
            check("before", Some("2020-01-01T00:00:00Z".into()), ms.into()),
            Some(true)
        );
    }

    #[test]
    fn array_operators() {
        let user_value = Some(list(&["a", "b"]));
        assert_eq!(check("array_contains_any", user_value.clone(), list(&["b", "z"])), Some(true));
        assert_eq!(check("array_contains_none", user_value.clone(), list(&["z"])), Some(true));
        assert_eq!(check("array_contains_all", user_value.clone(), list(&["a", "b"])), Some(true));
        assert_eq!(check("not_array_contains_all", user_value, list(&["a", "z"])), Some(true));
    }

    #[test]
    fn equality_and_unknown() {
        assert_eq!(check("eq", Some("x".into()), "x".into()), Some(true));
        assert_eq!(check("neq", None, "x".into()), Some(true));
        assert_eq!(check("quantum_superposition", Some("x".into()), "x".into()), None);
    }
}
