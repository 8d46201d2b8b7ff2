use serde::{Deserialize, Serialize};

use crate::{persisted::StickyValues, DynamicValue};

/// Record of a nested gate or segment consulted while evaluating a parent spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecondaryExposure {
    pub gate: String,
    #[serde(rename = "gateValue")]
    pub gate_value: String,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
}

impl SecondaryExposure {
    pub(crate) fn new(gate: &str, value: bool, rule_id: &str) -> SecondaryExposure {
        SecondaryExposure {
            gate: gate.to_owned(),
            gate_value: value.to_string(),
            rule_id: rule_id.to_owned(),
        }
    }
}

/// Device metadata derived from the user agent or ip while evaluating `ua_based`/`ip_based`
/// conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedDeviceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Rule ids that are not real rules.
pub mod rule_ids {
    pub const DEFAULT: &str = "default";
    pub const DISABLED: &str = "disabled";
    pub const OVERRIDE: &str = "local:override";
    pub const ID_OVERRIDE: &str = "local:id_override";

    /// Override results are always logged.
    pub fn is_override(rule_id: &str) -> bool {
        rule_id.ends_with(":override") || rule_id.ends_with(":id_override")
    }
}

/// Outcome of evaluating one spec for one user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalResult {
    pub bool_value: bool,
    pub json_value: Option<DynamicValue>,
    pub rule_id: String,
    pub group_name: Option<String>,
    pub id_type: String,
    pub secondary_exposures: Vec<SecondaryExposure>,
    /// Layer-level exposures, kept apart from the delegate's.
    pub undelegated_secondary_exposures: Option<Vec<SecondaryExposure>>,
    /// Experiment a layer delegated to.
    pub config_delegate: Option<String>,
    pub explicit_parameters: Option<Vec<String>>,
    pub is_experiment_group: bool,
    pub is_experiment_active: bool,
    pub is_in_layer: bool,
    pub is_device_based: bool,
    pub sampling_rate: Option<u64>,
    pub forward_all_exposures: bool,
    pub has_seen_analytical_gates: bool,
    pub config_version: Option<u32>,
    /// A condition type or operator was not understood; the value is the default.
    pub unsupported: bool,
    /// Value was replayed from persisted storage.
    pub from_persisted: bool,
    pub derived_device_metadata: Option<DerivedDeviceMetadata>,
}

impl EvalResult {
    /// Result of a spec that matched no rule.
    pub(crate) fn default_for(rule_id: &str, default_value: &DynamicValue) -> EvalResult {
        EvalResult {
            rule_id: rule_id.to_owned(),
            json_value: Some(default_value.clone()),
            ..EvalResult::default()
        }
    }

    pub(crate) fn from_sticky(sticky: &StickyValues) -> EvalResult {
        EvalResult {
            bool_value: sticky.value,
            json_value: Some(sticky.json_value.clone()),
            rule_id: sticky.rule_id.clone(),
            group_name: sticky.group_name.clone(),
            secondary_exposures: sticky.secondary_exposures.clone(),
            undelegated_secondary_exposures: sticky.undelegated_secondary_exposures.clone(),
            config_delegate: sticky.config_delegate.clone(),
            explicit_parameters: sticky.explicit_parameters.clone(),
            config_version: sticky.config_version,
            is_experiment_group: true,
            is_experiment_active: true,
            from_persisted: true,
            ..EvalResult::default()
        }
    }

    pub(crate) fn to_sticky(&self, time: i64) -> StickyValues {
        StickyValues {
            value: self.bool_value,
            json_value: self.json_value.clone().unwrap_or_default(),
            rule_id: self.rule_id.clone(),
            group_name: self.group_name.clone(),
            secondary_exposures: self.secondary_exposures.clone(),
            undelegated_secondary_exposures: self.undelegated_secondary_exposures.clone(),
            config_delegate: self.config_delegate.clone(),
            explicit_parameters: self.explicit_parameters.clone(),
            config_version: self.config_version,
            time,
        }
    }

    /// Value as an object, `{}` when absent.
    pub fn value_or_empty(&self) -> DynamicValue {
        self.json_value
            .clone()
            .filter(|v| !v.is_null())
            .unwrap_or_else(DynamicValue::empty_object)
    }

    pub fn is_override(&self) -> bool {
        rule_ids::is_override(&self.rule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_markers() {
        assert!(rule_ids::is_override(rule_ids::OVERRIDE));
        assert!(rule_ids::is_override(rule_ids::ID_OVERRIDE));
        assert!(!rule_ids::is_override("6X3qJgyfwA81IJ2dxI7lYp"));
    }

    #[test]
    fn sticky_round_trip_keeps_group() {
        let result = EvalResult {
            bool_value: true,
            json_value: Some(DynamicValue::from("treatment")),
            rule_id: "rule".to_owned(),
            group_name: Some("Test".to_owned()),
            is_experiment_group: true,
            ..EvalResult::default()
        };
        let replayed = EvalResult::from_sticky(&result.to_sticky(0));
        assert!(replayed.from_persisted);
        assert_eq!(replayed.group_name.as_deref(), Some("Test"));
        assert_eq!(replayed.json_value, result.json_value);
    }
}
