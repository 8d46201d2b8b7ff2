use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::DynamicValue;

/// Specification document. This is the response format of the `download_config_specs` endpoint,
/// and also the bootstrap and data adapter format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecsResponse {
    /// Feature gates. Segments and holdouts are served in this list too.
    #[serde(default)]
    pub feature_gates: Vec<TryParse<Spec>>,
    /// Dynamic configs, experiments and autotunes.
    #[serde(default)]
    pub dynamic_configs: Vec<TryParse<Spec>>,
    #[serde(default)]
    pub layer_configs: Vec<TryParse<Spec>>,
    #[serde(default)]
    pub cmab_configs: Vec<TryParse<CmabSpec>>,
    /// Layer name to the names of experiments allocated in it.
    #[serde(default)]
    pub layers: HashMap<String, Vec<String>>,
    /// Names of id lists available for download.
    #[serde(default)]
    pub id_lists: HashMap<String, bool>,
    #[serde(default)]
    pub has_updates: bool,
    /// Server cut time (milliseconds).
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub sdk_keys_to_app_ids: HashMap<String, String>,
    #[serde(default)]
    pub hashed_sdk_keys_to_app_ids: HashMap<String, String>,
    #[serde(default)]
    pub hashed_sdk_keys_to_entities: HashMap<String, KeyEntities>,
    #[serde(default)]
    pub session_replay_info: Option<SessionReplayInfo>,
    #[serde(default)]
    pub sdk_configs: HashMap<String, serde_json::Value>,
    /// Diagnostics sampling rates by context.
    #[serde(default)]
    pub diagnostics: HashMap<String, f64>,
}

impl SpecsResponse {
    pub fn from_json(json: &str) -> crate::Result<SpecsResponse> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Entities a (hashed) client key is allowed to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyEntities {
    #[serde(default)]
    pub gates: Vec<String>,
    #[serde(default)]
    pub configs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionReplayInfo {
    #[serde(default)]
    pub sampling_rate: Option<f64>,
    #[serde(default)]
    pub recording_blocked: Option<bool>,
    #[serde(default)]
    pub targeting_gate: Option<String>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// If one spec uses a format this version does not understand, the rest of the document is
/// still usable.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Kind of entity a [`Spec`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    FeatureGate,
    DynamicConfig,
    Experiment,
    Autotune,
    Layer,
    Segment,
    Holdout,
    Cmab,
}

impl EntityKind {
    /// Experiments and autotunes carry group semantics and may be sticky.
    pub fn is_experiment_like(&self) -> bool {
        matches!(self, EntityKind::Experiment | EntityKind::Autotune)
    }
}

/// A gate, config, experiment, autotune, layer, segment or holdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub name: String,
    pub entity: EntityKind,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub default_value: DynamicValue,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default, rename = "targetAppIDs")]
    pub target_app_ids: Option<Vec<String>>,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub has_shared_params: Option<bool>,
    #[serde(default)]
    pub is_device_based: bool,
    /// Every exposure for this spec must reach the event queue.
    #[serde(default)]
    pub forward_all_exposures: bool,
    /// Spec is used in analytics that cannot tolerate sampling.
    #[serde(default)]
    pub has_seen_analytical_gates: bool,
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    pub pass_percentage: f64,
    #[serde(default)]
    pub return_value: DynamicValue,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub is_experiment_group: Option<bool>,
    #[serde(default)]
    pub is_control_group: Option<bool>,
    /// Experiment this layer rule delegates to.
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub sampling_rate: Option<u64>,
}

/// `Condition` is a check that a field of the user (or environment) matches `target_value` under
/// the given operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub target_value: Option<DynamicValue>,
    #[serde(default)]
    pub additional_values: Option<HashMap<String, DynamicValue>>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    /// `target_value` compiled for `str_matches`, on first use.
    #[serde(skip)]
    pub(crate) pattern: CompiledPattern,
}

/// Lazily compiled regex of a condition. `None` inside when the pattern is invalid.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledPattern(OnceLock<Option<Regex>>);

impl CompiledPattern {
    pub(crate) fn get_or_compile(&self, pattern: &str) -> Option<&Regex> {
        self.0.get_or_init(|| Regex::new(pattern).ok()).as_ref()
    }
}

impl PartialEq for CompiledPattern {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// Contextual multi-armed bandit: picks one of several groups (arms) by scoring the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmabSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub salt: String,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub default_value: DynamicValue,
    #[serde(default, rename = "targetAppIDs")]
    pub target_app_ids: Option<Vec<String>>,
    #[serde(default)]
    pub groups: Vec<CmabGroup>,
    /// Model per group id.
    #[serde(default)]
    pub config: HashMap<String, CmabGroupConfig>,
    #[serde(default = "default_true")]
    pub higher_is_better: bool,
    /// Gate a user must pass to enter the bandit.
    #[serde(default)]
    pub targeting_gate_name: Option<String>,
    /// Share (0-100) of users assigned to a random arm.
    #[serde(default)]
    pub exploration_percentage: f64,
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmabGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameter_values: DynamicValue,
}

/// Linear model of one arm: `intercept + sum(weight * feature)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmabGroupConfig {
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub weights_numerical: HashMap<String, f64>,
    /// Field name to (field value to weight).
    #[serde(default)]
    pub weights_categorical: HashMap<String, HashMap<String, f64>>,
}

fn default_id_type() -> String {
    "userID".to_owned()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use super::*;

    #[test]
    fn parse_fixture() {
        let f = File::open("tests/data/download_config_specs.json")
            .expect("Failed to open tests/data/download_config_specs.json");
        let specs: SpecsResponse = serde_json::from_reader(BufReader::new(f)).unwrap();
        assert!(specs.has_updates);
        assert!(!specs.feature_gates.is_empty());
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let specs = SpecsResponse::from_json(
            r#"
              {
                "feature_gates": [
                  {"name": "ok", "entity": "feature_gate", "rules": []},
                  {"name": "broken", "entity": "quantum_gate", "rules": []}
                ],
                "has_updates": true,
                "time": 1
              }
            "#,
        )
        .unwrap();
        assert!(matches!(specs.feature_gates[0], TryParse::Parsed(_)));
        assert!(
            matches!(specs.feature_gates[1], TryParse::ParseFailed(_)),
            "{:?} should match TryParse::ParseFailed(_)",
            specs.feature_gates[1]
        );
    }
}
