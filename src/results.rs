//! Values returned by [`Client`](crate::Client) evaluation calls.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    eval::EvalResult,
    events::ExposureLogger,
    specs::store::{Specs, SpecsSource},
    DynamicValue, User,
};

/// Why an evaluation produced its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EvaluationReason {
    /// Evaluated against specs downloaded from the network.
    Network,
    /// Evaluated against the bootstrap document.
    Bootstrap,
    /// Evaluated against specs read from the data adapter.
    DataAdapter,
    /// No specs were available yet.
    Uninitialized,
    /// The entity does not exist in the active specs.
    Unrecognized,
    /// A local override supplied the value.
    LocalOverride,
    /// A sticky value was replayed.
    Persisted,
    /// Evaluation failed and the default was returned.
    Error,
}

impl From<SpecsSource> for EvaluationReason {
    fn from(source: SpecsSource) -> EvaluationReason {
        match source {
            SpecsSource::Network => EvaluationReason::Network,
            SpecsSource::Bootstrap => EvaluationReason::Bootstrap,
            SpecsSource::DataAdapter => EvaluationReason::DataAdapter,
            SpecsSource::Uninitialized => EvaluationReason::Uninitialized,
        }
    }
}

/// Details about an evaluation, useful for debugging.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetails {
    pub reason: EvaluationReason,
    /// Server time of the specs used.
    pub lcut: u64,
    /// When those specs were received. `None` before the first sync.
    pub received_at: Option<DateTime<Utc>>,
}

impl EvaluationDetails {
    pub(crate) fn new(reason: EvaluationReason, specs: &Specs) -> EvaluationDetails {
        EvaluationDetails {
            reason,
            lcut: specs.time,
            received_at: specs.received_at,
        }
    }

    pub(crate) fn error() -> EvaluationDetails {
        EvaluationDetails {
            reason: EvaluationReason::Error,
            lcut: 0,
            received_at: None,
        }
    }
}

/// Convert a parameter to the caller's type, `None` on mismatch.
fn typed<T: DeserializeOwned>(value: &DynamicValue) -> Option<T> {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| serde_json::from_value(value).ok())
}

fn get_param<T: DeserializeOwned>(value: &DynamicValue, param: &str, fallback: T) -> T {
    value.get(param).and_then(typed).unwrap_or(fallback)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGate {
    pub name: String,
    pub value: bool,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    pub details: EvaluationDetails,
}

impl FeatureGate {
    pub(crate) fn new(name: &str, result: &EvalResult, details: EvaluationDetails) -> FeatureGate {
        FeatureGate {
            name: name.to_owned(),
            value: result.bool_value,
            rule_id: result.rule_id.clone(),
            id_type: result.id_type.clone(),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfig {
    pub name: String,
    pub value: DynamicValue,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub group_name: Option<String>,
    pub id_type: String,
    pub details: EvaluationDetails,
}

impl DynamicConfig {
    pub(crate) fn new(name: &str, result: &EvalResult, details: EvaluationDetails) -> DynamicConfig {
        DynamicConfig {
            name: name.to_owned(),
            value: result.value_or_empty(),
            rule_id: result.rule_id.clone(),
            group_name: result.group_name.clone(),
            id_type: result.id_type.clone(),
            details,
        }
    }

    /// Typed parameter, or `fallback` if it is missing or of another type.
    ///
    /// ```
    /// # use featuregate::{DynamicConfig, DynamicValue};
    /// # fn f(config: DynamicConfig) {
    /// let limit: i64 = config.get("limit", 10);
    /// let label: String = config.get("label", "none".to_owned());
    /// # }
    /// ```
    pub fn get<T: DeserializeOwned>(&self, param: &str, fallback: T) -> T {
        get_param(&self.value, param, fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub name: String,
    pub value: DynamicValue,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub group_name: Option<String>,
    pub id_type: String,
    pub is_experiment_active: bool,
    pub is_user_in_experiment: bool,
    pub details: EvaluationDetails,
}

impl Experiment {
    pub(crate) fn new(name: &str, result: &EvalResult, details: EvaluationDetails) -> Experiment {
        Experiment {
            name: name.to_owned(),
            value: result.value_or_empty(),
            rule_id: result.rule_id.clone(),
            group_name: result.group_name.clone(),
            id_type: result.id_type.clone(),
            is_experiment_active: result.is_experiment_active,
            is_user_in_experiment: result.is_experiment_group,
            details,
        }
    }

    /// Typed parameter, or `fallback` if it is missing or of another type.
    pub fn get<T: DeserializeOwned>(&self, param: &str, fallback: T) -> T {
        get_param(&self.value, param, fallback)
    }
}

/// Evaluated layer. Reading a parameter with [`Layer::get`] logs a layer exposure for that
/// parameter; evaluating the layer alone does not.
#[derive(Clone)]
pub struct Layer {
    pub name: String,
    pub rule_id: String,
    pub group_name: Option<String>,
    /// Experiment the user was allocated to within the layer.
    pub allocated_experiment_name: Option<String>,
    pub value: DynamicValue,
    pub id_type: String,
    pub details: EvaluationDetails,
    user: User,
    result: EvalResult,
    exposures: Option<Arc<ExposureLogger>>,
}

impl Layer {
    pub(crate) fn new(
        name: &str,
        user: &User,
        result: EvalResult,
        details: EvaluationDetails,
        exposures: Option<Arc<ExposureLogger>>,
    ) -> Layer {
        Layer {
            name: name.to_owned(),
            rule_id: result.rule_id.clone(),
            group_name: result.group_name.clone(),
            allocated_experiment_name: result.config_delegate.clone(),
            value: result.value_or_empty(),
            id_type: result.id_type.clone(),
            details,
            user: user.clone(),
            result,
            exposures,
        }
    }

    /// Typed parameter, or `fallback` if it is missing or of another type. A present parameter is
    /// logged as exposed.
    pub fn get<T: DeserializeOwned>(&self, param: &str, fallback: T) -> T {
        let Some(value) = self.value.get(param) else {
            return fallback;
        };
        self.log_parameter_exposure(param);
        typed(value).unwrap_or(fallback)
    }

    /// Raw parameter value. A present parameter is logged as exposed.
    pub fn get_value(&self, param: &str) -> Option<&DynamicValue> {
        let value = self.value.get(param)?;
        self.log_parameter_exposure(param);
        Some(value)
    }

    /// Whether `param` belongs to the allocated experiment.
    pub fn is_explicit_parameter(&self, param: &str) -> bool {
        self.result
            .explicit_parameters
            .as_ref()
            .is_some_and(|params| params.iter().any(|p| p == param))
    }

    fn log_parameter_exposure(&self, param: &str) {
        if let Some(exposures) = &self.exposures {
            exposures.log_layer_parameter(&self.user, &self.name, param, &self.result);
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("rule_id", &self.rule_id)
            .field("group_name", &self.group_name)
            .field("allocated_experiment_name", &self.allocated_experiment_name)
            .field("value", &self.value)
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(value: serde_json::Value) -> EvalResult {
        EvalResult {
            json_value: Some(value.into()),
            rule_id: "rule".to_owned(),
            config_delegate: Some("exp".to_owned()),
            explicit_parameters: Some(vec!["color".to_owned()]),
            ..EvalResult::default()
        }
    }

    #[test]
    fn typed_get_falls_back_on_mismatch() {
        let config = DynamicConfig::new(
            "c",
            &result(serde_json::json!({"limit": 5, "label": "x", "flags": [true]})),
            EvaluationDetails::error(),
        );
        assert_eq!(config.get("limit", 0i64), 5);
        assert_eq!(config.get("label", String::new()), "x");
        assert_eq!(config.get("flags", Vec::<bool>::new()), vec![true]);
        assert_eq!(config.get("limit", "fallback".to_owned()), "fallback");
        assert!(!config.get("missing", false));
    }

    #[test]
    fn layer_without_logger_reads_values() {
        let layer = Layer::new(
            "l",
            &User::with_user_id("u"),
            result(serde_json::json!({"color": "blue"})),
            EvaluationDetails::error(),
            None,
        );
        assert_eq!(layer.get("color", String::new()), "blue");
        assert_eq!(layer.allocated_experiment_name.as_deref(), Some("exp"));
        assert!(layer.is_explicit_parameter("color"));
        assert!(!layer.is_explicit_parameter("size"));
        assert!(layer.get_value("size").is_none());
    }

    #[test]
    fn reason_follows_specs_source() {
        assert_eq!(
            EvaluationReason::from(SpecsSource::Bootstrap),
            EvaluationReason::Bootstrap
        );
    }
}
