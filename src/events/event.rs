use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    diagnostics::Marker,
    eval::{EvalResult, SecondaryExposure},
    sampling::{SamplingMode, SamplingStatus},
    DynamicValue, User,
};

pub const GATE_EXPOSURE_EVENT: &str = "statsig::gate_exposure";
pub const CONFIG_EXPOSURE_EVENT: &str = "statsig::config_exposure";
pub const LAYER_EXPOSURE_EVENT: &str = "statsig::layer_exposure";
pub const DIAGNOSTICS_EVENT: &str = "statsig::diagnostics";

/// An event queued for delivery. Exposure events are produced by evaluations; custom events come
/// from [`Client::log_event`](crate::Client::log_event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub event_name: String,
    /// Logged copy of the user, without private attributes.
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DynamicValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_exposures: Vec<SecondaryExposure>,
    /// Milliseconds since epoch.
    pub time: i64,
}

impl LogEvent {
    fn new(event_name: &str, user: &User) -> LogEvent {
        LogEvent {
            event_name: event_name.to_owned(),
            user: user.to_loggable(),
            value: None,
            metadata: BTreeMap::new(),
            secondary_exposures: Vec::new(),
            time: Utc::now().timestamp_millis(),
        }
    }

    /// Custom event logged by the application.
    pub fn custom(
        user: &User,
        event_name: &str,
        value: Option<DynamicValue>,
        metadata: BTreeMap<String, String>,
    ) -> LogEvent {
        LogEvent {
            value,
            metadata,
            ..LogEvent::new(event_name, user)
        }
    }

    pub fn gate_exposure(
        user: &User,
        gate_name: &str,
        result: &EvalResult,
        sampling: &SamplingStatus,
    ) -> LogEvent {
        let mut event = LogEvent::new(GATE_EXPOSURE_EVENT, user);
        event.metadata = BTreeMap::from([
            ("gate".to_owned(), gate_name.to_owned()),
            ("gateValue".to_owned(), result.bool_value.to_string()),
            ("ruleID".to_owned(), result.rule_id.clone()),
        ]);
        event.secondary_exposures = result.secondary_exposures.clone();
        event.annotate(result, sampling);
        event
    }

    pub fn config_exposure(
        user: &User,
        config_name: &str,
        result: &EvalResult,
        sampling: &SamplingStatus,
    ) -> LogEvent {
        let mut event = LogEvent::new(CONFIG_EXPOSURE_EVENT, user);
        event.metadata = BTreeMap::from([
            ("config".to_owned(), config_name.to_owned()),
            ("ruleID".to_owned(), result.rule_id.clone()),
            ("rulePassed".to_owned(), result.bool_value.to_string()),
        ]);
        event.secondary_exposures = result.secondary_exposures.clone();
        event.annotate(result, sampling);
        event
    }

    /// Exposure of one layer parameter. An explicit parameter belongs to the allocated experiment,
    /// so the delegate's exposures are logged; otherwise the layer's own exposures are.
    pub fn layer_exposure(
        user: &User,
        layer_name: &str,
        parameter_name: &str,
        result: &EvalResult,
        sampling: &SamplingStatus,
    ) -> LogEvent {
        let is_explicit = result
            .explicit_parameters
            .as_ref()
            .is_some_and(|params| params.iter().any(|p| p == parameter_name));
        let allocated_experiment = if is_explicit {
            result.config_delegate.clone().unwrap_or_default()
        } else {
            String::new()
        };

        let mut event = LogEvent::new(LAYER_EXPOSURE_EVENT, user);
        event.metadata = BTreeMap::from([
            ("config".to_owned(), layer_name.to_owned()),
            ("ruleID".to_owned(), result.rule_id.clone()),
            ("allocatedExperiment".to_owned(), allocated_experiment),
            ("parameterName".to_owned(), parameter_name.to_owned()),
            ("isExplicitParameter".to_owned(), is_explicit.to_string()),
        ]);
        event.secondary_exposures = if is_explicit {
            result.secondary_exposures.clone()
        } else {
            result
                .undelegated_secondary_exposures
                .clone()
                .unwrap_or_else(|| result.secondary_exposures.clone())
        };
        event.annotate(result, sampling);
        event
    }

    /// Buffered diagnostics markers for one context (e.g. `initialize`).
    pub fn diagnostics(context: &str, markers: &[Marker]) -> LogEvent {
        let mut event = LogEvent::new(DIAGNOSTICS_EVENT, &User::default());
        event.metadata = BTreeMap::from([
            ("context".to_owned(), context.to_owned()),
            (
                "markers".to_owned(),
                serde_json::to_string(markers).unwrap_or_default(),
            ),
        ]);
        event
    }

    fn annotate(&mut self, result: &EvalResult, sampling: &SamplingStatus) {
        if let Some(version) = result.config_version {
            self.metadata
                .insert("configVersion".to_owned(), version.to_string());
        }
        if result.from_persisted {
            self.metadata
                .insert("reason".to_owned(), "Persisted".to_owned());
        }
        if let Some(device) = &result.derived_device_metadata {
            if let Ok(json) = serde_json::to_string(device) {
                self.metadata.insert("deviceMetadata".to_owned(), json);
            }
        }
        if sampling.mode == SamplingMode::Off {
            return;
        }
        self.metadata.insert(
            "samplingMode".to_owned(),
            match sampling.mode {
                SamplingMode::On => "on",
                SamplingMode::Shadow => "shadow",
                SamplingMode::Off => "off",
            }
            .to_owned(),
        );
        if let Some(rate) = sampling.sampling_rate {
            self.metadata
                .insert("samplingRate".to_owned(), rate.to_string());
        }
        if let Some(logged) = sampling.shadow_logged {
            self.metadata.insert(
                "shadowLogged".to_owned(),
                if logged { "logged" } else { "dropped" }.to_owned(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_result() -> EvalResult {
        EvalResult {
            rule_id: "layer_rule".to_owned(),
            config_delegate: Some("exp".to_owned()),
            explicit_parameters: Some(vec!["color".to_owned()]),
            secondary_exposures: vec![SecondaryExposure::new("exp_gate", true, "r1")],
            undelegated_secondary_exposures: Some(vec![SecondaryExposure::new(
                "layer_gate",
                false,
                "r2",
            )]),
            ..EvalResult::default()
        }
    }

    #[test]
    fn gate_exposure_metadata() {
        let user = User::with_user_id("123").with_private_attribute("email", "x@y.z");
        let result = EvalResult {
            bool_value: true,
            rule_id: "rule".to_owned(),
            config_version: Some(3),
            ..EvalResult::default()
        };
        let event = LogEvent::gate_exposure(&user, "g", &result, &SamplingStatus::default());

        assert_eq!(event.event_name, GATE_EXPOSURE_EVENT);
        assert_eq!(event.metadata["gate"], "g");
        assert_eq!(event.metadata["gateValue"], "true");
        assert_eq!(event.metadata["ruleID"], "rule");
        assert_eq!(event.metadata["configVersion"], "3");
        assert!(!event.metadata.contains_key("samplingMode"));
        assert!(event.user.private_attributes.is_empty());
    }

    #[test]
    fn layer_exposure_picks_exposures_by_parameter() {
        let user = User::with_user_id("123");
        let result = layer_result();

        let explicit =
            LogEvent::layer_exposure(&user, "layer", "color", &result, &SamplingStatus::default());
        assert_eq!(explicit.metadata["allocatedExperiment"], "exp");
        assert_eq!(explicit.metadata["isExplicitParameter"], "true");
        assert_eq!(explicit.secondary_exposures[0].gate, "exp_gate");

        let implicit =
            LogEvent::layer_exposure(&user, "layer", "size", &result, &SamplingStatus::default());
        assert_eq!(implicit.metadata["allocatedExperiment"], "");
        assert_eq!(implicit.metadata["isExplicitParameter"], "false");
        assert_eq!(implicit.secondary_exposures[0].gate, "layer_gate");
    }

    #[test]
    fn shadow_annotations() {
        let sampling = SamplingStatus {
            should_log: true,
            sampling_rate: Some(101),
            shadow_logged: Some(false),
            mode: SamplingMode::Shadow,
        };
        let event = LogEvent::config_exposure(
            &User::with_user_id("1"),
            "c",
            &EvalResult::default(),
            &sampling,
        );
        assert_eq!(event.metadata["samplingMode"], "shadow");
        assert_eq!(event.metadata["samplingRate"], "101");
        assert_eq!(event.metadata["shadowLogged"], "dropped");
    }
}
