//! Bulk evaluation payload used to bootstrap client-side SDKs.
//!
//! Every entity the calling client key may see is evaluated for one user, its name is hashed, and
//! the result is rendered in the same shape the server renders for that key. Maps are ordered, so
//! the rendered JSON is stable byte for byte.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    eval::{evaluate, EvalContext, EvalResult, LocalOverrides, SecondaryExposure},
    hashing::{hash_name, HashAlgorithm},
    specs::{
        models::{EntityKind, KeyEntities, Spec},
        store::StoreSnapshot,
    },
    DynamicValue, User,
};

const GENERATOR: &str = "featuregate-rust";

/// Options of [`Client::get_client_initialize_response`](crate::Client::get_client_initialize_response).
#[derive(Debug, Clone, Default)]
pub struct ClientInitResponseOptions {
    /// Overrides the client's default name hashing.
    pub hash_algorithm: Option<HashAlgorithm>,
    /// Client key the payload is rendered for. Scopes entities and the target application.
    pub client_sdk_key: Option<String>,
    /// Render local overrides instead of evaluating overridden entities.
    pub include_local_overrides: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub name: String,
    pub value: bool,
    pub rule_id: String,
    pub id_type: String,
    pub secondary_exposures: Vec<SecondaryExposure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEvaluation {
    pub name: String,
    pub value: DynamicValue,
    pub rule_id: String,
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub is_device_based: bool,
    pub passed: bool,
    pub id_type: String,
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_user_in_experiment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_experiment_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_in_layer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit_parameters: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEvaluation {
    pub name: String,
    pub value: DynamicValue,
    pub rule_id: String,
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub is_device_based: bool,
    pub secondary_exposures: Vec<SecondaryExposure>,
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
    pub explicit_parameters: Vec<String>,
    /// Hashed name of the experiment the layer delegated to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_experiment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_user_in_experiment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_experiment_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedKeys {
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "customIDs")]
    pub custom_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInitResponse {
    pub feature_gates: BTreeMap<String, GateEvaluation>,
    pub dynamic_configs: BTreeMap<String, ConfigEvaluation>,
    pub layer_configs: BTreeMap<String, LayerEvaluation>,
    #[serde(rename = "sdkParams")]
    pub sdk_params: BTreeMap<String, serde_json::Value>,
    pub has_updates: bool,
    pub generator: String,
    pub evaluated_keys: EvaluatedKeys,
    /// Server time of the specs the payload was rendered from.
    pub time: u64,
    #[serde(rename = "sdkInfo")]
    pub sdk_info: BTreeMap<String, String>,
    pub user: User,
    pub hash_used: HashAlgorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_record_session: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_recording_rate: Option<f64>,
}

/// Render the payload for the context's user.
pub(crate) fn build(
    ctx: &EvalContext,
    overrides: Option<&LocalOverrides>,
    options: &ClientInitResponseOptions,
    default_hash: HashAlgorithm,
) -> ClientInitResponse {
    let snapshot = ctx.snapshot;
    let client_key = options.client_sdk_key.as_deref();
    let app_id = client_key
        .and_then(|key| snapshot.get_app_id_for_key(key))
        .or(snapshot.specs.app_id.as_deref());
    let ctx = ctx.clone().with_app_id(app_id);

    let renderer = Renderer {
        ctx: &ctx,
        overrides: overrides.filter(|_| options.include_local_overrides),
        hash: options.hash_algorithm.unwrap_or(default_hash),
        entities: client_key.and_then(|key| snapshot.get_entities_for_key(key)),
        app_id,
    };

    let feature_gates = sorted(&snapshot.specs.gates)
        .filter(|spec| !matches!(spec.entity, EntityKind::Segment | EntityKind::Holdout))
        .filter(|spec| renderer.is_visible(spec, |e| &e.gates))
        .map(|spec| renderer.gate(spec))
        .collect();
    let dynamic_configs = sorted(&snapshot.specs.configs)
        .filter(|spec| renderer.is_visible(spec, |e| &e.configs))
        .map(|spec| renderer.config(spec))
        .collect();
    let layer_configs = sorted(&snapshot.specs.layers)
        .filter(|spec| renderer.is_visible(spec, |e| &e.configs))
        .map(|spec| renderer.layer(spec))
        .collect();

    let (can_record_session, session_recording_rate) = renderer.session_replay();

    ClientInitResponse {
        feature_gates,
        dynamic_configs,
        layer_configs,
        sdk_params: BTreeMap::new(),
        has_updates: true,
        generator: GENERATOR.to_owned(),
        evaluated_keys: EvaluatedKeys {
            user_id: ctx.user.user_id.clone(),
            custom_ids: ctx.user.custom_ids.clone(),
        },
        time: snapshot.specs.time,
        sdk_info: BTreeMap::from([
            ("sdkType".to_owned(), env!("CARGO_PKG_NAME").to_owned()),
            ("sdkVersion".to_owned(), env!("CARGO_PKG_VERSION").to_owned()),
        ]),
        user: ctx.user.to_loggable(),
        hash_used: renderer.hash,
        can_record_session,
        session_recording_rate,
    }
}

fn sorted(
    specs: &std::collections::HashMap<String, std::sync::Arc<Spec>>,
) -> impl Iterator<Item = &Spec> {
    specs
        .iter()
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .map(|spec| spec.as_ref())
}

struct Renderer<'a> {
    ctx: &'a EvalContext<'a>,
    overrides: Option<&'a LocalOverrides>,
    hash: HashAlgorithm,
    entities: Option<&'a KeyEntities>,
    app_id: Option<&'a str>,
}

impl Renderer<'_> {
    fn is_visible(&self, spec: &Spec, allowed: impl Fn(&KeyEntities) -> &Vec<String>) -> bool {
        if let Some(app_id) = self.app_id {
            let targeted = spec
                .target_app_ids
                .as_ref()
                .is_some_and(|apps| apps.iter().any(|app| app == app_id));
            if !targeted {
                return false;
            }
        }
        self.entities
            .map_or(true, |entities| allowed(entities).contains(&spec.name))
    }

    fn hashed(&self, name: &str) -> String {
        hash_name(self.hash, name)
    }

    fn hashed_exposures(&self, exposures: &[SecondaryExposure]) -> Vec<SecondaryExposure> {
        exposures
            .iter()
            .map(|exposure| SecondaryExposure {
                gate: self.hashed(&exposure.gate),
                ..exposure.clone()
            })
            .collect()
    }

    fn gate(&self, spec: &Spec) -> (String, GateEvaluation) {
        let result = self
            .overrides
            .and_then(|o| o.gate_override(self.ctx.user, &spec.name))
            .unwrap_or_else(|| evaluate(self.ctx, spec, 0));
        let name = self.hashed(&spec.name);
        let gate = GateEvaluation {
            name: name.clone(),
            value: result.bool_value,
            rule_id: result.rule_id,
            id_type: spec.id_type.clone(),
            secondary_exposures: self.hashed_exposures(&result.secondary_exposures),
        };
        (name, gate)
    }

    fn config(&self, spec: &Spec) -> (String, ConfigEvaluation) {
        let result = self
            .overrides
            .and_then(|o| o.config_override(self.ctx.user, &spec.name))
            .unwrap_or_else(|| evaluate(self.ctx, spec, 0));

        let mut value = result.value_or_empty();
        let layer = self.ctx.snapshot.specs.experiment_to_layer.get(&spec.name);
        if let Some(layer) = layer.and_then(|name| self.ctx.snapshot.get_layer_config(name)) {
            value = layer.default_value.merged_with(&value);
        }

        let experiment_like = spec.entity.is_experiment_like();
        let name = self.hashed(&spec.name);
        let config = ConfigEvaluation {
            name: name.clone(),
            value,
            group: result.rule_id.clone(),
            rule_id: result.rule_id.clone(),
            group_name: result.group_name.clone(),
            is_device_based: result.is_device_based,
            passed: result.bool_value,
            id_type: spec.id_type.clone(),
            secondary_exposures: self.hashed_exposures(&result.secondary_exposures),
            is_user_in_experiment: experiment_like.then_some(result.is_experiment_group),
            is_experiment_active: experiment_like.then_some(result.is_experiment_active),
            is_in_layer: experiment_like.then_some(result.is_in_layer),
            explicit_parameters: experiment_like
                .then(|| result.explicit_parameters.clone().unwrap_or_default()),
        };
        (name, config)
    }

    fn layer(&self, spec: &Spec) -> (String, LayerEvaluation) {
        let result: EvalResult = self
            .overrides
            .and_then(|o| o.layer_override(self.ctx.user, &spec.name))
            .unwrap_or_else(|| evaluate(self.ctx, spec, 0));

        let delegated = result.config_delegate.is_some();
        let undelegated = result
            .undelegated_secondary_exposures
            .as_deref()
            .unwrap_or(&result.secondary_exposures);
        let name = self.hashed(&spec.name);
        let layer = LayerEvaluation {
            name: name.clone(),
            value: result.value_or_empty(),
            group: result.rule_id.clone(),
            rule_id: result.rule_id.clone(),
            group_name: result.group_name.clone(),
            is_device_based: result.is_device_based,
            secondary_exposures: self.hashed_exposures(&result.secondary_exposures),
            undelegated_secondary_exposures: self.hashed_exposures(undelegated),
            explicit_parameters: result.explicit_parameters.clone().unwrap_or_default(),
            allocated_experiment_name: result
                .config_delegate
                .as_deref()
                .map(|delegate| self.hashed(delegate)),
            is_user_in_experiment: delegated.then_some(result.is_experiment_group),
            is_experiment_active: delegated.then_some(result.is_experiment_active),
        };
        (name, layer)
    }

    /// Whether the user may be recorded, and at which rate.
    fn session_replay(&self) -> (Option<bool>, Option<f64>) {
        let Some(info) = &self.ctx.snapshot.specs.session_replay_info else {
            return (None, None);
        };
        if info.recording_blocked.unwrap_or(false) {
            return (Some(false), None);
        }
        let targeted = info.targeting_gate.as_deref().map_or(true, |gate| {
            self.ctx
                .snapshot
                .get_gate(gate)
                .is_some_and(|spec| evaluate(self.ctx, spec, 0).bool_value)
        });
        (Some(targeted), info.sampling_rate.filter(|_| targeted))
    }
}
