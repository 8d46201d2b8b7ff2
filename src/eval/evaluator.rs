use chrono::{DateTime, Utc};

use crate::{
    eval::{
        conditions::{ConditionOutcome, RuleScratch},
        result::{rule_ids, EvalResult},
        MetadataProviders,
    },
    hashing::passes_percentage,
    persisted::UserPersistedValues,
    specs::{
        models::{EntityKind, Rule, Spec},
        store::StoreSnapshot,
    },
    User,
};

/// Bound on nested gate/segment/delegate references. Deeper references evaluate as no match.
pub const MAX_DEPTH: u16 = 20;

/// Everything an evaluation may look at. Holding one context for a whole call gives a consistent
/// view even if the store is swapped concurrently.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub user: &'a User,
    pub snapshot: &'a StoreSnapshot,
    pub providers: &'a MetadataProviders,
    /// Application the calling key is scoped to, for `target_app` conditions.
    pub app_id: Option<&'a str>,
    /// Sticky values of the user under the evaluated spec's id type.
    pub persisted_values: Option<&'a UserPersistedValues>,
    pub ignore_persistence: bool,
    pub now: DateTime<Utc>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        user: &'a User,
        snapshot: &'a StoreSnapshot,
        providers: &'a MetadataProviders,
    ) -> EvalContext<'a> {
        EvalContext {
            user,
            snapshot,
            providers,
            app_id: snapshot.specs.app_id.as_deref(),
            persisted_values: None,
            ignore_persistence: false,
            now: Utc::now(),
        }
    }

    pub fn with_app_id(mut self, app_id: Option<&'a str>) -> Self {
        if app_id.is_some() {
            self.app_id = app_id;
        }
        self
    }

    pub fn with_persisted_values(mut self, values: Option<&'a UserPersistedValues>) -> Self {
        self.persisted_values = values;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Evaluate `spec` for the context's user.
///
/// Rules are walked in order and the first rule whose conditions all pass decides the result.
/// Experiments and layers with a pinned value replay it instead, unless persistence is ignored.
pub fn evaluate(ctx: &EvalContext, spec: &Spec, depth: u16) -> EvalResult {
    if depth > MAX_DEPTH {
        log::warn!(target: "featuregate",
                   name = spec.name.as_str(),
                   depth;
                   "nesting depth exceeded, treating as no match");
        let mut result = EvalResult::default_for(rule_ids::DEFAULT, &spec.default_value);
        apply_spec_fields(ctx, spec, &mut result);
        return result;
    }

    if let Some(mut replayed) = replay_persisted(ctx, spec) {
        replayed.id_type = spec.id_type.clone();
        replayed.is_in_layer = spec.entity != EntityKind::Layer
            && ctx.snapshot.specs.experiment_to_layer.contains_key(&spec.name);
        return replayed;
    }

    let mut result = evaluate_rules(ctx, spec, depth);
    apply_spec_fields(ctx, spec, &mut result);

    log::trace!(target: "featuregate",
                name = spec.name.as_str(),
                rule_id = result.rule_id.as_str(),
                value = result.bool_value;
                "evaluated a spec");
    result
}

fn evaluate_rules(ctx: &EvalContext, spec: &Spec, depth: u16) -> EvalResult {
    if !spec.enabled {
        return EvalResult::default_for(rule_ids::DISABLED, &spec.default_value);
    }

    let mut scratch = RuleScratch::default();
    for rule in &spec.rules {
        match rule_matches(ctx, rule, depth, &mut scratch) {
            ConditionOutcome::Fail => continue,
            ConditionOutcome::Unsupported => {
                let mut result = EvalResult::default_for(&rule.id, &spec.default_value);
                result.unsupported = true;
                result.secondary_exposures = scratch.secondary_exposures;
                result.derived_device_metadata = scratch.derived_device_metadata;
                return result;
            }
            ConditionOutcome::Pass => {}
        }

        if let Some(delegated) = evaluate_delegate(ctx, rule, depth, &scratch) {
            return delegated;
        }

        let salt = format!("{}.{}", spec.salt, rule.salt.as_deref().unwrap_or(&rule.id));
        let unit_id = ctx.user.get_unit_id(&rule.id_type).unwrap_or_default();
        let pass = passes_percentage(&salt, unit_id, rule.pass_percentage);

        return EvalResult {
            bool_value: pass,
            json_value: Some(if pass {
                rule.return_value.clone()
            } else {
                spec.default_value.clone()
            }),
            rule_id: rule.id.clone(),
            group_name: rule.group_name.clone(),
            is_experiment_group: rule.is_experiment_group.unwrap_or(false),
            sampling_rate: rule.sampling_rate,
            secondary_exposures: scratch.secondary_exposures,
            derived_device_metadata: scratch.derived_device_metadata,
            ..EvalResult::default()
        };
    }

    let mut result = EvalResult::default_for(rule_ids::DEFAULT, &spec.default_value);
    result.secondary_exposures = scratch.secondary_exposures;
    result.derived_device_metadata = scratch.derived_device_metadata;
    result
}

/// All conditions of a rule must pass. Failing conditions do not stop the walk, so every gate the
/// rule consults is recorded; an unsupported condition does.
fn rule_matches(
    ctx: &EvalContext,
    rule: &Rule,
    depth: u16,
    scratch: &mut RuleScratch,
) -> ConditionOutcome {
    let mut outcome = ConditionOutcome::Pass;
    for condition in &rule.conditions {
        match condition.eval(ctx, depth, scratch) {
            ConditionOutcome::Pass => {}
            ConditionOutcome::Fail => outcome = ConditionOutcome::Fail,
            ConditionOutcome::Unsupported => return ConditionOutcome::Unsupported,
        }
    }
    outcome
}

/// Resolve a layer rule that hands allocation over to an experiment.
fn evaluate_delegate(
    ctx: &EvalContext,
    rule: &Rule,
    depth: u16,
    scratch: &RuleScratch,
) -> Option<EvalResult> {
    let delegate_name = rule.config_delegate.as_deref()?;
    let delegate = ctx.snapshot.get_dynamic_config(delegate_name)?;

    let mut result = evaluate(ctx, delegate, depth + 1);
    let mut exposures = scratch.secondary_exposures.clone();
    exposures.append(&mut result.secondary_exposures);

    result.undelegated_secondary_exposures = Some(scratch.secondary_exposures.clone());
    result.secondary_exposures = exposures;
    result.config_delegate = Some(delegate_name.to_owned());
    result.explicit_parameters = delegate.explicit_parameters.clone();
    result.is_experiment_active = delegate.is_active.unwrap_or(false);
    result.is_in_layer = true;
    if result.derived_device_metadata.is_none() {
        result.derived_device_metadata = scratch.derived_device_metadata.clone();
    }
    Some(result)
}

fn apply_spec_fields(ctx: &EvalContext, spec: &Spec, result: &mut EvalResult) {
    result.id_type = spec.id_type.clone();
    result.config_version = spec.version;
    result.is_device_based = spec.is_device_based;
    result.forward_all_exposures |= spec.forward_all_exposures;
    result.has_seen_analytical_gates |= spec.has_seen_analytical_gates;

    if result.config_delegate.is_none() {
        if result.explicit_parameters.is_none() {
            result.explicit_parameters = spec.explicit_parameters.clone();
        }
        result.is_experiment_active = spec.is_active.unwrap_or(false);
        result.is_in_layer = ctx.snapshot.specs.experiment_to_layer.contains_key(&spec.name);
    }
}

/// Pinned value of `spec`, if it is sticky-eligible and one is stored.
fn replay_persisted(ctx: &EvalContext, spec: &Spec) -> Option<EvalResult> {
    if ctx.ignore_persistence {
        return None;
    }
    let sticky = ctx.persisted_values?.get(&spec.name)?;

    let still_active = match spec.entity {
        kind if kind.is_experiment_like() => spec.is_active.unwrap_or(false),
        EntityKind::Layer => sticky
            .config_delegate
            .as_deref()
            .and_then(|delegate| ctx.snapshot.get_dynamic_config(delegate))
            .and_then(|delegate| delegate.is_active)
            .unwrap_or(false),
        _ => false,
    };
    if !still_active {
        return None;
    }

    log::trace!(target: "featuregate",
                name = spec.name.as_str(),
                rule_id = sticky.rule_id.as_str();
                "replaying persisted value");
    let mut result = EvalResult::from_sticky(sticky);
    result.is_device_based = spec.is_device_based;
    result.forward_all_exposures = spec.forward_all_exposures;
    result.has_seen_analytical_gates = spec.has_seen_analytical_gates;
    Some(result)
}
