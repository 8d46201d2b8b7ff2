use std::cmp::Ordering;

use crate::{
    eval::{
        conditions::{eval_gate_reference, RuleScratch},
        evaluator::EvalContext,
        result::{rule_ids, EvalResult},
    },
    hashing::{bucket, Bucketer, Sha256Bucketer, TOTAL_BUCKETS},
    specs::models::{CmabGroup, CmabGroupConfig, CmabSpec},
    User,
};

/// Pick an arm of a contextual bandit for the context's user.
///
/// Users outside the targeting gate get the default value. A share of users given by
/// `exploration_percentage` is spread over arms at random; everyone else gets the arm whose
/// linear model scores best.
pub fn evaluate_cmab(ctx: &EvalContext, cmab: &CmabSpec, depth: u16) -> EvalResult {
    let mut result = select_arm(ctx, cmab, depth);
    result.id_type = cmab.id_type.clone();
    result.config_version = cmab.version;
    result
}

fn select_arm(ctx: &EvalContext, cmab: &CmabSpec, depth: u16) -> EvalResult {
    if !cmab.enabled {
        return EvalResult::default_for(rule_ids::DISABLED, &cmab.default_value);
    }

    let mut scratch = RuleScratch::default();
    if let Some(gate) = cmab.targeting_gate_name.as_deref() {
        let targeting = eval_gate_reference(ctx, gate, depth, &mut scratch);
        if !targeting.bool_value {
            let mut result = EvalResult::default_for(rule_ids::DEFAULT, &cmab.default_value);
            result.secondary_exposures = scratch.secondary_exposures;
            return result;
        }
    }
    if cmab.groups.is_empty() {
        let mut result = EvalResult::default_for(rule_ids::DEFAULT, &cmab.default_value);
        result.secondary_exposures = scratch.secondary_exposures;
        return result;
    }

    let unit_id = ctx.user.get_unit_id(&cmab.id_type).unwrap_or_default();
    let explore_threshold = cmab.exploration_percentage * (TOTAL_BUCKETS as f64 / 100.0);
    let explore = (bucket(&format!("{}.explore", cmab.salt), unit_id) as f64) < explore_threshold
        || cmab.groups.iter().any(|g| !cmab.config.contains_key(&g.id));

    let (group, rule_id) = if explore {
        let index = Sha256Bucketer.get_bucket(
            format!("{}.group.{unit_id}", cmab.salt),
            cmab.groups.len() as u64,
        ) as usize;
        let group = &cmab.groups[index];
        (group, format!("{}:explore", group.id))
    } else {
        let group = best_group(cmab, ctx.user);
        (group, group.id.clone())
    };

    EvalResult {
        bool_value: true,
        json_value: Some(group.parameter_values.clone()),
        rule_id,
        group_name: Some(group.name.clone()),
        is_experiment_group: true,
        is_experiment_active: true,
        secondary_exposures: scratch.secondary_exposures,
        ..EvalResult::default()
    }
}

fn best_group<'a>(cmab: &'a CmabSpec, user: &User) -> &'a CmabGroup {
    let direction = if cmab.higher_is_better {
        Ordering::Greater
    } else {
        Ordering::Less
    };

    let mut best = &cmab.groups[0];
    let mut best_score = score(cmab.config.get(&best.id), user);
    for group in &cmab.groups[1..] {
        let candidate = score(cmab.config.get(&group.id), user);
        // Ties keep the earlier group.
        if f64::total_cmp(&candidate, &best_score) == direction {
            best = group;
            best_score = candidate;
        }
    }
    best
}

fn score(model: Option<&CmabGroupConfig>, user: &User) -> f64 {
    let Some(model) = model else {
        return 0.0;
    };

    let numerical: f64 = model
        .weights_numerical
        .iter()
        .filter_map(|(field, weight)| {
            user.get_field(field)
                .and_then(|v| v.to_comparable_f64())
                // infinite/NaN attributes would poison the whole score
                .filter(|n| n.is_finite())
                .map(|value| value * weight)
        })
        .sum();

    let categorical: f64 = model
        .weights_categorical
        .iter()
        .filter_map(|(field, weights)| {
            let value = user.get_field(field)?.to_comparable_string()?;
            weights.get(&value).copied()
        })
        .sum();

    model.intercept + numerical + categorical
}
