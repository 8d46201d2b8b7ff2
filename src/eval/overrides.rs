use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use crate::{
    eval::result::{rule_ids, EvalResult},
    DynamicValue, User,
};

#[derive(Debug, Clone)]
struct OverrideEntry<T> {
    /// Applies to every user.
    all: Option<T>,
    /// Applies to users whose primary or custom id matches.
    by_id: HashMap<String, T>,
}

impl<T> Default for OverrideEntry<T> {
    fn default() -> Self {
        Self {
            all: None,
            by_id: HashMap::new(),
        }
    }
}

impl<T: Clone> OverrideEntry<T> {
    fn set(&mut self, value: T, id: Option<&str>) {
        match id {
            Some(id) => {
                self.by_id.insert(id.to_owned(), value);
            }
            None => self.all = Some(value),
        }
    }

    fn remove(&mut self, id: Option<&str>) {
        match id {
            Some(id) => {
                self.by_id.remove(id);
            }
            None => {
                self.all = None;
                self.by_id.clear();
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.all.is_none() && self.by_id.is_empty()
    }

    /// An id override wins over a global one.
    fn lookup(&self, user: &User) -> Option<(T, &'static str)> {
        let ids = user
            .user_id
            .iter()
            .chain(user.custom_ids.values());
        for id in ids {
            if let Some(value) = self.by_id.get(id) {
                return Some((value.clone(), rule_ids::ID_OVERRIDE));
            }
        }
        self.all.clone().map(|value| (value, rule_ids::OVERRIDE))
    }
}

type OverrideMap<T> = RwLock<HashMap<String, OverrideEntry<T>>>;

/// Developer-forced values, local to this process. Overrides bypass rule evaluation entirely and
/// produce results tagged with an override rule id, so their exposures are never sampled away.
#[derive(Debug, Default)]
pub struct LocalOverrides {
    gates: OverrideMap<bool>,
    configs: OverrideMap<DynamicValue>,
    layers: OverrideMap<DynamicValue>,
}

impl LocalOverrides {
    pub fn new() -> LocalOverrides {
        LocalOverrides::default()
    }

    /// Force the value of a gate, for everyone or for one id.
    pub fn override_gate(&self, name: &str, value: bool, id: Option<&str>) {
        set(&self.gates, name, value, id);
    }

    /// Force the value of a dynamic config or experiment.
    pub fn override_config(&self, name: &str, value: DynamicValue, id: Option<&str>) {
        set(&self.configs, name, value, id);
    }

    pub fn override_layer(&self, name: &str, value: DynamicValue, id: Option<&str>) {
        set(&self.layers, name, value, id);
    }

    /// Drop the override for one id, or every override of `name` when `id` is `None`.
    pub fn remove_gate_override(&self, name: &str, id: Option<&str>) {
        remove(&self.gates, name, id);
    }

    pub fn remove_config_override(&self, name: &str, id: Option<&str>) {
        remove(&self.configs, name, id);
    }

    pub fn remove_layer_override(&self, name: &str, id: Option<&str>) {
        remove(&self.layers, name, id);
    }

    pub fn remove_all_overrides(&self) {
        for map in [&self.configs, &self.layers] {
            map.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
        self.gates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn gate_override(&self, user: &User, name: &str) -> Option<EvalResult> {
        let (value, rule_id) = lookup(&self.gates, user, name)?;
        Some(EvalResult {
            bool_value: value,
            json_value: Some(DynamicValue::Bool(value)),
            rule_id: rule_id.to_owned(),
            ..EvalResult::default()
        })
    }

    pub(crate) fn config_override(&self, user: &User, name: &str) -> Option<EvalResult> {
        let (value, rule_id) = lookup(&self.configs, user, name)?;
        Some(value_override(value, rule_id))
    }

    pub(crate) fn layer_override(&self, user: &User, name: &str) -> Option<EvalResult> {
        let (value, rule_id) = lookup(&self.layers, user, name)?;
        Some(value_override(value, rule_id))
    }
}

fn value_override(value: DynamicValue, rule_id: &str) -> EvalResult {
    EvalResult {
        bool_value: true,
        json_value: Some(value),
        rule_id: rule_id.to_owned(),
        ..EvalResult::default()
    }
}

fn set<T: Clone>(map: &OverrideMap<T>, name: &str, value: T, id: Option<&str>) {
    map.write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(name.to_owned())
        .or_default()
        .set(value, id);
}

fn remove<T: Clone>(map: &OverrideMap<T>, name: &str, id: Option<&str>) {
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = map.get_mut(name) {
        entry.remove(id);
        if entry.is_empty() {
            map.remove(name);
        }
    }
}

fn lookup<T: Clone>(map: &OverrideMap<T>, user: &User, name: &str) -> Option<(T, &'static str)> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)?
        .lookup(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_override_wins_over_global() {
        let overrides = LocalOverrides::new();
        overrides.override_gate("gate", false, None);
        overrides.override_gate("gate", true, Some("vip"));

        let vip = overrides.gate_override(&User::with_user_id("vip"), "gate").unwrap();
        assert!(vip.bool_value);
        assert_eq!(vip.rule_id, rule_ids::ID_OVERRIDE);

        let other = overrides.gate_override(&User::with_user_id("other"), "gate").unwrap();
        assert!(!other.bool_value);
        assert_eq!(other.rule_id, rule_ids::OVERRIDE);
        assert!(other.is_override());
    }

    #[test]
    fn custom_ids_match() {
        let overrides = LocalOverrides::new();
        overrides.override_config("config", DynamicValue::from("forced"), Some("acme"));
        let user = User::with_user_id("u1").with_custom_id("companyID", "acme");
        let result = overrides.config_override(&user, "config").unwrap();
        assert_eq!(result.json_value, Some(DynamicValue::from("forced")));
    }

    #[test]
    fn remove_clears_entries() {
        let overrides = LocalOverrides::new();
        overrides.override_layer("layer", DynamicValue::empty_object(), None);
        overrides.override_layer("layer", DynamicValue::empty_object(), Some("u1"));

        overrides.remove_layer_override("layer", Some("u1"));
        let result = overrides.layer_override(&User::with_user_id("u1"), "layer").unwrap();
        assert_eq!(result.rule_id, rule_ids::OVERRIDE);

        overrides.remove_layer_override("layer", None);
        assert!(overrides.layer_override(&User::with_user_id("u1"), "layer").is_none());

        overrides.override_gate("gate", true, None);
        overrides.remove_all_overrides();
        assert!(overrides.gate_override(&User::default(), "gate").is_none());
    }
}
