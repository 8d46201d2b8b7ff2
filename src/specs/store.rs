//! A thread-safe in-memory storage for the currently active specification set. [`SpecStore`]
//! provides concurrent access for readers (evaluation) and writers (sync loop, data adapter poll,
//! bootstrap).
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    diagnostics::{Diagnostics, MarkerAction},
    hashing::djb2,
    specs::{
        id_lists::IdList,
        models::{CmabSpec, KeyEntities, SessionReplayInfo, Spec, SpecsResponse, TryParse},
    },
    Error, Result,
};

/// Where the active specs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SpecsSource {
    #[default]
    Uninitialized,
    Bootstrap,
    DataAdapter,
    Network,
}

/// Outcome of [`SpecStore::put_specs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecsUpdate {
    /// The document replaced the active specs.
    Updated,
    /// The document was not newer than the active specs and was dropped.
    NoUpdate,
}

/// Immutable specification set. Replaced wholesale on every successful sync.
#[derive(Debug, Default)]
pub struct Specs {
    pub gates: HashMap<String, Arc<Spec>>,
    pub configs: HashMap<String, Arc<Spec>>,
    pub layers: HashMap<String, Arc<Spec>>,
    pub cmabs: HashMap<String, Arc<CmabSpec>>,
    /// Experiment name to the layer it is allocated in.
    pub experiment_to_layer: HashMap<String, String>,
    /// Id lists advertised by the document.
    pub id_list_names: HashMap<String, bool>,
    pub app_id: Option<String>,
    pub sdk_keys_to_app_ids: HashMap<String, String>,
    pub hashed_sdk_keys_to_app_ids: HashMap<String, String>,
    pub hashed_sdk_keys_to_entities: HashMap<String, KeyEntities>,
    pub session_replay_info: Option<SessionReplayInfo>,
    pub sdk_configs: HashMap<String, serde_json::Value>,
    pub diagnostics_rates: HashMap<String, f64>,
    /// Server cut time of the document.
    pub time: u64,
    pub source: SpecsSource,
    pub received_at: Option<DateTime<Utc>>,
}

impl Specs {
    fn from_response(response: SpecsResponse, source: SpecsSource) -> Specs {
        fn by_name<T, F: Fn(&T) -> &str>(
            kind: &str,
            entries: Vec<TryParse<T>>,
            name: F,
        ) -> HashMap<String, Arc<T>> {
            entries
                .into_iter()
                .filter_map(|entry| match entry {
                    TryParse::Parsed(spec) => Some(spec),
                    TryParse::ParseFailed(raw) => {
                        log::warn!(target: "featuregate",
                                   kind,
                                   name:? = raw.get("name");
                                   "failed to parse spec, it will be treated as unrecognized");
                        None
                    }
                })
                .map(|spec| (name(&spec).to_owned(), Arc::new(spec)))
                .collect()
        }

        let experiment_to_layer = response
            .layers
            .iter()
            .flat_map(|(layer, experiments)| {
                experiments
                    .iter()
                    .map(move |experiment| (experiment.clone(), layer.clone()))
            })
            .collect();

        Specs {
            gates: by_name("gate", response.feature_gates, |s: &Spec| &s.name),
            configs: by_name("config", response.dynamic_configs, |s: &Spec| &s.name),
            layers: by_name("layer", response.layer_configs, |s: &Spec| &s.name),
            cmabs: by_name("cmab", response.cmab_configs, |s: &CmabSpec| &s.name),
            experiment_to_layer,
            id_list_names: response.id_lists,
            app_id: response.app_id,
            sdk_keys_to_app_ids: response.sdk_keys_to_app_ids,
            hashed_sdk_keys_to_app_ids: response.hashed_sdk_keys_to_app_ids,
            hashed_sdk_keys_to_entities: response.hashed_sdk_keys_to_entities,
            session_replay_info: response.session_replay_info,
            sdk_configs: response.sdk_configs,
            diagnostics_rates: response.diagnostics,
            time: response.time,
            source,
            received_at: Some(Utc::now()),
        }
    }
}

/// Consistent view of specs and id lists. Evaluation holds one snapshot for the whole call.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub specs: Arc<Specs>,
    pub id_lists: Arc<HashMap<String, Arc<IdList>>>,
}

impl StoreSnapshot {
    pub fn get_gate(&self, name: &str) -> Option<&Arc<Spec>> {
        self.specs.gates.get(name)
    }

    pub fn get_dynamic_config(&self, name: &str) -> Option<&Arc<Spec>> {
        self.specs.configs.get(name)
    }

    pub fn get_layer_config(&self, name: &str) -> Option<&Arc<Spec>> {
        self.specs.layers.get(name)
    }

    pub fn get_cmab(&self, name: &str) -> Option<&Arc<CmabSpec>> {
        self.specs.cmabs.get(name)
    }

    pub fn get_id_list(&self, name: &str) -> Option<&Arc<IdList>> {
        self.id_lists.get(name)
    }

    pub fn is_initialized(&self) -> bool {
        self.specs.source != SpecsSource::Uninitialized
    }

    /// Entities visible to a client key. `None` means no restriction.
    pub fn get_entities_for_key(&self, client_key: &str) -> Option<&KeyEntities> {
        self.specs.hashed_sdk_keys_to_entities.get(&djb2(client_key))
    }

    /// Target application of a client key, falling back to the document's own app id.
    pub fn get_app_id_for_key(&self, client_key: &str) -> Option<&str> {
        let specs = &self.specs;
        specs
            .sdk_keys_to_app_ids
            .get(client_key)
            .or_else(|| specs.hashed_sdk_keys_to_app_ids.get(&djb2(client_key)))
            .or(specs.app_id.as_ref())
            .map(String::as_str)
    }
}

/// `SpecStore` provides a thread-safe (`Sync`) storage for specs that allows concurrent access for
/// readers and writers.
///
/// Readers clone an `Arc` to an immutable [`StoreSnapshot`]; writers build a new snapshot outside
/// of the lock and only take the exclusive section to swap the reference.
pub struct SpecStore {
    snapshot: RwLock<Arc<StoreSnapshot>>,
    /// Serializes writers, so a compare-then-swap cannot interleave with another writer.
    write_lock: Mutex<()>,
    diagnostics: Arc<Diagnostics>,
}

impl SpecStore {
    pub fn new(diagnostics: Arc<Diagnostics>) -> SpecStore {
        SpecStore {
            snapshot: RwLock::new(Arc::new(StoreSnapshot::default())),
            write_lock: Mutex::new(()),
            diagnostics,
        }
    }

    /// Get the currently active snapshot. It is not affected by later writes.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        // read() fails only if a writer panicked while holding the lock. Swapping an Arc cannot
        // leave the slot half-written, so the inner value is still consistent.
        let slot = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.clone()
    }

    fn swap(&self, snapshot: StoreSnapshot) {
        let new_value = Arc::new(snapshot);
        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = new_value;
    }

    fn lock_writers(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the active specs with `response` if it is strictly newer.
    pub fn put_specs(&self, response: SpecsResponse, source: SpecsSource) -> SpecsUpdate {
        let _writer = self.lock_writers();
        let current = self.snapshot();

        let is_newer = !current.is_initialized() || response.time > current.specs.time;
        if !response.has_updates || !is_newer {
            log::debug!(target: "featuregate",
                        current_time = current.specs.time,
                        received_time = response.time,
                        has_updates = response.has_updates,
                        source:? = source;
                        "no update");
            self.diagnostics
                .mark("specs_update", "no_update", MarkerAction::End, true);
            return SpecsUpdate::NoUpdate;
        }

        let specs = Specs::from_response(response, source);
        log::debug!(target: "featuregate",
                    time = specs.time,
                    source:? = source,
                    gates = specs.gates.len(),
                    configs = specs.configs.len(),
                    layers = specs.layers.len();
                    "specs updated");
        self.swap(StoreSnapshot {
            specs: Arc::new(specs),
            id_lists: current.id_lists.clone(),
        });
        self.diagnostics
            .mark("specs_update", "process", MarkerAction::End, true);
        SpecsUpdate::Updated
    }

    /// Parse and store a raw specification document. A malformed document leaves the store
    /// untouched.
    pub fn put_specs_json(&self, json: &str, source: SpecsSource) -> Result<SpecsUpdate> {
        let response = SpecsResponse::from_json(json).inspect_err(|err| {
            log::warn!(target: "featuregate",
                       source:? = source;
                       "failed to parse specification document: {err}");
            self.diagnostics
                .mark("specs_update", "parse", MarkerAction::End, false);
        })?;
        Ok(self.put_specs(response, source))
    }

    /// Replace a single id list.
    pub fn put_id_list(&self, list: IdList) {
        let _writer = self.lock_writers();
        let current = self.snapshot();
        let mut id_lists = (*current.id_lists).clone();
        id_lists.insert(list.name.clone(), Arc::new(list));
        self.swap(StoreSnapshot {
            specs: current.specs.clone(),
            id_lists: Arc::new(id_lists),
        });
    }

    /// Drop id lists that are no longer advertised.
    pub fn retain_id_lists(&self, keep: impl Fn(&str) -> bool) {
        let _writer = self.lock_writers();
        let current = self.snapshot();
        if current.id_lists.keys().all(|name| keep(name)) {
            return;
        }
        let id_lists = current
            .id_lists
            .iter()
            .filter(|(name, _)| keep(name))
            .map(|(name, list)| (name.clone(), list.clone()))
            .collect();
        self.swap(StoreSnapshot {
            specs: current.specs.clone(),
            id_lists: Arc::new(id_lists),
        });
    }

    pub fn get_gate(&self, name: &str) -> Option<Arc<Spec>> {
        self.snapshot().get_gate(name).cloned()
    }

    pub fn get_dynamic_config(&self, name: &str) -> Option<Arc<Spec>> {
        self.snapshot().get_dynamic_config(name).cloned()
    }

    pub fn get_layer_config(&self, name: &str) -> Option<Arc<Spec>> {
        self.snapshot().get_layer_config(name).cloned()
    }

    pub fn get_cmab(&self, name: &str) -> Option<Arc<CmabSpec>> {
        self.snapshot().get_cmab(name).cloned()
    }

    /// Entities visible to a client key. `None` means no restriction.
    pub fn get_entities_for_key(&self, client_key: &str) -> Option<KeyEntities> {
        self.snapshot().get_entities_for_key(client_key).cloned()
    }

    /// Target application of a client key, falling back to the document's own app id.
    pub fn get_app_id_for_key(&self, client_key: &str) -> Option<String> {
        self.snapshot().get_app_id_for_key(client_key).map(str::to_owned)
    }

    pub fn get_session_replay_info(&self) -> Option<SessionReplayInfo> {
        self.snapshot().specs.session_replay_info.clone()
    }

    /// Server time of the active document, `0` before the first sync.
    pub fn last_sync_time(&self) -> u64 {
        self.snapshot().specs.time
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_initialized()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn document(time: u64, gate: &str) -> SpecsResponse {
        SpecsResponse::from_json(&format!(
            r#"{{
                "feature_gates": [{{"name": "{gate}", "entity": "feature_gate", "rules": []}}],
                "has_updates": true,
                "time": {time}
            }}"#
        ))
        .unwrap()
    }

    fn store() -> SpecStore {
        SpecStore::new(Arc::new(Diagnostics::new()))
    }

    #[test]
    fn older_documents_are_dropped() {
        let store = store();
        assert_eq!(
            store.put_specs(document(100, "a"), SpecsSource::Network),
            SpecsUpdate::Updated
        );
        assert_eq!(
            store.put_specs(document(50, "b"), SpecsSource::Network),
            SpecsUpdate::NoUpdate
        );
        assert_eq!(
            store.put_specs(document(100, "c"), SpecsSource::Network),
            SpecsUpdate::NoUpdate
        );

        assert_eq!(store.last_sync_time(), 100);
        assert!(store.get_gate("a").is_some());
        assert!(store.get_gate("b").is_none());
        assert!(store
            .diagnostics
            .markers()
            .iter()
            .any(|m| m.step == "no_update"));
    }

    #[test]
    fn malformed_document_keeps_last_known_good() {
        let store = store();
        store.put_specs(document(100, "a"), SpecsSource::Network);

        assert!(store
            .put_specs_json("{not json", SpecsSource::Network)
            .is_err());
        assert!(store.get_gate("a").is_some());
        assert_eq!(store.last_sync_time(), 100);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let store = store();
        store.put_specs(document(1, "old"), SpecsSource::Network);
        let held = store.snapshot();

        store.put_specs(document(2, "new"), SpecsSource::Network);

        assert!(held.get_gate("old").is_some());
        assert!(held.get_gate("new").is_none());
        assert!(store.get_gate("new").is_some());
    }

    #[test]
    fn can_write_from_many_threads() {
        let store = Arc::new(store());
        let handles = (1..=8u64)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.put_specs(document(t, &format!("g{t}")), SpecsSource::Network);
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.last_sync_time(), 8);
        assert!(store.get_gate("g8").is_some());
    }

    #[test]
    fn app_id_and_entities_for_key() {
        let store = store();
        let json = format!(
            r#"{{
                "has_updates": true,
                "time": 1,
                "app_id": "default-app",
                "sdk_keys_to_app_ids": {{"client-plain": "app-1"}},
                "hashed_sdk_keys_to_app_ids": {{"{hashed}": "app-2"}},
                "hashed_sdk_keys_to_entities": {{"{hashed}": {{"gates": ["g"], "configs": []}}}}
            }}"#,
            hashed = djb2("client-hashed")
        );
        store.put_specs_json(&json, SpecsSource::Bootstrap).unwrap();

        assert_eq!(store.get_app_id_for_key("client-plain").as_deref(), Some("app-1"));
        assert_eq!(store.get_app_id_for_key("client-hashed").as_deref(), Some("app-2"));
        assert_eq!(store.get_app_id_for_key("other").as_deref(), Some("default-app"));
        assert_eq!(
            store.get_entities_for_key("client-hashed").unwrap().gates,
            vec!["g".to_owned()]
        );
        assert!(store.get_entities_for_key("other").is_none());
    }
}
