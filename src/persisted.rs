//! Sticky experiment assignments.
//!
//! Once a user is bucketed into an experiment group, the decision is pinned under
//! `(unit id, id type)` and replayed on later evaluations, even if the rules change. Durable
//! storage is delegated to a [`PersistentStorage`] adapter; this module keeps a read-mostly cache
//! in front of it.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{eval::SecondaryExposure, DynamicValue, Result, User};

/// A pinned evaluation of one config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyValues {
    pub value: bool,
    pub json_value: DynamicValue,
    pub rule_id: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub undelegated_secondary_exposures: Option<Vec<SecondaryExposure>>,
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    #[serde(default)]
    pub config_version: Option<u32>,
    /// When the value was pinned (milliseconds).
    pub time: i64,
}

/// Config name to pinned evaluation, for one storage key.
pub type UserPersistedValues = HashMap<String, StickyValues>;

/// External durable storage for sticky values.
///
/// Implementations should be fast: `load` is called on the evaluation path of sticky experiments.
pub trait PersistentStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<UserPersistedValues>>;
    fn save(&self, key: &str, config_name: &str, data: StickyValues) -> Result<()>;
    fn delete(&self, key: &str, config_name: &str) -> Result<()>;
}

/// Storage key of a user under an id type, `None` if the user has no such id.
pub fn storage_key(user: &User, id_type: &str) -> Option<String> {
    user.get_unit_id(id_type)
        .map(|unit_id| format!("{unit_id}:{id_type}"))
}

struct CachedValues {
    loaded_at: Instant,
    values: Arc<UserPersistedValues>,
}

/// Cache in front of [`PersistentStorage`]. Storage failures are logged and treated as "no
/// persisted value"; they never fail an evaluation.
///
/// At most `capacity` keys are held, each for at most `ttl`, after which storage is read again.
pub struct PersistedValuesCache {
    storage: Arc<dyn PersistentStorage>,
    capacity: usize,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedValues>>,
}

impl PersistedValuesCache {
    pub const DEFAULT_CAPACITY: usize = 10_000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(storage: Arc<dyn PersistentStorage>) -> PersistedValuesCache {
        PersistedValuesCache::with_limits(storage, Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }

    pub fn with_limits(
        storage: Arc<dyn PersistentStorage>,
        capacity: usize,
        ttl: Duration,
    ) -> PersistedValuesCache {
        PersistedValuesCache {
            storage,
            capacity: capacity.max(1),
            ttl,
            cache: RwLock::default(),
        }
    }

    pub fn load(&self, user: &User, id_type: &str) -> Option<Arc<UserPersistedValues>> {
        let key = storage_key(user, id_type)?;
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .filter(|cached| cached.loaded_at.elapsed() < self.ttl)
        {
            return Some(cached.values.clone());
        }

        let loaded = match self.storage.load(&key) {
            Ok(values) => Arc::new(values.unwrap_or_default()),
            Err(err) => {
                log::warn!(target: "featuregate", key; "failed to load persisted values: {err}");
                return None;
            }
        };
        self.insert(key, loaded.clone());
        Some(loaded)
    }

    fn insert(&self, key: String, values: Arc<UserPersistedValues>) {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !cache.contains_key(&key) && cache.len() >= self.capacity {
            cache.retain(|_, cached| cached.loaded_at.elapsed() < self.ttl);
            if cache.len() >= self.capacity {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, cached)| cached.loaded_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(
            key,
            CachedValues {
                loaded_at: Instant::now(),
                values,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn save(&self, user: &User, id_type: &str, config_name: &str, data: StickyValues) {
        let Some(key) = storage_key(user, id_type) else {
            return;
        };
        if let Err(err) = self.storage.save(&key, config_name, data.clone()) {
            log::warn!(target: "featuregate", key, config_name; "failed to save persisted value: {err}");
            return;
        }
        self.update_cached(&key, |values| {
            values.insert(config_name.to_owned(), data);
        });
    }

    pub fn delete(&self, user: &User, id_type: &str, config_name: &str) {
        let Some(key) = storage_key(user, id_type) else {
            return;
        };
        if let Err(err) = self.storage.delete(&key, config_name) {
            log::warn!(target: "featuregate", key, config_name; "failed to delete persisted value: {err}");
            return;
        }
        self.update_cached(&key, |values| {
            values.remove(config_name);
        });
    }

    fn update_cached(&self, key: &str, update: impl FnOnce(&mut UserPersistedValues)) {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = cache.get_mut(key) {
            update(Arc::make_mut(&mut cached.values));
        }
    }

    /// Release cached values.
    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

/// [`PersistentStorage`] kept in process memory. Useful for tests and single-process setups.
#[derive(Default)]
pub struct InMemoryPersistentStorage {
    values: Mutex<HashMap<String, UserPersistedValues>>,
}

impl PersistentStorage for InMemoryPersistentStorage {
    fn load(&self, key: &str) -> Result<Option<UserPersistedValues>> {
        let values = self.values.lock().map_err(|_| poisoned())?;
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, config_name: &str, data: StickyValues) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| poisoned())?;
        values
            .entry(key.to_owned())
            .or_default()
            .insert(config_name.to_owned(), data);
        Ok(())
    }

    fn delete(&self, key: &str, config_name: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| poisoned())?;
        if let Some(entry) = values.get_mut(key) {
            entry.remove(config_name);
        }
        Ok(())
    }
}

fn poisoned() -> crate::Error {
    crate::Error::Persistence("in-memory storage lock poisoned".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn sticky(rule_id: &str) -> StickyValues {
        StickyValues {
            value: true,
            json_value: DynamicValue::empty_object(),
            rule_id: rule_id.to_owned(),
            group_name: Some("Control".to_owned()),
            secondary_exposures: vec![],
            undelegated_secondary_exposures: None,
            config_delegate: None,
            explicit_parameters: None,
            config_version: Some(1),
            time: 0,
        }
    }

    struct FailingStorage;

    impl PersistentStorage for FailingStorage {
        fn load(&self, _key: &str) -> Result<Option<UserPersistedValues>> {
            Err(Error::Persistence("down".to_owned()))
        }
        fn save(&self, _key: &str, _config_name: &str, _data: StickyValues) -> Result<()> {
            Err(Error::Persistence("down".to_owned()))
        }
        fn delete(&self, _key: &str, _config_name: &str) -> Result<()> {
            Err(Error::Persistence("down".to_owned()))
        }
    }

    #[test]
    fn save_then_load() {
        let cache = PersistedValuesCache::new(Arc::new(InMemoryPersistentStorage::default()));
        let user = User::with_user_id("u1");

        assert!(cache.load(&user, "userID").unwrap().is_empty());
        cache.save(&user, "userID", "exp", sticky("r1"));

        let values = cache.load(&user, "userID").unwrap();
        assert_eq!(values.get("exp").unwrap().rule_id, "r1");

        cache.delete(&user, "userID", "exp");
        assert!(cache.load(&user, "userID").unwrap().get("exp").is_none());
    }

    #[test]
    fn storage_failure_means_no_value() {
        let cache = PersistedValuesCache::new(Arc::new(FailingStorage));
        let user = User::with_user_id("u1");
        cache.save(&user, "userID", "exp", sticky("r1"));
        assert!(cache.load(&user, "userID").is_none());
    }

    #[test]
    fn cache_holds_at_most_capacity_keys() {
        let storage = Arc::new(InMemoryPersistentStorage::default());
        let cache = PersistedValuesCache::with_limits(storage, 3, Duration::from_secs(60));
        for i in 0..10 {
            assert!(cache.load(&User::with_user_id(format!("u{i}")), "userID").is_some());
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn expired_entries_are_read_from_storage_again() {
        let storage = Arc::new(InMemoryPersistentStorage::default());
        let cache = PersistedValuesCache::with_limits(storage.clone(), 10, Duration::ZERO);
        let user = User::with_user_id("u1");

        assert!(cache.load(&user, "userID").unwrap().is_empty());
        // Written by another process sharing the storage.
        storage.save("u1:userID", "exp", sticky("r2")).unwrap();
        assert_eq!(
            cache.load(&user, "userID").unwrap().get("exp").unwrap().rule_id,
            "r2"
        );
    }

    #[test]
    fn key_uses_unit_id_and_id_type() {
        let user = User::with_user_id("u1").with_custom_id("companyID", "c1");
        assert_eq!(storage_key(&user, "userID").as_deref(), Some("u1:userID"));
        assert_eq!(storage_key(&user, "companyID").as_deref(), Some("c1:companyID"));
        assert_eq!(storage_key(&User::default(), "userID"), None);
    }
}
