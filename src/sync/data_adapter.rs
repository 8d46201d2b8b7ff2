use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use crate::{hashing::djb2, Result};

/// External key/value source of specification documents, e.g. a shared cache populated by another
/// process.
///
/// Values are opaque strings: the raw documents the network endpoints return.
pub trait DataAdapter: Send + Sync {
    fn initialize(&self) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value` under `key`. `time` is the server time of the document, if known.
    fn set(&self, key: &str, value: &str, time: Option<u64>) -> Result<()>;
    fn shutdown(&self) -> Result<()>;
    /// Whether the sync loop should read `key` from this adapter instead of the network.
    fn should_poll_for_updates(&self, key: &str) -> bool;
}

/// Adapter key of the specification document for an sdk key.
pub fn specs_key(sdk_key: &str) -> String {
    format!("featuregate|/v2/download_config_specs|{}", djb2(sdk_key))
}

/// Adapter key of the id list manifest for an sdk key.
pub fn id_lists_key(sdk_key: &str) -> String {
    format!("featuregate|/v1/get_id_lists|{}", djb2(sdk_key))
}

/// [`DataAdapter`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDataAdapter {
    values: Mutex<HashMap<String, String>>,
    poll_for_updates: bool,
}

impl InMemoryDataAdapter {
    pub fn new(poll_for_updates: bool) -> InMemoryDataAdapter {
        InMemoryDataAdapter {
            values: Mutex::default(),
            poll_for_updates,
        }
    }
}

impl DataAdapter for InMemoryDataAdapter {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str, _time: Option<u64>) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn should_poll_for_updates(&self, _key: &str) -> bool {
        self.poll_for_updates
    }
}
