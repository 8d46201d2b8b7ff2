//! One sync cycle: fetch specs (or id lists) from a source and apply them to the store.
//!
//! Thread scheduling lives in [`PollerThread`](super::PollerThread); this module only knows how
//! to talk to each source.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use reqwest::Url;

use crate::{
    diagnostics::{Diagnostics, MarkerAction},
    specs::{
        id_lists::{IdList, IdListError, IdListMetadata, IdListSyncAction},
        store::{SpecStore, SpecsSource, SpecsUpdate},
    },
    sync::{
        data_adapter::{specs_key, DataAdapter},
        network::{NetworkClient, Request, RetryPolicy},
    },
    Error, Result,
};

/// Callback invoked with the raw document and its server time after every successful update.
pub type SpecsUpdateCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

const DOWNLOAD_CONFIG_SPECS_ENDPOINT: &str = "download_config_specs";
const GET_ID_LISTS_ENDPOINT: &str = "get_id_lists";

/// Endpoints used for syncing.
#[derive(Debug, Clone)]
pub struct SyncEndpoints {
    /// Base of the spec download endpoint, usually a CDN.
    pub specs_url: String,
    /// Origin API base, used for id lists and as the fallback for spec downloads.
    pub api_url: String,
    pub fallback_to_origin: bool,
}

pub struct SpecsSyncer {
    sdk_key: String,
    store: Arc<SpecStore>,
    network: Arc<NetworkClient>,
    endpoints: SyncEndpoints,
    retry: RetryPolicy,
    data_adapter: Option<Arc<dyn DataAdapter>>,
    on_specs_update: Option<SpecsUpdateCallback>,
    diagnostics: Arc<Diagnostics>,
    last_error: Mutex<Option<Error>>,
}

enum IdListFetchError {
    Network(Error),
    Chunk(IdListError),
}

impl SpecsSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sdk_key: String,
        store: Arc<SpecStore>,
        network: Arc<NetworkClient>,
        endpoints: SyncEndpoints,
        retry: RetryPolicy,
        data_adapter: Option<Arc<dyn DataAdapter>>,
        on_specs_update: Option<SpecsUpdateCallback>,
        diagnostics: Arc<Diagnostics>,
    ) -> SpecsSyncer {
        SpecsSyncer {
            sdk_key,
            store,
            network,
            endpoints,
            retry,
            data_adapter,
            on_specs_update,
            diagnostics,
            last_error: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<SpecStore> {
        &self.store
    }

    pub fn is_unauthorized(&self) -> bool {
        self.network.is_unauthorized()
    }

    /// Error of the latest failed cycle, cleared by the next successful one.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        let mut last_error = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(_) => *last_error = None,
            Err(err) => *last_error = Some(err.clone()),
        }
        result
    }

    /// Apply a one-shot bootstrap document. Ignored once the store holds specs.
    pub fn bootstrap(&self, json: &str) -> Result<SpecsUpdate> {
        if self.store.is_initialized() {
            return Ok(SpecsUpdate::NoUpdate);
        }
        self.diagnostics.start("initialize", "bootstrap");
        let result = self.apply(json, SpecsSource::Bootstrap);
        self.diagnostics
            .mark("initialize", "bootstrap", MarkerAction::End, result.is_ok());
        result
    }

    pub fn has_data_adapter(&self) -> bool {
        self.data_adapter.is_some()
    }

    pub fn initialize_data_adapter(&self) -> Result<()> {
        match &self.data_adapter {
            Some(adapter) => adapter.initialize(),
            None => Ok(()),
        }
    }

    pub fn shutdown_data_adapter(&self) -> Result<()> {
        match &self.data_adapter {
            Some(adapter) => adapter.shutdown(),
            None => Ok(()),
        }
    }

    /// Whether periodic syncs read from the data adapter instead of the network.
    pub fn polls_data_adapter(&self) -> bool {
        self.data_adapter
            .as_ref()
            .is_some_and(|adapter| adapter.should_poll_for_updates(&specs_key(&self.sdk_key)))
    }

    /// One periodic specs sync from the preferred source.
    pub fn sync_specs(&self) -> Result<SpecsUpdate> {
        if self.polls_data_adapter() {
            self.sync_from_data_adapter()
        } else {
            self.sync_from_network()
        }
    }

    pub fn sync_from_data_adapter(&self) -> Result<SpecsUpdate> {
        let Some(adapter) = &self.data_adapter else {
            return Ok(SpecsUpdate::NoUpdate);
        };
        self.diagnostics.start("download_config_specs", "data_adapter");
        let result = adapter
            .get(&specs_key(&self.sdk_key))
            .and_then(|value| {
                value.ok_or_else(|| Error::DataAdapter("no specs stored for this key".to_owned()))
            })
            .and_then(|json| self.apply(&json, SpecsSource::DataAdapter));
        self.diagnostics.mark(
            "download_config_specs",
            "data_adapter",
            MarkerAction::End,
            result.is_ok(),
        );
        self.record(result)
    }

    /// Download specs changed since the last known server time.
    pub fn sync_from_network(&self) -> Result<SpecsUpdate> {
        let since_time = self.store.last_sync_time();
        let result = self.download_specs(since_time).and_then(|body| {
            let update = self.apply(&body, SpecsSource::Network)?;
            if update == SpecsUpdate::Updated {
                self.write_back(&body);
            }
            Ok(update)
        });
        self.record(result)
    }

    fn download_specs(&self, since_time: u64) -> Result<String> {
        let primary = specs_url(&self.endpoints.specs_url, &self.sdk_key, since_time)?;
        let fallback = if self.endpoints.fallback_to_origin
            && self.endpoints.specs_url != self.endpoints.api_url
        {
            Some(specs_url(&self.endpoints.api_url, &self.sdk_key, since_time)?)
        } else {
            None
        };

        log::debug!(target: "featuregate", since_time; "downloading specs");
        self.diagnostics.start("download_config_specs", "network_request");
        let response = self
            .network
            .send_with_fallback(Request::get(primary), fallback);
        let status = match &response {
            Ok(response) => Some(response.status),
            Err(Error::Network { status, .. }) => Some(*status),
            Err(_) => None,
        };
        self.diagnostics.end_with_status(
            "download_config_specs",
            "network_request",
            response.is_ok(),
            status,
        );
        Ok(response?.body)
    }

    fn apply(&self, json: &str, source: SpecsSource) -> Result<SpecsUpdate> {
        let update = self.store.put_specs_json(json, source)?;
        if update == SpecsUpdate::Updated {
            if let Some(callback) = &self.on_specs_update {
                callback(json, self.store.last_sync_time());
            }
        }
        Ok(update)
    }

    fn write_back(&self, body: &str) {
        let Some(adapter) = &self.data_adapter else {
            return;
        };
        let time = self.store.last_sync_time();
        if let Err(err) = adapter.set(&specs_key(&self.sdk_key), body, Some(time)) {
            log::warn!(target: "featuregate", "failed to write specs to data adapter: {err}");
        }
    }

    /// Bring every advertised id list up to date and drop lists no longer advertised.
    pub fn sync_id_lists(&self) -> Result<()> {
        let result = self.sync_id_lists_inner();
        self.record(result)
    }

    fn sync_id_lists_inner(&self) -> Result<()> {
        let url = endpoint_url(&self.endpoints.api_url, GET_ID_LISTS_ENDPOINT)?;
        self.diagnostics.start("get_id_list_sources", "network_request");
        let response = self
            .network
            .send(Request::post(url, "{}".to_owned()), self.retry);
        self.diagnostics.mark(
            "get_id_list_sources",
            "network_request",
            MarkerAction::End,
            response.is_ok(),
        );
        let manifest: HashMap<String, IdListMetadata> = serde_json::from_str(&response?.body)?;

        let snapshot = self.store.snapshot();
        for (name, metadata) in &manifest {
            let current = snapshot.get_id_list(name).map(|list| list.as_ref());
            if let Err(err) = self.sync_id_list(name, metadata, current) {
                log::warn!(target: "featuregate", name; "failed to sync id list: {err}");
            }
        }
        self.store.retain_id_lists(|name| manifest.contains_key(name));
        Ok(())
    }

    fn sync_id_list(
        &self,
        name: &str,
        metadata: &IdListMetadata,
        current: Option<&IdList>,
    ) -> Result<()> {
        let (mut list, offset) = match current.map(|list| (list, list.plan_sync(metadata))) {
            Some((_, IdListSyncAction::Skip)) => return Ok(()),
            Some((list, IdListSyncAction::FetchFrom { offset })) => (list.clone(), offset),
            Some((_, IdListSyncAction::Reset)) | None => (IdList::new(name, metadata), 0),
        };

        self.diagnostics.start("get_id_list", "network_request");
        let result = match self.fetch_into(&mut list, metadata, offset) {
            Err(IdListFetchError::Chunk(err)) if offset > 0 => {
                log::debug!(target: "featuregate",
                            name,
                            offset;
                            "incremental id list update rejected, fetching the whole list: {err}");
                list = IdList::new(name, metadata);
                self.fetch_into(&mut list, metadata, 0)
            }
            other => other,
        };
        self.diagnostics.mark(
            "get_id_list",
            "network_request",
            MarkerAction::End,
            result.is_ok(),
        );

        match result {
            Ok(()) => {
                log::debug!(target: "featuregate", name, ids = list.len(); "id list synced");
                self.store.put_id_list(list);
                Ok(())
            }
            Err(IdListFetchError::Network(err)) => Err(err),
            Err(IdListFetchError::Chunk(err)) => {
                Err(Error::InvalidIdList(format!("{name}: {err}")))
            }
        }
    }

    fn fetch_into(
        &self,
        list: &mut IdList,
        metadata: &IdListMetadata,
        offset: u64,
    ) -> std::result::Result<(), IdListFetchError> {
        let url = Url::parse(&metadata.url)
            .map_err(|err| IdListFetchError::Network(Error::InvalidUrl(err)))?;
        let request = Request::get(url).with_header("Range", format!("bytes={offset}-"));
        let response = self
            .network
            .send(request, self.retry)
            .map_err(IdListFetchError::Network)?;
        list.apply_chunk(&response.body, metadata.size)
            .map_err(IdListFetchError::Chunk)
    }
}

fn endpoint_url(base: &str, endpoint: &str) -> Result<Url> {
    Url::parse(&format!("{}/{endpoint}", base.trim_end_matches('/'))).map_err(Error::InvalidUrl)
}

fn specs_url(base: &str, sdk_key: &str, since_time: u64) -> Result<Url> {
    let mut url = endpoint_url(base, &format!("{DOWNLOAD_CONFIG_SPECS_ENDPOINT}/{sdk_key}.json"))?;
    if since_time > 0 {
        url.query_pairs_mut()
            .append_pair("sinceTime", &since_time.to_string());
    }
    Ok(url)
}
