use std::{sync::Arc, time::Duration};

use crate::{
    diagnostics::OutputLogger,
    error_boundary::ObservabilityClient,
    eval::{CountryLookup, UserAgentParser},
    events::{EventLoggerConfig, EventLoggingAdapter},
    hashing::HashAlgorithm,
    persisted::PersistentStorage,
    sync::{DataAdapter, PollerThreadConfig, RetryPolicy, SpecsUpdateCallback, Transport},
};

/// Configuration for [`Client`](crate::Client).
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use featuregate::ClientOptions;
/// let options = ClientOptions::new()
///     .environment("staging")
///     .specs_sync_interval(Duration::from_secs(30))
///     .disable_id_lists(true);
/// ```
pub struct ClientOptions {
    pub(crate) specs_url: String,
    pub(crate) api_url: String,
    pub(crate) fallback_to_origin: bool,
    pub(crate) specs_sync_interval: Duration,
    pub(crate) id_lists_sync_interval: Duration,
    pub(crate) sync_jitter: Duration,
    pub(crate) init_timeout: Duration,
    pub(crate) event_flush_interval: Duration,
    pub(crate) event_batch_size: usize,
    pub(crate) event_queue_capacity: usize,
    pub(crate) flush_max_retries: u32,
    pub(crate) network_max_retries: u32,
    pub(crate) network_backoff_base: Duration,
    pub(crate) network_backoff_max: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) environment: Option<String>,
    pub(crate) disable_all_logging: bool,
    pub(crate) disable_id_lists: bool,
    pub(crate) hash_algorithm: HashAlgorithm,
    pub(crate) bootstrap_specs: Option<String>,
    pub(crate) data_adapter: Option<Arc<dyn DataAdapter>>,
    pub(crate) persistent_storage: Option<Arc<dyn PersistentStorage>>,
    pub(crate) observability_client: Option<Arc<dyn ObservabilityClient>>,
    pub(crate) output_logger: Option<Box<dyn OutputLogger>>,
    pub(crate) on_specs_update: Option<SpecsUpdateCallback>,
    pub(crate) user_agent_parser: Option<Arc<dyn UserAgentParser>>,
    pub(crate) country_lookup: Option<Arc<dyn CountryLookup>>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) event_logging_adapter: Option<Arc<dyn EventLoggingAdapter>>,
}

impl ClientOptions {
    /// Default base URL for spec downloads.
    pub const DEFAULT_SPECS_URL: &'static str = "https://api.statsigcdn.com/v2";
    /// Default origin API base URL.
    pub const DEFAULT_API_URL: &'static str = "https://statsigapi.net/v1";
    pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_NETWORK_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_NETWORK_BACKOFF_BASE: Duration = Duration::from_millis(200);
    pub const DEFAULT_NETWORK_BACKOFF_MAX: Duration = Duration::from_secs(5);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create options with every setting at its default.
    pub fn new() -> ClientOptions {
        ClientOptions {
            specs_url: ClientOptions::DEFAULT_SPECS_URL.to_owned(),
            api_url: ClientOptions::DEFAULT_API_URL.to_owned(),
            fallback_to_origin: true,
            specs_sync_interval: PollerThreadConfig::DEFAULT_SPECS_INTERVAL,
            id_lists_sync_interval: PollerThreadConfig::DEFAULT_ID_LISTS_INTERVAL,
            sync_jitter: PollerThreadConfig::DEFAULT_JITTER,
            init_timeout: ClientOptions::DEFAULT_INIT_TIMEOUT,
            event_flush_interval: EventLoggerConfig::DEFAULT_FLUSH_INTERVAL,
            event_batch_size: EventLoggerConfig::DEFAULT_BATCH_SIZE,
            event_queue_capacity: EventLoggerConfig::DEFAULT_QUEUE_CAPACITY,
            flush_max_retries: EventLoggerConfig::DEFAULT_MAX_RETRIES,
            network_max_retries: ClientOptions::DEFAULT_NETWORK_MAX_RETRIES,
            network_backoff_base: ClientOptions::DEFAULT_NETWORK_BACKOFF_BASE,
            network_backoff_max: ClientOptions::DEFAULT_NETWORK_BACKOFF_MAX,
            request_timeout: ClientOptions::DEFAULT_REQUEST_TIMEOUT,
            environment: None,
            disable_all_logging: false,
            disable_id_lists: false,
            hash_algorithm: HashAlgorithm::Sha256,
            bootstrap_specs: None,
            data_adapter: None,
            persistent_storage: None,
            observability_client: None,
            output_logger: None,
            on_specs_update: None,
            user_agent_parser: None,
            country_lookup: None,
            transport: None,
            event_logging_adapter: None,
        }
    }

    /// Override base URL for spec downloads (usually a CDN).
    pub fn specs_url(mut self, specs_url: impl Into<String>) -> Self {
        self.specs_url = specs_url.into();
        self
    }

    /// Override the origin API base URL used for id lists, events and as download fallback.
    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Whether spec downloads retry once against the origin after a retryable CDN failure.
    pub fn fallback_to_origin(mut self, fallback_to_origin: bool) -> Self {
        self.fallback_to_origin = fallback_to_origin;
        self
    }

    pub fn specs_sync_interval(mut self, interval: Duration) -> Self {
        self.specs_sync_interval = interval;
        self
    }

    pub fn id_lists_sync_interval(mut self, interval: Duration) -> Self {
        self.id_lists_sync_interval = interval;
        self
    }

    /// Randomized duration subtracted from each sync interval.
    pub fn sync_jitter(mut self, jitter: Duration) -> Self {
        self.sync_jitter = jitter;
        self
    }

    /// Upper bound on how long [`Client::initialize`](crate::Client::initialize) waits for the
    /// first sync.
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn event_flush_interval(mut self, interval: Duration) -> Self {
        self.event_flush_interval = interval;
        self
    }

    /// Events per delivered batch, clamped to `[10, 10000]`.
    pub fn event_batch_size(mut self, batch_size: usize) -> Self {
        self.event_batch_size = batch_size;
        self
    }

    /// Queued events beyond this are dropped, oldest first.
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn flush_max_retries(mut self, retries: u32) -> Self {
        self.flush_max_retries = retries;
        self
    }

    /// Retry budget and exponential backoff of network requests.
    pub fn network_retries(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.network_max_retries = max_retries;
        self.network_backoff_base = base;
        self.network_backoff_max = max;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Environment tier (e.g. `"production"`, `"staging"`) applied to users without one.
    pub fn environment(mut self, tier: impl Into<String>) -> Self {
        self.environment = Some(tier.into());
        self
    }

    /// Do not queue or deliver any event.
    pub fn disable_all_logging(mut self, disable: bool) -> Self {
        self.disable_all_logging = disable;
        self
    }

    pub fn disable_id_lists(mut self, disable: bool) -> Self {
        self.disable_id_lists = disable;
        self
    }

    /// Default name hashing of client snapshots.
    pub fn hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    /// Specification document applied before any other source while the store is empty.
    pub fn bootstrap_specs(mut self, json: impl Into<String>) -> Self {
        self.bootstrap_specs = Some(json.into());
        self
    }

    pub fn data_adapter(mut self, adapter: Arc<dyn DataAdapter>) -> Self {
        self.data_adapter = Some(adapter);
        self
    }

    /// Storage of sticky experiment assignments.
    pub fn persistent_storage(mut self, storage: Arc<dyn PersistentStorage>) -> Self {
        self.persistent_storage = Some(storage);
        self
    }

    pub fn observability_client(mut self, client: Arc<dyn ObservabilityClient>) -> Self {
        self.observability_client = Some(client);
        self
    }

    /// Receives diagnostics markers as they are recorded.
    pub fn output_logger(mut self, logger: impl OutputLogger + 'static) -> Self {
        self.output_logger = Some(Box::new(logger));
        self
    }

    /// Called with the raw document and its server time after each successful specs update.
    ///
    /// ```
    /// # use featuregate::ClientOptions;
    /// let options = ClientOptions::new().on_specs_update(|_json, time| {
    ///     println!("specs updated to {time}");
    /// });
    /// ```
    pub fn on_specs_update(mut self, callback: impl Fn(&str, u64) + Send + Sync + 'static) -> Self {
        self.on_specs_update = Some(Arc::new(callback));
        self
    }

    pub fn user_agent_parser(mut self, parser: Arc<dyn UserAgentParser>) -> Self {
        self.user_agent_parser = Some(parser);
        self
    }

    pub fn country_lookup(mut self, lookup: Arc<dyn CountryLookup>) -> Self {
        self.country_lookup = Some(lookup);
        self
    }

    /// Replace the HTTP transport, e.g. to route requests through a proxy client.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace event delivery.
    pub fn event_logging_adapter(mut self, adapter: Arc<dyn EventLoggingAdapter>) -> Self {
        self.event_logging_adapter = Some(adapter);
        self
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.network_max_retries,
            backoff_base: self.network_backoff_base,
            backoff_max: self.network_backoff_max,
        }
    }

    pub(crate) fn poller_config(&self) -> PollerThreadConfig {
        PollerThreadConfig {
            specs_interval: self.specs_sync_interval,
            id_lists_interval: (!self.disable_id_lists).then_some(self.id_lists_sync_interval),
            jitter: self.sync_jitter,
        }
    }

    pub(crate) fn event_logger_config(&self) -> EventLoggerConfig {
        EventLoggerConfig {
            flush_interval: self.event_flush_interval,
            batch_size: self.event_batch_size,
            queue_capacity: self.event_queue_capacity,
            retry: RetryPolicy {
                max_retries: self.flush_max_retries,
                ..self.retry_policy()
            },
        }
    }
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions::new()
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("specs_url", &self.specs_url)
            .field("api_url", &self.api_url)
            .field("specs_sync_interval", &self.specs_sync_interval)
            .field("environment", &self.environment)
            .field("disable_all_logging", &self.disable_all_logging)
            .field("disable_id_lists", &self.disable_id_lists)
            .field("hash_algorithm", &self.hash_algorithm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.specs_url, ClientOptions::DEFAULT_SPECS_URL);
        assert!(options.fallback_to_origin);
        assert_eq!(options.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(
            options.poller_config().id_lists_interval,
            Some(PollerThreadConfig::DEFAULT_ID_LISTS_INTERVAL)
        );
        assert_eq!(options.event_logger_config().batch_size, 1_000);
        assert_eq!(
            options.event_logger_config().retry.max_retries,
            EventLoggerConfig::DEFAULT_MAX_RETRIES
        );
    }

    #[test]
    fn flush_budget_is_independent_of_network_budget() {
        let options = ClientOptions::new()
            .network_retries(1, Duration::from_millis(5), Duration::from_millis(50))
            .flush_max_retries(7);
        let retry = options.event_logger_config().retry;
        assert_eq!(retry.max_retries, 7);
        assert_eq!(retry.backoff_base, Duration::from_millis(5));
        assert_eq!(options.retry_policy().max_retries, 1);
    }

    #[test]
    fn disabling_id_lists_removes_interval() {
        let options = ClientOptions::new().disable_id_lists(true);
        assert_eq!(options.poller_config().id_lists_interval, None);
    }
}
