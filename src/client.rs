use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use url::Url;

use crate::{
    client_init_response::{self, ClientInitResponse, ClientInitResponseOptions},
    diagnostics::{Diagnostics, MarkerAction},
    error_boundary::ErrorBoundary,
    eval::{evaluate, evaluate_cmab, EvalContext, EvalResult, LocalOverrides, MetadataProviders},
    events::{EventLogger, EventLoggingAdapter, ExposureLogger, HttpEventLoggingAdapter, LogEvent},
    hashing::HashAlgorithm,
    persisted::{PersistedValuesCache, UserPersistedValues},
    results::{
        DynamicConfig, EvaluationDetails, EvaluationReason, Experiment, FeatureGate, Layer,
    },
    sampling::SamplingProcessor,
    specs::{
        models::{EntityKind, Spec},
        store::{SpecStore, SpecsSource, StoreSnapshot},
    },
    sync::{
        NetworkClient, PollerThread, PollerThreadConfig, ReqwestTransport, SpecsSyncer,
        SyncEndpoints, SyncState, Transport,
    },
    ClientOptions, DynamicValue, Error, Result, User,
};

const SDK_KEY_PREFIX: &str = "secret-";

/// Per-call evaluation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationOptions {
    /// Evaluate without logging an exposure.
    pub disable_exposure_logging: bool,
    /// Neither replay nor store sticky values.
    pub ignore_persistence: bool,
}

/// Health of the background sync.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Source of the active specs.
    pub source: SpecsSource,
    /// Server time of the active specs, `0` before the first sync.
    pub last_sync_time: u64,
    /// Error of the latest failed sync cycle.
    pub last_error: Option<Error>,
}

#[derive(Debug, Clone, Copy)]
enum Lookup {
    Gate,
    Config,
    Layer,
}

struct Evaluation {
    user: User,
    result: EvalResult,
    details: EvaluationDetails,
}

/// A feature gate and experimentation client.
///
/// Evaluation happens locally against specs kept fresh by a background thread. Exposures and
/// custom events are queued and delivered in batches by a second thread.
///
/// Evaluation methods never fail: faults are reported through the configured
/// [`ObservabilityClient`](crate::ObservabilityClient) and a safe default is returned.
///
/// # Examples
/// ```no_run
/// # use featuregate::{Client, ClientOptions, User};
/// let client = Client::new("secret-key", ClientOptions::default())?;
/// client.initialize()?;
///
/// let user = User::with_user_id("user-1");
/// if client.check_gate(&user, "new_checkout") {
///     // ...
/// }
/// client.shutdown()?;
/// # Ok::<(), featuregate::Error>(())
/// ```
pub struct Client {
    environment: Option<String>,
    hash_algorithm: HashAlgorithm,
    init_timeout: Duration,
    poller_config: PollerThreadConfig,
    bootstrap_specs: Option<String>,
    diagnostics: Arc<Diagnostics>,
    error_boundary: Arc<ErrorBoundary>,
    store: Arc<SpecStore>,
    syncer: Arc<SpecsSyncer>,
    event_logger: Arc<EventLogger>,
    exposures: Arc<ExposureLogger>,
    persisted: Option<PersistedValuesCache>,
    providers: MetadataProviders,
    overrides: LocalOverrides,
    poller: Mutex<Option<PollerThread>>,
    shut_down: AtomicBool,
}

impl Client {
    /// Create a client. No thread is started and no request is made until
    /// [`Client::initialize`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSdkKey`] if `sdk_key` is not a server secret key, and
    /// [`Error::InvalidUrl`] if a configured URL does not parse.
    pub fn new(sdk_key: impl Into<String>, mut options: ClientOptions) -> Result<Client> {
        let sdk_key = sdk_key.into();
        if sdk_key.len() <= SDK_KEY_PREFIX.len() || !sdk_key.starts_with(SDK_KEY_PREFIX) {
            return Err(Error::InvalidSdkKey);
        }
        Url::parse(&options.specs_url).map_err(Error::InvalidUrl)?;
        Url::parse(&options.api_url).map_err(Error::InvalidUrl)?;

        let diagnostics = Arc::new(match options.output_logger.take() {
            Some(output) => Diagnostics::with_output(output),
            None => Diagnostics::new(),
        });
        let error_boundary = Arc::new(ErrorBoundary::new(options.observability_client.clone()));

        let transport: Arc<dyn Transport> = match options.transport.clone() {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(options.request_timeout)?),
        };
        let network = Arc::new(NetworkClient::new(
            transport,
            sdk_key.clone(),
            options.retry_policy(),
        ));

        let store = Arc::new(SpecStore::new(diagnostics.clone()));
        let syncer = Arc::new(SpecsSyncer::new(
            sdk_key,
            store.clone(),
            network.clone(),
            SyncEndpoints {
                specs_url: options.specs_url.clone(),
                api_url: options.api_url.clone(),
                fallback_to_origin: options.fallback_to_origin,
            },
            options.retry_policy(),
            options.data_adapter.clone(),
            options.on_specs_update.clone(),
            diagnostics.clone(),
        ));

        let event_logger = Arc::new(if options.disable_all_logging {
            EventLogger::disabled(error_boundary.clone())
        } else {
            let adapter: Arc<dyn EventLoggingAdapter> = match options.event_logging_adapter.clone()
            {
                Some(adapter) => adapter,
                None => Arc::new(HttpEventLoggingAdapter::new(network, &options.api_url)?),
            };
            EventLogger::new(
                adapter,
                options.event_logger_config(),
                error_boundary.clone(),
            )
        });
        let exposures = Arc::new(ExposureLogger::new(
            store.clone(),
            SamplingProcessor::new(options.environment.clone()),
            event_logger.clone(),
        ));

        Ok(Client {
            hash_algorithm: options.hash_algorithm,
            init_timeout: options.init_timeout,
            poller_config: options.poller_config(),
            persisted: options.persistent_storage.clone().map(PersistedValuesCache::new),
            providers: MetadataProviders {
                user_agent_parser: options.user_agent_parser.clone(),
                country_lookup: options.country_lookup.clone(),
            },
            bootstrap_specs: options.bootstrap_specs.take(),
            environment: options.environment.take(),
            diagnostics,
            error_boundary,
            store,
            syncer,
            event_logger,
            exposures,
            overrides: LocalOverrides::new(),
            poller: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the background threads and wait (up to the configured init timeout) for the first
    /// sync. Calling it again is a no-op.
    ///
    /// A timeout is not an error: the client keeps syncing in the background and evaluates with
    /// defaults until specs arrive.
    ///
    /// # Errors
    ///
    /// Returns the error of the first sync when every source failed, e.g.
    /// [`Error::Unauthorized`] for a rejected key.
    pub fn initialize(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::AlreadyShutdown);
        }
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return Ok(());
        }

        self.diagnostics.start("initialize", "overall");
        self.event_logger.start()?;
        let thread = PollerThread::start(
            self.syncer.clone(),
            self.bootstrap_specs.clone(),
            self.poller_config.clone(),
        )?;
        let result = thread.wait_for_initialization(self.init_timeout);
        *poller = Some(thread);
        drop(poller);

        self.diagnostics.end_with_status(
            "initialize",
            "overall",
            self.store.is_initialized(),
            None,
        );
        self.log_diagnostics("initialize");
        log::info!(target: "featuregate",
                   initialized = self.store.is_initialized(),
                   source:? = self.store.snapshot().specs.source;
                   "client initialized");
        result
    }

    /// Stop background syncing, deliver queued events and release adapters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPanicked`] if a background thread panicked. Every step runs
    /// regardless; the first error is returned.
    pub fn shutdown(self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.diagnostics.start("shutdown", "overall");
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let stopped = poller.map_or(Ok(()), PollerThread::shutdown);
        self.diagnostics
            .mark("shutdown", "overall", MarkerAction::End, stopped.is_ok());
        self.log_diagnostics("shutdown");

        let flushed = self.event_logger.shutdown();
        let adapter = self.syncer.shutdown_data_adapter().inspect_err(|err| {
            log::warn!(target: "featuregate", "failed to shut down data adapter: {err}");
        });
        self.exposures.reset();
        if let Some(persisted) = &self.persisted {
            persisted.clear();
        }
        log::debug!(target: "featuregate", "client shut down");

        stopped.and(flushed).and(adapter)
    }

    /// Current sync health.
    pub fn sync_status(&self) -> SyncStatus {
        let snapshot = self.store.snapshot();
        let state = match &*self.poller.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(poller) => poller.state(),
            None if self.shut_down.load(Ordering::Acquire) => SyncState::Shutdown,
            None => SyncState::Unstarted,
        };
        SyncStatus {
            state,
            source: snapshot.specs.source,
            last_sync_time: snapshot.specs.time,
            last_error: self.syncer.last_error(),
        }
    }

    pub fn check_gate(&self, user: &User, gate_name: &str) -> bool {
        self.check_gate_with_options(user, gate_name, EvaluationOptions::default())
    }

    pub fn check_gate_with_options(
        &self,
        user: &User,
        gate_name: &str,
        options: EvaluationOptions,
    ) -> bool {
        self.get_feature_gate_with_options(user, gate_name, options)
            .value
    }

    pub fn get_feature_gate(&self, user: &User, gate_name: &str) -> FeatureGate {
        self.get_feature_gate_with_options(user, gate_name, EvaluationOptions::default())
    }

    pub fn get_feature_gate_with_options(
        &self,
        user: &User,
        gate_name: &str,
        options: EvaluationOptions,
    ) -> FeatureGate {
        self.error_boundary.capture(
            "get_feature_gate",
            || {
                let evaluation = self.evaluate(user, gate_name, Lookup::Gate, options);
                if !options.disable_exposure_logging {
                    self.exposures
                        .log_gate(&evaluation.user, gate_name, &evaluation.result);
                }
                Ok(FeatureGate::new(
                    gate_name,
                    &evaluation.result,
                    evaluation.details,
                ))
            },
            || FeatureGate::new(gate_name, &EvalResult::default(), EvaluationDetails::error()),
        )
    }

    pub fn get_dynamic_config(&self, user: &User, config_name: &str) -> DynamicConfig {
        self.get_dynamic_config_with_options(user, config_name, EvaluationOptions::default())
    }

    pub fn get_dynamic_config_with_options(
        &self,
        user: &User,
        config_name: &str,
        options: EvaluationOptions,
    ) -> DynamicConfig {
        self.error_boundary.capture(
            "get_dynamic_config",
            || {
                let evaluation = self.evaluate(user, config_name, Lookup::Config, options);
                if !options.disable_exposure_logging {
                    self.exposures
                        .log_config(&evaluation.user, config_name, &evaluation.result);
                }
                Ok(DynamicConfig::new(
                    config_name,
                    &evaluation.result,
                    evaluation.details,
                ))
            },
            || {
                DynamicConfig::new(
                    config_name,
                    &EvalResult::default(),
                    EvaluationDetails::error(),
                )
            },
        )
    }

    pub fn get_experiment(&self, user: &User, experiment_name: &str) -> Experiment {
        self.get_experiment_with_options(user, experiment_name, EvaluationOptions::default())
    }

    pub fn get_experiment_with_options(
        &self,
        user: &User,
        experiment_name: &str,
        options: EvaluationOptions,
    ) -> Experiment {
        self.error_boundary.capture(
            "get_experiment",
            || {
                let evaluation = self.evaluate(user, experiment_name, Lookup::Config, options);
                if !options.disable_exposure_logging {
                    self.exposures
                        .log_config(&evaluation.user, experiment_name, &evaluation.result);
                }
                Ok(Experiment::new(
                    experiment_name,
                    &evaluation.result,
                    evaluation.details,
                ))
            },
            || {
                Experiment::new(
                    experiment_name,
                    &EvalResult::default(),
                    EvaluationDetails::error(),
                )
            },
        )
    }

    /// Evaluate a layer. Exposures are logged per parameter, when read through [`Layer::get`].
    pub fn get_layer(&self, user: &User, layer_name: &str) -> Layer {
        self.get_layer_with_options(user, layer_name, EvaluationOptions::default())
    }

    pub fn get_layer_with_options(
        &self,
        user: &User,
        layer_name: &str,
        options: EvaluationOptions,
    ) -> Layer {
        self.error_boundary.capture(
            "get_layer",
            || {
                let evaluation = self.evaluate(user, layer_name, Lookup::Layer, options);
                let exposures =
                    (!options.disable_exposure_logging).then(|| self.exposures.clone());
                Ok(Layer::new(
                    layer_name,
                    &evaluation.user,
                    evaluation.result,
                    evaluation.details,
                    exposures,
                ))
            },
            || {
                Layer::new(
                    layer_name,
                    user,
                    EvalResult::default(),
                    EvaluationDetails::error(),
                    None,
                )
            },
        )
    }

    /// Pick a contextual bandit arm for the user. The exposure is logged as a config exposure.
    pub fn get_cmab(&self, user: &User, cmab_name: &str) -> Experiment {
        self.error_boundary.capture(
            "get_cmab",
            || {
                let user = user.with_default_environment(self.environment.as_deref());
                let snapshot = self.store.snapshot();
                let (result, reason) = if !snapshot.is_initialized() {
                    (EvalResult::default(), EvaluationReason::Uninitialized)
                } else if let Some(cmab) = snapshot.get_cmab(cmab_name) {
                    let ctx = EvalContext::new(&user, &snapshot, &self.providers);
                    (
                        evaluate_cmab(&ctx, cmab, 0),
                        EvaluationReason::from(snapshot.specs.source),
                    )
                } else {
                    (EvalResult::default(), EvaluationReason::Unrecognized)
                };
                self.exposures.log_config(&user, cmab_name, &result);
                Ok(Experiment::new(
                    cmab_name,
                    &result,
                    EvaluationDetails::new(reason, &snapshot.specs),
                ))
            },
            || Experiment::new(cmab_name, &EvalResult::default(), EvaluationDetails::error()),
        )
    }

    /// Log an exposure for a gate evaluated earlier with exposure logging disabled.
    pub fn manually_log_gate_exposure(&self, user: &User, gate_name: &str) {
        self.error_boundary.capture(
            "manually_log_gate_exposure",
            || {
                let evaluation =
                    self.evaluate(user, gate_name, Lookup::Gate, EvaluationOptions::default());
                self.exposures
                    .log_gate(&evaluation.user, gate_name, &evaluation.result);
                Ok(())
            },
            || (),
        );
    }

    /// Log an exposure for a config or experiment evaluated earlier with exposure logging
    /// disabled.
    pub fn manually_log_config_exposure(&self, user: &User, config_name: &str) {
        self.error_boundary.capture(
            "manually_log_config_exposure",
            || {
                let evaluation =
                    self.evaluate(user, config_name, Lookup::Config, EvaluationOptions::default());
                self.exposures
                    .log_config(&evaluation.user, config_name, &evaluation.result);
                Ok(())
            },
            || (),
        );
    }

    pub fn manually_log_layer_parameter_exposure(
        &self,
        user: &User,
        layer_name: &str,
        parameter_name: &str,
    ) {
        self.error_boundary.capture(
            "manually_log_layer_parameter_exposure",
            || {
                let evaluation =
                    self.evaluate(user, layer_name, Lookup::Layer, EvaluationOptions::default());
                self.exposures.log_layer_parameter(
                    &evaluation.user,
                    layer_name,
                    parameter_name,
                    &evaluation.result,
                );
                Ok(())
            },
            || (),
        );
    }

    /// Queue a custom event. Events with an empty name are dropped.
    pub fn log_event(
        &self,
        user: &User,
        event_name: &str,
        value: Option<DynamicValue>,
        metadata: Option<BTreeMap<String, String>>,
    ) {
        if event_name.is_empty() {
            log::warn!(target: "featuregate", "dropping event with an empty name");
            return;
        }
        self.error_boundary.capture(
            "log_event",
            || {
                let user = user.with_default_environment(self.environment.as_deref());
                self.event_logger.enqueue(LogEvent::custom(
                    &user,
                    event_name,
                    value,
                    metadata.unwrap_or_default(),
                ));
                Ok(())
            },
            || (),
        );
    }

    /// Deliver queued events now, on the calling thread.
    pub fn flush_events(&self) {
        self.event_logger.flush();
    }

    /// Evaluate every entity the client key may see and render the client bootstrap payload.
    /// Returns `None` until specs are available.
    pub fn get_client_initialize_response(
        &self,
        user: &User,
        options: &ClientInitResponseOptions,
    ) -> Option<ClientInitResponse> {
        self.error_boundary.capture(
            "get_client_initialize_response",
            || {
                let snapshot = self.store.snapshot();
                if !snapshot.is_initialized() {
                    log::warn!(target: "featuregate", "client initialize response requested before specs are available");
                    return Ok(None);
                }
                let user = user.with_default_environment(self.environment.as_deref());
                let ctx = EvalContext::new(&user, &snapshot, &self.providers);
                Ok(Some(client_init_response::build(
                    &ctx,
                    Some(&self.overrides),
                    options,
                    self.hash_algorithm,
                )))
            },
            || None,
        )
    }

    /// Force a gate value, for every user or only for `id` (a user id or custom id).
    pub fn override_gate(&self, gate_name: &str, value: bool, id: Option<&str>) {
        self.overrides.override_gate(gate_name, value, id);
    }

    /// Force the value of a dynamic config or experiment.
    pub fn override_config(&self, config_name: &str, value: DynamicValue, id: Option<&str>) {
        self.overrides.override_config(config_name, value, id);
    }

    pub fn override_layer(&self, layer_name: &str, value: DynamicValue, id: Option<&str>) {
        self.overrides.override_layer(layer_name, value, id);
    }

    pub fn remove_gate_override(&self, gate_name: &str, id: Option<&str>) {
        self.overrides.remove_gate_override(gate_name, id);
    }

    pub fn remove_config_override(&self, config_name: &str, id: Option<&str>) {
        self.overrides.remove_config_override(config_name, id);
    }

    pub fn remove_layer_override(&self, layer_name: &str, id: Option<&str>) {
        self.overrides.remove_layer_override(layer_name, id);
    }

    pub fn remove_all_overrides(&self) {
        self.overrides.remove_all_overrides();
    }

    fn evaluate(
        &self,
        user: &User,
        name: &str,
        lookup: Lookup,
        options: EvaluationOptions,
    ) -> Evaluation {
        let user = user.with_default_environment(self.environment.as_deref());
        let snapshot = self.store.snapshot();

        let overridden = match lookup {
            Lookup::Gate => self.overrides.gate_override(&user, name),
            Lookup::Config => self.overrides.config_override(&user, name),
            Lookup::Layer => self.overrides.layer_override(&user, name),
        };
        if let Some(result) = overridden {
            return Evaluation {
                details: EvaluationDetails::new(EvaluationReason::LocalOverride, &snapshot.specs),
                user,
                result,
            };
        }

        if !snapshot.is_initialized() {
            log::debug!(target: "featuregate", name; "evaluating before specs are available");
            return Evaluation {
                details: EvaluationDetails::new(EvaluationReason::Uninitialized, &snapshot.specs),
                user,
                result: EvalResult::default(),
            };
        }

        let Some(spec) = find_spec(&snapshot, name, lookup) else {
            log::debug!(target: "featuregate", name, lookup:?; "unrecognized entity");
            return Evaluation {
                details: EvaluationDetails::new(EvaluationReason::Unrecognized, &snapshot.specs),
                user,
                result: EvalResult::default(),
            };
        };

        let stored = self.load_sticky(&user, spec, options);
        let result = {
            let mut ctx = EvalContext::new(&user, &snapshot, &self.providers)
                .with_persisted_values(stored.as_deref());
            ctx.ignore_persistence = options.ignore_persistence;
            evaluate(&ctx, spec, 0)
        };
        self.update_sticky(&user, spec, &result, stored.as_deref(), options);

        let reason = if result.from_persisted {
            EvaluationReason::Persisted
        } else {
            EvaluationReason::from(snapshot.specs.source)
        };
        Evaluation {
            details: EvaluationDetails::new(reason, &snapshot.specs),
            user,
            result,
        }
    }

    fn load_sticky(
        &self,
        user: &User,
        spec: &Spec,
        options: EvaluationOptions,
    ) -> Option<Arc<UserPersistedValues>> {
        let persisted = self.persisted.as_ref()?;
        let sticky_kind = spec.entity.is_experiment_like() || spec.entity == EntityKind::Layer;
        if options.ignore_persistence || !sticky_kind {
            return None;
        }
        persisted.load(user, &spec.id_type)
    }

    /// Pin a fresh experiment-group assignment, or drop a pinned value the user no longer
    /// qualifies for.
    fn update_sticky(
        &self,
        user: &User,
        spec: &Spec,
        result: &EvalResult,
        stored: Option<&UserPersistedValues>,
        options: EvaluationOptions,
    ) {
        let Some(persisted) = &self.persisted else {
            return;
        };
        if options.ignore_persistence || result.from_persisted {
            return;
        }

        let eligible = result.is_experiment_group
            && match spec.entity {
                kind if kind.is_experiment_like() => spec.is_active.unwrap_or(false),
                EntityKind::Layer => result.config_delegate.is_some(),
                _ => false,
            };
        if eligible {
            persisted.save(
                user,
                &spec.id_type,
                &spec.name,
                result.to_sticky(Utc::now().timestamp_millis()),
            );
        } else if stored.is_some_and(|values| values.contains_key(&spec.name)) {
            persisted.delete(user, &spec.id_type, &spec.name);
        }
    }

    fn log_diagnostics(&self, context: &str) {
        let markers = self.diagnostics.drain();
        if markers.is_empty() {
            return;
        }
        let rate = self
            .store
            .snapshot()
            .specs
            .diagnostics_rates
            .get(context)
            .copied();
        if rate.is_some_and(|rate| rate <= 0.0) {
            return;
        }
        self.event_logger
            .enqueue(LogEvent::diagnostics(context, &markers));
    }
}

fn find_spec<'a>(snapshot: &'a StoreSnapshot, name: &str, lookup: Lookup) -> Option<&'a Spec> {
    let spec = match lookup {
        Lookup::Gate => snapshot.get_gate(name),
        Lookup::Config => snapshot.get_dynamic_config(name),
        Lookup::Layer => snapshot.get_layer_config(name),
    };
    spec.map(|spec| &**spec)
}
