//! A background poller thread that keeps the spec store fresh.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use rand::{thread_rng, Rng};
use serde::Serialize;

use crate::{
    sync::specs_sync::SpecsSyncer,
    Error, Result,
};

/// Lifecycle of the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unstarted,
    /// Running the first sync (bootstrap, data adapter, then network).
    Bootstrapping,
    Polling,
    Shutdown,
}

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between spec syncs.
    pub specs_interval: Duration,
    /// Interval between id list syncs. `None` disables id list syncing.
    pub id_lists_interval: Option<Duration>,
    /// Jitter applies a randomized duration to wait between requests. This helps to avoid
    /// multiple server instances synchronizing and producing spiky network load.
    pub jitter: Duration,
}

impl PollerThreadConfig {
    pub const DEFAULT_SPECS_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_ID_LISTS_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(1);
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            specs_interval: PollerThreadConfig::DEFAULT_SPECS_INTERVAL,
            id_lists_interval: Some(PollerThreadConfig::DEFAULT_ID_LISTS_INTERVAL),
            jitter: PollerThreadConfig::DEFAULT_JITTER,
        }
    }
}

#[derive(Debug)]
struct PollerStatus {
    state: SyncState,
    /// `None` until the first sync finishes.
    initialized: Option<Result<()>>,
}

type SharedStatus = Arc<(Mutex<PollerStatus>, Condvar)>;

/// The poller thread runs the first sync, then syncs specs (and id lists) periodically until
/// stopped.
///
/// Source precedence for the first sync: the bootstrap document (only while the store is empty),
/// the data adapter, then the network. The network is skipped when an earlier source initialized
/// the store. A failed cycle never clears the store.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    status: SharedStatus,
}

impl PollerThread {
    /// Starts the poller thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(
        syncer: Arc<SpecsSyncer>,
        bootstrap: Option<String>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough as we can simply `try_send()` and ignore if the
        // buffer is full (another thread has sent a stop command already).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let status: SharedStatus = Arc::new((
            Mutex::new(PollerStatus {
                state: SyncState::Unstarted,
                initialized: None,
            }),
            Condvar::new(),
        ));

        let join_handle = {
            let status = Arc::clone(&status);
            let update = move |state: SyncState, initialized: Option<Result<()>>| {
                let mut guard = status.0.lock().unwrap_or_else(PoisonError::into_inner);
                guard.state = state;
                if let Some(result) = initialized {
                    guard.initialized.get_or_insert(result);
                }
                status.1.notify_all();
            };

            std::thread::Builder::new()
                .name("featuregate-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        update(SyncState::Bootstrapping, None);
                        let first = initial_sync(&syncer, bootstrap.as_deref());
                        if let Some(interval) = config.id_lists_interval {
                            if !syncer.is_unauthorized() && interval > Duration::ZERO {
                                let _ = syncer.sync_id_lists();
                            }
                        }
                        if let Err(Error::Unauthorized) = first {
                            // Unrecoverable error
                            update(SyncState::Shutdown, Some(first));
                            return;
                        }
                        update(SyncState::Polling, Some(first));

                        let mut last_id_list_sync = Instant::now();
                        loop {
                            let timeout = jitter(config.specs_interval, config.jitter);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {}
                                Ok(()) => {
                                    log::debug!(target: "featuregate", "poller thread received stop command");
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    log::debug!(target: "featuregate", "poller thread received disconnected");
                                    return;
                                }
                            }

                            log::debug!(target: "featuregate", "syncing specs");
                            if let Err(Error::Unauthorized) = syncer.sync_specs() {
                                update(SyncState::Shutdown, None);
                                return;
                            }

                            if let Some(interval) = config.id_lists_interval {
                                if last_id_list_sync.elapsed() >= interval {
                                    log::debug!(target: "featuregate", "syncing id lists");
                                    let _ = syncer.sync_id_lists();
                                    last_id_list_sync = Instant::now();
                                }
                            }
                        }
                    }));

                    if result.is_err() {
                        update(SyncState::Shutdown, Some(Err(Error::ThreadPanicked)));
                    } else {
                        update(SyncState::Shutdown, None);
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            status,
        })
    }

    pub fn state(&self) -> SyncState {
        self.status
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Block until the first sync finishes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns the error of the first sync, if every source failed. Returns `Ok` on timeout; the
    /// poller keeps trying in the background.
    pub fn wait_for_initialization(&self, timeout: Duration) -> Result<()> {
        let guard = self.status.0.lock().map_err(|_| Error::ThreadPanicked)?;
        let (guard, _) = self
            .status
            .1
            .wait_timeout_while(guard, timeout, |status| status.initialized.is_none())
            .map_err(|_| Error::ThreadPanicked)?;
        match &guard.initialized {
            Some(result) => result.clone(),
            None => {
                log::warn!(target: "featuregate", "initialization timed out, continuing in the background");
                Ok(())
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means the receiver was dropped (thread exited) or the buffer is full (stop was
        // already sent). Both can be ignored.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::ThreadPanicked)?;
        Ok(())
    }
}

fn initial_sync(syncer: &SpecsSyncer, bootstrap: Option<&str>) -> Result<()> {
    if let Some(json) = bootstrap {
        if let Err(err) = syncer.bootstrap(json) {
            log::warn!(target: "featuregate", "bootstrap document rejected: {err}");
        }
    }

    if syncer.has_data_adapter() {
        if let Err(err) = syncer
            .initialize_data_adapter()
            .and_then(|()| syncer.sync_from_data_adapter())
        {
            log::debug!(target: "featuregate", "data adapter has no specs: {err}");
        }
    }

    if syncer.store().is_initialized() {
        return Ok(());
    }

    syncer.sync_from_network().map(|_| ())
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let result = super::jitter(Duration::ZERO, Duration::from_secs(30));
        assert_eq!(result, Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::Diagnostics,
        specs::store::{SpecStore, SpecsSource},
        sync::{
            network::{testing::FakeTransport, NetworkClient, RetryPolicy},
            specs_sync::SyncEndpoints,
        },
    };

    fn syncer(transport: Arc<FakeTransport>) -> Arc<SpecsSyncer> {
        let diagnostics = Arc::new(Diagnostics::new());
        Arc::new(SpecsSyncer::new(
            "secret-key".to_owned(),
            Arc::new(SpecStore::new(diagnostics.clone())),
            Arc::new(NetworkClient::new(
                transport,
                "secret-key".to_owned(),
                RetryPolicy::NONE,
            )),
            SyncEndpoints {
                specs_url: "https://api.test/v1".to_owned(),
                api_url: "https://api.test/v1".to_owned(),
                fallback_to_origin: false,
            },
            RetryPolicy::NONE,
            None,
            None,
            diagnostics,
        ))
    }

    fn config() -> PollerThreadConfig {
        PollerThreadConfig {
            specs_interval: Duration::from_millis(10),
            id_lists_interval: None,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn bootstrap_initializes_without_network() {
        let _ = env_logger::builder().is_test(true).try_init();

        let transport = Arc::new(FakeTransport::default());
        let syncer = syncer(transport);
        let bootstrap = r#"{"has_updates": true, "time": 7, "feature_gates": []}"#.to_owned();

        let poller = PollerThread::start(syncer.clone(), Some(bootstrap), config()).unwrap();
        poller.wait_for_initialization(Duration::from_secs(5)).unwrap();

        assert_eq!(syncer.store().last_sync_time(), 7);
        assert_eq!(syncer.store().snapshot().specs.source, SpecsSource::Bootstrap);
        assert_eq!(poller.state(), SyncState::Polling);
        poller.shutdown().unwrap();
    }

    #[test]
    fn unauthorized_stops_polling() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond("/v1/download_config_specs/secret-key.json", 401, "");
        let syncer = syncer(transport.clone());

        let poller = PollerThread::start(syncer, None, config()).unwrap();
        assert!(matches!(
            poller.wait_for_initialization(Duration::from_secs(5)),
            Err(Error::Unauthorized)
        ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(poller.state(), SyncState::Shutdown);
        assert_eq!(transport.requests_to("/v1/download_config_specs/secret-key.json").len(), 1);
        poller.shutdown().unwrap();
    }

    #[test]
    fn polls_until_stopped() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond(
            "/v1/download_config_specs/secret-key.json",
            200,
            r#"{"has_updates": true, "time": 1}"#,
        );
        let poller = PollerThread::start(syncer(transport.clone()), None, config()).unwrap();
        poller.wait_for_initialization(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        poller.shutdown().unwrap();

        let count = transport.requests_to("/v1/download_config_specs/secret-key.json").len();
        assert!(count > 1, "{count}");
    }
}
