//! Background delivery of queued events.
use std::{
    sync::{
        mpsc::{RecvTimeoutError, SyncSender},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use reqwest::Url;
use serde::Serialize;

use crate::{
    error_boundary::ErrorBoundary,
    events::{queue::EventQueue, LogEvent},
    sync::network::{NetworkClient, Request, RetryPolicy},
    Error, Result,
};

/// Delivers a batch of events somewhere.
pub trait EventLoggingAdapter: Send + Sync {
    fn log_events(&self, events: &[LogEvent]) -> Result<()>;
}

/// Posts batches to the `rgstr` endpoint of the API.
pub struct HttpEventLoggingAdapter {
    network: Arc<NetworkClient>,
    url: Url,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEventRequest<'a> {
    events: &'a [LogEvent],
    statsig_metadata: SdkMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SdkMetadata {
    sdk_type: &'static str,
    sdk_version: &'static str,
}

impl HttpEventLoggingAdapter {
    pub fn new(network: Arc<NetworkClient>, api_url: &str) -> Result<HttpEventLoggingAdapter> {
        let url = Url::parse(&format!("{}/rgstr", api_url.trim_end_matches('/')))
            .map_err(Error::InvalidUrl)?;
        Ok(HttpEventLoggingAdapter { network, url })
    }
}

impl EventLoggingAdapter for HttpEventLoggingAdapter {
    fn log_events(&self, events: &[LogEvent]) -> Result<()> {
        let body = serde_json::to_string(&LogEventRequest {
            events,
            statsig_metadata: SdkMetadata {
                sdk_type: env!("CARGO_PKG_NAME"),
                sdk_version: env!("CARGO_PKG_VERSION"),
            },
        })?;
        let request = Request::post(self.url.clone(), body)
            .with_header("STATSIG-EVENT-COUNT", events.len().to_string());
        // Retries are driven by the event logger.
        self.network.send(request, RetryPolicy::NONE)?;
        Ok(())
    }
}

/// Configuration for [`EventLogger`].
#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub queue_capacity: usize,
    /// Retry budget and backoff for a batch whose delivery failed.
    pub retry: RetryPolicy,
}

impl EventLoggerConfig {
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_BATCH_SIZE: usize = 1_000;
    pub const DEFAULT_QUEUE_CAPACITY: usize = 50_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
}

impl Default for EventLoggerConfig {
    fn default() -> EventLoggerConfig {
        EventLoggerConfig {
            flush_interval: EventLoggerConfig::DEFAULT_FLUSH_INTERVAL,
            batch_size: EventLoggerConfig::DEFAULT_BATCH_SIZE,
            queue_capacity: EventLoggerConfig::DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy {
                max_retries: EventLoggerConfig::DEFAULT_MAX_RETRIES,
                backoff_base: Duration::from_millis(200),
                backoff_max: Duration::from_secs(5),
            },
        }
    }
}

enum Command {
    Flush,
    Stop,
}

struct Delivery {
    queue: EventQueue,
    adapter: Arc<dyn EventLoggingAdapter>,
    error_boundary: Arc<ErrorBoundary>,
    retry: RetryPolicy,
}

impl Delivery {
    fn flush_all(&self) {
        loop {
            let batch = self.queue.next_batch();
            if batch.is_empty() {
                return;
            }
            self.deliver(&batch);
        }
    }

    fn deliver(&self, batch: &[LogEvent]) {
        let mut attempt = 0;
        loop {
            let err = match self.adapter.log_events(batch) {
                Ok(()) => {
                    log::debug!(target: "featuregate", count = batch.len(); "flushed events");
                    return;
                }
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.retry.max_retries {
                log::warn!(target: "featuregate",
                           dropped = batch.len(),
                           attempts = attempt + 1;
                           "failed to flush events: {err}");
                self.error_boundary.report(
                    "flush_events",
                    &format!("dropped {} events: {err}", batch.len()),
                );
                return;
            }
            std::thread::sleep(self.retry.delay_for_attempt(attempt));
            attempt += 1;
        }
    }
}

/// Queues events and delivers them in batches from a background thread, every flush interval or
/// as soon as a full batch is queued.
///
/// Enqueueing never blocks on delivery. Batches that still fail after the retry budget are dropped
/// and reported to the [`ErrorBoundary`].
pub struct EventLogger {
    delivery: Arc<Delivery>,
    flush_interval: Duration,
    /// Command channel and handle of the flush thread, if started.
    worker: Mutex<Option<(SyncSender<Command>, JoinHandle<()>)>>,
    disabled: bool,
}

impl EventLogger {
    pub fn new(
        adapter: Arc<dyn EventLoggingAdapter>,
        config: EventLoggerConfig,
        error_boundary: Arc<ErrorBoundary>,
    ) -> EventLogger {
        EventLogger {
            delivery: Arc::new(Delivery {
                queue: EventQueue::new(config.batch_size, config.queue_capacity),
                adapter,
                error_boundary,
                retry: config.retry,
            }),
            flush_interval: config.flush_interval,
            worker: Mutex::new(None),
            disabled: false,
        }
    }

    /// Logger that discards every event.
    pub fn disabled(error_boundary: Arc<ErrorBoundary>) -> EventLogger {
        struct Noop;
        impl EventLoggingAdapter for Noop {
            fn log_events(&self, _events: &[LogEvent]) -> Result<()> {
                Ok(())
            }
        }
        EventLogger {
            disabled: true,
            ..EventLogger::new(Arc::new(Noop), EventLoggerConfig::default(), error_boundary)
        }
    }

    /// Start the flush thread. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() || self.disabled {
            return Ok(());
        }

        // A buffer of 1 is enough: a pending Flush already covers any later one.
        let (sender, receiver) = std::sync::mpsc::sync_channel::<Command>(1);
        let delivery = Arc::clone(&self.delivery);
        let flush_interval = self.flush_interval;
        let handle = std::thread::Builder::new()
            .name("featuregate-events".to_owned())
            .spawn(move || loop {
                match receiver.recv_timeout(flush_interval) {
                    Ok(Command::Flush) | Err(RecvTimeoutError::Timeout) => delivery.flush_all(),
                    Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        log::debug!(target: "featuregate", "event logger thread stopping");
                        return;
                    }
                }
            })?;
        *worker = Some((sender, handle));
        Ok(())
    }

    pub fn enqueue(&self, event: LogEvent) {
        if self.disabled {
            return;
        }
        if self.delivery.queue.push(event) {
            if let Some((sender, _)) = &*self.worker.lock().unwrap_or_else(PoisonError::into_inner)
            {
                let _ = sender.try_send(Command::Flush);
            }
        }
    }

    /// Deliver everything queued, on the calling thread.
    pub fn flush(&self) {
        self.delivery.flush_all();
    }

    pub fn pending_count(&self) -> usize {
        self.delivery.queue.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.delivery.queue.dropped_count()
    }

    /// Stop the flush thread and deliver what is left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPanicked`] if the flush thread has panicked. Remaining events are
    /// flushed regardless.
    pub fn shutdown(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let joined = match worker {
            Some((sender, handle)) => {
                // The buffer may hold a Flush; a blocking send waits for the thread to take it.
                let _ = sender.send(Command::Stop);
                handle.join().map_err(|_| Error::ThreadPanicked)
            }
            None => Ok(()),
        };
        self.flush();
        joined
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        error_boundary::ObservabilityClient,
        sync::network::testing::FakeTransport,
        User,
    };

    #[derive(Default)]
    struct RecordingAdapter {
        batches: Mutex<Vec<Vec<LogEvent>>>,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl EventLoggingAdapter for RecordingAdapter {
        fn log_events(&self, events: &[LogEvent]) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Network {
                    status: 503,
                    retryable: true,
                });
            }
            self.batches.lock().unwrap().push(events.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingObserver(AtomicUsize);

    impl ObservabilityClient for CountingObserver {
        fn on_error(&self, _tag: &str, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(batch_size: usize) -> EventLoggerConfig {
        EventLoggerConfig {
            flush_interval: Duration::from_secs(3600),
            batch_size,
            queue_capacity: 1_000,
            retry: RetryPolicy {
                max_retries: 2,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(1),
            },
        }
    }

    fn event(i: usize) -> LogEvent {
        LogEvent::custom(&User::with_user_id("u"), &format!("e{i}"), None, BTreeMap::new())
    }

    #[test]
    fn full_batch_triggers_background_flush() {
        let _ = env_logger::builder().is_test(true).try_init();

        let adapter = Arc::new(RecordingAdapter::default());
        let logger = EventLogger::new(adapter.clone(), config(10), Arc::default());
        logger.start().unwrap();

        for i in 0..10 {
            logger.enqueue(event(i));
        }
        for _ in 0..200 {
            if !adapter.batches.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(adapter.batches.lock().unwrap()[0].len(), 10);
        logger.shutdown().unwrap();
    }

    #[test]
    fn shutdown_flushes_remaining_events() {
        let adapter = Arc::new(RecordingAdapter::default());
        let logger = EventLogger::new(adapter.clone(), config(10), Arc::default());
        logger.start().unwrap();

        for i in 0..3 {
            logger.enqueue(event(i));
        }
        logger.shutdown().unwrap();

        assert_eq!(logger.pending_count(), 0);
        let batches = adapter.batches.lock().unwrap();
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 3);
    }

    #[test]
    fn transient_failures_are_retried() {
        let adapter = Arc::new(RecordingAdapter {
            failures_left: AtomicUsize::new(2),
            ..RecordingAdapter::default()
        });
        let logger = EventLogger::new(adapter.clone(), config(10), Arc::default());
        logger.enqueue(event(0));
        logger.flush();

        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(adapter.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn exhausted_retries_drop_and_report() {
        let adapter = Arc::new(RecordingAdapter {
            failures_left: AtomicUsize::new(usize::MAX),
            ..RecordingAdapter::default()
        });
        let observer = Arc::new(CountingObserver::default());
        let boundary = Arc::new(ErrorBoundary::new(Some(observer.clone())));
        let logger = EventLogger::new(adapter.clone(), config(10), boundary);
        logger.enqueue(event(0));
        logger.flush();

        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(logger.pending_count(), 0);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_logger_discards() {
        let logger = EventLogger::disabled(Arc::default());
        logger.enqueue(event(0));
        assert_eq!(logger.pending_count(), 0);
    }

    #[test]
    fn http_adapter_posts_to_rgstr() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond("/v1/rgstr", 202, "");
        let network = Arc::new(NetworkClient::new(
            transport.clone(),
            "secret-key".to_owned(),
            RetryPolicy::NONE,
        ));
        let adapter = HttpEventLoggingAdapter::new(network, "https://api.test/v1/").unwrap();

        adapter.log_events(&[event(0), event(1)]).unwrap();

        let request = &transport.requests_to("/v1/rgstr")[0];
        let body: serde_json::Value =
            serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["events"].as_array().unwrap().len(), 2);
        assert_eq!(body["events"][0]["eventName"], "e0");
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| *name == "STATSIG-EVENT-COUNT" && value == "2"));
    }
}
