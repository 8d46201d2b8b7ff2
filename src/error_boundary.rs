//! Single funnel for internal faults.
//!
//! Public entry points run their body through [`ErrorBoundary::capture`]. Faults (returned errors
//! or panics) are logged once per dedupe window, reported to an optional
//! [`ObservabilityClient`], and replaced with the caller's default. Nothing is re-raised into
//! application code.
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::Error;

/// Identical faults are reported at most once per this window.
const DEDUPE_WINDOW: Duration = Duration::from_secs(60);
/// Bound on distinct tracked faults, so an outage with varying messages cannot grow the map.
const MAX_TRACKED_FAULTS: usize = 1_000;

/// Receives faults surfaced by the SDK, e.g. to count them in a metrics backend.
pub trait ObservabilityClient: Send + Sync {
    fn on_error(&self, tag: &str, message: &str);
}

#[derive(Default)]
pub struct ErrorBoundary {
    seen: Mutex<HashMap<String, Instant>>,
    observer: Option<Arc<dyn ObservabilityClient>>,
}

impl ErrorBoundary {
    pub fn new(observer: Option<Arc<dyn ObservabilityClient>>) -> ErrorBoundary {
        ErrorBoundary {
            seen: Mutex::default(),
            observer,
        }
    }

    /// Run `task`, converting any error or panic into `default()`.
    pub fn capture<T>(
        &self,
        tag: &str,
        task: impl FnOnce() -> Result<T, Error>,
        default: impl FnOnce() -> T,
    ) -> T {
        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                self.report(tag, &err.to_string());
                default()
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                self.report(tag, &message);
                default()
            }
        }
    }

    /// Report a fault that was handled elsewhere.
    pub fn report(&self, tag: &str, message: &str) {
        if !self.should_report(tag, message) {
            return;
        }
        log::error!(target: "featuregate", tag; "{message}");
        if let Some(observer) = &self.observer {
            observer.on_error(tag, message);
        }
    }

    fn should_report(&self, tag: &str, message: &str) -> bool {
        let key = format!("{tag}:{message}");
        let now = Instant::now();
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(last) = seen.get(&key) {
            if now.duration_since(*last) < DEDUPE_WINDOW {
                return false;
            }
        }
        if seen.len() >= MAX_TRACKED_FAULTS {
            seen.retain(|_, last| now.duration_since(*last) < DEDUPE_WINDOW);
            if seen.len() >= MAX_TRACKED_FAULTS {
                return false;
            }
        }
        seen.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingObserver(AtomicUsize);

    impl ObservabilityClient for CountingObserver {
        fn on_error(&self, _tag: &str, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn returns_default_on_error_and_panic() {
        let boundary = ErrorBoundary::default();
        assert_eq!(
            boundary.capture("t", || Err(Error::AlreadyShutdown), || 7),
            7
        );
        assert_eq!(
            boundary.capture("t", || -> Result<i32, Error> { panic!("boom") }, || 8),
            8
        );
        assert_eq!(boundary.capture("t", || Ok(1), || 9), 1);
    }

    #[test]
    fn identical_faults_are_reported_once() {
        let observer = Arc::new(CountingObserver::default());
        let boundary = ErrorBoundary::new(Some(observer.clone()));

        for _ in 0..50 {
            boundary.report("check_gate", "same failure");
        }
        boundary.report("check_gate", "other failure");

        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
    }
}
