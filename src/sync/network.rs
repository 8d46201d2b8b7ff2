//! HTTP plumbing shared by spec sync, id list sync and event delivery.
//!
//! [`Transport`] performs a single request. [`NetworkClient`] layers the retry budget,
//! exponential backoff, origin fallback and unauthorized caching on top of it.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use reqwest::Url;

use crate::{Error, Result};

const API_KEY_HEADER: &str = "STATSIG-API-KEY";
const CLIENT_TIME_HEADER: &str = "STATSIG-CLIENT-TIME";
const SDK_TYPE_HEADER: &str = "STATSIG-SDK-TYPE";
const SDK_VERSION_HEADER: &str = "STATSIG-SDK-VERSION";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

impl Request {
    pub fn get(url: Url) -> Request {
        Request {
            method: Method::Get,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: Url, body: String) -> Request {
        Request {
            method: Method::Post,
            url,
            headers: vec![("Content-Type", "application/json".to_owned())],
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Request {
        self.headers.push((name, value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A single HTTP round trip. Non-success statuses are returned as `Ok`; `Err` means the request
/// could not be performed at all.
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<Response>;
}

/// [`Transport`] backed by a blocking reqwest client.
pub struct ReqwestTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<ReqwestTransport> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        let mut builder = match request.method {
            Method::Get => self.client.get(request.url.clone()),
            Method::Post => self.client.post(request.url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(Response { status, body })
    }
}

/// Retry budget and backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// No retries.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
    };

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.backoff_max)
    }
}

/// Authenticated client for the feature gate service.
pub struct NetworkClient {
    transport: Arc<dyn Transport>,
    sdk_key: String,
    retry: RetryPolicy,
    /// If we receive a 401/403 during a request, the sdk key is not valid. We cache this so we
    /// don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl NetworkClient {
    pub fn new(transport: Arc<dyn Transport>, sdk_key: String, retry: RetryPolicy) -> NetworkClient {
        NetworkClient {
            transport,
            sdk_key,
            retry,
            unauthorized: AtomicBool::new(false),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.unauthorized.load(Ordering::Relaxed)
    }

    /// Send `request` to `primary`, retrying retryable failures. If the primary endpoint keeps
    /// failing with a retryable error, the request is sent once more through `fallback`.
    pub fn send_with_fallback(
        &self,
        request: Request,
        fallback: Option<Url>,
    ) -> Result<Response> {
        match self.send(request.clone(), self.retry) {
            Err(err) if err.is_retryable() => match fallback {
                Some(url) => {
                    log::debug!(target: "featuregate",
                                url:% = url;
                                "primary endpoint failed, falling back to origin: {err}");
                    self.send(Request { url, ..request }, RetryPolicy::NONE)
                }
                None => Err(err),
            },
            other => other,
        }
    }

    /// Send `request`, retrying retryable failures according to `retry`.
    pub fn send(&self, request: Request, retry: RetryPolicy) -> Result<Response> {
        if self.is_unauthorized() {
            return Err(Error::Unauthorized);
        }

        let request = request
            .with_header(API_KEY_HEADER, self.sdk_key.clone())
            .with_header(SDK_TYPE_HEADER, env!("CARGO_PKG_NAME"))
            .with_header(SDK_VERSION_HEADER, env!("CARGO_PKG_VERSION"));

        let mut attempt = 0;
        loop {
            let request = request.clone().with_header(
                CLIENT_TIME_HEADER,
                chrono::Utc::now().timestamp_millis().to_string(),
            );
            let err = match self.transport.send(&request) {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => Error::from_status(response.status),
                Err(err) => err,
            };

            if let Error::Unauthorized = err {
                log::warn!(target: "featuregate", "client is not authorized. Check your sdk key");
                self.unauthorized.store(true, Ordering::Relaxed);
                return Err(err);
            }
            if !err.is_retryable() || attempt >= retry.max_retries {
                log::warn!(target: "featuregate",
                           url:% = request.url,
                           attempt;
                           "request failed: {err}");
                return Err(err);
            }

            let delay = retry.delay_for_attempt(attempt);
            log::debug!(target: "featuregate",
                        url:% = request.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64;
                        "retrying request: {err}");
            std::thread::sleep(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    use super::*;

    /// Scripted transport: responses are queued per url path, and every request is recorded.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        responses: Mutex<HashMap<String, VecDeque<Result<Response>>>>,
        pub(crate) requests: Mutex<Vec<Request>>,
    }

    impl FakeTransport {
        pub(crate) fn respond(&self, path: &str, status: u16, body: impl Into<String>) {
            self.responses
                .lock()
                .unwrap()
                .entry(path.to_owned())
                .or_default()
                .push_back(Ok(Response {
                    status,
                    body: body.into(),
                }));
        }

        pub(crate) fn requests_to(&self, path: &str) -> Vec<Request> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url.path() == path)
                .cloned()
                .collect()
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, request: &Request) -> Result<Response> {
            self.requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            let queue = responses.entry(request.url.path().to_owned()).or_default();
            // The last scripted response repeats.
            match queue.len() {
                0 => Ok(Response {
                    status: 404,
                    body: String::new(),
                }),
                1 => queue.front().cloned().unwrap_or(Err(Error::ThreadPanicked)),
                _ => queue.pop_front().unwrap_or(Err(Error::ThreadPanicked)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::FakeTransport, *};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn retries_retryable_statuses_within_budget() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond("/v1/x", 503, "");
        transport.respond("/v1/x", 503, "");
        transport.respond("/v1/x", 200, "ok");
        let client = NetworkClient::new(transport.clone(), "secret-key".to_owned(), policy(3));

        let response = client.send(Request::get(url("https://a.test/v1/x")), policy(3)).unwrap();
        assert_eq!(response.body, "ok");
        assert_eq!(transport.requests_to("/v1/x").len(), 3);
    }

    #[test]
    fn terminal_statuses_are_not_retried() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond("/v1/x", 400, "");
        let client = NetworkClient::new(transport.clone(), "secret-key".to_owned(), policy(3));

        let err = client.send(Request::get(url("https://a.test/v1/x")), policy(3)).unwrap_err();
        assert!(matches!(err, Error::Network { status: 400, retryable: false }));
        assert_eq!(transport.requests_to("/v1/x").len(), 1);
    }

    #[test]
    fn unauthorized_is_cached() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond("/v1/x", 401, "");
        let client = NetworkClient::new(transport.clone(), "secret-key".to_owned(), policy(3));

        assert!(matches!(
            client.send(Request::get(url("https://a.test/v1/x")), policy(3)),
            Err(Error::Unauthorized)
        ));
        assert!(matches!(
            client.send(Request::get(url("https://a.test/v1/x")), policy(3)),
            Err(Error::Unauthorized)
        ));
        assert_eq!(transport.requests_to("/v1/x").len(), 1);
    }

    #[test]
    fn falls_back_to_origin_after_retryable_failure() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond("/cdn", 522, "");
        transport.respond("/origin", 200, "from origin");
        let client = NetworkClient::new(transport.clone(), "secret-key".to_owned(), policy(1));

        let response = client
            .send_with_fallback(
                Request::get(url("https://cdn.test/cdn")),
                Some(url("https://origin.test/origin")),
            )
            .unwrap();
        assert_eq!(response.body, "from origin");
        assert_eq!(transport.requests_to("/cdn").len(), 2);

        let request = &transport.requests_to("/origin")[0];
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| *name == API_KEY_HEADER && value == "secret-key"));
    }
}
