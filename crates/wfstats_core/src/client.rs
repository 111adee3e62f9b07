use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::Duration;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::entity::{Entity, Implementation, Tester, TestStatus};

pub const DEFAULT_API_URL: &str = "https://www.wikifunctions.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "wfstats/0.1 (wf-dump-scripts; Wikifunctions dump statistics)";
pub const DEFAULT_USELANG: &str = "en";
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 32_000;
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// `Z41` is the boolean true object the validator returns for a passing test.
pub const PASS_MARKER: &str = "Z41";
const VALIDATION_RESULT_KEY: &str = "Z40K1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub cap_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            cap_delay_ms: DEFAULT_BACKOFF_CAP_MS,
        }
    }
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-based): base * 2^(attempt-1), clamped to [base, cap].
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .clamp(self.base_delay_ms.min(self.cap_delay_ms), self.cap_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub uselang: String,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    pub search_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            uselang: DEFAULT_USELANG.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid API url `{0}`")]
    InvalidUrl(String),
    #[error("failed to set up client: {0}")]
    Setup(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("API request failed with HTTP {0}")]
    HttpStatus(u16),
    #[error("failed to decode API JSON response")]
    Decode(#[from] serde_json::Error),
    #[error("API error [{code}]: {info}")]
    Api { code: String, info: String },
    #[error("no test result returned, see {url}")]
    NoTestResultFound { url: String },
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<ClientError>,
    },
}

impl ClientError {
    /// Transport-class failures are worth another attempt; answers from the API are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited | Self::HttpStatus(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub url: String,
    pub body: String,
}

/// The single request path every query goes through.
pub trait ApiTransport: Send + Sync {
    fn get(&self, params: &[(String, String)]) -> Result<ApiResponse, ClientError>;
}

impl<T: ApiTransport + ?Sized> ApiTransport for Arc<T> {
    fn get(&self, params: &[(String, String)]) -> Result<ApiResponse, ClientError> {
        (**self).get(params)
    }
}

pub struct HttpTransport {
    client: Client,
    api_url: Url,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let api_url =
            Url::parse(&config.api_url).map_err(|_| ClientError::InvalidUrl(config.api_url.clone()))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|error| ClientError::Setup(error.to_string()))?;
        Ok(Self {
            client,
            api_url,
            user_agent: config.user_agent.clone(),
        })
    }
}

impl ApiTransport for HttpTransport {
    fn get(&self, params: &[(String, String)]) -> Result<ApiResponse, ClientError> {
        let response = self
            .client
            .get(self.api_url.clone())
            .header("User-Agent", self.user_agent.clone())
            .query(params)
            .send()
            .map_err(|error| ClientError::Transport(describe_reqwest_error(&error)))?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response
            .text()
            .map_err(|error| ClientError::Transport(describe_reqwest_error(&error)))?;
        Ok(ApiResponse { status, url, body })
    }
}

fn describe_reqwest_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("timed out: {error}")
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}

/// One (function, implementation, tester) cell to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusQuery {
    pub function_id: String,
    pub implementation_id: String,
    pub tester_id: String,
}

pub struct WikifunctionsClient<T = HttpTransport> {
    transport: T,
    /// Worker pool for bulk queries; its width caps in-flight requests.
    pool: ThreadPool,
    config: ClientConfig,
    request_count: AtomicUsize,
}

impl WikifunctionsClient<HttpTransport> {
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(transport, config)
    }
}

impl<T: ApiTransport> WikifunctionsClient<T> {
    pub fn with_transport(transport: T, config: ClientConfig) -> Result<Self, ClientError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.concurrency.max(1))
            .thread_name(|index| format!("wfstats-api-{index}"))
            .build()
            .map_err(|error| ClientError::Setup(error.to_string()))?;
        Ok(Self {
            transport,
            pool,
            config,
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Total transport calls made, retries included.
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn concurrency(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn request_json(&self, params: &[(&str, String)]) -> Result<Value, ClientError> {
        let pairs = query_pairs(params);
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = None::<ClientError>;

        for attempt in 1..=max_attempts {
            self.request_count.fetch_add(1, Ordering::Relaxed);
            let error = match self.transport.get(&pairs).and_then(decode_response) {
                Ok(payload) => return Ok(payload),
                Err(error) if error.is_retryable() => error,
                Err(error) => return Err(error),
            };
            tracing::debug!(attempt, max_attempts, %error, "API request failed");
            last_error = Some(error);
            if attempt < max_attempts {
                sleep(policy.delay_after(attempt));
            }
        }

        Err(ClientError::RetriesExhausted {
            attempts: max_attempts,
            last: Box::new(last_error.unwrap_or(ClientError::Transport(
                "no attempt was made".to_string(),
            ))),
        })
    }

    /// Human-clickable URL for a query, used in diagnostics.
    pub fn query_url(&self, params: &[(&str, String)]) -> String {
        let pairs = query_pairs(params);
        Url::parse_with_params(&self.config.api_url, &pairs)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| self.config.api_url.clone())
    }

    pub fn fetch_test_status(
        &self,
        function_id: &str,
        implementation_id: &str,
        tester_id: &str,
    ) -> Result<TestStatus, ClientError> {
        let params = [
            ("action", "wikilambda_perform_test".to_string()),
            ("wikilambda_perform_test_zfunction", function_id.to_string()),
            (
                "wikilambda_perform_test_zimplementations",
                implementation_id.to_string(),
            ),
            ("wikilambda_perform_test_ztesters", tester_id.to_string()),
            ("uselang", self.config.uselang.clone()),
        ];
        tracing::debug!(
            function = function_id,
            implementation = implementation_id,
            tester = tester_id,
            "fetching test status"
        );

        let payload = self.request_json(&params)?;
        let entries = payload
            .get("query")
            .and_then(|query| query.get("wikilambda_perform_test"))
            .and_then(Value::as_array)
            .filter(|entries| !entries.is_empty())
            .ok_or_else(|| ClientError::NoTestResultFound {
                url: self.query_url(&params),
            })?;

        let status = entries[0].get("validateStatus").unwrap_or(&Value::Null);
        if validation_passed(status) {
            Ok(TestStatus::Pass)
        } else {
            Ok(TestStatus::Fail)
        }
    }

    /// Runs every tester against one implementation, one after another.
    /// A failing tester is recorded as `Error` and the rest still run.
    pub fn fetch_implementation_statuses(
        &self,
        function_id: &str,
        implementation: &Implementation,
        testers: &[Arc<Tester>],
    ) -> BTreeMap<String, TestStatus> {
        let mut results = BTreeMap::new();
        let Ok(implementation_id) = implementation.id() else {
            return results;
        };
        for tester in testers {
            let Ok(tester_id) = tester.id() else {
                continue;
            };
            let status = self.status_or_error(&StatusQuery {
                function_id: function_id.to_string(),
                implementation_id: implementation_id.to_string(),
                tester_id: tester_id.to_string(),
            });
            results.insert(tester_id.to_string(), status);
        }
        results
    }

    /// Fans `queries` out over the client's pool; the output lines up with the input.
    pub fn bulk_fetch_test_statuses(&self, queries: &[StatusQuery]) -> Vec<TestStatus> {
        self.pool.install(|| {
            queries
                .par_iter()
                .map(|query| self.status_or_error(query))
                .collect()
        })
    }

    fn status_or_error(&self, query: &StatusQuery) -> TestStatus {
        match self.fetch_test_status(
            &query.function_id,
            &query.implementation_id,
            &query.tester_id,
        ) {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(
                    function = %query.function_id,
                    implementation = %query.implementation_id,
                    tester = %query.tester_id,
                    %error,
                    "test status fetch failed"
                );
                TestStatus::Error
            }
        }
    }

    pub fn fetch_connected_implementations(
        &self,
        function_id: &str,
    ) -> Result<Vec<String>, ClientError> {
        let payload = self.request_json(&[
            ("action", "query".to_string()),
            ("list", "wikilambdafn_search".to_string()),
            ("wikilambdafn_zfunction_id", function_id.to_string()),
            ("wikilambdafn_type", "Z14".to_string()),
            ("wikilambdafn_limit", self.config.search_limit.to_string()),
        ])?;
        let implementations = payload
            .get("query")
            .and_then(|query| query.get("wikilambdafn_search"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("zid").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        tracing::debug!(
            function = function_id,
            count = implementations.len(),
            "connected implementations"
        );
        Ok(implementations)
    }

    /// Always returns one entry per input id; failed lookups map to an empty list.
    pub fn bulk_fetch_connected_implementations(
        &self,
        function_ids: &[String],
    ) -> BTreeMap<String, Vec<String>> {
        self.pool.install(|| {
            function_ids
                .par_iter()
                .map(|function_id| {
                    let implementations = self
                        .fetch_connected_implementations(function_id)
                        .unwrap_or_else(|error| {
                            tracing::error!(function = %function_id, %error, "failed fetching implementations");
                            Vec::new()
                        });
                    (function_id.clone(), implementations)
                })
                .collect::<Vec<_>>()
        })
        .into_iter()
        .collect()
    }
}

fn query_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn decode_response(response: ApiResponse) -> Result<Value, ClientError> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ClientError::RateLimited);
    }
    if !status.is_success() {
        return Err(ClientError::HttpStatus(response.status));
    }
    tracing::trace!(url = %response.url, "API response");

    let payload: Value = serde_json::from_str(&response.body)?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return Err(ClientError::Api {
            code: code.to_string(),
            info: info.to_string(),
        });
    }
    Ok(payload)
}

/// The validator reports a `Z40` boolean, usually JSON-encoded inside a string.
pub fn validation_passed(status: &Value) -> bool {
    match status {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::String(_)) | Err(_) => raw.contains(PASS_MARKER),
            Ok(parsed) => validation_passed(&parsed),
        },
        Value::Object(map) => map
            .get(VALIDATION_RESULT_KEY)
            .and_then(crate::entity::reference_id)
            .is_some_and(|value| value == PASS_MARKER),
        _ => false,
    }
}
