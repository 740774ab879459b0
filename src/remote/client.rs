use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Url};
use tracing::{debug, warn};

use super::prompb::{
    decode_snappy, encode_snappy, LabelMatcher, Query, ReadRequest, ReadResponse, ResponseType,
    TimeSeries, WriteRequest,
};
use crate::error::{MigrateError, StoreError};

const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_MAX_BACKOFF_SECS: u64 = 10;
const READ_VERSION_HEADER: &str = "X-Prometheus-Remote-Read-Version";
const WRITE_VERSION_HEADER: &str = "X-Prometheus-Remote-Write-Version";
const PROTOCOL_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer(String),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    /// Extra attempts after the first one for transient failures.
    pub max_retries: usize,
    pub auth: Option<Auth>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
            auth: None,
        }
    }
}

/// HTTP client for one Prometheus remote-read or remote-write endpoint.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: Client,
    url: Url,
    auth: Option<Auth>,
    max_retries: usize,
}

impl RemoteClient {
    pub fn new(url: &str, options: &ClientOptions) -> Result<Self, MigrateError> {
        let parsed = Url::parse(url)
            .map_err(|err| MigrateError::Config(format!("invalid endpoint url '{url}': {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(MigrateError::Config(format!(
                "endpoint url '{url}' must use http or https"
            )));
        }
        if let Some(Auth::Basic { username, .. }) = &options.auth {
            if username.trim().is_empty() {
                return Err(MigrateError::Config(format!(
                    "basic auth for '{url}' requires a username"
                )));
            }
        }
        let http = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|err| MigrateError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            url: parsed,
            auth: options.auth.clone(),
            max_retries: options.max_retries,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Remote read over the inclusive range `[start_ms, end_ms]`.
    pub async fn read(
        &self,
        start_ms: i64,
        end_ms: i64,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<TimeSeries>, StoreError> {
        let request = ReadRequest {
            queries: vec![Query {
                start_timestamp_ms: start_ms,
                end_timestamp_ms: end_ms,
                matchers: matchers.to_vec(),
            }],
            accepted_response_types: vec![ResponseType::Samples as i32],
        };
        let body = encode_snappy(&request)?;
        let response = self.post(body, READ_VERSION_HEADER).await?;
        let decoded: ReadResponse = decode_snappy(&response)?;
        let series: Vec<TimeSeries> = decoded
            .results
            .into_iter()
            .flat_map(|result| result.timeseries)
            .collect();
        debug!(
            url = %self.url,
            start_ms,
            end_ms,
            series = series.len(),
            "remote read complete"
        );
        Ok(series)
    }

    pub async fn write(&self, timeseries: Vec<TimeSeries>) -> Result<(), StoreError> {
        let series = timeseries.len();
        let body = encode_snappy(&WriteRequest { timeseries })?;
        let bytes = body.len();
        self.post(body, WRITE_VERSION_HEADER).await?;
        debug!(url = %self.url, series, bytes, "remote write complete");
        Ok(())
    }

    async fn post(&self, body: Vec<u8>, version_header: &'static str) -> Result<Vec<u8>, StoreError> {
        let max_attempts = self.max_retries + 1;
        let attempt_counter = Arc::new(AtomicUsize::new(0));

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(RETRY_BASE_DELAY_MS))
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(Duration::from_secs(RETRY_MAX_BACKOFF_SECS))
            .with_max_elapsed_time(None)
            .build();

        retry_notify(
            backoff,
            || {
                let body = body.clone();
                let attempt_counter = Arc::clone(&attempt_counter);
                async move {
                    let attempt = attempt_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    match self.send_once(body, version_header).await {
                        Ok(bytes) => Ok(bytes),
                        Err(err) if err.is_transient() && attempt < max_attempts => {
                            Err(BackoffError::transient(err))
                        }
                        Err(err) => Err(BackoffError::permanent(err)),
                    }
                }
            },
            |err: StoreError, wait: Duration| {
                warn!(
                    url = %self.url,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "retrying remote request"
                );
            },
        )
        .await
    }

    async fn send_once(&self, body: Vec<u8>, version_header: &'static str) -> Result<Vec<u8>, StoreError> {
        let mut request = self
            .http
            .post(self.url.clone())
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(USER_AGENT, concat!("prom-migrator/", env!("CARGO_PKG_VERSION")))
            .header(version_header, PROTOCOL_VERSION)
            .body(body);
        request = match &self.auth {
            Some(Auth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(Auth::Bearer(token)) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(|source| StoreError::Transport {
            url: self.url.to_string(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        let bytes = response.bytes().await.map_err(|source| StoreError::Transport {
            url: self.url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}
