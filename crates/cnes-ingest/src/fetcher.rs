//! Single-identifier lookups against the CNES service
//!
//! A lookup never returns an error: network failures, timeouts, non-2xx
//! statuses and unusable bodies all become [`LookupOutcome::Failure`].

use crate::config::FetchConfig;
use async_trait::async_trait;
use chrono::Utc;
use cnes_common::types::{FailureReason, FetchMetadata, Identifier, LookupFailure, LookupOutcome, Record};
use cnes_common::{CnesError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

/// Performs one lookup per identifier
#[async_trait]
pub trait LookupClient: Send + Sync {
    async fn lookup(&self, identifier: &Identifier) -> LookupOutcome;
}

/// HTTP implementation: `GET {base_url}/{identifier}`
pub struct HttpLookupClient {
    client: Client,
    base_url: Url,
}

impl HttpLookupClient {
    /// Build a client whose idle pool matches the number of concurrent lookups.
    pub fn new(config: &FetchConfig, pool_size: usize) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| CnesError::config(format!("invalid base URL '{}': {}", config.base_url, e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .pool_max_idle_per_host(pool_size.max(1))
            .build()
            .map_err(|e| CnesError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    /// URL for one identifier; the identifier is percent-encoded as a single path segment.
    pub fn lookup_url(&self, identifier: &Identifier) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(identifier.as_str());
        }
        url.to_string()
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }
}

#[async_trait]
impl LookupClient for HttpLookupClient {
    async fn lookup(&self, identifier: &Identifier) -> LookupOutcome {
        let url = self.lookup_url(identifier);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => return failed(transport_failure(identifier, &url, &err)),
        };

        let status = response.status();
        if !status.is_success() {
            return failed(status_failure(identifier, &url, status));
        }

        match response.bytes().await {
            Ok(body) => parse_body(identifier, &url, status, &body),
            Err(err) => failed(transport_failure(identifier, &url, &err)),
        }
    }
}

fn failed(failure: LookupFailure) -> LookupOutcome {
    debug!(
        identifier = %failure.identifier,
        reason = %failure.reason,
        status = ?failure.status_code,
        detail = failure.detail.as_deref().unwrap_or(""),
        "Lookup failed"
    );
    LookupOutcome::Failure(failure)
}

/// Classify a non-2xx response
pub(crate) fn status_failure(identifier: &Identifier, url: &str, status: StatusCode) -> LookupFailure {
    let reason = if status == StatusCode::NOT_FOUND {
        FailureReason::NotFound
    } else {
        FailureReason::HttpStatus
    };

    LookupFailure::new(identifier.clone(), reason)
        .with_status(status.as_u16())
        .with_detail(format!("HTTP {}", status))
        .with_url(url)
}

/// Classify a transport-level error
pub(crate) fn transport_failure(
    identifier: &Identifier,
    url: &str,
    err: &reqwest::Error,
) -> LookupFailure {
    let reason = if err.is_timeout() {
        FailureReason::Timeout
    } else if err.is_connect() || err.is_request() {
        FailureReason::Connection
    } else if err.is_body() || err.is_decode() {
        FailureReason::InvalidBody
    } else {
        FailureReason::Unexpected
    };

    let mut failure = LookupFailure::new(identifier.clone(), reason)
        .with_detail(err.to_string())
        .with_url(url);
    failure.status_code = err.status().map(|s| s.as_u16());
    failure
}

/// Turn a 2xx body into a record; anything but a JSON object is a failure.
pub(crate) fn parse_body(
    identifier: &Identifier,
    url: &str,
    status: StatusCode,
    body: &[u8],
) -> LookupOutcome {
    let invalid = |detail: String| {
        failed(
            LookupFailure::new(identifier.clone(), FailureReason::InvalidBody)
                .with_status(status.as_u16())
                .with_detail(detail)
                .with_url(url),
        )
    };

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(attributes)) => {
            let metadata = FetchMetadata {
                identifier: identifier.clone(),
                url: url.to_string(),
                fetched_at: Utc::now(),
            };
            LookupOutcome::Success(Record::new(metadata, attributes))
        },
        Ok(other) => invalid(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(err) => invalid(format!("response is not valid JSON: {}", err)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
