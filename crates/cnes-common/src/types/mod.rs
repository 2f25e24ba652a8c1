//! Common types used across CNES ingestion

mod lenient;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use lenient::value_to_code;

/// Raw attribute map returned by the lookup service
pub type Attributes = Map<String, Value>;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque key looked up against the remote service (a CNES establishment code).
///
/// Identifiers are never deduplicated; two equal identifiers in the input are
/// two independent work items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Lookup Results
// ============================================================================

/// Where and when a record was fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchMetadata {
    /// Identifier that was looked up
    pub identifier: Identifier,

    /// URL the record was fetched from
    pub url: String,

    /// Timestamp of the successful response
    pub fetched_at: DateTime<Utc>,
}

/// A successfully looked-up record.
///
/// `attributes` is the JSON object returned by the service, untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub metadata: FetchMetadata,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(metadata: FetchMetadata, attributes: Attributes) -> Self {
        Self {
            metadata,
            attributes,
        }
    }

    /// Get a raw attribute
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Read an attribute as a join code.
    ///
    /// Strings and integral numbers are accepted; anything else (or a blank
    /// string) yields `None`.
    pub fn code(&self, key: &str) -> Option<String> {
        self.attribute(key).and_then(value_to_code)
    }
}

/// Why a single lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The service answered 404 for the identifier
    NotFound,
    /// Any other non-2xx status, including rate limiting
    HttpStatus,
    /// The request did not finish within the configured timeout
    Timeout,
    /// Connection could not be established or was reset
    Connection,
    /// A 2xx response whose body is not a JSON object
    InvalidBody,
    /// Anything the classifier does not recognise
    Unexpected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NotFound => "not_found",
            FailureReason::HttpStatus => "http_status",
            FailureReason::Timeout => "timeout",
            FailureReason::Connection => "connection",
            FailureReason::InvalidBody => "invalid_body",
            FailureReason::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed lookup, as stored in the failure list and the final report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupFailure {
    pub identifier: Identifier,
    pub reason: FailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl LookupFailure {
    pub fn new(identifier: Identifier, reason: FailureReason) -> Self {
        Self {
            identifier,
            reason,
            status_code: None,
            detail: None,
            url: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Result of looking up one identifier
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Success(Record),
    Failure(LookupFailure),
}

impl LookupOutcome {
    pub fn identifier(&self) -> &Identifier {
        match self {
            LookupOutcome::Success(record) => &record.metadata.identifier,
            LookupOutcome::Failure(failure) => &failure.identifier,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LookupOutcome::Success(_))
    }
}

/// Job counters.
///
/// `done == succeeded + failed` and `done <= total` always hold for counts
/// produced by the job state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub total: usize,
    pub done: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Counts {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.done)
    }

    pub fn is_consistent(&self) -> bool {
        self.done == self.succeeded + self.failed && self.done <= self.total
    }
}

// ============================================================================
// Reference Data
// ============================================================================

/// Descriptive fields attached to an enriched record.
///
/// Serialized with the key names of the reference dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionFields {
    #[serde(
        rename = "codigo_regiao_pais",
        default,
        deserialize_with = "lenient::opt_code"
    )]
    pub country_region_code: Option<String>,

    #[serde(rename = "regiao_pais", default)]
    pub country_region: Option<String>,

    #[serde(rename = "uf", default)]
    pub state: Option<String>,

    #[serde(
        rename = "codigo_macrorregiao_saude",
        default,
        deserialize_with = "lenient::opt_code"
    )]
    pub health_macroregion_code: Option<String>,

    #[serde(rename = "macrorregiao_saude", default)]
    pub health_macroregion: Option<String>,

    #[serde(
        rename = "codigo_regiao_saude",
        default,
        deserialize_with = "lenient::opt_code"
    )]
    pub health_region_code: Option<String>,

    #[serde(rename = "regiao_saude", default)]
    pub health_region: Option<String>,

    #[serde(rename = "municipio", default)]
    pub municipality: Option<String>,

    #[serde(
        rename = "populacao_estimada_ibge_2022",
        default,
        deserialize_with = "lenient::opt_count"
    )]
    pub estimated_population: Option<u64>,
}

/// One municipality of the reference dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    /// Join key, matched exactly against the record's municipality code
    #[serde(
        rename = "codigo_municipio",
        default,
        deserialize_with = "lenient::code"
    )]
    pub municipality_code: String,

    /// State code; not attached on merge since records already carry it
    #[serde(rename = "codigo_uf", default, deserialize_with = "lenient::opt_code")]
    pub state_code: Option<String>,

    #[serde(flatten)]
    pub region: RegionFields,
}
