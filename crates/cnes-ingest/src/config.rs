//! Ingestion job configuration
//!
//! All settings are validated once, before the first wave is dispatched.

use cnes_common::{CnesError, Result};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Defaults
// ============================================================================

/// Public CNES establishments endpoint; the identifier is appended as a path segment.
pub const DEFAULT_BASE_URL: &str = "https://apidadosabertos.saude.gov.br/cnes/estabelecimentos";

/// Default number of simultaneous lookups (and wave size).
pub const DEFAULT_CONCURRENCY: usize = 15;

/// Above this the public API starts throttling; allowed, but warned about.
pub const RECOMMENDED_MAX_CONCURRENCY: usize = 25;

/// Default pause between waves in milliseconds.
pub const DEFAULT_WAVE_DELAY_MS: u64 = 300;

/// Default checkpoint cadence, in waves.
pub const DEFAULT_CHECKPOINT_EVERY: usize = 5;

/// Total per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Record attribute holding the municipality code used for enrichment.
pub const DEFAULT_JOIN_FIELD: &str = "codigo_municipio";

pub const USER_AGENT: &str = concat!("cnes-ingest/", env!("CARGO_PKG_VERSION"));

/// Wave scheduling settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveConfig {
    /// Lookups in flight at once; also the wave size
    pub concurrency: usize,

    /// Pause after each wave except the last
    pub delay: Duration,

    /// Write a checkpoint after every N waves
    pub checkpoint_every: usize,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            delay: Duration::from_millis(DEFAULT_WAVE_DELAY_MS),
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
        }
    }
}

impl WaveConfig {
    pub fn new(concurrency: usize, delay: Duration) -> Self {
        Self {
            concurrency,
            delay,
            ..Self::default()
        }
    }

    pub fn with_checkpoint_every(mut self, waves: usize) -> Self {
        self.checkpoint_every = waves;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CnesError::config("concurrency limit must be greater than zero"));
        }

        if self.checkpoint_every == 0 {
            return Err(CnesError::config("checkpoint cadence must be at least one wave"));
        }

        if self.concurrency > RECOMMENDED_MAX_CONCURRENCY {
            warn!(
                concurrency = self.concurrency,
                recommended = RECOMMENDED_MAX_CONCURRENCY,
                "Concurrency above the recommended limit; the service may throttle requests"
            );
        }

        Ok(())
    }
}

/// HTTP lookup settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| CnesError::config(format!("invalid base URL '{}': {}", self.base_url, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CnesError::config(format!(
                "base URL must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(CnesError::config("request timeouts must be greater than zero"));
        }

        Ok(())
    }
}

/// Complete configuration for one ingestion job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub wave: WaveConfig,
    pub fetch: FetchConfig,

    /// Record attribute joined against the reference index
    pub join_field: String,

    /// Directory receiving the checkpoint file
    pub checkpoint_dir: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            wave: WaveConfig::default(),
            fetch: FetchConfig::default(),
            join_field: DEFAULT_JOIN_FIELD.to_string(),
            checkpoint_dir: PathBuf::from("."),
        }
    }
}

impl IngestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.wave.concurrency = concurrency;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.wave.delay = delay;
        self
    }

    pub fn with_checkpoint_every(mut self, waves: usize) -> Self {
        self.wave.checkpoint_every = waves;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.fetch.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.fetch.timeout = timeout;
        self
    }

    pub fn with_join_field(mut self, field: impl Into<String>) -> Self {
        self.join_field = field.into();
        self
    }

    /// Validate every section; the job refuses to start on error.
    pub fn validate(&self) -> Result<()> {
        self.wave.validate()?;
        self.fetch.validate()?;

        if self.join_field.trim().is_empty() {
            return Err(CnesError::config("join field name must not be empty"));
        }

        Ok(())
    }
}

/// Parse a delay given in (fractional) seconds, rejecting negatives and NaN.
pub fn parse_delay_secs(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("delay must be a non-negative number of seconds, got '{}'", value));
    }

    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::new();
        assert_eq!(config.wave.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.wave.delay, Duration::from_millis(300));
        assert_eq!(config.join_field, "codigo_municipio");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = IngestConfig::new().with_concurrency(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CnesError::Config(_)));
    }

    #[test]
    fn test_zero_checkpoint_cadence_is_rejected() {
        let config = IngestConfig::new().with_checkpoint_every(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_high_concurrency_is_allowed() {
        let config = IngestConfig::new().with_concurrency(RECOMMENDED_MAX_CONCURRENCY + 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_url_validation() {
        assert!(IngestConfig::new().with_base_url("not a url").validate().is_err());
        assert!(IngestConfig::new().with_base_url("ftp://example.com/x").validate().is_err());
        assert!(IngestConfig::new()
            .with_base_url("http://127.0.0.1:8080/cnes/estabelecimentos")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = IngestConfig::new().with_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_delay_secs() {
        assert_eq!(parse_delay_secs("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_delay_secs("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_delay_secs(" 1.25 ").unwrap(), Duration::from_millis(1250));
        assert!(parse_delay_secs("-1").is_err());
        assert!(parse_delay_secs("NaN").is_err());
        assert!(parse_delay_secs("soon").is_err());
    }
}
