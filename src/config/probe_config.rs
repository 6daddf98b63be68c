use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Probe tuning, read from the YAML config file.
/// Every field has a default, so an empty document is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Timeout applied to each stage (connect, TLS, HTTP check) separately.
    pub stage_timeout_ms: u64,

    /// Endpoints slower than this are left out of the output.
    pub latency_ceiling_ms: u64,

    /// Maximum number of endpoints probed at the same time.
    pub concurrency_limit: usize,

    /// Keep only the fastest N endpoints.
    pub top_n: Option<usize>,

    /// Send a HEAD request over websocket/httpupgrade transports.
    pub verify_application_layer: bool,

    /// Drop endpoints whose HEAD request fails.
    /// Defaults to false, many servers refuse unauthenticated requests.
    pub require_application_layer: bool,

    /// Complete the TLS handshake even when the certificate does not verify.
    pub accept_invalid_certs: bool,

    /// Hard limit for the whole batch. Unset means unbounded.
    pub batch_deadline_ms: Option<u64>,

    pub verifier: VerifierConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 5000,
            latency_ceiling_ms: 600,
            concurrency_limit: 64,
            top_n: None,
            verify_application_layer: true,
            require_application_layer: false,
            accept_invalid_certs: true,
            batch_deadline_ms: None,
            verifier: VerifierConfig::default(),
        }
    }
}

impl ProbeConfig {
    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_timeout_ms == 0 {
            return Err(ConfigError::Invalid("stage_timeout_ms must be positive".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid("concurrency_limit must be positive".into()));
        }
        if self.top_n == Some(0) {
            return Err(ConfigError::Invalid("top_n must be positive when set".into()));
        }
        if self.verifier.timeout_ms == 0 {
            return Err(ConfigError::Invalid("verifier.timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    /// TCP, TLS and HTTP stages run in-process.
    Staged,
    /// Hand each endpoint to an Xray runtime.
    Xray,
}

/// Which prober to use, and how to run the external one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub kind: VerifierKind,

    /// Path to the Xray executable.
    pub binary: String,

    pub timeout_ms: u64,

    /// Fetched through the runtime's SOCKS port once it is listening.
    pub probe_url: Option<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            kind: VerifierKind::Staged,
            binary: "./xray".to_string(),
            timeout_ms: 8000,
            probe_url: None,
        }
    }
}
