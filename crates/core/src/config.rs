use serde::Deserialize;

/// Reporting engine configuration. Loaded from environment variables with
/// the prefix `CLUBROOM__`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    /// Seconds between QR reconciliation polls.
    #[serde(default = "default_qr_poll_interval_secs")]
    pub qr_poll_interval_secs: u64,
    /// Total failed/empty polls allowed before reconciliation gives up,
    /// shared across all windows of one report invocation.
    #[serde(default = "default_qr_max_attempts")]
    pub qr_max_attempts: u32,
    /// Per-extractor timeout for the consolidated report.
    #[serde(default = "default_extractor_timeout_ms")]
    pub extractor_timeout_ms: u64,
    /// Default bound on retention offsets when a request does not set one.
    #[serde(default = "default_max_retention_offset")]
    pub max_retention_offset: u32,
}

fn default_qr_poll_interval_secs() -> u64 {
    90
}
fn default_qr_max_attempts() -> u32 {
    5
}
fn default_extractor_timeout_ms() -> u64 {
    10_000
}
fn default_max_retention_offset() -> u32 {
    30
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            qr_poll_interval_secs: default_qr_poll_interval_secs(),
            qr_max_attempts: default_qr_max_attempts(),
            extractor_timeout_ms: default_extractor_timeout_ms(),
            max_retention_offset: default_max_retention_offset(),
        }
    }
}

impl ReportingConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CLUBROOM")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ReportingConfig::default();
        assert_eq!(cfg.qr_poll_interval_secs, 90);
        assert_eq!(cfg.qr_max_attempts, 5);
        assert!(cfg.extractor_timeout_ms > 0);
    }
}
