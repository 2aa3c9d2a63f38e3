//! Configuration for rastreo
//!
//! Loaded from a TOML file; every section is optional and falls back to its
//! defaults.
//!
//! ```toml
//! [correlator]
//! unclosed_frames = "force_close"   # or "discard"
//! orphan_memory_grow = "attach_at_root"   # or "drop"
//!
//! [batch]
//! max_batch_size = 100
//! flush_interval_ms = 1000
//!
//! [baseline]
//! major = 0
//! minor = 0
//!
//! [otlp]
//! service_name = "my-wasm-service"
//! endpoint = "localhost:4317"
//! protocol = "grpc"            # or "http/protobuf"
//! allow_insecure = true
//!
//! [otlp.headers]
//! x-honeycomb-team = "..."
//! ```

use crate::batcher::BatchConfig;
use crate::correlator::CorrelatorConfig;
use crate::otlp_exporter::OtlpConfig;
use crate::symbols::CompatibilityBaseline;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RastreoConfig {
    pub correlator: CorrelatorConfig,
    pub batch: BatchConfig,
    pub baseline: CompatibilityBaseline,
    pub otlp: OtlpConfig,
}

impl RastreoConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batch.validate()?;
        self.otlp.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{OrphanPolicy, UnclosedFramePolicy};
    use crate::otlp_exporter::OtlpProtocol;
    use crate::symbols::InstrVersion;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RastreoConfig::from_toml_str("").unwrap();
        assert_eq!(config, RastreoConfig::default());
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.baseline, InstrVersion::CURRENT);
    }

    #[test]
    fn test_full_config() {
        let config = RastreoConfig::from_toml_str(
            r#"
            [correlator]
            unclosed_frames = "discard"
            orphan_memory_grow = "drop"

            [batch]
            max_batch_size = 5
            flush_interval_ms = 250

            [baseline]
            major = 1
            minor = 2

            [otlp]
            service_name = "svc"
            endpoint = "collector:4318"
            protocol = "http/protobuf"
            allow_insecure = true

            [otlp.headers]
            x-api-key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.correlator.unclosed_frames, UnclosedFramePolicy::Discard);
        assert_eq!(config.correlator.orphan_memory_grow, OrphanPolicy::Drop);
        assert_eq!(config.batch.max_batch_size, 5);
        assert_eq!(config.batch.flush_interval_ms, 250);
        assert_eq!(config.baseline, InstrVersion::new(1, 2));
        assert_eq!(config.otlp.protocol, OtlpProtocol::HttpProtobuf);
        assert_eq!(config.otlp.headers.get("x-api-key").map(String::as_str), Some("secret"));
        assert!(config.otlp.allow_insecure);
    }

    #[test]
    fn test_invalid_batch_rejected() {
        let result = RastreoConfig::from_toml_str("[batch]\nmax_batch_size = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let result = RastreoConfig::from_toml_str("[correlator]\nunclosed_frames = \"maybe\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[batch]\nmax_batch_size = 7").unwrap();

        let config = RastreoConfig::from_file(file.path()).unwrap();
        assert_eq!(config.batch.max_batch_size, 7);
    }
}
