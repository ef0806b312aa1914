//! Engine configuration types.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Upper bound on concurrent chunk streams for one file.
pub const MAX_CHUNK_STREAMS: usize = 64;

/// Configuration for the batch engine.
///
/// Per-batch concurrency can be overridden with [`BatchOptions`].
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct EngineConfig {
    /// Number of files processed simultaneously.
    #[builder(default = "4")]
    pub file_concurrency: usize,

    /// Concurrent chunk streams for one large file.
    ///
    /// Networked filesystems with strict locking may prefer 1.
    #[builder(default = "4")]
    pub chunk_streams: usize,

    /// Bytes read and written per chunk.
    #[builder(default = "1024 * 1024")]
    pub chunk_size: usize,

    /// Files larger than this use intra-file concurrency.
    #[builder(default = "64 * 1024 * 1024")]
    pub large_file_threshold: u64,

    /// Copy permissions and modification time to the destination.
    #[builder(default = "true")]
    pub preserve_metadata: bool,

    /// Throughput sample window used for the ETA, in milliseconds.
    #[builder(default = "5000")]
    pub eta_window_ms: u64,

    /// Interval between subscriber heartbeats, in milliseconds.
    #[builder(default = "5000")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive missed heartbeats after which a subscriber is dropped.
    #[builder(default = "3")]
    pub max_missed_heartbeats: u32,

    /// Frames buffered per subscriber.
    #[builder(default = "64")]
    pub subscriber_buffer: usize,

    /// Where the undo ledger is persisted (None = in memory only).
    #[builder(default)]
    pub ledger_path: Option<PathBuf>,
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.file_concurrency == Some(0) {
            return Err("file_concurrency must be at least 1".to_string());
        }
        if let Some(streams) = self.chunk_streams {
            if streams == 0 || streams > MAX_CHUNK_STREAMS {
                return Err(format!("chunk_streams must be between 1 and {MAX_CHUNK_STREAMS}"));
            }
        }
        if self.chunk_size == Some(0) {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if self.subscriber_buffer == Some(0) {
            return Err("subscriber_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Check a config that did not go through the builder (e.g. loaded from TOML).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.file_concurrency == 0 {
            return Err(EngineError::invalid_config("file_concurrency must be at least 1"));
        }
        check_chunk_streams(self.chunk_streams)?;
        if self.chunk_size == 0 {
            return Err(EngineError::invalid_config("chunk_size must be greater than 0"));
        }
        if self.subscriber_buffer == 0 {
            return Err(EngineError::invalid_config(
                "subscriber_buffer must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Throughput sample window.
    pub fn eta_window(&self) -> Duration {
        Duration::from_millis(self.eta_window_ms)
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            file_concurrency: 4,
            chunk_streams: 4,
            chunk_size: 1024 * 1024,
            large_file_threshold: 64 * 1024 * 1024,
            preserve_metadata: true,
            eta_window_ms: 5000,
            heartbeat_interval_ms: 5000,
            max_missed_heartbeats: 3,
            subscriber_buffer: 64,
            ledger_path: None,
        }
    }
}

/// Options supplied with a single batch submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Files processed simultaneously (None = engine default).
    #[serde(default)]
    pub file_concurrency: Option<usize>,
    /// Chunk streams per large file (None = engine default).
    #[serde(default)]
    pub chunk_streams: Option<usize>,
    /// Directory that must exist (or be creatable) before any item runs.
    #[serde(default)]
    pub destination_root: Option<PathBuf>,
}

impl BatchOptions {
    /// Options with explicit concurrency widths.
    pub fn with_concurrency(file_concurrency: usize, chunk_streams: usize) -> Self {
        Self {
            file_concurrency: Some(file_concurrency),
            chunk_streams: Some(chunk_streams),
            destination_root: None,
        }
    }

    /// Set the destination root precondition.
    pub fn destination_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.destination_root = Some(root.into());
        self
    }

    /// Resolve the widths against engine defaults.
    ///
    /// Zero widths are rejected, as are more than [`MAX_CHUNK_STREAMS`] streams.
    pub fn resolve(&self, config: &EngineConfig) -> Result<(usize, usize), EngineError> {
        let files = self.file_concurrency.unwrap_or(config.file_concurrency);
        let streams = self.chunk_streams.unwrap_or(config.chunk_streams);
        if files == 0 {
            return Err(EngineError::invalid_config("file_concurrency must be at least 1"));
        }
        check_chunk_streams(streams)?;
        Ok((files, streams))
    }
}

fn check_chunk_streams(streams: usize) -> Result<(), EngineError> {
    if streams == 0 || streams > MAX_CHUNK_STREAMS {
        return Err(EngineError::invalid_config(format!(
            "chunk_streams must be between 1 and {MAX_CHUNK_STREAMS}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .file_concurrency(8usize)
            .chunk_streams(2usize)
            .preserve_metadata(false)
            .build()
            .unwrap();

        assert_eq!(config.file_concurrency, 8);
        assert_eq!(config.chunk_streams, 2);
        assert!(!config.preserve_metadata);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.ledger_path, None);
    }

    #[test]
    fn test_config_builder_rejects_zero_width() {
        let result = EngineConfig::builder().file_concurrency(0usize).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_defaults_match_default() {
        let built = EngineConfig::builder().build().unwrap();
        assert_eq!(built, EngineConfig::default());
    }

    #[test]
    fn test_batch_options_resolve() {
        let config = EngineConfig::default();
        assert_eq!(BatchOptions::default().resolve(&config).unwrap(), (4, 4));
        assert_eq!(
            BatchOptions::with_concurrency(2, 1).resolve(&config).unwrap(),
            (2, 1)
        );
        assert!(BatchOptions::with_concurrency(0, 1).resolve(&config).is_err());
    }

    #[test]
    fn test_chunk_streams_upper_bound() {
        let config = EngineConfig::default();
        assert_eq!(
            BatchOptions::with_concurrency(1, MAX_CHUNK_STREAMS)
                .resolve(&config)
                .unwrap(),
            (1, MAX_CHUNK_STREAMS)
        );
        assert!(BatchOptions::with_concurrency(1, MAX_CHUNK_STREAMS + 1).resolve(&config).is_err());
        assert!(BatchOptions::with_concurrency(1, usize::MAX).resolve(&config).is_err());
        assert!(EngineConfig::builder().chunk_streams(usize::MAX).build().is_err());

        let config = EngineConfig {
            chunk_streams: 1000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
