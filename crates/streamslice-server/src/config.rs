//! Server configuration file.
//!
//! Every section and key is optional; missing values take the core crate's
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use streamslice_core::buffer::BufferPoolConfig;
use streamslice_core::operator::{LateDataConfig, OperatorConfig};
use streamslice_core::slice::{SpillConfig, WindowType};
use streamslice_core::time::{LogOverflowPolicy, OriginId, WatermarkConfig};

/// Size in bytes of the records produced by the synthetic workload.
pub const RECORD_SIZE: usize = 16;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub pool: PoolSection,
    pub watermark: WatermarkSection,
    pub window: WindowSection,
    pub operator: OperatorSection,
    pub workload: WorkloadSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub buffer_size: usize,
    pub num_buffers: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = BufferPoolConfig::default();
        Self {
            buffer_size: defaults.buffer_size,
            num_buffers: defaults.num_buffers,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    Reject,
    SpinWait,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WatermarkSection {
    pub log_size: usize,
    pub initial_sequence: u64,
    pub overflow: OverflowPolicy,
    pub spin_timeout_ms: u64,
}

impl Default for WatermarkSection {
    fn default() -> Self {
        let defaults = WatermarkConfig::default();
        Self {
            log_size: defaults.log_size,
            initial_sequence: defaults.initial_sequence,
            overflow: OverflowPolicy::SpinWait,
            spin_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WindowKind {
    Tumbling,
    Sliding,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WindowSection {
    pub kind: WindowKind,
    pub size: i64,
    /// Ignored for tumbling windows.
    pub slide: Option<i64>,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            kind: WindowKind::Tumbling,
            size: 1_000,
            slide: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorSection {
    /// Hash partitions per triggered join window.
    pub partitions: Option<usize>,
    /// Route late records to this side output instead of dropping them.
    pub late_side_output: Option<String>,
    /// Spill partitions here when the pool runs dry.
    pub spill_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadSection {
    pub workers: usize,
    pub origins: usize,
    pub buffers_per_origin: u64,
    pub records_per_buffer: usize,
    pub keys: u64,
    /// Every n-th record is pushed behind the watermark; 0 disables.
    pub late_every: usize,
}

impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            workers: 4,
            origins: 2,
            buffers_per_origin: 1_000,
            records_per_buffer: 64,
            keys: 32,
            late_every: 0,
        }
    }
}

impl ServerConfig {
    /// Loads the configuration from `path`, or the defaults without one.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parses a TOML document.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn pool_config(&self) -> BufferPoolConfig {
        BufferPoolConfig::builder()
            .buffer_size(self.pool.buffer_size)
            .num_buffers(self.pool.num_buffers)
            .build()
    }

    pub fn watermark_config(&self) -> WatermarkConfig {
        let overflow_policy = match self.watermark.overflow {
            OverflowPolicy::Reject => LogOverflowPolicy::Reject,
            OverflowPolicy::SpinWait => LogOverflowPolicy::SpinWait {
                timeout: Duration::from_millis(self.watermark.spin_timeout_ms),
            },
        };
        WatermarkConfig::builder()
            .log_size(self.watermark.log_size)
            .initial_sequence(self.watermark.initial_sequence)
            .overflow_policy(overflow_policy)
            .build()
    }

    pub fn window_type(&self) -> WindowType {
        match self.window.kind {
            WindowKind::Tumbling => WindowType::Tumbling {
                size: self.window.size,
            },
            WindowKind::Sliding => WindowType::Sliding {
                size: self.window.size,
                slide: self.window.slide.unwrap_or(self.window.size),
            },
        }
    }

    /// Operator configuration shared by the window and join handlers.
    pub fn operator_config(&self) -> OperatorConfig {
        let mut builder = OperatorConfig::builder()
            .window(self.window_type())
            .num_workers(self.workload.workers)
            .record_size(RECORD_SIZE)
            .origins((0..self.workload.origins as u64).map(OriginId))
            .watermark(self.watermark_config());
        if let Some(partitions) = self.operator.partitions {
            builder = builder.num_partitions(partitions);
        }
        if let Some(name) = &self.operator.late_side_output {
            builder = builder.late_data(LateDataConfig::with_side_output(name.as_str()));
        }
        if let Some(directory) = &self.operator.spill_directory {
            builder = builder.spill(SpillConfig::enabled(directory));
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_sample_config_parses() {
        let config = ServerConfig::parse(include_str!("../streamslice.toml")).unwrap();
        assert_eq!(config.window.kind, WindowKind::Sliding);
        assert_eq!(
            config.window_type(),
            WindowType::Sliding {
                size: 1_000,
                slide: 250
            }
        );
        assert_eq!(config.workload.origins, 2);
        assert_eq!(config.operator.late_side_output.as_deref(), Some("late-events"));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.watermark_config(), WatermarkConfig::default());
        assert_eq!(config.pool_config(), BufferPoolConfig::default());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(ServerConfig::parse("[pool]\nbuffer_sise = 10\n").is_err());
    }

    #[test]
    fn test_reject_policy() {
        let config = ServerConfig::parse("[watermark]\noverflow = \"reject\"\nlog_size = 64\n").unwrap();
        let watermark = config.watermark_config();
        assert_eq!(watermark.overflow_policy, LogOverflowPolicy::Reject);
        assert_eq!(watermark.log_size, 64);
    }

    #[test]
    fn test_operator_config_follows_workload() {
        let config = ServerConfig::parse(
            "[workload]\nworkers = 3\norigins = 3\n[operator]\npartitions = 8\nspill_directory = \"/tmp/spill\"\n",
        )
        .unwrap();
        let operator = config.operator_config();
        assert_eq!(operator.num_workers, 3);
        assert_eq!(operator.num_partitions, 8);
        assert_eq!(operator.record_size, RECORD_SIZE);
        assert_eq!(operator.origins, vec![OriginId(0), OriginId(1), OriginId(2)]);
        assert!(operator.spill.enabled);
        assert!(operator.late_data.should_drop());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window]\nkind = \"tumbling\"\nsize = 500").unwrap();
        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.window_type(), WindowType::Tumbling { size: 500 });

        let missing = ServerConfig::load(Some(Path::new("/nonexistent/streamslice.toml")));
        assert!(missing.unwrap_err().to_string().contains("failed to read"));
        assert_eq!(ServerConfig::load(None).unwrap(), ServerConfig::default());
    }
}
