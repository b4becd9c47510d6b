//! Receiver configuration and timing defaults
//!
//! [`ReceiverConfig`] is the small runtime surface owned by the launcher: the
//! repair kill-switch, the codec family and the repair port. Pool size and the
//! health/repair timing constants are compile-time defaults exposed through
//! [`HealthTiming`] and [`RepairTiming`] so tests can shorten them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::types::CodecFamily;
use crate::{ReceiverError, Result};

/// Number of hardware buffers per pool generation.
pub const DEFAULT_POOL_SIZE: usize = 24;

/// UDP port the sender listens on for keyframe requests.
pub const DEFAULT_REPAIR_PORT: u16 = 11223;

/// Runtime configuration for the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiverConfig {
    /// Codec family of the incoming elementary stream
    pub codec: CodecFamily,

    /// Global kill-switch for keyframe repair requests
    pub keyframe_requests: bool,

    /// Destination port for repair datagrams
    pub repair_port: u16,

    /// `tracing` filter directive used by [`ReceiverConfig::init_logging`]
    pub log_filter: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            codec: CodecFamily::default(),
            keyframe_requests: true,
            repair_port: DEFAULT_REPAIR_PORT,
            log_filter: "info".to_string(),
        }
    }
}

impl ReceiverConfig {
    /// Parse a configuration from YAML text; missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| ReceiverError::File { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&yaml)
    }

    fn validate(&self) -> Result<()> {
        if self.repair_port == 0 {
            return Err(ReceiverError::config_error("repair_port", "port 0 is not addressable"));
        }
        Ok(())
    }

    /// Install a global `tracing` subscriber honouring `log_filter`.
    ///
    /// `RUST_LOG` takes precedence when set. Calling this twice is harmless.
    pub fn init_logging(&self) -> Result<()> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.log_filter)
                .map_err(|e| ReceiverError::config_error("log_filter", e.to_string()))?,
        };
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        Ok(())
    }
}

/// Thresholds and cooldowns of the stream health state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTiming {
    /// Period of the health tick
    pub tick_interval: Duration,
    /// Silence after which an up stream is declared down
    pub down_after: Duration,
    /// Minimum spacing between `rtp-gap` requests
    pub gap_cooldown: Duration,
    /// Sequence distance at or above which a packet is treated as reordered
    pub reorder_threshold: u16,
    /// Age of the sequence base after which an out-of-range packet rebases it
    pub rebase_after: Duration,
    /// Decoder silence that counts as a stall
    pub stall_after: Duration,
    /// Packets must have arrived this recently for a stall to be declared
    pub stall_packet_window: Duration,
    /// Minimum spacing between `decode-stall` requests
    pub stall_cooldown: Duration,
    /// Minimum spacing between `integrity` requests
    pub integrity_cooldown: Duration,
    /// Bursts sent when the stream comes up
    pub stream_up_bursts: u32,
    /// Bursts sent when recording starts
    pub record_start_bursts: u32,
}

impl Default for HealthTiming {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            down_after: Duration::from_millis(1200),
            gap_cooldown: Duration::from_millis(500),
            reorder_threshold: 30000,
            rebase_after: Duration::from_millis(1000),
            stall_after: Duration::from_millis(700),
            stall_packet_window: Duration::from_millis(500),
            stall_cooldown: Duration::from_millis(700),
            integrity_cooldown: Duration::from_millis(350),
            stream_up_bursts: 3,
            record_start_bursts: 3,
        }
    }
}

/// Pacing of keyframe request bursts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairTiming {
    /// Datagrams per burst
    pub datagrams_per_burst: u32,
    /// Spacing between datagrams inside a burst
    pub datagram_spacing: Duration,
    /// Spacing between bursts
    pub burst_gap: Duration,
    /// Spacing between bursts for recording-related reasons
    pub record_burst_gap: Duration,
}

impl Default for RepairTiming {
    fn default() -> Self {
        Self {
            datagrams_per_burst: 3,
            datagram_spacing: Duration::from_millis(100),
            burst_gap: Duration::from_millis(100),
            record_burst_gap: Duration::from_millis(150),
        }
    }
}
