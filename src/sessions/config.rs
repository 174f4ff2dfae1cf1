//! Configuration types for lockstep sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `SyncConfig` | Handshake and retry timing | `lan()`, `high_latency()`, `lossy()` |
//! | `ProtocolConfig` | Quality reports, timeouts, protocol randomness | `competitive()`, `deterministic()` |
//! | `RollbackConfig` | Prediction depth, queue sizing, input delay | `competitive()`, `high_latency()` |
//!
//! # Example
//!
//! ```
//! use lockstep_rollback::{ProtocolConfig, SessionBuilder, SyncConfig};
//!
//! let builder = SessionBuilder::new()
//!     .with_sync_config(SyncConfig::lan())
//!     .with_protocol_config(ProtocolConfig::deterministic(7));
//! # let _ = builder;
//! ```

use web_time::Duration;

use crate::input_queue::INPUT_QUEUE_LENGTH;
use crate::sync_layer::MAX_PREDICTION_FRAMES;
use crate::RollbackError;

fn check_duration(
    field: &'static str,
    value: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), RollbackError> {
    if value < Duration::from_millis(min_ms) || value > Duration::from_millis(max_ms) {
        return Err(RollbackError::InvalidRequest {
            info: format!(
                "{} must be between {}ms and {}ms, got {}ms",
                field,
                min_ms,
                max_ms,
                value.as_millis()
            ),
        });
    }
    Ok(())
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), RollbackError> {
    if value < min || value > max {
        return Err(RollbackError::InvalidRequest {
            info: format!(
                "{} must be between {} and {}, got {}",
                field, min, max, value
            ),
        });
    }
    Ok(())
}

/// Configuration for the synchronization handshake and the running-phase retries.
///
/// The defaults work well for typical networks with <15% packet loss and <100ms RTT.
///
/// ```
/// use lockstep_rollback::SyncConfig;
/// use web_time::Duration;
///
/// let lossy = SyncConfig {
///     num_sync_packets: 8,
///     ..SyncConfig::default()
/// };
/// assert_eq!(lossy.sync_first_retry_interval, Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless passed to SessionBuilder::with_sync_config()"]
pub struct SyncConfig {
    /// Number of successful sync roundtrips required before the connection counts as synchronized.
    ///
    /// Default: 5
    pub num_sync_packets: u32,

    /// Retry interval while no roundtrip has completed yet.
    ///
    /// Default: 500ms
    pub sync_first_retry_interval: Duration,

    /// Retry interval once at least one roundtrip has completed.
    ///
    /// Default: 2000ms
    pub sync_retry_interval: Duration,

    /// Time between resends of unacknowledged input during the running phase.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,

    /// A keepalive is sent if nothing else was sent for this long.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_first_retry_interval: Duration::from_millis(500),
            sync_retry_interval: Duration::from_millis(2000),
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    /// Creates a new `SyncConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: fewer roundtrips and short intervals.
    pub fn lan() -> Self {
        Self {
            num_sync_packets: 3,
            sync_first_retry_interval: Duration::from_millis(100),
            sync_retry_interval: Duration::from_millis(250),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
        }
    }

    /// Preset for high-latency networks (100-200ms RTT).
    ///
    /// Uses longer intervals to avoid flooding the network with retries.
    pub fn high_latency() -> Self {
        Self {
            num_sync_packets: 5,
            sync_first_retry_interval: Duration::from_millis(800),
            sync_retry_interval: Duration::from_millis(3000),
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
        }
    }

    /// Preset for lossy networks (5-15% packet loss): more roundtrips for more confidence.
    pub fn lossy() -> Self {
        Self {
            num_sync_packets: 8,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), RollbackError> {
        check_range("num_sync_packets", u64::from(self.num_sync_packets), 1, 64)?;
        check_duration(
            "sync_first_retry_interval",
            self.sync_first_retry_interval,
            1,
            60_000,
        )?;
        check_duration("sync_retry_interval", self.sync_retry_interval, 1, 60_000)?;
        check_duration(
            "running_retry_interval",
            self.running_retry_interval,
            1,
            60_000,
        )?;
        check_duration("keepalive_interval", self.keepalive_interval, 1, 60_000)
    }
}

/// Configuration for the running phase of the peer protocol.
///
/// ```
/// use lockstep_rollback::ProtocolConfig;
///
/// let config = ProtocolConfig::deterministic(42);
/// assert_eq!(config.protocol_rng_seed, Some(42));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// Interval between quality reports, which measure the round-trip time.
    ///
    /// Default: 1000ms
    pub quality_report_interval: Duration,

    /// Interval between recomputations of the bandwidth statistics.
    ///
    /// Default: 1000ms
    pub network_stats_interval: Duration,

    /// Silence after which a `NetworkInterrupted` event is raised.
    ///
    /// Default: 750ms
    pub disconnect_notify_start: Duration,

    /// Silence after which the peer is considered disconnected.
    ///
    /// Default: 5000ms
    pub disconnect_timeout: Duration,

    /// Unacknowledged inputs beyond this count disconnect the peer.
    ///
    /// Default: 128
    pub pending_output_limit: usize,

    /// Seed for the protocol RNG (handshake nonces and session tokens).
    /// `None` seeds from timing entropy.
    ///
    /// Default: `None`
    pub protocol_rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(1000),
            network_stats_interval: Duration::from_millis(1000),
            disconnect_notify_start: Duration::from_millis(750),
            disconnect_timeout: Duration::from_millis(5000),
            pending_output_limit: 128,
            protocol_rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for competitive play: faster quality reports and earlier disconnect.
    pub fn competitive() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(250),
            disconnect_notify_start: Duration::from_millis(500),
            disconnect_timeout: Duration::from_millis(3000),
            ..Self::default()
        }
    }

    /// Default configuration with a fixed RNG seed, for reproducible handshakes.
    pub fn deterministic(seed: u64) -> Self {
        Self {
            protocol_rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if a value is out of range or if the
    /// interruption notice would come after the disconnect.
    pub fn validate(&self) -> Result<(), RollbackError> {
        check_duration(
            "quality_report_interval",
            self.quality_report_interval,
            1,
            10_000,
        )?;
        check_duration(
            "network_stats_interval",
            self.network_stats_interval,
            1,
            60_000,
        )?;
        check_duration(
            "disconnect_notify_start",
            self.disconnect_notify_start,
            1,
            300_000,
        )?;
        check_duration("disconnect_timeout", self.disconnect_timeout, 1, 300_000)?;
        if self.disconnect_notify_start >= self.disconnect_timeout {
            return Err(RollbackError::InvalidRequest {
                info: "disconnect_notify_start must be shorter than disconnect_timeout".to_owned(),
            });
        }
        check_range(
            "pending_output_limit",
            self.pending_output_limit as u64,
            1,
            4096,
        )
    }
}

/// Configuration for the rollback engine.
///
/// `queue_length` must exceed `max_prediction_frames`, otherwise the queues could not hold
/// the history a rollback needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "RollbackConfig has no effect unless passed to SessionBuilder"]
pub struct RollbackConfig {
    /// How many frames the simulation may run ahead of the confirmed frame.
    ///
    /// Default: 8
    pub max_prediction_frames: usize,

    /// Capacity of each participant's input queue.
    ///
    /// Default: 128
    pub queue_length: usize,

    /// Input delay applied to the local participant.
    ///
    /// Default: 0
    pub input_delay: usize,

    /// Simulation rate, used for the tick scheduler and frame advantage estimates.
    ///
    /// Default: 60
    pub fps: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_prediction_frames: MAX_PREDICTION_FRAMES,
            queue_length: INPUT_QUEUE_LENGTH,
            input_delay: 0,
            fps: 60,
        }
    }
}

impl RollbackConfig {
    /// Creates a new `RollbackConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for competitive play: two frames of input delay reduce visible rollbacks.
    pub fn competitive() -> Self {
        Self {
            input_delay: 2,
            ..Self::default()
        }
    }

    /// Preset for high-latency links: deeper prediction and larger queues.
    pub fn high_latency() -> Self {
        Self {
            max_prediction_frames: 12,
            queue_length: 256,
            input_delay: 3,
            fps: 60,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), RollbackError> {
        check_range(
            "max_prediction_frames",
            self.max_prediction_frames as u64,
            1,
            64,
        )?;
        if self.queue_length <= self.max_prediction_frames {
            return Err(RollbackError::InvalidRequest {
                info: format!(
                    "queue_length {} must exceed max_prediction_frames {}",
                    self.queue_length, self.max_prediction_frames
                ),
            });
        }
        check_range(
            "input_delay",
            self.input_delay as u64,
            0,
            self.queue_length as u64 - 1,
        )?;
        check_range("fps", self.fps as u64, 1, 1000)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_default_values() {
        let config = SyncConfig::default();
        assert_eq!(config.num_sync_packets, 5);
        assert_eq!(config.sync_first_retry_interval, Duration::from_millis(500));
        assert_eq!(config.sync_retry_interval, Duration::from_millis(2000));
        assert_eq!(config.running_retry_interval, Duration::from_millis(200));
        assert_eq!(config.keepalive_interval, Duration::from_millis(200));
        assert_eq!(config, SyncConfig::new());
    }

    #[test]
    fn sync_config_presets_are_valid() {
        for config in [
            SyncConfig::default(),
            SyncConfig::lan(),
            SyncConfig::high_latency(),
            SyncConfig::lossy(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
        assert_eq!(SyncConfig::lossy().num_sync_packets, 8);
    }

    #[test]
    fn sync_config_rejects_zero_packets() {
        let config = SyncConfig {
            num_sync_packets: 0,
            ..SyncConfig::default()
        };
        match config.validate() {
            Err(RollbackError::InvalidRequest { info }) => {
                assert!(info.contains("num_sync_packets"));
            },
            other => panic!("Expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn protocol_config_default_values() {
        let config = ProtocolConfig::default();
        assert_eq!(config.quality_report_interval, Duration::from_millis(1000));
        assert_eq!(config.network_stats_interval, Duration::from_millis(1000));
        assert_eq!(config.disconnect_notify_start, Duration::from_millis(750));
        assert_eq!(config.disconnect_timeout, Duration::from_millis(5000));
        assert_eq!(config.pending_output_limit, 128);
        assert_eq!(config.protocol_rng_seed, None);
    }

    #[test]
    fn protocol_config_presets_are_valid() {
        assert!(ProtocolConfig::competitive().validate().is_ok());
        assert!(ProtocolConfig::deterministic(3).validate().is_ok());
    }

    #[test]
    fn protocol_config_rejects_notify_after_timeout() {
        let config = ProtocolConfig {
            disconnect_notify_start: Duration::from_millis(6000),
            ..ProtocolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn protocol_config_rejects_zero_interval() {
        let config = ProtocolConfig {
            quality_report_interval: Duration::ZERO,
            ..ProtocolConfig::default()
        };
        match config.validate() {
            Err(RollbackError::InvalidRequest { info }) => {
                assert!(info.contains("quality_report_interval"));
            },
            other => panic!("Expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn rollback_config_validation() {
        assert!(RollbackConfig::default().validate().is_ok());
        assert!(RollbackConfig::competitive().validate().is_ok());
        assert!(RollbackConfig::high_latency().validate().is_ok());

        let too_small_queue = RollbackConfig {
            queue_length: 8,
            ..RollbackConfig::default()
        };
        assert!(too_small_queue.validate().is_err());

        let too_much_delay = RollbackConfig {
            input_delay: 128,
            ..RollbackConfig::default()
        };
        assert!(too_much_delay.validate().is_err());
    }
}
