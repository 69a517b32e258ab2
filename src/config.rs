//! Engine configuration
//!
//! The adaptive block-size constants (tick interval, choke threshold, growth
//! and backoff factors) live in [`crate::throttle`] and are deliberately not
//! configurable.

/// RFT engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Slave session survive timeout (milliseconds).
    /// No inbound order within this window kills the session.
    pub survive_timeout_ms: u64,

    /// Master keepalive ping interval (milliseconds)
    pub ping_interval_ms: u64,

    /// Maximum byte span assigned to one provider in a single order
    pub max_assignment_size: u64,

    /// Capacity of a streamer's outbound report channel.
    /// A full channel is what produces choke signals, so this doubles as the
    /// backpressure depth.
    pub report_channel_capacity: usize,

    /// Capacity of a download's event channel
    pub event_channel_capacity: usize,

    /// Capacity of a coordinator's command channel
    pub command_channel_capacity: usize,

    /// Sliding window for speed monitors (milliseconds)
    pub speed_window_ms: u64,

    /// Block size used when streaming a finished resource through the
    /// verification hash
    pub hashing_block_size: usize,

    /// Regulator redistribution interval (milliseconds)
    pub regulation_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            survive_timeout_ms: 30_000,       // 30s
            ping_interval_ms: 10_000,         // 10s
            max_assignment_size: 128 * 1024,  // 128KB per order
            report_channel_capacity: 16,
            event_channel_capacity: 64,
            command_channel_capacity: 256,
            speed_window_ms: 5_000,
            hashing_block_size: 64 * 1024,
            regulation_interval_ms: 1_000,
        }
    }
}

impl Config {
    /// New configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for fat, stable pipes
    pub fn high_throughput() -> Self {
        Self {
            max_assignment_size: 512 * 1024,  // 512KB
            report_channel_capacity: 64,
            speed_window_ms: 2_000,
            regulation_interval_ms: 500,
            ..Self::default()
        }
    }

    /// Settings for flaky links: smaller assignments so a dead provider
    /// strands less in-flight work, longer grace periods
    pub fn unstable_network() -> Self {
        Self {
            survive_timeout_ms: 60_000,
            ping_interval_ms: 5_000,
            max_assignment_size: 32 * 1024,   // 32KB
            report_channel_capacity: 8,
            speed_window_ms: 10_000,
            ..Self::default()
        }
    }
}
