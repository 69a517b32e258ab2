//! Adaptive block-size policy
//!
//! Additive-then-multiplicative growth with multiplicative backoff: every
//! tick without a choke grows the preferred block size, and the longer a
//! session sustains throughput the more aggressive the growth stage. Any
//! choke or explicit hard throttle restarts the climb from the slow stage.
//!
//! The constants are empirically tuned and encode the only congestion
//! control this protocol has; keep them in lockstep with deployed peers.

use std::time::Duration;

/// Policy evaluation interval
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// An outbound write slower than this counts as a choke
pub const CHOKE_THRESHOLD: Duration = Duration::from_millis(150);

/// Initial preferred block size (bytes)
pub const INITIAL_BLOCK_SIZE: f64 = 1024.0;

/// Block size never drops below this (bytes); there is no ceiling
pub const MIN_BLOCK_SIZE: f64 = 8.0;

/// Growth factor for the first 100 unchoked ticks
const GROWTH_SLOW: f64 = 1.001;

/// Growth factor for ticks 100..200
const GROWTH_MEDIUM: f64 = 1.003;

/// Growth factor from tick 200 on
const GROWTH_FAST: f64 = 1.010;

/// Automatic backoff applied on a choke signal
const CHOKE_THROTTLE: f64 = 0.999;

/// Factor applied by a soft throttle; does not reset the climb
const SOFT_THROTTLE: f64 = 0.992;

/// Adaptive block-size controller for one streaming session
#[derive(Debug)]
pub struct BlockSizePolicy {
    /// Preferred block size in bytes
    block_size: f64,

    /// Unchoked ticks since the last climb restart
    growth_ticks: u32,
}

impl BlockSizePolicy {
    pub fn new() -> Self {
        Self {
            block_size: INITIAL_BLOCK_SIZE,
            growth_ticks: 0,
        }
    }

    /// Current block size, floored, as a byte count
    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// One policy tick. `choked` reports whether any outbound write since the
    /// previous tick exceeded [`CHOKE_THRESHOLD`].
    pub fn on_tick(&mut self, choked: bool) {
        if choked {
            self.apply(CHOKE_THROTTLE);
            self.growth_ticks = 0;
            return;
        }

        let factor = match self.growth_ticks {
            0..=99 => GROWTH_SLOW,
            100..=199 => GROWTH_MEDIUM,
            _ => GROWTH_FAST,
        };
        self.block_size *= factor;
        self.growth_ticks += 1;
    }

    /// Master-directed throttle: multiply by `variation` and restart the climb
    pub fn hard_throttle(&mut self, variation: f32) {
        self.apply(variation as f64);
        self.growth_ticks = 0;
    }

    /// Self-initiated gentle reduction; the climb counter is untouched
    pub fn soft_throttle(&mut self) {
        self.apply(SOFT_THROTTLE);
    }

    fn apply(&mut self, factor: f64) {
        self.block_size = (self.block_size * factor).max(MIN_BLOCK_SIZE);
    }
}

impl Default for BlockSizePolicy {
    fn default() -> Self {
        Self::new()
    }
}
