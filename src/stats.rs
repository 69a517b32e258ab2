//! Transfer statistics
//!
//! One `ProviderStatistics` per (download, provider) pair; read by reporting
//! threads concurrently with being written by the transfer task, so the
//! coordinator publishes snapshots rather than sharing live references.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::range::{Range, RangeSet};

/// Transfer sample
#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: Instant,
    bytes: u64,
}

/// Sliding-window speed monitor
#[derive(Debug, Clone)]
pub struct SpeedMonitor {
    samples: VecDeque<Sample>,
    window: Duration,
    total_bytes: u64,
}

impl SpeedMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            total_bytes: 0,
        }
    }

    /// Record a transfer of `bytes`
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back(Sample {
            timestamp: now,
            bytes,
        });
        self.total_bytes += bytes;
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.timestamp) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current speed over the window (bytes/sec)
    pub fn speed(&mut self) -> f64 {
        let now = Instant::now();
        self.prune(now);

        if self.samples.is_empty() {
            return 0.0;
        }

        let windowed: u64 = self.samples.iter().map(|s| s.bytes).sum();
        let span = now
            .duration_since(self.samples.front().map(|s| s.timestamp).unwrap_or(now))
            .as_secs_f64()
            .max(0.001);
        windowed as f64 / span
    }

    /// Bytes recorded over the monitor's lifetime
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Per-provider statistics for one download session
///
/// `resume`/`stop_session` toggle the active session without destroying
/// history; the object lives until the provider is permanently removed or the
/// download ends.
#[derive(Debug, Clone)]
pub struct ProviderStatistics {
    /// When this provider was added to the download
    created_at: Instant,

    /// Start of the current active session, if any
    session_start: Option<Instant>,

    /// Active time accumulated by past sessions
    accumulated_active: Duration,

    /// Segments the provider reports owning
    pub shared: RangeSet,

    /// Segments currently in flight to this provider
    pub assigned: RangeSet,

    /// Segments confirmed downloaded from this provider
    pub downloaded: RangeSet,

    /// Sliding-window download speed
    speed: SpeedMonitor,
}

impl ProviderStatistics {
    pub fn new(speed_window: Duration) -> Self {
        Self {
            created_at: Instant::now(),
            session_start: Some(Instant::now()),
            accumulated_active: Duration::ZERO,
            shared: RangeSet::new(),
            assigned: RangeSet::new(),
            downloaded: RangeSet::new(),
            speed: SpeedMonitor::new(speed_window),
        }
    }

    /// Begin (or re-begin) an active session
    pub fn resume(&mut self) {
        if self.session_start.is_none() {
            self.session_start = Some(Instant::now());
        }
    }

    /// End the active session, folding its duration into the total
    pub fn stop_session(&mut self) {
        if let Some(start) = self.session_start.take() {
            self.accumulated_active += start.elapsed();
        }
    }

    /// Whether a session is currently active
    pub fn is_active(&self) -> bool {
        self.session_start.is_some()
    }

    /// Total active time across all sessions
    pub fn active_time(&self) -> Duration {
        let current = self
            .session_start
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO);
        self.accumulated_active + current
    }

    /// Age since the provider joined the download
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Record a range handed to the provider
    pub fn record_assigned(&mut self, range: Range) {
        self.assigned.add(range);
    }

    /// Confirm a downloaded range: always leaves `assigned` before entering
    /// `downloaded`, so no byte is ever in both
    pub fn report_downloaded_segment(&mut self, range: Range) {
        self.assigned.remove(range);
        self.downloaded.add(range);
        self.speed.record(range.size());
    }

    /// Drop all in-flight ranges, returning them to the caller's pool
    pub fn release_assigned(&mut self) -> RangeSet {
        std::mem::take(&mut self.assigned)
    }

    /// Current download speed from this provider (bytes/sec)
    pub fn speed(&mut self) -> f64 {
        self.speed.speed()
    }

    /// Total bytes downloaded from this provider
    pub fn downloaded_bytes(&self) -> u64 {
        self.speed.total_bytes()
    }
}
