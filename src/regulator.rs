//! Global bandwidth regulator
//!
//! The one cross-session shared mutable resource: many concurrent sessions
//! (slave streamers or master downloads) register here, a global desired
//! speed is split across them by priority, and sessions running over their
//! allowance receive a hard-throttle variation factor. Sessions never touch
//! each other's state directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::stats::SpeedMonitor;

/// Regulator session key
pub type SessionId = u64;

/// Default priority for new sessions
pub const DEFAULT_PRIORITY: f32 = 1.0;

/// Variation factors below this are noise and not worth an order
const MIN_ACTIONABLE_VARIATION: f32 = 0.98;

/// Floor for emitted variation factors
const MIN_VARIATION: f32 = 0.1;

struct SessionEntry {
    priority: f32,
    monitor: SpeedMonitor,
}

struct Inner {
    max_desired_speed: Option<f64>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_id: SessionId,
}

/// Cross-session desired-speed budget
pub struct BandwidthRegulator {
    inner: Mutex<Inner>,
    speed_window: Duration,
}

impl BandwidthRegulator {
    pub fn new(speed_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_desired_speed: None,
                sessions: HashMap::new(),
                next_id: 1,
            }),
            speed_window,
        }
    }

    /// Register a session with the given scheduling priority
    pub fn register(&self, priority: f32) -> SessionId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(
            id,
            SessionEntry {
                priority: priority.max(0.0),
                monitor: SpeedMonitor::new(self.speed_window),
            },
        );
        id
    }

    /// Remove a session; its share returns to the pool on the next pass
    pub fn unregister(&self, id: SessionId) {
        self.inner.lock().sessions.remove(&id);
    }

    /// Change a session's priority
    pub fn set_priority(&self, id: SessionId, priority: f32) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(&id) {
            entry.priority = priority.max(0.0);
        }
    }

    /// Set or clear the global desired-speed cap (bytes/sec)
    pub fn set_max_desired_speed(&self, speed: Option<f64>) {
        self.inner.lock().max_desired_speed = speed;
    }

    /// Current global cap
    pub fn max_desired_speed(&self) -> Option<f64> {
        self.inner.lock().max_desired_speed
    }

    /// Record `bytes` transferred by `id`
    pub fn record_transfer(&self, id: SessionId, bytes: u64) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(&id) {
            entry.monitor.record(bytes);
        }
    }

    /// Measured speed of one session (bytes/sec)
    pub fn session_speed(&self, id: SessionId) -> f64 {
        self.inner
            .lock()
            .sessions
            .get_mut(&id)
            .map(|entry| entry.monitor.speed())
            .unwrap_or(0.0)
    }

    /// One redistribution pass: split the budget by priority and emit a
    /// variation factor for every session measured above its allowance.
    /// With no cap set, nothing is emitted and sessions grow freely.
    pub fn variations(&self) -> Vec<(SessionId, f32)> {
        let mut inner = self.inner.lock();
        let Some(cap) = inner.max_desired_speed else {
            return Vec::new();
        };

        let total_priority: f32 = inner.sessions.values().map(|e| e.priority).sum();
        if total_priority <= 0.0 {
            return Vec::new();
        }

        let mut orders = Vec::new();
        for (&id, entry) in inner.sessions.iter_mut() {
            let allowance = cap * (entry.priority / total_priority) as f64;
            let measured = entry.monitor.speed();
            if measured <= 0.0 || allowance <= 0.0 {
                continue;
            }

            let variation = (allowance / measured) as f32;
            if variation < MIN_ACTIONABLE_VARIATION {
                let variation = variation.max(MIN_VARIATION);
                debug!(
                    session = id,
                    measured, allowance, variation, "throttling session over allowance"
                );
                orders.push((id, variation));
            }
        }
        orders
    }
}

/// Per-session handle: records transfers and unregisters on drop
pub struct RegulatorHandle {
    regulator: Arc<BandwidthRegulator>,
    id: SessionId,
}

impl RegulatorHandle {
    pub fn new(regulator: Arc<BandwidthRegulator>, priority: f32) -> Self {
        let id = regulator.register(priority);
        Self { regulator, id }
    }

    /// Session key within the regulator
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Record `bytes` moved by this session
    pub fn record(&self, bytes: u64) {
        self.regulator.record_transfer(self.id, bytes);
    }
}

impl Drop for RegulatorHandle {
    fn drop(&mut self) {
        self.regulator.unregister(self.id);
    }
}
