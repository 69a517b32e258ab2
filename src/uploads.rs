//! Slave-side session registry
//!
//! Owns every active streamer on this peer, keyed by subchannel. Inbound
//! order frames are decoded here; a malformed frame is equivalent to a DIED
//! order for that session only, other sessions are untouched.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::MasterOrder;
use crate::regulator::{BandwidthRegulator, RegulatorHandle, SessionId};
use crate::resource::{ResourceReader, Subchannel};
use crate::streamer::{Streamer, StreamerOutput};
use crate::{Config, Error, Result};

struct SessionEntry {
    streamer: Streamer,
    regulator_session: SessionId,
}

/// Registry of active upload (serving) sessions
pub struct UploadsManager {
    config: Config,
    sessions: DashMap<Subchannel, SessionEntry>,
    regulator: Arc<BandwidthRegulator>,
}

impl UploadsManager {
    pub fn new(config: Config) -> Self {
        let window = std::time::Duration::from_millis(config.speed_window_ms);
        Self {
            config,
            sessions: DashMap::new(),
            regulator: Arc::new(BandwidthRegulator::new(window)),
        }
    }

    /// Regulator shared by all sessions on this peer; use it to set the
    /// global desired upload speed
    pub fn regulator(&self) -> &Arc<BandwidthRegulator> {
        &self.regulator
    }

    /// Start a streamer for `subchannel`. Called when the remote master's
    /// resource request arrives out of band. Returns the outbound report
    /// stream the transport must drain.
    pub fn register(
        &self,
        subchannel: Subchannel,
        reader: Arc<dyn ResourceReader>,
        intermediate_hash_size: Option<u64>,
        priority: f32,
    ) -> mpsc::Receiver<StreamerOutput> {
        let handle = RegulatorHandle::new(self.regulator.clone(), priority);
        let regulator_session = handle.id();
        let (streamer, output_rx) =
            Streamer::start(&self.config, reader, intermediate_hash_size, Some(handle));

        info!("upload session registered on subchannel {subchannel}");
        self.sessions.insert(
            subchannel,
            SessionEntry {
                streamer,
                regulator_session,
            },
        );
        output_rx
    }

    /// Route an inbound order frame to its session. A decode failure kills
    /// that session (silently, like a DIED) and surfaces the protocol error.
    pub async fn dispatch(&self, subchannel: Subchannel, frame: &[u8]) -> Result<()> {
        let streamer = self
            .sessions
            .get(&subchannel)
            .map(|entry| entry.streamer.clone())
            .ok_or(Error::SessionClosed)?;

        match MasterOrder::from_bytes(frame) {
            Ok(order) => {
                let ended = matches!(order, MasterOrder::Died);
                let result = streamer.order(order).await;
                if ended {
                    self.sessions.remove(&subchannel);
                }
                result
            }
            Err(e) => {
                warn!("protocol error on subchannel {subchannel}, killing session: {e}");
                let _ = streamer.order(MasterOrder::Died).await;
                self.sessions.remove(&subchannel);
                Err(e)
            }
        }
    }

    /// Tear a session down explicitly
    pub async fn release(&self, subchannel: Subchannel) {
        if let Some((_, entry)) = self.sessions.remove(&subchannel) {
            debug!("releasing upload session on subchannel {subchannel}");
            let _ = entry.streamer.order(MasterOrder::Died).await;
        }
    }

    /// Drop sessions whose task has ended (timeout or I/O death)
    pub fn prune(&self) {
        self.sessions.retain(|subchannel, entry| {
            let alive = entry.streamer.is_alive();
            if !alive {
                debug!("pruning dead upload session on subchannel {subchannel}");
            }
            alive
        });
    }

    /// One regulation pass: deliver hard-throttle factors to sessions
    /// running over their allowance
    pub async fn regulate(&self) {
        let variations = self.regulator.variations();
        if variations.is_empty() {
            return;
        }

        for (session_id, variation) in variations {
            let target = self.sessions.iter().find_map(|entry| {
                (entry.value().regulator_session == session_id)
                    .then(|| entry.value().streamer.clone())
            });
            if let Some(streamer) = target {
                let _ = streamer.order(MasterOrder::HardThrottle(variation)).await;
            }
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Spawn a periodic prune + regulate loop. The task ends when the last
    /// strong reference to the manager is dropped.
    pub fn spawn_regulation_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = std::time::Duration::from_millis(self.config.regulation_interval_ms);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.prune();
                manager.regulate().await;
            }
        })
    }
}
