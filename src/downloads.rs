//! Master-side download registry
//!
//! Owns every active download coordinator on this peer and the bandwidth
//! regulator they share. Provider sessions are opened here: a random
//! subchannel is drawn for each link so concurrent sessions to the same peer
//! never collide.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::coordinator::{
    DownloadCoordinator, DownloadEvent, DownloadHandle, ProviderId,
};
use crate::hash::TotalHash;
use crate::regulator::{BandwidthRegulator, RegulatorHandle, SessionId};
use crate::resource::{ResourceId, ResourceProvider, ResourceWriter, Subchannel};
use crate::{Config, Error, Result};

/// Registry key for one download
pub type DownloadId = u64;

struct DownloadEntry {
    handle: DownloadHandle,
    regulator_session: SessionId,
    resource: ResourceId,
    intermediate_hash_size: Option<u64>,
    subchannels: Vec<Subchannel>,
}

/// Registry of active downloads
pub struct DownloadsManager {
    config: Config,
    downloads: DashMap<DownloadId, DownloadEntry>,
    regulator: Arc<BandwidthRegulator>,
    next_id: std::sync::atomic::AtomicU64,
    // Subchannels reserved by live downloads; a reservation lasts until the
    // download is released or pruned.
    open_subchannels: Mutex<HashSet<Subchannel>>,
}

impl DownloadsManager {
    pub fn new(config: Config) -> Self {
        let window = std::time::Duration::from_millis(config.speed_window_ms);
        Self {
            config,
            downloads: DashMap::new(),
            regulator: Arc::new(BandwidthRegulator::new(window)),
            next_id: std::sync::atomic::AtomicU64::new(1),
            open_subchannels: Mutex::new(HashSet::new()),
        }
    }

    /// Draw a subchannel no live session on this peer is using
    fn draw_subchannel(&self) -> Subchannel {
        let mut open = self.open_subchannels.lock();
        let mut rng = rand::thread_rng();
        loop {
            let candidate: Subchannel = rng.gen();
            if open.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Regulator shared by all downloads on this peer; use it to set the
    /// global desired download speed
    pub fn regulator(&self) -> &Arc<BandwidthRegulator> {
        &self.regulator
    }

    /// Start a new download into `writer`. Providers are attached afterwards
    /// with [`DownloadsManager::add_provider`]; the returned receiver carries
    /// state, progress and hashing events.
    pub fn start(
        &self,
        resource: ResourceId,
        writer: Box<dyn ResourceWriter>,
        total_hash: Option<TotalHash>,
        expected_length: Option<u64>,
        intermediate_hash_size: Option<u64>,
        priority: f32,
    ) -> Result<(DownloadId, mpsc::Receiver<DownloadEvent>)> {
        let regulator_handle = RegulatorHandle::new(self.regulator.clone(), priority);
        let regulator_session = regulator_handle.id();

        let (handle, events) = DownloadCoordinator::start(
            self.config.clone(),
            resource.clone(),
            writer,
            total_hash,
            expected_length,
            Some(regulator_handle),
        )?;

        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!("download {id} of {resource} registered");
        self.downloads.insert(
            id,
            DownloadEntry {
                handle,
                regulator_session,
                resource,
                intermediate_hash_size,
                subchannels: Vec::new(),
            },
        );
        Ok((id, events))
    }

    /// Open a provider session for `download` and attach it. The subchannel
    /// is drawn at random and retried against the live-session set, so
    /// concurrent sessions on this peer never share a key; the provider's
    /// transport carries it to the remote peer so the matching upload
    /// session lands on the same one.
    pub async fn add_provider(
        &self,
        download: DownloadId,
        provider: &dyn ResourceProvider,
    ) -> Result<ProviderId> {
        let (handle, resource, hash_size) = {
            let entry = self
                .downloads
                .get(&download)
                .ok_or(Error::SessionClosed)?;
            (
                entry.handle.clone(),
                entry.resource.clone(),
                entry.intermediate_hash_size,
            )
        };

        let subchannel = self.draw_subchannel();
        debug!("opening provider session for {resource} on subchannel {subchannel}");
        let link = match provider.request_resource(&resource, subchannel, hash_size) {
            Ok(link) => link,
            Err(e) => {
                self.open_subchannels.lock().remove(&subchannel);
                return Err(e);
            }
        };
        if let Some(mut entry) = self.downloads.get_mut(&download) {
            entry.subchannels.push(subchannel);
        } else {
            self.open_subchannels.lock().remove(&subchannel);
        }
        handle.add_provider(link).await
    }

    /// Control handle for a registered download
    pub fn handle(&self, download: DownloadId) -> Option<DownloadHandle> {
        self.downloads
            .get(&download)
            .map(|entry| entry.handle.clone())
    }

    /// Forget a download. The coordinator keeps running until it reaches a
    /// terminal state on its own; stop or cancel through the handle first.
    pub fn release(&self, download: DownloadId) {
        if let Some((_, entry)) = self.downloads.remove(&download) {
            self.free_subchannels(&entry);
            debug!("released download {download}");
        }
    }

    /// Drop downloads that reached a terminal state
    pub fn prune(&self) {
        self.downloads.retain(|id, entry| {
            let live = !entry.handle.state().is_terminal();
            if !live {
                debug!("pruning finished download {id}");
                self.free_subchannels(entry);
            }
            live
        });
    }

    fn free_subchannels(&self, entry: &DownloadEntry) {
        let mut open = self.open_subchannels.lock();
        for subchannel in &entry.subchannels {
            open.remove(subchannel);
        }
    }

    /// One regulation pass: deliver hard-throttle factors to downloads
    /// running over their allowance
    pub async fn regulate(&self) {
        let variations = self.regulator.variations();
        if variations.is_empty() {
            return;
        }

        for (session_id, variation) in variations {
            let target = self.downloads.iter().find_map(|entry| {
                (entry.value().regulator_session == session_id)
                    .then(|| entry.value().handle.clone())
            });
            if let Some(handle) = target {
                let _ = handle.set_throttle(variation).await;
            }
        }
    }

    /// Number of registered downloads
    pub fn download_count(&self) -> usize {
        self.downloads.len()
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
