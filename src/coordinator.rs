//! Master download coordinator
//!
//! One coordinator per download: fans the resource request out to N
//! providers, assigns disjoint ranges, merges chunks into the writer, tracks
//! per-provider statistics and verifies the finished resource.
//!
//! The single most important invariant: no byte is ever assigned to two
//! providers at the same time. The assignment pass subtracts the global
//! downloaded set and every provider's in-flight set before picking a gap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::hash::{verify_resource, HashAlgorithm, TotalHash};
use crate::message::{MasterOrder, SlaveReport};
use crate::range::{Range, RangeSet};
use crate::regulator::RegulatorHandle;
use crate::resource::{ProviderLink, ResourceId, ResourceWriter};
use crate::stats::ProviderStatistics;
use crate::{Config, Error, Result};

/// Provider key within one download
pub type ProviderId = u64;

/// Download lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Running,
    Paused,
    Stopped,
    Completed,
    Cancelled,
}

impl DownloadState {
    /// Whether this state ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Stopped | DownloadState::Completed | DownloadState::Cancelled
        )
    }
}

/// Why a download ended in `Cancelled`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for it
    Requested,

    /// Final whole-resource digest did not match; the partial bytes were
    /// preserved for inspection
    HashMismatch { expected: String, got: String },

    /// The resource writer failed
    WriterFailure(String),
}

/// Events streamed to the download's owner
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    StateChanged {
        state: DownloadState,
        reason: Option<CancelReason>,
    },
    Progress {
        downloaded: u64,
        total: Option<u64>,
    },
    /// Whole-resource hashing progress, 0-100
    HashingProgress(u8),
    ProviderAdded(ProviderId),
    ProviderLost(ProviderId),
}

/// Point-in-time view of one provider
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub id: ProviderId,
    pub shared_bytes: u64,
    pub assigned_bytes: u64,
    pub downloaded_bytes: u64,
    pub speed: f64,
    pub active_time: Duration,
}

/// Point-in-time view of a download, safe to read from reporting threads
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub resource: ResourceId,
    pub state: DownloadState,
    pub reason: Option<CancelReason>,
    pub total: Option<u64>,
    pub downloaded_bytes: u64,
    pub providers: Vec<ProviderSnapshot>,
}

enum Command {
    AddProvider {
        link: Box<dyn ProviderLink>,
        reply: oneshot::Sender<ProviderId>,
    },
    RemoveProvider(ProviderId),
    Pause,
    Resume,
    Stop,
    Cancel,
    Report(ProviderId, SlaveReport),
    ReportError(ProviderId, Error),
    SetThrottle(f32),
}

/// Cloneable control handle for a running download
#[derive(Clone)]
pub struct DownloadHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot: Arc<RwLock<DownloadSnapshot>>,
}

impl DownloadHandle {
    /// Attach a provider link; its session starts immediately
    pub async fn add_provider(&self, link: Box<dyn ProviderLink>) -> Result<ProviderId> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddProvider { link, reply })
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Permanently remove a provider; its in-flight ranges return to the pool
    pub async fn remove_provider(&self, id: ProviderId) -> Result<()> {
        self.send(Command::RemoveProvider(id)).await
    }

    /// Suspend assignment without releasing providers
    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    /// Resume a paused download
    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    /// Stop: preserve written bytes for a later resumed session
    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Cancel: discard written bytes
    pub async fn cancel(&self) -> Result<()> {
        self.send(Command::Cancel).await
    }

    /// Send a hard-throttle variation factor to every provider
    pub async fn set_throttle(&self, variation: f32) -> Result<()> {
        self.send(Command::SetThrottle(variation)).await
    }

    /// Current state
    pub fn state(&self) -> DownloadState {
        self.snapshot.read().state
    }

    /// Full statistics snapshot
    pub fn snapshot(&self) -> DownloadSnapshot {
        self.snapshot.read().clone()
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

/// Feeds report frames from transport pumps into the coordinator.
/// Held by the per-provider pump tasks.
#[derive(Clone)]
pub struct ReportFeed {
    cmd_tx: mpsc::Sender<Command>,
}

impl ReportFeed {
    /// Decode and deliver one inbound frame for `provider`. A malformed
    /// frame aborts that provider's session only.
    pub async fn frame(&self, provider: ProviderId, frame: &[u8]) {
        let cmd = match SlaveReport::from_bytes(frame) {
            Ok(report) => Command::Report(provider, report),
            Err(e) => Command::ReportError(provider, e),
        };
        let _ = self.cmd_tx.send(cmd).await;
    }
}

/// Entry point: spawns the per-download coordinator task
pub struct DownloadCoordinator;

impl DownloadCoordinator {
    /// Start coordinating a download into `writer`.
    ///
    /// An unsupported hash algorithm name is rejected here, before any
    /// provider is contacted. Providers are attached afterwards through
    /// [`DownloadHandle::add_provider`].
    pub fn start(
        config: Config,
        resource: ResourceId,
        writer: Box<dyn ResourceWriter>,
        total_hash: Option<TotalHash>,
        expected_length: Option<u64>,
        regulator: Option<RegulatorHandle>,
    ) -> Result<(DownloadHandle, mpsc::Receiver<DownloadEvent>)> {
        let verify = match total_hash {
            Some(hash) => Some((HashAlgorithm::parse(&hash.algorithm)?, hash)),
            None => None,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);

        // A resumed writer's recorded size wins over the caller's expectation.
        let writer_initialized = writer.size().is_some();
        let total = writer.size().or(expected_length);
        let downloaded = writer.available_segments().unwrap_or_default();
        info!(
            "download of {resource} starting: {} bytes already owned",
            downloaded.size()
        );

        let snapshot = Arc::new(RwLock::new(DownloadSnapshot {
            resource: resource.clone(),
            state: DownloadState::Running,
            reason: None,
            total,
            downloaded_bytes: downloaded.size(),
            providers: Vec::new(),
        }));

        let inner = Inner {
            config,
            resource,
            writer,
            writer_initialized,
            verify,
            total,
            downloaded,
            providers: HashMap::new(),
            next_provider: 1,
            state: DownloadState::Running,
            reason: None,
            events: event_tx,
            snapshot: snapshot.clone(),
            regulator,
            feed: ReportFeed {
                cmd_tx: cmd_tx.clone(),
            },
        };

        tokio::spawn(run(inner, cmd_rx));

        Ok((DownloadHandle { cmd_tx, snapshot }, event_rx))
    }
}

struct Provider {
    link: Box<dyn ProviderLink>,
    stats: ProviderStatistics,
}

struct Inner {
    config: Config,
    resource: ResourceId,
    writer: Box<dyn ResourceWriter>,
    writer_initialized: bool,
    verify: Option<(HashAlgorithm, TotalHash)>,
    total: Option<u64>,
    downloaded: RangeSet,
    providers: HashMap<ProviderId, Provider>,
    next_provider: ProviderId,
    state: DownloadState,
    reason: Option<CancelReason>,
    events: mpsc::Sender<DownloadEvent>,
    snapshot: Arc<RwLock<DownloadSnapshot>>,
    regulator: Option<RegulatorHandle>,
    feed: ReportFeed,
}

async fn run(mut inner: Inner, mut cmd_rx: mpsc::Receiver<Command>) {
    let mut ping = tokio::time::interval(Duration::from_millis(inner.config.ping_interval_ms));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // A resumed writer may already own everything.
    inner.check_completion().await;

    while !inner.state.is_terminal() {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                inner.handle_command(cmd).await;
            }
            _ = ping.tick() => inner.ping_links(),
        }
        inner.publish_snapshot();
    }
    inner.publish_snapshot();
}

impl Inner {
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddProvider { link, reply } => {
                let id = self.add_provider(link);
                let _ = reply.send(id);
            }
            Command::RemoveProvider(id) => {
                self.drop_provider(id, true);
                self.assign_all();
            }
            Command::Pause => self.pause().await,
            Command::Resume => self.resume().await,
            Command::Stop => self.finish(DownloadState::Stopped, None).await,
            Command::Cancel => {
                if let Err(e) = self.writer.cancel() {
                    warn!("writer cancel failed: {e}");
                }
                self.teardown_links();
                self.set_state(DownloadState::Cancelled, Some(CancelReason::Requested))
                    .await;
            }
            Command::Report(id, report) => self.handle_report(id, report).await,
            Command::ReportError(id, e) => {
                warn!("protocol error from provider {id}, dropping it: {e}");
                self.drop_provider(id, false);
                self.assign_all();
            }
            Command::SetThrottle(variation) => {
                let order = MasterOrder::HardThrottle(variation);
                let mut dead = Vec::new();
                for (&id, provider) in self.providers.iter_mut() {
                    if provider.link.send_order(&order).is_err() {
                        dead.push(id);
                    }
                }
                for id in dead {
                    self.drop_provider(id, false);
                }
            }
        }
    }

    fn add_provider(&mut self, mut link: Box<dyn ProviderLink>) -> ProviderId {
        let id = self.next_provider;
        self.next_provider += 1;

        // Pump inbound report frames into the command channel; a closed
        // stream is a transport-level death for this provider only.
        if let Some(mut incoming) = link.incoming() {
            let feed = self.feed.clone();
            tokio::spawn(async move {
                while let Some(frame) = incoming.recv().await {
                    feed.frame(id, &frame).await;
                }
                let _ = feed
                    .cmd_tx
                    .send(Command::Report(id, SlaveReport::Died))
                    .await;
            });
        }

        let mut provider = Provider {
            link,
            stats: ProviderStatistics::new(Duration::from_millis(self.config.speed_window_ms)),
        };

        // First orders: learn the length, then what the provider can serve.
        let opening = provider
            .link
            .send_order(&MasterOrder::ReportResourceLength)
            .and_then(|_| {
                provider
                    .link
                    .send_order(&MasterOrder::ReportAvailableSegments)
            });

        match opening {
            Ok(()) => {
                debug!("provider {id} attached to download of {}", self.resource);
                self.providers.insert(id, provider);
                let _ = self.events.try_send(DownloadEvent::ProviderAdded(id));
            }
            Err(e) => {
                warn!("provider {id} link failed on attach: {e}");
            }
        }
        id
    }

    async fn handle_report(&mut self, id: ProviderId, report: SlaveReport) {
        if !self.providers.contains_key(&id) {
            return;
        }

        match report {
            SlaveReport::ResourceSize(size) => self.handle_size_report(id, size).await,

            SlaveReport::SegmentAvailability(mut segments) => {
                if let Some(total) = self.total {
                    if total > 0 {
                        segments = segments
                            .intersection(&RangeSet::from_range(Range::new(0, total - 1)));
                    } else {
                        segments.clear();
                    }
                }
                debug!("provider {id} shares {segments}");
                if let Some(provider) = self.providers.get_mut(&id) {
                    provider.stats.shared = segments;
                }
                self.assign_all();
            }

            SlaveReport::SegmentAssignation(remote) => {
                // Cross-check only; the local set is authoritative.
                if let Some(provider) = self.providers.get(&id) {
                    if remote != provider.stats.assigned {
                        warn!(
                            "provider {id} queue {remote} disagrees with assigned {}",
                            provider.stats.assigned
                        );
                    }
                }
            }

            SlaveReport::ResourceChunk { first_byte, data } => {
                self.handle_chunk(id, first_byte, data).await;
            }

            SlaveReport::UnavailableSegment => {
                // The provider cannot serve what we asked for; put its
                // in-flight ranges back in the pool and re-learn what it has.
                warn!("provider {id} reported an unavailable segment");
                if let Some(provider) = self.providers.get_mut(&id) {
                    let released = provider.stats.release_assigned();
                    debug!("released {released} from provider {id}");
                    if provider
                        .link
                        .send_order(&MasterOrder::ReportAvailableSegments)
                        .is_err()
                    {
                        self.drop_provider(id, false);
                    }
                }
                self.assign_all();
            }

            SlaveReport::Died => {
                info!("provider {id} died");
                self.drop_provider(id, false);
                self.assign_all();
            }
        }
    }

    async fn handle_size_report(&mut self, id: ProviderId, size: u64) {
        if let Some(total) = self.total {
            if total != size {
                warn!("provider {id} reports length {size}, expected {total}; dropping it");
                self.drop_provider(id, true);
                return;
            }
        } else {
            debug!("resource length learned: {size} bytes");
            self.total = Some(size);
        }

        if !self.writer_initialized {
            if let Err(e) = self.writer.init(size) {
                self.fail_writer(e).await;
                return;
            }
            self.writer_initialized = true;
            self.assign_all();
            self.check_completion().await;
        }
    }

    async fn handle_chunk(&mut self, id: ProviderId, first_byte: u64, data: bytes::Bytes) {
        if data.is_empty() {
            return;
        }
        // Chunks still in flight are accepted while paused; only assignment
        // is suspended.
        if self.state.is_terminal() {
            return;
        }

        if let Err(e) = self.writer.write(first_byte, &data) {
            self.fail_writer(e).await;
            return;
        }

        let range = Range::new(first_byte, first_byte + data.len() as u64 - 1);
        if let Some(provider) = self.providers.get_mut(&id) {
            provider.stats.report_downloaded_segment(range);
        }
        self.downloaded.add(range);

        if let Some(regulator) = &self.regulator {
            regulator.record(data.len() as u64);
        }

        let _ = self.events.try_send(DownloadEvent::Progress {
            downloaded: self.downloaded.size(),
            total: self.total,
        });

        self.assign_for(id);
        self.check_completion().await;
    }

    /// Pick the first unowned, unassigned gap in the provider's shared set
    fn candidate_for(&self, id: ProviderId) -> Option<Range> {
        // No assignment until the writer is sized.
        if !self.writer_initialized {
            return None;
        }
        let provider = self.providers.get(&id)?;
        // One outstanding assignment per provider.
        if !provider.stats.assigned.is_empty() {
            return None;
        }

        let mut candidate = provider.stats.shared.clone();
        candidate.subtract(&self.downloaded);
        for other in self.providers.values() {
            candidate.subtract(&other.stats.assigned);
        }

        let first = candidate.first()?;
        let len = first.size().min(self.config.max_assignment_size);
        Some(Range::new(first.min, first.min + len - 1))
    }

    fn assign_for(&mut self, id: ProviderId) {
        if self.state != DownloadState::Running {
            return;
        }
        let Some(range) = self.candidate_for(id) else {
            return;
        };

        let Some(provider) = self.providers.get_mut(&id) else {
            return;
        };
        match provider
            .link
            .send_order(&MasterOrder::AddNewSegment(range))
        {
            Ok(()) => {
                debug!("assigned {range} to provider {id}");
                provider.stats.record_assigned(range);
            }
            Err(e) => {
                warn!("provider {id} link failed on assignment: {e}");
                self.drop_provider(id, false);
            }
        }
    }

    fn assign_all(&mut self) {
        let ids: Vec<ProviderId> = self.providers.keys().copied().collect();
        for id in ids {
            self.assign_for(id);
        }
    }

    async fn check_completion(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let Some(total) = self.total else { return };
        let complete = total == 0
            || (self.downloaded.size() >= total
                && self.downloaded.contains_range(&Range::new(0, total - 1)));
        if !complete {
            return;
        }

        info!("download of {} complete, {} bytes", self.resource, total);
        self.teardown_links();

        if let Some((algorithm, hash)) = self.verify.take() {
            let events = self.events.clone();
            let block_size = self.config.hashing_block_size;
            // Hashing reads the whole resource back, which blocks on disk for
            // file-backed writers. Lend the writer to a blocking task so the
            // other sessions on this runtime keep running meanwhile.
            let writer = std::mem::replace(&mut self.writer, Box::new(DetachedWriter));
            let verification = tokio::task::spawn_blocking(move || {
                let result = verify_resource(
                    writer.as_ref(),
                    total,
                    algorithm,
                    &hash.digest_hex,
                    block_size,
                    |percent| {
                        let _ = events.try_send(DownloadEvent::HashingProgress(percent));
                    },
                );
                (writer, result)
            })
            .await;

            let result = match verification {
                Ok((writer, result)) => {
                    self.writer = writer;
                    result
                }
                Err(e) => Err(Error::Writer(format!("verification task failed: {e}"))),
            };

            match result {
                Ok(()) => self.complete_writer().await,
                Err(Error::HashMismatch { expected, got }) => {
                    warn!("hash mismatch on {}: expected {expected}, got {got}", self.resource);
                    // Keep the bytes around for inspection; this is not a
                    // silent discard.
                    if let Err(e) = self.writer.stop() {
                        warn!("writer stop after hash mismatch failed: {e}");
                    }
                    self.set_state(
                        DownloadState::Cancelled,
                        Some(CancelReason::HashMismatch { expected, got }),
                    )
                    .await;
                }
                Err(e) => self.fail_writer(e).await,
            }
        } else {
            self.complete_writer().await;
        }
    }

    async fn complete_writer(&mut self) {
        match self.writer.complete() {
            Ok(()) => self.set_state(DownloadState::Completed, None).await,
            Err(e) => self.fail_writer(e).await,
        }
    }

    async fn pause(&mut self) {
        if self.state != DownloadState::Running {
            return;
        }
        for provider in self.providers.values_mut() {
            provider.stats.stop_session();
        }
        self.set_state(DownloadState::Paused, None).await;
    }

    async fn resume(&mut self) {
        if self.state != DownloadState::Paused {
            return;
        }
        for provider in self.providers.values_mut() {
            provider.stats.resume();
        }
        self.set_state(DownloadState::Running, None).await;
        self.assign_all();
    }

    /// Stop path: preserve bytes, close links, end the session
    async fn finish(&mut self, state: DownloadState, reason: Option<CancelReason>) {
        if self.state.is_terminal() {
            return;
        }
        self.teardown_links();
        if let Err(e) = self.writer.stop() {
            warn!("writer stop failed: {e}");
        }
        self.set_state(state, reason).await;
    }

    async fn fail_writer(&mut self, e: Error) {
        warn!("download of {} failed on writer: {e}", self.resource);
        self.teardown_links();
        self.set_state(
            DownloadState::Cancelled,
            Some(CancelReason::WriterFailure(e.to_string())),
        )
        .await;
    }

    fn teardown_links(&mut self) {
        let ids: Vec<ProviderId> = self.providers.keys().copied().collect();
        for id in ids {
            self.drop_provider(id, true);
        }
    }

    fn drop_provider(&mut self, id: ProviderId, notify_slave: bool) {
        if let Some(mut provider) = self.providers.remove(&id) {
            provider.stats.stop_session();
            let released = provider.stats.release_assigned();
            if !released.is_empty() {
                debug!("provider {id} leaves {released} back in the pool");
            }
            if notify_slave {
                let _ = provider.link.send_order(&MasterOrder::Died);
            }
            provider.link.die();
            let _ = self.events.try_send(DownloadEvent::ProviderLost(id));
        }
    }

    fn ping_links(&mut self) {
        let mut dead = Vec::new();
        for (&id, provider) in self.providers.iter_mut() {
            if provider.link.send_order(&MasterOrder::Ping).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.drop_provider(id, false);
        }
    }

    async fn set_state(&mut self, state: DownloadState, reason: Option<CancelReason>) {
        self.state = state;
        self.reason = reason.clone();
        let _ = self
            .events
            .send(DownloadEvent::StateChanged { state, reason })
            .await;
    }

    fn publish_snapshot(&mut self) {
        let providers = self
            .providers
            .iter_mut()
            .map(|(&id, provider)| ProviderSnapshot {
                id,
                shared_bytes: provider.stats.shared.size(),
                assigned_bytes: provider.stats.assigned.size(),
                downloaded_bytes: provider.stats.downloaded_bytes(),
                speed: provider.stats.speed(),
                active_time: provider.stats.active_time(),
            })
            .collect();

        *self.snapshot.write() = DownloadSnapshot {
            resource: self.resource.clone(),
            state: self.state,
            reason: self.reason.clone(),
            total: self.total,
            downloaded_bytes: self.downloaded.size(),
            providers,
        };
    }
}

/// Placeholder standing in while the real writer is lent to the hashing
/// task. Every operation fails; nothing touches the writer between the
/// loan and the terminal state anyway.
struct DetachedWriter;

impl DetachedWriter {
    fn gone() -> Error {
        Error::Writer("writer detached for verification".to_string())
    }
}

impl ResourceWriter for DetachedWriter {
    fn size(&self) -> Option<u64> {
        None
    }

    fn available_segments(&self) -> Option<RangeSet> {
        None
    }

    fn init(&mut self, _size: u64) -> Result<()> {
        Err(Self::gone())
    }

    fn write(&mut self, _offset: u64, _data: &[u8]) -> Result<()> {
        Err(Self::gone())
    }

    fn read(&self, _offset: u64, _len: usize) -> Result<bytes::Bytes> {
        Err(Self::gone())
    }

    fn complete(&mut self) -> Result<()> {
        Err(Self::gone())
    }

    fn cancel(&mut self) -> Result<()> {
        Err(Self::gone())
    }

    fn stop(&mut self) -> Result<()> {
        Err(Self::gone())
    }

    fn path(&self) -> Option<std::path::PathBuf> {
        None
    }

    fn set_user_field(&mut self, _key: &str, _value: String) {}

    fn user_field(&self, _key: &str) -> Option<String> {
        None
    }
}
