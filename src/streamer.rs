//! Slave streamer (serving side)
//!
//! One streamer per transfer session: owns the segment queue and the adaptive
//! block-size policy, pulls bytes from a [`ResourceReader`] and pushes
//! [`SlaveReport`]s to the outbound handler. Control orders are handled
//! between block sends and never wait on an in-flight block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::message::{MasterOrder, SlaveReport};
use crate::range::{Range, RangeSet};
use crate::regulator::RegulatorHandle;
use crate::resource::ResourceReader;
use crate::throttle::{BlockSizePolicy, CHOKE_THRESHOLD, TICK_INTERVAL};
use crate::{Config, Error, Result};

/// What a streamer emits toward the transport
#[derive(Debug)]
pub enum StreamerOutput {
    /// A report frame to encode and send
    Report(SlaveReport),

    /// The queue just emptied; flush the channel instead of leaving a
    /// half-filled frame stalled
    Flush,
}

/// Handle to a running streamer session
#[derive(Clone)]
pub struct Streamer {
    order_tx: mpsc::Sender<MasterOrder>,
    alive: Arc<AtomicBool>,
}

impl Streamer {
    /// Spawn a streamer for one session. Returns the handle and the outbound
    /// report stream the transport drains.
    pub fn start(
        config: &Config,
        reader: Arc<dyn ResourceReader>,
        intermediate_hash_size: Option<u64>,
        regulator: Option<RegulatorHandle>,
    ) -> (Self, mpsc::Receiver<StreamerOutput>) {
        let (order_tx, order_rx) = mpsc::channel(config.command_channel_capacity);
        let (output_tx, output_rx) = mpsc::channel(config.report_channel_capacity);
        let alive = Arc::new(AtomicBool::new(true));

        let inner = StreamerInner {
            reader,
            queue: VecDeque::new(),
            policy: BlockSizePolicy::new(),
            output: output_tx,
            hash_window: intermediate_hash_size.filter(|&w| w > 0),
            regulator,
            choked: false,
        };

        let survive_timeout = Duration::from_millis(config.survive_timeout_ms);
        let alive_task = alive.clone();
        tokio::spawn(async move {
            run(inner, order_rx, survive_timeout).await;
            alive_task.store(false, Ordering::SeqCst);
        });

        (Self { order_tx, alive }, output_rx)
    }

    /// Deliver a decoded order to the session
    pub async fn order(&self, order: MasterOrder) -> Result<()> {
        self.order_tx
            .send(order)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Whether the session task is still running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct StreamerInner {
    reader: Arc<dyn ResourceReader>,
    queue: VecDeque<Range>,
    policy: BlockSizePolicy,
    output: mpsc::Sender<StreamerOutput>,
    hash_window: Option<u64>,
    regulator: Option<RegulatorHandle>,
    choked: bool,
}

async fn run(
    mut inner: StreamerInner,
    mut order_rx: mpsc::Receiver<MasterOrder>,
    survive_timeout: Duration,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + survive_timeout;

    loop {
        tokio::select! {
            biased;

            order = order_rx.recv() => {
                let Some(order) = order else { break };
                deadline = Instant::now() + survive_timeout;
                if !inner.handle_order(order).await {
                    break;
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                // The master vanished without sending DIED.
                warn!("streamer survive timeout, reporting death");
                inner.report_died().await;
                break;
            }

            _ = tick.tick() => {
                let choked = std::mem::take(&mut inner.choked);
                inner.policy.on_tick(choked);
            }

            _ = std::future::ready(()), if !inner.queue.is_empty() => {
                if !inner.send_next_block().await {
                    break;
                }
            }
        }
    }
}

impl StreamerInner {
    /// Handle one control order. Returns false when the session must end.
    async fn handle_order(&mut self, order: MasterOrder) -> bool {
        match order {
            MasterOrder::ReportResourceLength => match self.reader.length() {
                Ok(length) => self.report(SlaveReport::ResourceSize(length)).await,
                Err(e) => {
                    warn!("reader failed to report length: {e}");
                    self.report_died().await;
                    false
                }
            },

            MasterOrder::ReportAvailableSegments => match self.reader.available_segments() {
                Ok(segments) => self.report(SlaveReport::SegmentAvailability(segments)).await,
                Err(e) => {
                    warn!("reader failed to report segments: {e}");
                    self.report_died().await;
                    false
                }
            },

            MasterOrder::ReportAssignedSegments => {
                let queued: RangeSet = self.queue.iter().copied().collect();
                self.report(SlaveReport::SegmentAssignation(queued)).await
            }

            MasterOrder::EraseSegments => {
                debug!("erasing {} queued segments", self.queue.len());
                self.queue.clear();
                true
            }

            MasterOrder::AddNewSegment(range) => {
                let available = match self.reader.available_segments() {
                    Ok(segments) => segments,
                    Err(e) => {
                        warn!("reader failed on segment check: {e}");
                        self.report_died().await;
                        return false;
                    }
                };
                if available.contains_range(&range) {
                    debug!("queueing segment {range}");
                    self.queue.push_back(range);
                    true
                } else {
                    debug!("segment {range} unavailable, warning master");
                    self.report(SlaveReport::UnavailableSegment).await
                }
            }

            MasterOrder::HardThrottle(variation) => {
                self.policy.hard_throttle(variation);
                true
            }

            MasterOrder::SoftThrottle => {
                self.policy.soft_throttle();
                true
            }

            // Liveness only; the deadline was already reset.
            MasterOrder::Ping => true,

            // Remote is gone: tear down without echoing a death message.
            MasterOrder::Died => {
                debug!("master died, closing session");
                false
            }
        }
    }

    /// Read and emit the next block from the queue front.
    /// Returns false when the session must end.
    async fn send_next_block(&mut self) -> bool {
        let Some(front) = self.queue.front().copied() else {
            return true;
        };

        let offset = front.min;
        let mut len = (self.policy.block_size().max(1) as u64).min(front.size());
        if let Some(window) = self.hash_window {
            // Never cross an intermediate-hash boundary.
            len = len.min(window - offset % window);
        }

        let data = match self.reader.read(offset, len as usize) {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => {
                warn!("reader returned no data at offset {offset}");
                self.report_died().await;
                return false;
            }
            Err(e) => {
                warn!("read failed at offset {offset}: {e}");
                self.report_died().await;
                return false;
            }
        };

        let sent = data.len() as u64;
        let started = Instant::now();
        if !self
            .report(SlaveReport::ResourceChunk {
                first_byte: offset,
                data,
            })
            .await
        {
            return false;
        }
        if started.elapsed() > CHOKE_THRESHOLD {
            self.choked = true;
        }

        if let Some(regulator) = &self.regulator {
            regulator.record(sent);
        }

        // Advance the queue front.
        if sent >= front.size() {
            self.queue.pop_front();
        } else if let Some(front) = self.queue.front_mut() {
            front.min += sent;
        }

        if self.queue.is_empty() {
            return self.output.send(StreamerOutput::Flush).await.is_ok();
        }
        true
    }

    /// Send a report; false when the transport is gone
    async fn report(&mut self, report: SlaveReport) -> bool {
        self.output
            .send(StreamerOutput::Report(report))
            .await
            .is_ok()
    }

    async fn report_died(&mut self) {
        let _ = self.output.send(StreamerOutput::Report(SlaveReport::Died)).await;
    }
}
