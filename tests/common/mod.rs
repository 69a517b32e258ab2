//! Shared fixtures: in-memory readers/writers and a loopback provider that
//! wires a download coordinator to a real upload streamer over encoded
//! frames.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rft::{
    ChannelLink, ProviderLink, Range, RangeSet, ResourceId, ResourceProvider, ResourceReader,
    ResourceWriter, Result, StreamerOutput, Subchannel, UploadsManager,
};

/// Log capture for failing tests; honors `RUST_LOG`
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Reader over an in-memory byte buffer, optionally owning only part of it
pub struct MemReader {
    data: Vec<u8>,
    segments: RangeSet,
}

impl MemReader {
    pub fn partial(data: Vec<u8>, segments: RangeSet) -> Self {
        Self { data, segments }
    }
}

impl ResourceReader for MemReader {
    fn length(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn available_segments(&self) -> Result<RangeSet> {
        Ok(self.segments.clone())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = offset as usize;
        let end = (start + len).min(self.data.len());
        Ok(Bytes::copy_from_slice(&self.data[start..end]))
    }

    fn stop(&self) {}
}

#[derive(Default)]
pub struct MemWriterState {
    pub buf: Vec<u8>,
    pub size: Option<u64>,
    pub owned: RangeSet,
    /// Every write call as (offset, len), in arrival order
    pub writes: Vec<(u64, usize)>,
    pub completed: bool,
    pub cancelled: bool,
    pub stopped: bool,
    pub fields: std::collections::HashMap<String, String>,
}

/// Writer over shared in-memory state, cloneable so tests can inspect the
/// bytes after handing the writer to the coordinator
#[derive(Clone, Default)]
pub struct MemWriter(pub Arc<Mutex<MemWriterState>>);

impl MemWriter {
    /// Writer resuming a previous session that already owns `owned` bytes
    /// of a resource of known `size`
    pub fn resumed(size: u64, buf: Vec<u8>, owned: RangeSet) -> Self {
        let writer = MemWriter::default();
        {
            let mut state = writer.0.lock();
            state.size = Some(size);
            state.buf = buf;
            state.owned = owned;
        }
        writer
    }
}

impl ResourceWriter for MemWriter {
    fn size(&self) -> Option<u64> {
        self.0.lock().size
    }

    fn available_segments(&self) -> Option<RangeSet> {
        let state = self.0.lock();
        (!state.owned.is_empty()).then(|| state.owned.clone())
    }

    fn init(&mut self, size: u64) -> Result<()> {
        let mut state = self.0.lock();
        state.size = Some(size);
        state.buf.resize(size as usize, 0);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.0.lock();
        let end = offset as usize + data.len();
        if state.buf.len() < end {
            state.buf.resize(end, 0);
        }
        state.buf[offset as usize..end].copy_from_slice(data);
        if !data.is_empty() {
            state
                .owned
                .add(Range::new(offset, offset + data.len() as u64 - 1));
        }
        state.writes.push((offset, data.len()));
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let state = self.0.lock();
        let start = offset as usize;
        let end = (start + len).min(state.buf.len());
        Ok(Bytes::copy_from_slice(&state.buf[start..end]))
    }

    fn complete(&mut self) -> Result<()> {
        self.0.lock().completed = true;
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        state.cancelled = true;
        state.buf.clear();
        state.owned.clear();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.0.lock().stopped = true;
        Ok(())
    }

    fn path(&self) -> Option<PathBuf> {
        None
    }

    fn set_user_field(&mut self, key: &str, value: String) {
        self.0.lock().fields.insert(key.to_string(), value);
    }

    fn user_field(&self, key: &str) -> Option<String> {
        self.0.lock().fields.get(key).cloned()
    }
}

/// Provider backed by a real [`UploadsManager`]: every opened session runs a
/// genuine slave streamer, with order and report frames crossing in-process
/// channels exactly as they would cross a transport.
pub struct LoopbackProvider {
    uploads: Arc<UploadsManager>,
    data: Vec<u8>,
    segments: RangeSet,
}

impl LoopbackProvider {
    /// Provider owning the whole resource
    pub fn new(uploads: Arc<UploadsManager>, data: Vec<u8>) -> Self {
        let segments = if data.is_empty() {
            RangeSet::new()
        } else {
            RangeSet::from_range(Range::new(0, data.len() as u64 - 1))
        };
        Self {
            uploads,
            data,
            segments,
        }
    }

    /// Provider owning only `segments` of the resource
    pub fn partial(uploads: Arc<UploadsManager>, data: Vec<u8>, segments: RangeSet) -> Self {
        Self {
            uploads,
            data,
            segments,
        }
    }
}

impl ResourceProvider for LoopbackProvider {
    fn request_resource(
        &self,
        _resource: &ResourceId,
        subchannel: Subchannel,
        intermediate_hash_size: Option<u64>,
    ) -> Result<Box<dyn ProviderLink>> {
        let reader = Arc::new(MemReader::partial(
            self.data.clone(),
            self.segments.clone(),
        ));
        let mut output =
            self.uploads
                .register(subchannel, reader, intermediate_hash_size, 1.0);

        let (order_tx, mut order_rx) = mpsc::unbounded_channel::<Bytes>();
        let (report_tx, report_rx) = mpsc::unbounded_channel::<Bytes>();

        // Master -> slave direction: order frames into the registry.
        let uploads = self.uploads.clone();
        tokio::spawn(async move {
            while let Some(frame) = order_rx.recv().await {
                if uploads.dispatch(subchannel, &frame).await.is_err() {
                    break;
                }
            }
        });

        // Slave -> master direction: report frames back over the link.
        tokio::spawn(async move {
            while let Some(out) = output.recv().await {
                if let StreamerOutput::Report(report) = out {
                    if report_tx.send(Bytes::from(report.to_bytes())).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Box::new(ChannelLink::new(order_tx, report_rx)))
    }
}
