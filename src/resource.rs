//! Resource and provider contracts
//!
//! The engine never touches storage or the peer channel directly: readers,
//! writers and provider links are supplied by the surrounding code. Two
//! stock implementations are provided: [`ChannelLink`] over a pair of
//! byte-frame channels, and [`FileWriter`] over a local file with a metadata
//! sidecar for resumed sessions.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::MasterOrder;
use crate::range::{Range, RangeSet};
use crate::{Error, Result};

/// Logical multiplexing key on the underlying peer channel
pub type Subchannel = u16;

/// Identity of a transferable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    /// Store the resource lives in
    pub store: String,

    /// Resource identifier within the store
    pub id: String,
}

impl ResourceId {
    pub fn new(store: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.store, self.id)
    }
}

/// Source of resource bytes on the serving (slave) side
///
/// Reads must be servable from any owned sub-range; a reader backed by a
/// partial download serves whatever `available_segments` reports.
pub trait ResourceReader: Send + Sync {
    /// Total resource length in bytes
    fn length(&self) -> Result<u64>;

    /// Segments this reader owns
    fn available_segments(&self) -> Result<RangeSet>;

    /// Read `len` bytes starting at `offset`
    fn read(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Release underlying handles
    fn stop(&self);
}

/// Sink for resource bytes on the consuming (master) side
///
/// Must support random-offset writes; chunk order across providers is not
/// guaranteed. A resumable writer reports previously owned bytes through
/// `available_segments` and survives a `stop`/reopen cycle, including its
/// user dictionary.
pub trait ResourceWriter: Send {
    /// Known resource size, if any (set by `init` or a resumed session)
    fn size(&self) -> Option<u64>;

    /// Bytes already owned from a prior stopped session
    fn available_segments(&self) -> Option<RangeSet>;

    /// Fix the resource size; called once, when the size is first learned
    fn init(&mut self, size: u64) -> Result<()>;

    /// Write `data` at absolute `offset`
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Read back written bytes; backs final integrity verification
    fn read(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// The resource is complete and verified
    fn complete(&mut self) -> Result<()>;

    /// Discard all written bytes
    fn cancel(&mut self) -> Result<()>;

    /// Flush and close, preserving bytes for a later resume
    fn stop(&mut self) -> Result<()>;

    /// Backing path, if file-based
    fn path(&self) -> Option<PathBuf>;

    /// Attach caller metadata that survives a stop/resume cycle
    fn set_user_field(&mut self, key: &str, value: String);

    /// Read back caller metadata
    fn user_field(&self, key: &str) -> Option<String>;
}

/// Control handle for one active transfer session bound to one provider
///
/// Orders flow out through `send_order`; the slave's report frames flow back
/// through the `incoming` stream, which the coordinator takes exactly once.
/// `die` is idempotent and stops both directions.
pub trait ProviderLink: Send {
    /// Send a master order to the remote slave
    fn send_order(&mut self, order: &MasterOrder) -> Result<()>;

    /// Take the inbound report-frame stream. Returns `None` after the first
    /// call or once the link is dead.
    fn incoming(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>>;

    /// Stop the session. Idempotent.
    fn die(&mut self);
}

/// Something that can serve a resource
pub trait ResourceProvider: Send + Sync {
    /// Open a transfer session for `resource` on `subchannel`. The remote
    /// peer instantiates the matching slave streamer out of band;
    /// `intermediate_hash_size` is handed to it so chunk boundaries respect
    /// the reader's hash windows.
    fn request_resource(
        &self,
        resource: &ResourceId,
        subchannel: Subchannel,
        intermediate_hash_size: Option<u64>,
    ) -> Result<Box<dyn ProviderLink>>;
}

/// [`ProviderLink`] over a pair of in-process byte-frame channels
///
/// The transport side owns the other ends: it forwards outgoing frames to the
/// peer channel under this session's subchannel and pushes received report
/// frames into the incoming sender.
pub struct ChannelLink {
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    incoming: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl ChannelLink {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Bytes>,
        incoming: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            outgoing: Some(outgoing),
            incoming: Some(incoming),
        }
    }
}

impl ProviderLink for ChannelLink {
    fn send_order(&mut self, order: &MasterOrder) -> Result<()> {
        let outgoing = self.outgoing.as_ref().ok_or(Error::SessionClosed)?;
        outgoing
            .send(Bytes::from(order.to_bytes()))
            .map_err(|_| Error::ChannelClosed)
    }

    fn incoming(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.incoming.take()
    }

    fn die(&mut self) {
        // Dropping the sender closes the slave-facing direction; the report
        // pump observes the closed incoming stream and stops.
        self.outgoing = None;
        self.incoming = None;
    }
}

/// On-disk state carried between sessions, stored next to the resource file
#[derive(Serialize, Deserialize)]
struct FileWriterSidecar {
    size: Option<u64>,
    owned: Vec<(u64, u64)>,
    fields: HashMap<String, String>,
}

/// [`ResourceWriter`] over a local file
///
/// `stop` persists the owned segments and the user dictionary into a
/// `.rftmeta` sidecar; reopening the same path resumes from it. `complete`
/// removes the sidecar, `cancel` removes both files.
pub struct FileWriter {
    file: Mutex<std::fs::File>,
    path: PathBuf,
    sidecar_path: PathBuf,
    size: Option<u64>,
    owned: RangeSet,
    fields: HashMap<String, String>,
}

fn sidecar_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".rftmeta");
    PathBuf::from(os)
}

impl FileWriter {
    /// Open `path` for writing, resuming from its sidecar if one exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sidecar_path = sidecar_path_for(&path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut writer = Self {
            file: Mutex::new(file),
            path,
            sidecar_path,
            size: None,
            owned: RangeSet::new(),
            fields: HashMap::new(),
        };

        if writer.sidecar_path.exists() {
            let sidecar: FileWriterSidecar =
                bincode::deserialize(&std::fs::read(&writer.sidecar_path)?)?;
            writer.size = sidecar.size;
            for (min, max) in sidecar.owned {
                writer.owned.add(Range::new(min, max));
            }
            writer.fields = sidecar.fields;
            debug!(
                "resuming {} with {} bytes owned",
                writer.path.display(),
                writer.owned.size()
            );
        }
        Ok(writer)
    }

    fn persist(&self) -> Result<()> {
        let sidecar = FileWriterSidecar {
            size: self.size,
            owned: self.owned.iter().map(|r| (r.min, r.max)).collect(),
            fields: self.fields.clone(),
        };
        std::fs::write(&self.sidecar_path, bincode::serialize(&sidecar)?)?;
        Ok(())
    }

    fn remove_sidecar(&self) {
        if let Err(e) = std::fs::remove_file(&self.sidecar_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("sidecar removal failed: {e}");
            }
        }
    }
}

impl ResourceWriter for FileWriter {
    fn size(&self) -> Option<u64> {
        self.size
    }

    fn available_segments(&self) -> Option<RangeSet> {
        (!self.owned.is_empty()).then(|| self.owned.clone())
    }

    fn init(&mut self, size: u64) -> Result<()> {
        self.file.lock().set_len(size)?;
        self.size = Some(size);
        self.persist()?;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        drop(file);
        self.owned
            .add(Range::new(offset, offset + data.len() as u64 - 1));
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let len = match self.size {
            Some(size) if offset >= size => 0,
            Some(size) => len.min((size - offset) as usize),
            None => len,
        };
        let mut buf = vec![0u8; len];
        if len > 0 {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        Ok(Bytes::from(buf))
    }

    fn complete(&mut self) -> Result<()> {
        self.file.lock().flush()?;
        self.remove_sidecar();
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        self.remove_sidecar();
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.file.lock().flush()?;
        self.persist()
    }

    fn path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn set_user_field(&mut self, key: &str, value: String) {
        self.fields.insert(key.to_string(), value);
    }

    fn user_field(&self, key: &str) -> Option<String> {
        self.fields.get(key).cloned()
    }
}
