//! # RFT (Resource Flow Transfer)
//!
//! Resumable multi-source resource transfer engine
//!
//! ## Core features
//! - **Multi-source**: one download pulls disjoint ranges from N providers
//! - **Resumable**: writers persist owned segments across sessions
//! - **Pull-based**: the master orders, slaves stream until told otherwise
//! - **Adaptive block sizing**: per-session block size grows until the
//!   channel chokes, then backs off
//! - **Bandwidth regulation**: priority-weighted speed split across sessions
//! - **Integrity**: optional whole-resource digest verified on completion

pub mod config;
pub mod coordinator;
pub mod downloads;
pub mod error;
pub mod hash;
pub mod message;
pub mod range;
pub mod regulator;
pub mod resource;
pub mod stats;
pub mod streamer;
pub mod throttle;
pub mod uploads;

pub use config::Config;
pub use coordinator::{
    CancelReason, DownloadCoordinator, DownloadEvent, DownloadHandle, DownloadSnapshot,
    DownloadState, ProviderId, ProviderSnapshot,
};
pub use downloads::{DownloadId, DownloadsManager};
pub use error::{Error, Result};
pub use hash::{HashAlgorithm, TotalHash};
pub use message::{MasterOrder, SlaveReport};
pub use range::{Range, RangeSet};
pub use regulator::{BandwidthRegulator, RegulatorHandle, SessionId};
pub use resource::{
    ChannelLink, FileWriter, ProviderLink, ResourceId, ResourceProvider, ResourceReader,
    ResourceWriter, Subchannel,
};
pub use stats::ProviderStatistics;
pub use streamer::{Streamer, StreamerOutput};
pub use uploads::UploadsManager;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic number (frame identification)
pub const MAGIC_NUMBER: u32 = 0x52465450; // "RFTP"
