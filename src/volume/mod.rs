//! Volume Module
//!
//! Collaborator traits for the remote (primary) volume and the local pool
//! that holds replicas, plus their in-memory implementations.

mod memory;

pub use memory::{MemoryImage, MemoryPool, MemoryRemote, RemoteWriter};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;

use crate::error::Result;
use crate::journal::RemoteJournal;

/// Feature bits understood by the replay path
pub mod features {
    pub const LAYERING: u64 = 1 << 0;
    pub const EXCLUSIVE_LOCK: u64 = 1 << 2;
    pub const OBJECT_MAP: u64 = 1 << 3;
    pub const FAST_DIFF: u64 = 1 << 4;
    pub const JOURNALING: u64 = 1 << 6;
}

/// Mirroring state of the remote volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorState {
    Enabled,
    Disabling,
    Disabled,
}

/// How the remote volume is mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorMode {
    /// Events are streamed through the journal
    Journal,
    /// Periodic snapshots are shipped instead of a journal
    Snapshot,
}

/// Mirroring metadata of the remote volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImageInfo {
    /// Cluster-independent identity shared by source and replica
    pub global_id: String,
    pub state: MirrorState,
    pub mode: MirrorMode,
    /// True while the remote volume is the writable source
    pub primary: bool,
}

/// What the local pool knows about a volume name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImageInfo {
    pub name: String,
    /// Global id the volume replicates, if it is a mirror volume
    pub global_id: Option<String>,
    /// True when the local volume has been promoted to primary
    pub primary: bool,
}

impl LocalImageInfo {
    /// True when this volume is a (non-primary) replica of `global_id`
    pub fn is_replica_of(&self, global_id: &str) -> bool {
        self.global_id.as_deref() == Some(global_id) && !self.primary
    }
}

/// Snapshot as seen by the replay path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Id assigned by the primary, kept across renames
    pub id: u64,
    pub name: String,
    pub protected: bool,
    /// Clones still referencing this snapshot
    pub children: u32,
}

/// Point-in-time contents of a volume, used for the initial image sync
#[derive(Debug, Clone, Default)]
pub struct ImageContents {
    pub size: u64,
    pub data: Vec<u8>,
    pub snapshots: Vec<SnapshotInfo>,
    pub metadata: BTreeMap<String, String>,
    pub features: u64,
}

/// Subscription to volume header updates (resync flag, metadata, features)
pub type VolumeWatch = WatchStream<u64>;

/// The remote source volume
#[async_trait::async_trait]
pub trait RemoteImage: Send + Sync {
    /// Volume name, reused for the local replica
    fn name(&self) -> &str;

    /// Mirroring metadata, `None` when mirroring was never enabled
    async fn mirror_info(&self) -> Result<Option<MirrorImageInfo>>;

    /// Replication journal, `None` when the volume has no journal
    async fn journal(&self) -> Result<Option<Arc<dyn RemoteJournal>>>;

    /// Full contents for seeding a fresh replica
    async fn export(&self) -> Result<ImageContents>;
}

/// The local pool holding replicas
#[async_trait::async_trait]
pub trait LocalPool: Send + Sync {
    /// Look a volume up by name
    async fn lookup(&self, name: &str) -> Result<Option<LocalImageInfo>>;

    /// Create an empty, non-primary replica of `global_id`
    async fn create_replica(
        &self,
        name: &str,
        global_id: &str,
        size: u64,
    ) -> Result<Arc<dyn LocalVolume>>;

    /// Open an existing volume
    async fn open(&self, name: &str) -> Result<Arc<dyn LocalVolume>>;

    /// Delete a volume
    async fn remove(&self, name: &str) -> Result<()>;
}

/// A local replica volume
#[async_trait::async_trait]
pub trait LocalVolume: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for, then take, exclusive ownership
    async fn acquire_exclusive(&self, owner: &str) -> Result<()>;

    /// Give up exclusive ownership
    async fn release_exclusive(&self, owner: &str) -> Result<()>;

    // Data I/O
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
    async fn discard(&self, offset: u64, length: u64) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>>;

    // Snapshots
    async fn snap_create(&self, id: u64, name: &str) -> Result<()>;
    async fn snap_remove(&self, name: &str) -> Result<()>;
    async fn snap_rename(&self, src: &str, dst: &str) -> Result<()>;
    async fn snap_protect(&self, name: &str) -> Result<()>;
    async fn snap_unprotect(&self, name: &str) -> Result<()>;
    async fn snapshots(&self) -> Result<Vec<SnapshotInfo>>;

    // Key/value metadata
    async fn metadata_set(&self, key: &str, value: &str) -> Result<()>;
    async fn metadata_remove(&self, key: &str) -> Result<()>;
    async fn metadata_get(&self, key: &str) -> Result<Option<String>>;

    // Feature bits
    async fn features(&self) -> Result<u64>;
    async fn update_features(&self, features: u64, enabled: bool) -> Result<()>;

    /// True when an operator asked for this replica to be rebuilt
    async fn resync_requested(&self) -> Result<bool>;

    /// Persist a resync request
    async fn request_resync(&self) -> Result<()>;

    /// Replace contents with a remote export
    async fn import(&self, contents: &ImageContents) -> Result<()>;

    /// Subscribe to header updates
    fn watch(&self) -> VolumeWatch;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_identity() {
        let info = LocalImageInfo {
            name: "image1".into(),
            global_id: Some("global".into()),
            primary: false,
        };
        assert!(info.is_replica_of("global"));
        assert!(!info.is_replica_of("other"));

        let promoted = LocalImageInfo {
            primary: true,
            ..info
        };
        assert!(!promoted.is_replica_of("global"));
    }
}
