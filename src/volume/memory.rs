//! In-Memory Volumes
//!
//! Block volumes, a local pool and a primary writer kept in process memory.
//! They back the `simulate` command and the test suite.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio_stream::wrappers::WatchStream;

use super::{
    features, ImageContents, LocalImageInfo, LocalPool, LocalVolume, MirrorImageInfo, MirrorMode,
    MirrorState, RemoteImage, SnapshotInfo, VolumeWatch,
};
use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::journal::{CommitPosition, JournalEvent, MemoryJournal, RemoteJournal};

/// Mutable volume state
struct ImageState {
    data: Vec<u8>,
    snapshots: BTreeMap<String, SnapshotInfo>,
    metadata: BTreeMap<String, String>,
    features: u64,
    global_id: Option<String>,
    primary: bool,
    resync_requested: bool,
    /// Next snapshot id handed out by this volume as a primary
    next_snap_id: u64,
}

/// In-memory block volume
pub struct MemoryImage {
    name: String,
    state: RwLock<ImageState>,
    /// Current exclusive owner
    owner: Mutex<Option<String>>,
    /// Signalled whenever ownership is released
    lock_released: Notify,
    /// Header update counter
    header_tx: watch::Sender<u64>,
    /// Number of upcoming flushes that fail with `Busy`
    failing_flushes: AtomicU32,
}

impl MemoryImage {
    /// Create a zero-filled volume
    pub fn new(name: impl Into<String>, size: u64, features: u64) -> Self {
        Self::with_identity(name.into(), size, features, None, true)
    }

    fn with_identity(
        name: String,
        size: u64,
        features: u64,
        global_id: Option<String>,
        primary: bool,
    ) -> Self {
        let (header_tx, _) = watch::channel(0u64);
        Self {
            name,
            state: RwLock::new(ImageState {
                data: vec![0; size as usize],
                snapshots: BTreeMap::new(),
                metadata: BTreeMap::new(),
                features,
                global_id,
                primary,
                resync_requested: false,
                next_snap_id: 1,
            }),
            owner: Mutex::new(None),
            lock_released: Notify::new(),
            header_tx,
            failing_flushes: AtomicU32::new(0),
        }
    }

    fn replica(name: &str, global_id: &str, size: u64) -> Self {
        Self::with_identity(name.to_string(), size, 0, Some(global_id.to_string()), false)
    }

    fn bump_header(&self) {
        self.header_tx.send_modify(|counter| *counter += 1);
    }

    /// Volume size in bytes
    pub async fn size(&self) -> u64 {
        self.state.read().await.data.len() as u64
    }

    /// Current exclusive owner, if any
    pub async fn exclusive_owner(&self) -> Option<String> {
        self.owner.lock().await.clone()
    }

    /// Write as a local client; fails while someone else owns the volume
    pub async fn local_write(&self, client: &str, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(owner) = self.owner.lock().await.as_deref() {
            if owner != client {
                return Err(Error::Busy(format!(
                    "volume '{}' is exclusively owned by '{}'",
                    self.name, owner
                )));
            }
        }
        self.write(offset, data).await
    }

    /// Record a clone referencing `snap`
    pub async fn add_snapshot_child(&self, snap: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let snapshot = state
            .snapshots
            .get_mut(snap)
            .ok_or_else(|| Error::NotFound(format!("snapshot '{}'", snap)))?;
        snapshot.children += 1;
        Ok(())
    }

    /// Make the next `count` flushes fail with `Busy`
    pub fn fail_next_flushes(&self, count: u32) {
        self.failing_flushes.store(count, Ordering::SeqCst);
    }

    /// Reserve an id for a snapshot about to be created
    pub async fn allocate_snap_id(&self) -> u64 {
        let mut state = self.state.write().await;
        let id = state.next_snap_id;
        state.next_snap_id += 1;
        id
    }

    /// Id of the snapshot called `name`
    pub async fn snap_id(&self, name: &str) -> Option<u64> {
        self.state.read().await.snapshots.get(name).map(|s| s.id)
    }

    /// Change the mirror identity of this volume
    pub async fn set_mirror_identity(&self, global_id: Option<String>, primary: bool) {
        let mut state = self.state.write().await;
        state.global_id = global_id;
        state.primary = primary;
    }

    fn info(&self, state: &ImageState) -> LocalImageInfo {
        LocalImageInfo {
            name: self.name.clone(),
            global_id: state.global_id.clone(),
            primary: state.primary,
        }
    }

    /// Apply an event the way the primary executes it, without replay leniency
    pub async fn execute(&self, event: &JournalEvent) -> Result<()> {
        match event {
            JournalEvent::AioWrite { offset, data } => self.write(*offset, data).await,
            JournalEvent::AioDiscard { offset, length } => self.discard(*offset, *length).await,
            JournalEvent::AioFlush | JournalEvent::Noop => Ok(()),
            JournalEvent::SnapCreate { snap_id, name } => self.snap_create(*snap_id, name).await,
            JournalEvent::SnapRemove { name, .. } => self.snap_remove(name).await,
            JournalEvent::SnapRename { src, dst, .. } => self.snap_rename(src, dst).await,
            JournalEvent::SnapProtect { name, .. } => self.snap_protect(name).await,
            JournalEvent::SnapUnprotect { name, .. } => self.snap_unprotect(name).await,
            JournalEvent::MetadataSet { key, value } => self.metadata_set(key, value).await,
            JournalEvent::MetadataRemove { key } => self.metadata_remove(key).await,
            JournalEvent::UpdateFeatures { features, enabled } => {
                self.update_features(*features, *enabled).await
            }
        }
    }

    async fn contents(&self) -> ImageContents {
        let state = self.state.read().await;
        ImageContents {
            size: state.data.len() as u64,
            data: state.data.clone(),
            snapshots: state.snapshots.values().cloned().collect(),
            metadata: state.metadata.clone(),
            features: state.features,
        }
    }
}

fn check_range(name: &str, size: usize, offset: u64, length: u64) -> Result<()> {
    let end = offset
        .checked_add(length)
        .ok_or_else(|| Error::InvalidArgument("range overflows".into()))?;
    if end > size as u64 {
        return Err(Error::InvalidArgument(format!(
            "range {}..{} is beyond the end of volume '{}' ({} bytes)",
            offset, end, name, size
        )));
    }
    Ok(())
}

#[async_trait::async_trait]
impl LocalVolume for MemoryImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire_exclusive(&self, owner: &str) -> Result<()> {
        loop {
            let released = self.lock_released.notified();
            {
                let mut current = self.owner.lock().await;
                match current.as_deref() {
                    None => {
                        *current = Some(owner.to_string());
                        return Ok(());
                    }
                    Some(existing) if existing == owner => return Ok(()),
                    Some(_) => {}
                }
            }
            released.await;
        }
    }

    async fn release_exclusive(&self, owner: &str) -> Result<()> {
        let mut current = self.owner.lock().await;
        match current.as_deref() {
            Some(existing) if existing == owner => {
                *current = None;
                drop(current);
                self.lock_released.notify_waiters();
                Ok(())
            }
            None => Ok(()),
            Some(existing) => Err(Error::Busy(format!(
                "volume '{}' is owned by '{}', not '{}'",
                self.name, existing, owner
            ))),
        }
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        check_range(&self.name, state.data.len(), offset, data.len() as u64)?;
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn discard(&self, offset: u64, length: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let size = state.data.len() as u64;
        if offset >= size {
            return Ok(());
        }
        let end = offset.saturating_add(length).min(size);
        state.data[offset as usize..end as usize].fill(0);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let failing = self
            .failing_flushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Busy(format!("flush of volume '{}' failed", self.name)));
        }
        Ok(())
    }

    async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        check_range(&self.name, state.data.len(), offset, length)?;
        Ok(state.data[offset as usize..(offset + length) as usize].to_vec())
    }

    async fn snap_create(&self, id: u64, name: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.snapshots.contains_key(name) {
                return Err(Error::AlreadyExists(format!("snapshot '{}'", name)));
            }
            if state.snapshots.values().any(|s| s.id == id) {
                return Err(Error::AlreadyExists(format!("snapshot id {}", id)));
            }
            state.next_snap_id = state.next_snap_id.max(id + 1);
            state.snapshots.insert(
                name.to_string(),
                SnapshotInfo {
                    id,
                    name: name.to_string(),
                    protected: false,
                    children: 0,
                },
            );
        }
        self.bump_header();
        Ok(())
    }

    async fn snap_remove(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match state.snapshots.get(name) {
                None => return Err(Error::NotFound(format!("snapshot '{}'", name))),
                Some(snap) if snap.protected => {
                    return Err(Error::Busy(format!("snapshot '{}' is protected", name)))
                }
                Some(_) => {}
            }
            state.snapshots.remove(name);
        }
        self.bump_header();
        Ok(())
    }

    async fn snap_rename(&self, src: &str, dst: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.snapshots.contains_key(dst) {
                return Err(Error::AlreadyExists(format!("snapshot '{}'", dst)));
            }
            let mut snap = state
                .snapshots
                .remove(src)
                .ok_or_else(|| Error::NotFound(format!("snapshot '{}'", src)))?;
            snap.name = dst.to_string();
            state.snapshots.insert(dst.to_string(), snap);
        }
        self.bump_header();
        Ok(())
    }

    async fn snap_protect(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let snap = state
                .snapshots
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("snapshot '{}'", name)))?;
            if snap.protected {
                return Err(Error::Busy(format!("snapshot '{}' is already protected", name)));
            }
            snap.protected = true;
        }
        self.bump_header();
        Ok(())
    }

    async fn snap_unprotect(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let snap = state
                .snapshots
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("snapshot '{}'", name)))?;
            if !snap.protected {
                return Err(Error::InvalidArgument(format!(
                    "snapshot '{}' is not protected",
                    name
                )));
            }
            if snap.children > 0 {
                return Err(Error::Busy(format!(
                    "snapshot '{}' still has {} children",
                    name, snap.children
                )));
            }
            snap.protected = false;
        }
        self.bump_header();
        Ok(())
    }

    async fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self.state.read().await.snapshots.values().cloned().collect())
    }

    async fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .write()
            .await
            .metadata
            .insert(key.to_string(), value.to_string());
        self.bump_header();
        Ok(())
    }

    async fn metadata_remove(&self, key: &str) -> Result<()> {
        if self.state.write().await.metadata.remove(key).is_none() {
            return Err(Error::NotFound(format!("metadata key '{}'", key)));
        }
        self.bump_header();
        Ok(())
    }

    async fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.read().await.metadata.get(key).cloned())
    }

    async fn features(&self) -> Result<u64> {
        Ok(self.state.read().await.features)
    }

    async fn update_features(&self, mask: u64, enabled: bool) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !enabled
                && mask & features::EXCLUSIVE_LOCK != 0
                && state.features & features::JOURNALING != 0
                && mask & features::JOURNALING == 0
            {
                return Err(Error::InvalidArgument(
                    "exclusive-lock cannot be disabled while journaling is enabled".into(),
                ));
            }
            if enabled {
                state.features |= mask;
            } else {
                state.features &= !mask;
            }
        }
        self.bump_header();
        Ok(())
    }

    async fn resync_requested(&self) -> Result<bool> {
        Ok(self.state.read().await.resync_requested)
    }

    async fn request_resync(&self) -> Result<()> {
        self.state.write().await.resync_requested = true;
        tracing::info!("Resync requested for volume '{}'", self.name);
        self.bump_header();
        Ok(())
    }

    async fn import(&self, contents: &ImageContents) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.data = contents.data.clone();
            state.data.resize(contents.size as usize, 0);
            state.snapshots = contents
                .snapshots
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect();
            state.next_snap_id = contents
                .snapshots
                .iter()
                .map(|s| s.id + 1)
                .max()
                .unwrap_or(1);
            state.metadata = contents.metadata.clone();
            state.features = contents.features;
            state.resync_requested = false;
        }
        self.bump_header();
        Ok(())
    }

    fn watch(&self) -> VolumeWatch {
        WatchStream::new(self.header_tx.subscribe())
    }
}

/// In-memory local pool
#[derive(Default)]
pub struct MemoryPool {
    images: RwLock<HashMap<String, Arc<MemoryImage>>>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a plain (non-mirrored) volume
    pub async fn create_image(&self, name: &str, size: u64) -> Result<Arc<MemoryImage>> {
        let mut images = self.images.write().await;
        if images.contains_key(name) {
            return Err(Error::AlreadyExists(format!("volume '{}'", name)));
        }
        let image = Arc::new(MemoryImage::new(name, size, features::EXCLUSIVE_LOCK));
        images.insert(name.to_string(), Arc::clone(&image));
        Ok(image)
    }

    /// Concrete handle to a volume, for inspection
    pub async fn get(&self, name: &str) -> Option<Arc<MemoryImage>> {
        self.images.read().await.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl LocalPool for MemoryPool {
    async fn lookup(&self, name: &str) -> Result<Option<LocalImageInfo>> {
        let image = match self.get(name).await {
            Some(image) => image,
            None => return Ok(None),
        };
        let state = image.state.read().await;
        Ok(Some(image.info(&state)))
    }

    async fn create_replica(
        &self,
        name: &str,
        global_id: &str,
        size: u64,
    ) -> Result<Arc<dyn LocalVolume>> {
        let mut images = self.images.write().await;
        if images.contains_key(name) {
            return Err(Error::AlreadyExists(format!("volume '{}'", name)));
        }
        let image = Arc::new(MemoryImage::replica(name, global_id, size));
        images.insert(name.to_string(), Arc::clone(&image));
        tracing::info!("Created replica volume '{}' for {}", name, global_id);
        Ok(image)
    }

    async fn open(&self, name: &str) -> Result<Arc<dyn LocalVolume>> {
        match self.get(name).await {
            Some(image) => Ok(image),
            None => Err(Error::NotFound(format!("volume '{}'", name))),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let image = self
            .images
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", name)))?;
        // wake anyone still waiting on the removed volume's ownership
        image.lock_released.notify_waiters();
        tracing::info!("Removed volume '{}'", name);
        Ok(())
    }
}

/// Primary volume in a simulated remote cluster
pub struct MemoryRemote {
    image: MemoryImage,
    mirror: RwLock<Option<MirrorImageInfo>>,
    journal: RwLock<Option<Arc<MemoryJournal>>>,
}

impl MemoryRemote {
    /// Create a journaled, mirroring-enabled primary volume
    pub fn new(name: &str, size: u64, journal_config: JournalConfig) -> Arc<Self> {
        Arc::new(Self {
            image: MemoryImage::new(
                name,
                size,
                features::LAYERING | features::EXCLUSIVE_LOCK | features::JOURNALING,
            ),
            mirror: RwLock::new(Some(MirrorImageInfo {
                global_id: uuid::Uuid::new_v4().to_string(),
                state: MirrorState::Enabled,
                mode: MirrorMode::Journal,
                primary: true,
            })),
            journal: RwLock::new(Some(Arc::new(MemoryJournal::with_config(journal_config)))),
        })
    }

    /// The volume contents
    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    /// Concrete journal handle
    pub async fn memory_journal(&self) -> Option<Arc<MemoryJournal>> {
        self.journal.read().await.clone()
    }

    /// Global id, if mirroring is configured
    pub async fn global_id(&self) -> Option<String> {
        self.mirror.read().await.as_ref().map(|m| m.global_id.clone())
    }

    /// Change the mirroring state
    pub async fn set_mirror_state(&self, state: MirrorState) {
        if let Some(info) = self.mirror.write().await.as_mut() {
            info.state = state;
        }
    }

    /// Change the mirroring mode
    pub async fn set_mirror_mode(&self, mode: MirrorMode) {
        if let Some(info) = self.mirror.write().await.as_mut() {
            info.mode = mode;
        }
    }

    /// Remove mirroring metadata entirely
    pub async fn clear_mirror_info(&self) {
        *self.mirror.write().await = None;
    }

    /// Demote to non-primary
    pub async fn demote(&self) {
        if let Some(info) = self.mirror.write().await.as_mut() {
            info.primary = false;
        }
    }

    /// Promote back to primary
    pub async fn promote(&self) {
        if let Some(info) = self.mirror.write().await.as_mut() {
            info.primary = true;
        }
    }

    /// Drop the journal
    pub async fn remove_journal(&self) {
        *self.journal.write().await = None;
        let _ = self
            .image
            .update_features(features::JOURNALING, false)
            .await;
    }

    /// Open a writer session; each session writes under a fresh tag
    pub async fn open_writer(self: &Arc<Self>) -> Result<RemoteWriter> {
        let journal = self
            .memory_journal()
            .await
            .ok_or_else(|| Error::NotFound(format!("volume '{}' has no journal", self.image.name)))?;
        let tag = journal.allocate_tag().await;
        Ok(RemoteWriter {
            remote: Arc::clone(self),
            journal,
            tag,
            last_position: None,
        })
    }
}

#[async_trait::async_trait]
impl RemoteImage for MemoryRemote {
    fn name(&self) -> &str {
        &self.image.name
    }

    async fn mirror_info(&self) -> Result<Option<MirrorImageInfo>> {
        Ok(self.mirror.read().await.clone())
    }

    async fn journal(&self) -> Result<Option<Arc<dyn RemoteJournal>>> {
        Ok(self
            .journal
            .read()
            .await
            .clone()
            .map(|j| j as Arc<dyn RemoteJournal>))
    }

    async fn export(&self) -> Result<ImageContents> {
        Ok(self.image.contents().await)
    }
}

/// Writer session on a [`MemoryRemote`]
pub struct RemoteWriter {
    remote: Arc<MemoryRemote>,
    journal: Arc<MemoryJournal>,
    tag: u64,
    last_position: Option<CommitPosition>,
}

impl RemoteWriter {
    /// Tag this session writes under
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Execute an event on the primary and journal it
    pub async fn execute(&mut self, event: JournalEvent) -> Result<CommitPosition> {
        self.remote.image.execute(&event).await?;
        self.journal_only(event).await
    }

    /// Journal an event without executing it on the primary
    pub async fn journal_only(&mut self, event: JournalEvent) -> Result<CommitPosition> {
        let position = self.journal.append(self.tag, &event).await?;
        self.last_position = Some(position);
        Ok(position)
    }

    /// Write bytes
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<CommitPosition> {
        self.execute(JournalEvent::AioWrite {
            offset,
            data: data.to_vec(),
        })
        .await
    }

    /// Create a snapshot under a freshly allocated id
    pub async fn snap_create(&mut self, name: &str) -> Result<CommitPosition> {
        let snap_id = self.remote.image.allocate_snap_id().await;
        self.execute(JournalEvent::SnapCreate {
            snap_id,
            name: name.to_string(),
        })
        .await
    }

    /// Rename a snapshot
    pub async fn snap_rename(&mut self, src: &str, dst: &str) -> Result<CommitPosition> {
        let snap_id = self.existing_snap_id(src).await?;
        self.execute(JournalEvent::SnapRename {
            snap_id,
            src: src.to_string(),
            dst: dst.to_string(),
        })
        .await
    }

    /// Protect a snapshot
    pub async fn snap_protect(&mut self, name: &str) -> Result<CommitPosition> {
        let snap_id = self.existing_snap_id(name).await?;
        self.execute(JournalEvent::SnapProtect {
            snap_id,
            name: name.to_string(),
        })
        .await
    }

    /// Remove a snapshot
    pub async fn snap_remove(&mut self, name: &str) -> Result<CommitPosition> {
        let snap_id = self.existing_snap_id(name).await?;
        self.execute(JournalEvent::SnapRemove {
            snap_id,
            name: name.to_string(),
        })
        .await
    }

    async fn existing_snap_id(&self, name: &str) -> Result<u64> {
        self.remote
            .image
            .snap_id(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("snapshot '{}'", name)))
    }

    /// Make everything appended so far visible as the primary commit position
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(position) = self.last_position {
            self.journal.commit_primary(position).await?;
        }
        Ok(())
    }

    /// Flush and end the session
    pub async fn close(mut self) -> Result<()> {
        self.flush().await
    }
}
