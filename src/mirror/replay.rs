//! Replay Engine
//!
//! Reads the remote journal in order, applies each event to the local
//! replica and advances the commit position, optionally holding commits
//! back by the configured mirroring delay.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::commit::CommitTracker;
use super::{ControllerState, MirrorEvent, StateCell};
use crate::config::ReplayerSettings;
use crate::error::{Error, Result};
use crate::journal::{
    ClientState, CommitPosition, EventKind, JournalEntry, JournalEvent, ReadResult, RemoteJournal,
};
use crate::volume::{LocalVolume, SnapshotInfo};

/// Requests sent to a running engine
pub(crate) enum ReplayCommand {
    /// Commit everything applied so far, ignoring the mirroring delay
    Flush(oneshot::Sender<Result<()>>),
}

/// Why the engine stopped
#[derive(Debug)]
pub enum ReplayExit {
    /// Cancelled by a stop request
    Stopped,
    /// An event could not be applied or decoded
    Fault(Error),
    /// The registration was disconnected by the journal
    Disconnected,
    /// The replica's resync flag was set
    ResyncRequested,
}

/// Applied entry whose commit is being held back
#[derive(Debug, Clone, Copy)]
struct PendingCommit {
    position: CommitPosition,
    due: Instant,
}

/// Outcome of draining the journal
enum Drain {
    /// Batch limit reached, more entries may be readable
    More,
    /// Nothing past the cursor
    Idle,
}

/// Single consumer of the remote journal for one replica
pub struct ReplayEngine {
    volume: Arc<dyn LocalVolume>,
    journal: Arc<dyn RemoteJournal>,
    tracker: Arc<CommitTracker>,
    settings: ReplayerSettings,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    /// Exclusive owner name used on the local volume
    owner: String,
    /// Position of the last applied entry
    cursor: CommitPosition,
    /// Tag of the last applied entry
    current_tag: Option<u64>,
    /// Applied entries not yet committed
    pending: VecDeque<PendingCommit>,
    /// True while exclusive ownership is held
    holding: bool,
}

impl ReplayEngine {
    pub(crate) fn new(
        volume: Arc<dyn LocalVolume>,
        journal: Arc<dyn RemoteJournal>,
        tracker: Arc<CommitTracker>,
        start_position: CommitPosition,
        settings: ReplayerSettings,
        state: Arc<StateCell>,
        cancel: CancellationToken,
    ) -> Self {
        let owner = format!("mirror:{}", tracker.client_id());
        Self {
            volume,
            journal,
            tracker,
            settings,
            state,
            cancel,
            owner,
            cursor: start_position,
            current_tag: None,
            pending: VecDeque::new(),
            holding: false,
        }
    }

    /// Replay until cancelled or until replay cannot continue
    pub(crate) async fn run(mut self, commands: &mut mpsc::Receiver<ReplayCommand>) -> ReplayExit {
        tracing::info!(
            "Replay of '{}' starting after {}",
            self.volume.name(),
            self.cursor
        );

        let exit = match self.replay_loop(commands).await {
            Ok(exit) => exit,
            Err(Error::Cancelled) => ReplayExit::Stopped,
            Err(Error::NotConnected(reason)) => {
                tracing::warn!("Replay of '{}' disconnected: {}", self.volume.name(), reason);
                ReplayExit::Disconnected
            }
            Err(e) => ReplayExit::Fault(e),
        };

        if !self.pending.is_empty() {
            tracing::info!(
                "Replay of '{}' abandoning {} uncommitted entries after {}",
                self.volume.name(),
                self.pending.len(),
                self.cursor
            );
        }
        self.release().await;

        tracing::info!("Replay of '{}' finished: {:?}", self.volume.name(), exit);
        exit
    }

    async fn replay_loop(
        &mut self,
        commands: &mut mpsc::Receiver<ReplayCommand>,
    ) -> Result<ReplayExit> {
        let mut journal_watch = self.journal.watch();
        let mut volume_watch = self.volume.watch();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(ReplayExit::Stopped);
            }
            if let Some(exit) = self.check_liveness().await? {
                return Ok(exit);
            }

            while let Ok(command) = commands.try_recv() {
                self.handle_command(command).await?;
            }

            match self.drain(commands).await? {
                Drain::More => continue,
                Drain::Idle => {}
            }

            self.commit_due().await?;
            self.release().await;
            if self.pending.is_empty() {
                self.state.set_while_replaying(ControllerState::Replaying);
            } else {
                self.state.set_while_replaying(ControllerState::ReplayFlushing);
            }

            let deadline = self.pending.front().map(|p| p.due);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(ReplayExit::Stopped),
                Some(_) = journal_watch.next() => {}
                Some(_) = volume_watch.next() => {}
                Some(command) = commands.recv() => self.handle_command(command).await?,
                _ = sleep_until_opt(deadline), if deadline.is_some() => {}
            }
        }
    }

    /// Stop conditions observed on the journal and the replica
    async fn check_liveness(&self) -> Result<Option<ReplayExit>> {
        if self.tracker.connection_state().await? == ClientState::Disconnected {
            return Ok(Some(ReplayExit::Disconnected));
        }
        if self.volume.resync_requested().await? {
            tracing::info!("Resync requested on '{}' while replaying", self.volume.name());
            return Ok(Some(ReplayExit::ResyncRequested));
        }
        Ok(None)
    }

    /// Apply up to one batch of entries
    async fn drain(&mut self, commands: &mut mpsc::Receiver<ReplayCommand>) -> Result<Drain> {
        let mut applied = 0;
        while applied < self.settings.max_batch_entries {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let entry = match self.journal.read_next(&self.cursor).await? {
                ReadResult::Entry(entry) => entry,
                ReadResult::WouldBlock => {
                    self.commit_due().await?;
                    return Ok(Drain::Idle);
                }
            };

            if let Some(tag) = self.current_tag {
                if entry.tag_tid() != tag {
                    self.finish_tag(tag, entry.tag_tid(), commands).await?;
                }
            }

            self.apply_entry(&entry).await?;
            applied += 1;
        }

        self.commit_due().await?;
        Ok(Drain::More)
    }

    /// Commit every entry of the finished tag before the next tag is consumed
    async fn finish_tag(
        &mut self,
        tag: u64,
        next_tag: u64,
        commands: &mut mpsc::Receiver<ReplayCommand>,
    ) -> Result<()> {
        tracing::debug!(
            "Tag boundary on '{}': {} -> {}, {} entries pending",
            self.volume.name(),
            tag,
            next_tag,
            self.pending.len()
        );
        self.apply_with_retry(self.cursor, &JournalEvent::AioFlush).await?;

        loop {
            self.commit_due().await?;
            let Some(due) = self.pending.front().map(|p| p.due) else {
                return Ok(());
            };

            // ownership is not needed while waiting out the delay
            self.release().await;
            self.state
                .set_while_replaying(ControllerState::ReplayFlushing);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(due) => {}
                Some(command) = commands.recv() => self.handle_command(command).await?,
            }
        }
    }

    async fn apply_entry(&mut self, entry: &JournalEntry) -> Result<()> {
        let event = entry.decode().map_err(|e| Error::ReplayFault {
            position: entry.position,
            reason: e.to_string(),
        })?;

        match event.kind() {
            EventKind::Noop => {}
            kind => {
                if kind == EventKind::Metadata {
                    tracing::debug!(
                        "Replaying {} at {} on '{}'",
                        event.name(),
                        entry.position,
                        self.volume.name()
                    );
                }
                self.acquire().await?;
                self.apply_with_retry(entry.position, &event).await?;
            }
        }

        self.cursor = entry.position;
        self.current_tag = Some(entry.tag_tid());
        self.pending.push_back(PendingCommit {
            position: entry.position,
            due: self.commit_due_at(entry),
        });
        Ok(())
    }

    fn commit_due_at(&self, entry: &JournalEntry) -> Instant {
        let now = Instant::now();
        if self.settings.mirroring_replay_delay.is_zero() {
            return now;
        }
        let delay = chrono::Duration::from_std(self.settings.mirroring_replay_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let remaining = (entry.write_time + delay - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        now + remaining
    }

    async fn acquire(&mut self) -> Result<()> {
        if self.holding {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.volume.acquire_exclusive(&self.owner) => result?,
        }
        self.holding = true;
        Ok(())
    }

    async fn release(&mut self) {
        if !self.holding {
            return;
        }
        if let Err(e) = self.volume.release_exclusive(&self.owner).await {
            tracing::warn!(
                "Failed to release ownership of '{}': {}",
                self.volume.name(),
                e
            );
        }
        self.holding = false;
    }

    async fn apply_with_retry(&self, position: CommitPosition, event: &JournalEvent) -> Result<()> {
        let mut attempt = 0;
        loop {
            match apply_event(self.volume.as_ref(), event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient_apply_failure() && attempt < self.settings.max_apply_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Applying {} at {} to '{}' failed (attempt {}): {}",
                        event.name(),
                        position,
                        self.volume.name(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.settings.apply_retry_delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Applying {} at {} to '{}' failed: {}",
                        event.name(),
                        position,
                        self.volume.name(),
                        e
                    );
                    return Err(Error::ReplayFault {
                        position,
                        reason: format!("{} failed: {}", event.name(), e),
                    });
                }
            }
        }
    }

    /// Advance the commit position past every entry whose delay has elapsed
    async fn commit_due(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut target = None;
        while let Some(front) = self.pending.front() {
            if front.due > now {
                break;
            }
            target = Some(front.position);
            self.pending.pop_front();
        }
        match target {
            Some(position) => self.commit(position).await,
            None => Ok(()),
        }
    }

    /// Advance the commit position past every applied entry
    async fn commit_all(&mut self) -> Result<()> {
        let last = self.pending.drain(..).last();
        match last {
            Some(pending) => self.commit(pending.position).await,
            None => Ok(()),
        }
    }

    async fn commit(&self, position: CommitPosition) -> Result<()> {
        self.tracker.advance(position).await?;
        if let Ok(lag) = self.tracker.lag().await {
            self.state.emit(MirrorEvent::CommitLag(lag));
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: ReplayCommand) -> Result<()> {
        match command {
            ReplayCommand::Flush(reply) => {
                let result = match self.volume.flush().await {
                    Ok(()) => self.commit_all().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result.clone());
                result
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn find_by_id(snapshots: &[SnapshotInfo], id: u64) -> Option<&SnapshotInfo> {
    snapshots.iter().find(|s| s.id == id)
}

/// Apply one event, skipping operations that are already in effect
///
/// Snapshots are matched by id, so events recorded before a later rename or
/// removal still find (or correctly miss) the snapshot they refer to.
pub(crate) async fn apply_event(volume: &dyn LocalVolume, event: &JournalEvent) -> Result<()> {
    match event {
        JournalEvent::AioWrite { offset, data } => volume.write(*offset, data).await,
        JournalEvent::AioDiscard { offset, length } => volume.discard(*offset, *length).await,
        JournalEvent::AioFlush => volume.flush().await,
        JournalEvent::SnapCreate { snap_id, name } => {
            let snapshots = volume.snapshots().await?;
            if find_by_id(&snapshots, *snap_id).is_some() {
                tracing::debug!("Snapshot {} ('{}') already exists", snap_id, name);
                return Ok(());
            }
            if let Some(holder) = snapshots.iter().find(|s| s.name == *name) {
                // the name was reused by a later snapshot
                tracing::debug!(
                    "Snapshot name '{}' is held by snapshot {}, skipping create of {}",
                    name,
                    holder.id,
                    snap_id
                );
                return Ok(());
            }
            volume.snap_create(*snap_id, name).await
        }
        JournalEvent::SnapRemove { snap_id, .. } => {
            let snapshots = volume.snapshots().await?;
            match find_by_id(&snapshots, *snap_id) {
                Some(snap) => volume.snap_remove(&snap.name).await,
                None => Ok(()),
            }
        }
        JournalEvent::SnapRename { snap_id, src, dst } => {
            let snapshots = volume.snapshots().await?;
            let Some(snap) = find_by_id(&snapshots, *snap_id) else {
                tracing::debug!("Snapshot {} ('{}') no longer exists", snap_id, src);
                return Ok(());
            };
            if snap.name == *dst {
                tracing::debug!("Snapshot {} already renamed to '{}'", snap_id, dst);
                return Ok(());
            }
            if let Some(holder) = snapshots.iter().find(|s| s.name == *dst) {
                tracing::debug!(
                    "Snapshot name '{}' is held by snapshot {}, skipping rename of {}",
                    dst,
                    holder.id,
                    snap_id
                );
                return Ok(());
            }
            volume.snap_rename(&snap.name, dst).await
        }
        JournalEvent::SnapProtect { snap_id, .. } => {
            let snapshots = volume.snapshots().await?;
            match find_by_id(&snapshots, *snap_id) {
                Some(snap) if !snap.protected => volume.snap_protect(&snap.name).await,
                _ => Ok(()),
            }
        }
        JournalEvent::SnapUnprotect { snap_id, .. } => {
            let snapshots = volume.snapshots().await?;
            match find_by_id(&snapshots, *snap_id) {
                Some(snap) if snap.protected => volume.snap_unprotect(&snap.name).await,
                _ => Ok(()),
            }
        }
        JournalEvent::MetadataSet { key, value } => {
            if volume.metadata_get(key).await?.as_deref() == Some(value.as_str()) {
                return Ok(());
            }
            volume.metadata_set(key, value).await
        }
        JournalEvent::MetadataRemove { key } => {
            if volume.metadata_get(key).await?.is_none() {
                return Ok(());
            }
            volume.metadata_remove(key).await
        }
        JournalEvent::UpdateFeatures { features, enabled } => {
            let current = volume.features().await?;
            let effective = if *enabled {
                current & features == *features
            } else {
                current & features == 0
            };
            if effective {
                return Ok(());
            }
            match volume.update_features(*features, *enabled).await {
                Err(Error::InvalidArgument(reason)) => {
                    tracing::warn!(
                        "Skipping feature update {:#x} (enabled={}) on '{}': {}",
                        features,
                        enabled,
                        volume.name(),
                        reason
                    );
                    Ok(())
                }
                other => other,
            }
        }
        JournalEvent::Noop => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{features, MemoryImage};

    #[tokio::test]
    async fn test_snapshot_ops_are_idempotent() {
        let image = MemoryImage::new("image", 4096, 0);
        let events = [
            JournalEvent::SnapCreate {
                snap_id: 1,
                name: "snap1".into(),
            },
            JournalEvent::SnapProtect {
                snap_id: 1,
                name: "snap1".into(),
            },
            JournalEvent::SnapUnprotect {
                snap_id: 1,
                name: "snap1".into(),
            },
            JournalEvent::SnapRename {
                snap_id: 1,
                src: "snap1".into(),
                dst: "snap2".into(),
            },
        ];

        for _ in 0..2 {
            for event in &events {
                apply_event(&image, event).await.unwrap();
            }
        }

        let snapshots = image.snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "snap2");
        assert!(!snapshots[0].protected);

        let remove = JournalEvent::SnapRemove {
            snap_id: 1,
            name: "snap2".into(),
        };
        apply_event(&image, &remove).await.unwrap();
        apply_event(&image, &remove).await.unwrap();
        assert!(image.snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reapplied_create_after_rename_keeps_one_snapshot() {
        let image = MemoryImage::new("image", 4096, 0);
        let events = [
            JournalEvent::SnapCreate {
                snap_id: 1,
                name: "s".into(),
            },
            JournalEvent::SnapProtect {
                snap_id: 1,
                name: "s".into(),
            },
            JournalEvent::SnapRename {
                snap_id: 1,
                src: "s".into(),
                dst: "t".into(),
            },
        ];
        for event in &events {
            apply_event(&image, event).await.unwrap();
        }

        // replay of the whole sequence against a replica that already saw it
        for event in &events {
            apply_event(&image, event).await.unwrap();
        }

        let snapshots = image.snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "t");
        assert_eq!(snapshots[0].id, 1);
        assert!(snapshots[0].protected);
    }

    #[tokio::test]
    async fn test_reapplied_events_skip_a_reused_name() {
        let image = MemoryImage::new("image", 4096, 0);
        let events = [
            JournalEvent::SnapCreate {
                snap_id: 1,
                name: "s".into(),
            },
            JournalEvent::SnapRemove {
                snap_id: 1,
                name: "s".into(),
            },
            JournalEvent::SnapCreate {
                snap_id: 2,
                name: "s".into(),
            },
        ];
        for event in &events {
            apply_event(&image, event).await.unwrap();
        }
        for event in &events {
            apply_event(&image, event).await.unwrap();
        }

        let snapshots = image.snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, 2);
    }

    #[tokio::test]
    async fn test_metadata_and_features_are_idempotent() {
        let image = MemoryImage::new(
            "image",
            4096,
            features::EXCLUSIVE_LOCK | features::JOURNALING,
        );
        let set = JournalEvent::MetadataSet {
            key: "conf_rbd_cache".into(),
            value: "false".into(),
        };
        apply_event(&image, &set).await.unwrap();
        apply_event(&image, &set).await.unwrap();
        assert_eq!(
            image.metadata_get("conf_rbd_cache").await.unwrap().as_deref(),
            Some("false")
        );

        let remove = JournalEvent::MetadataRemove {
            key: "conf_rbd_cache".into(),
        };
        apply_event(&image, &remove).await.unwrap();
        apply_event(&image, &remove).await.unwrap();

        let enable = JournalEvent::UpdateFeatures {
            features: features::OBJECT_MAP | features::FAST_DIFF,
            enabled: true,
        };
        apply_event(&image, &enable).await.unwrap();
        apply_event(&image, &enable).await.unwrap();
        assert_ne!(image.features().await.unwrap() & features::FAST_DIFF, 0);

        // not honoured on a journaled replica, skipped without failing
        let drop_lock = JournalEvent::UpdateFeatures {
            features: features::EXCLUSIVE_LOCK,
            enabled: false,
        };
        apply_event(&image, &drop_lock).await.unwrap();
        assert_ne!(image.features().await.unwrap() & features::EXCLUSIVE_LOCK, 0);
    }

    #[tokio::test]
    async fn test_rewrite_of_identical_data_is_harmless() {
        let image = MemoryImage::new("image", 4096, 0);
        let write = JournalEvent::AioWrite {
            offset: 512,
            data: vec![9u8; 512],
        };
        apply_event(&image, &write).await.unwrap();
        apply_event(&image, &write).await.unwrap();
        assert_eq!(image.read(512, 512).await.unwrap(), vec![9u8; 512]);
    }
}
