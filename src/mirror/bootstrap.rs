//! Bootstrap Coordinator
//!
//! Validates that replication can start, reconciles the local replica with
//! the remote volume and decides where replay resumes. Every step is safe to
//! repeat: a bootstrap interrupted at any point is completed by the next one.

use std::sync::Arc;

use super::commit::CommitTracker;
use crate::error::{Error, Result};
use crate::journal::{ClientInfo, ClientState, CommitPosition, RemoteJournal, SyncState};
use crate::volume::{LocalImageInfo, LocalPool, LocalVolume, MirrorMode, MirrorState, RemoteImage};

/// What to do with an existing registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationAction {
    /// Reuse the replica and resume from the persisted commit position
    Resume,
    /// Discard the replica and registration, then rebuild both
    Resync,
    /// Persist the resync flag and fail; the next attempt resyncs
    FlagResyncAndFail,
    /// Fail until an operator requests a resync
    Fail,
}

impl RegistrationAction {
    /// Decide how to treat a registration of a fully synced replica
    pub fn plan(state: ClientState, resync_requested: bool, resync_after_disconnect: bool) -> Self {
        if resync_requested {
            return RegistrationAction::Resync;
        }
        match (state, resync_after_disconnect) {
            (ClientState::Connected, _) => RegistrationAction::Resume,
            (ClientState::Disconnected, true) => RegistrationAction::FlagResyncAndFail,
            (ClientState::Disconnected, false) => RegistrationAction::Fail,
        }
    }
}

/// Outcome of a successful bootstrap
pub struct Bootstrapped {
    pub global_id: String,
    pub volume: Arc<dyn LocalVolume>,
    pub journal: Arc<dyn RemoteJournal>,
    pub tracker: Arc<CommitTracker>,
    /// Persisted commit position replay resumes from
    pub start_position: CommitPosition,
    /// True when the replica was rebuilt from scratch
    pub resynced: bool,
}

/// Bootstraps one replica
pub struct BootstrapCoordinator {
    remote: Arc<dyn RemoteImage>,
    pool: Arc<dyn LocalPool>,
    client_id: String,
    resync_after_disconnect: bool,
}

impl BootstrapCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteImage>,
        pool: Arc<dyn LocalPool>,
        client_id: &str,
        resync_after_disconnect: bool,
    ) -> Self {
        Self {
            remote,
            pool,
            client_id: client_id.to_string(),
            resync_after_disconnect,
        }
    }

    /// Check preconditions and prepare the replica
    pub async fn run(&self) -> Result<Bootstrapped> {
        let name = self.remote.name();

        let info = self.remote.mirror_info().await?.ok_or_else(|| {
            Error::NotFound(format!("mirroring is not configured for volume '{}'", name))
        })?;
        if info.state != MirrorState::Enabled {
            return Err(Error::NotFound(format!(
                "mirroring is {:?} for volume '{}'",
                info.state, name
            )));
        }
        if !info.primary {
            return Err(Error::RemoteUnavailable(format!(
                "remote volume '{}' is not primary",
                name
            )));
        }

        let journal = match info.mode {
            MirrorMode::Journal => self.remote.journal().await?.ok_or_else(|| {
                Error::NotFound(format!("remote volume '{}' has no journal", name))
            })?,
            MirrorMode::Snapshot => {
                return Err(Error::Unsupported(format!(
                    "volume '{}' uses snapshot-based mirroring",
                    name
                )))
            }
        };

        let local = self.pool.lookup(name).await?;
        if let Some(local) = &local {
            self.check_local(local, &info.global_id)?;
        }

        let registration = journal.client(&self.client_id).await?;

        let Some(local) = local else {
            tracing::info!("Volume '{}': no local replica, starting image sync", name);
            return self
                .resync(&journal, &info.global_id, registration.as_ref(), false)
                .await;
        };
        let Some(registration) = registration else {
            tracing::warn!(
                "Volume '{}': registration '{}' missing (journal reset), resyncing",
                name,
                self.client_id
            );
            return self.resync(&journal, &info.global_id, None, true).await;
        };
        if registration.sync_state == SyncState::Syncing {
            tracing::info!("Volume '{}': completing interrupted image sync", name);
            return self
                .resync(&journal, &info.global_id, Some(&registration), true)
                .await;
        }

        let volume = self.pool.open(&local.name).await?;
        let resync_requested = volume.resync_requested().await?;
        match RegistrationAction::plan(
            registration.state,
            resync_requested,
            self.resync_after_disconnect,
        ) {
            RegistrationAction::Resume => {
                tracing::info!(
                    "Volume '{}': resuming replay from {}",
                    name,
                    registration.commit_position
                );
                Ok(Bootstrapped {
                    global_id: info.global_id,
                    tracker: Arc::new(CommitTracker::new(
                        journal.clone(),
                        &self.client_id,
                        registration.commit_position,
                    )),
                    volume,
                    journal,
                    start_position: registration.commit_position,
                    resynced: false,
                })
            }
            RegistrationAction::Resync => {
                tracing::info!("Volume '{}': resync requested", name);
                drop(volume);
                self.resync(&journal, &info.global_id, Some(&registration), true)
                    .await
            }
            RegistrationAction::FlagResyncAndFail => {
                tracing::warn!(
                    "Volume '{}': registration disconnected, flagging resync for next start",
                    name
                );
                volume.request_resync().await?;
                Err(Error::NotConnected(format!(
                    "registration '{}' for volume '{}' is disconnected, resync flagged",
                    self.client_id, name
                )))
            }
            RegistrationAction::Fail => Err(Error::NotConnected(format!(
                "registration '{}' for volume '{}' is disconnected",
                self.client_id, name
            ))),
        }
    }

    fn check_local(&self, local: &LocalImageInfo, global_id: &str) -> Result<()> {
        if local.is_replica_of(global_id) {
            return Ok(());
        }
        if local.primary && local.global_id.as_deref() == Some(global_id) {
            return Err(Error::AlreadyExists(format!(
                "local volume '{}' has been promoted to primary",
                local.name
            )));
        }
        Err(Error::AlreadyExists(format!(
            "local volume '{}' exists and is not a replica of {}",
            local.name, global_id
        )))
    }

    /// Discard any replica and registration, then rebuild both
    async fn resync(
        &self,
        journal: &Arc<dyn RemoteJournal>,
        global_id: &str,
        registration: Option<&ClientInfo>,
        local_exists: bool,
    ) -> Result<Bootstrapped> {
        let name = self.remote.name();

        if registration.is_some() {
            match journal.unregister_client(&self.client_id).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if local_exists {
            match self.pool.remove(name).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let start_position = journal
            .register_client(&self.client_id, SyncState::Syncing)
            .await?;
        let contents = self.remote.export().await?;
        let volume = self
            .pool
            .create_replica(name, global_id, contents.size)
            .await?;
        volume.import(&contents).await?;
        journal
            .update_sync_state(&self.client_id, SyncState::Replaying)
            .await?;

        tracing::info!(
            "Volume '{}': image sync complete ({} bytes, {} snapshots), replay starts after {}",
            name,
            contents.size,
            contents.snapshots.len(),
            start_position
        );

        Ok(Bootstrapped {
            global_id: global_id.to_string(),
            tracker: Arc::new(CommitTracker::new(
                journal.clone(),
                &self.client_id,
                start_position,
            )),
            volume,
            journal: journal.clone(),
            start_position,
            resynced: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::volume::{MemoryPool, MemoryRemote};

    const CLIENT: &str = "local-mirror";

    fn coordinator(
        remote: &Arc<MemoryRemote>,
        pool: &Arc<MemoryPool>,
        resync_after_disconnect: bool,
    ) -> BootstrapCoordinator {
        BootstrapCoordinator::new(
            remote.clone(),
            pool.clone(),
            CLIENT,
            resync_after_disconnect,
        )
    }

    #[test]
    fn test_registration_plan() {
        use ClientState::*;
        assert_eq!(RegistrationAction::plan(Connected, false, false), RegistrationAction::Resume);
        assert_eq!(RegistrationAction::plan(Connected, true, false), RegistrationAction::Resync);
        assert_eq!(RegistrationAction::plan(Disconnected, false, false), RegistrationAction::Fail);
        assert_eq!(
            RegistrationAction::plan(Disconnected, false, true),
            RegistrationAction::FlagResyncAndFail
        );
        assert_eq!(RegistrationAction::plan(Disconnected, true, false), RegistrationAction::Resync);
    }

    #[tokio::test]
    async fn test_fresh_bootstrap_then_resume() {
        let remote = MemoryRemote::new("image", 1 << 16, JournalConfig::default());
        let pool = Arc::new(MemoryPool::new());
        let mut writer = remote.open_writer().await.unwrap();
        writer.write(0, &[1u8; 512]).await.unwrap();
        writer.close().await.unwrap();

        let first = coordinator(&remote, &pool, false).run().await.unwrap();
        assert!(first.resynced);
        assert_eq!(first.volume.read(0, 512).await.unwrap(), vec![1u8; 512]);

        let journal = remote.memory_journal().await.unwrap();
        let client = journal.client(CLIENT).await.unwrap().unwrap();
        assert_eq!(client.sync_state, SyncState::Replaying);

        let second = coordinator(&remote, &pool, false).run().await.unwrap();
        assert!(!second.resynced);
        assert_eq!(second.start_position, first.start_position);
    }

    #[tokio::test]
    async fn test_interrupted_sync_is_redone() {
        let remote = MemoryRemote::new("image", 1 << 16, JournalConfig::default());
        let pool = Arc::new(MemoryPool::new());
        let journal = remote.memory_journal().await.unwrap();

        // registration left behind by a sync that never finished
        journal.register_client(CLIENT, SyncState::Syncing).await.unwrap();
        pool.create_replica("image", &remote.global_id().await.unwrap(), 1 << 16)
            .await
            .unwrap();

        let boot = coordinator(&remote, &pool, false).run().await.unwrap();
        assert!(boot.resynced);
        let client = journal.client(CLIENT).await.unwrap().unwrap();
        assert_eq!(client.sync_state, SyncState::Replaying);
    }

    #[tokio::test]
    async fn test_promoted_local_blocks_bootstrap() {
        let remote = MemoryRemote::new("image", 1 << 16, JournalConfig::default());
        let pool = Arc::new(MemoryPool::new());
        coordinator(&remote, &pool, false).run().await.unwrap();

        let local = pool.get("image").await.unwrap();
        local
            .set_mirror_identity(remote.global_id().await, true)
            .await;

        assert!(matches!(
            coordinator(&remote, &pool, false).run().await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_mode_is_unsupported() {
        let remote = MemoryRemote::new("image", 1 << 16, JournalConfig::default());
        let pool = Arc::new(MemoryPool::new());
        remote.set_mirror_mode(MirrorMode::Snapshot).await;

        assert!(matches!(
            coordinator(&remote, &pool, false).run().await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_flags_resync_once() {
        let remote = MemoryRemote::new("image", 1 << 16, JournalConfig::default());
        let pool = Arc::new(MemoryPool::new());
        coordinator(&remote, &pool, true).run().await.unwrap();

        let journal = remote.memory_journal().await.unwrap();
        journal
            .set_client_state(CLIENT, ClientState::Disconnected)
            .await
            .unwrap();

        assert!(matches!(
            coordinator(&remote, &pool, true).run().await,
            Err(Error::NotConnected(_))
        ));
        let local = pool.get("image").await.unwrap();
        assert!(local.resync_requested().await.unwrap());

        let boot = coordinator(&remote, &pool, true).run().await.unwrap();
        assert!(boot.resynced);
        assert!(!boot.volume.resync_requested().await.unwrap());
        assert_eq!(
            journal.client_state(CLIENT).await.unwrap(),
            ClientState::Connected
        );
    }
}
