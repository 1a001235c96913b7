//! Commit Tracker
//!
//! Tracks how far this replica has durably consumed the remote journal and
//! how far the primary writer has acknowledged its own appends.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::journal::{ClientState, CommitPosition, RemoteJournal};

/// Distance between the replica and the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitLag {
    pub replica: CommitPosition,
    pub primary: CommitPosition,
    pub entries_behind: u64,
}

/// Commit position bookkeeping for one journal client
pub struct CommitTracker {
    /// Remote journal
    journal: Arc<dyn RemoteJournal>,
    /// This replica's journal client id
    client_id: String,
    /// Last position persisted through this tracker
    committed: RwLock<CommitPosition>,
}

impl CommitTracker {
    /// Create a tracker starting from the registration's persisted position
    pub fn new(journal: Arc<dyn RemoteJournal>, client_id: &str, committed: CommitPosition) -> Self {
        Self {
            journal,
            client_id: client_id.to_string(),
            committed: RwLock::new(committed),
        }
    }

    /// Journal client id
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Persist that every event up to `position` has been applied locally
    pub async fn advance(&self, position: CommitPosition) -> Result<()> {
        let mut committed = self.committed.write().await;
        if position < *committed {
            return Err(Error::StaleCommit {
                current: *committed,
                requested: position,
            });
        }

        match self.journal.advance_commit(&self.client_id, position).await {
            Ok(()) => {
                *committed = position;
                tracing::debug!("Client '{}' committed {}", self.client_id, position);
                Ok(())
            }
            Err(e @ Error::NotConnected(_)) => {
                tracing::warn!(
                    "Commit of {} rejected, client '{}' is disconnected",
                    position,
                    self.client_id
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Position persisted on the journal for this replica
    pub async fn current_position(&self) -> Result<CommitPosition> {
        match self.journal.client(&self.client_id).await? {
            Some(info) => Ok(info.commit_position),
            None => Err(Error::NotFound(format!(
                "journal client '{}' is not registered",
                self.client_id
            ))),
        }
    }

    /// Position acknowledged by the primary writer
    pub async fn primary_position(&self) -> Result<CommitPosition> {
        self.journal.primary_position().await
    }

    /// Connection state of this replica's registration
    pub async fn connection_state(&self) -> Result<ClientState> {
        self.journal.client_state(&self.client_id).await
    }

    /// True when the replica has committed everything the primary acknowledged
    ///
    /// A disconnected registration is never caught up.
    pub async fn caught_up(&self) -> Result<bool> {
        let info = match self.journal.client(&self.client_id).await? {
            Some(info) if info.state == ClientState::Connected => info,
            _ => return Ok(false),
        };
        Ok(info.commit_position == self.primary_position().await?)
    }

    /// Current commit lag
    pub async fn lag(&self) -> Result<CommitLag> {
        let replica = self.current_position().await?;
        let primary = self.primary_position().await?;
        let entries_behind = self.journal.entries_between(&replica, &primary).await?;
        Ok(CommitLag {
            replica,
            primary,
            entries_behind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalEvent, MemoryJournal, SyncState};

    async fn setup() -> (Arc<MemoryJournal>, CommitTracker, u64) {
        let journal = Arc::new(MemoryJournal::new());
        let start = journal
            .register_client("mirror", SyncState::Replaying)
            .await
            .unwrap();
        let tag = journal.allocate_tag().await;
        let tracker = CommitTracker::new(journal.clone(), "mirror", start);
        (journal, tracker, tag)
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let (journal, tracker, tag) = setup().await;
        let first = journal.append(tag, &JournalEvent::Noop).await.unwrap();
        let second = journal.append(tag, &JournalEvent::Noop).await.unwrap();

        tracker.advance(second).await.unwrap();
        assert!(matches!(
            tracker.advance(first).await,
            Err(Error::StaleCommit { .. })
        ));
        assert_eq!(tracker.current_position().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_caught_up_follows_primary() {
        let (journal, tracker, tag) = setup().await;
        assert!(tracker.caught_up().await.unwrap());

        let position = journal.append(tag, &JournalEvent::Noop).await.unwrap();
        journal.commit_primary(position).await.unwrap();
        assert!(!tracker.caught_up().await.unwrap());
        assert_eq!(tracker.lag().await.unwrap().entries_behind, 1);

        tracker.advance(position).await.unwrap();
        assert!(tracker.caught_up().await.unwrap());
        assert_eq!(tracker.lag().await.unwrap().entries_behind, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_surfaced() {
        let (journal, tracker, tag) = setup().await;
        let position = journal.append(tag, &JournalEvent::Noop).await.unwrap();
        journal.commit_primary(position).await.unwrap();
        tracker.advance(position).await.unwrap();

        journal
            .set_client_state("mirror", ClientState::Disconnected)
            .await
            .unwrap();

        assert_eq!(
            tracker.connection_state().await.unwrap(),
            ClientState::Disconnected
        );
        assert!(!tracker.caught_up().await.unwrap());

        let next = journal.append(tag, &JournalEvent::Noop).await.unwrap();
        assert!(matches!(
            tracker.advance(next).await,
            Err(Error::NotConnected(_))
        ));
    }
}
