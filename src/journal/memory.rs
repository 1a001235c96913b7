//! In-Process Journal
//!
//! Reference implementation of [`RemoteJournal`] kept entirely in memory.
//! Used by the `simulate` command and by tests; a production deployment
//! plugs a cluster-backed journal in behind the same trait.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_stream::wrappers::WatchStream;

use super::entry::{JournalEntry, JournalEvent};
use super::{
    ClientInfo, ClientState, CommitPosition, JournalWatch, ReadResult, RemoteJournal, SyncState,
    PRIMARY_CLIENT_ID,
};
use crate::config::JournalConfig;
use crate::error::{Error, Result};

/// Journal state guarded by a single lock
struct JournalInner {
    /// Retained entries in append order
    entries: VecDeque<JournalEntry>,
    /// Entries ever appended (drives segment numbering)
    appended: u64,
    /// Newest allocated tag
    current_tag: u64,
    /// Next entry id per tag
    next_entry_tid: HashMap<u64, u64>,
    /// Registered clients
    clients: BTreeMap<String, ClientInfo>,
    /// Position of the newest trimmed entry
    trimmed_through: CommitPosition,
}

impl JournalInner {
    fn new() -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(PRIMARY_CLIENT_ID.to_string(), primary_client());

        Self {
            entries: VecDeque::new(),
            appended: 0,
            current_tag: 0,
            next_entry_tid: HashMap::new(),
            clients,
            trimmed_through: CommitPosition::default(),
        }
    }

    fn tail(&self) -> CommitPosition {
        self.entries
            .back()
            .map(|e| e.position)
            .unwrap_or(self.trimmed_through)
    }

    fn active_segment(&self, entries_per_segment: u64) -> u64 {
        self.appended.saturating_sub(1) / entries_per_segment
    }

    /// Drop whole segments that every connected client has committed past
    fn trim(&mut self) {
        let min_commit = self
            .clients
            .values()
            .filter(|c| c.state == ClientState::Connected)
            .map(|c| c.commit_position)
            .min();

        let Some(min_commit) = min_commit else {
            return;
        };

        while let Some(front) = self.entries.front() {
            if front.position.segment < min_commit.segment && front.position <= min_commit {
                self.trimmed_through = front.position;
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Disconnect replicas that fell too far behind the active segment
    fn enforce_lag_limit(&mut self, max_lag_segments: u64, active_segment: u64) {
        if max_lag_segments == 0 {
            return;
        }

        for client in self.clients.values_mut() {
            if client.id == PRIMARY_CLIENT_ID || client.state != ClientState::Connected {
                continue;
            }
            let behind = active_segment.saturating_sub(client.commit_position.segment);
            if behind > max_lag_segments {
                tracing::warn!(
                    "Journal client '{}' is {} segments behind (limit {}), disconnecting",
                    client.id,
                    behind,
                    max_lag_segments
                );
                client.state = ClientState::Disconnected;
            }
        }
    }
}

fn primary_client() -> ClientInfo {
    ClientInfo {
        id: PRIMARY_CLIENT_ID.to_string(),
        state: ClientState::Connected,
        commit_position: CommitPosition::default(),
        sync_state: SyncState::Replaying,
    }
}

/// In-memory ordered journal
pub struct MemoryJournal {
    /// Journal settings
    config: JournalConfig,
    /// Entries and clients
    inner: RwLock<JournalInner>,
    /// Notification counter
    notify_tx: watch::Sender<u64>,
}

impl MemoryJournal {
    /// Create an empty journal with default settings
    pub fn new() -> Self {
        Self::with_config(JournalConfig::default())
    }

    /// Create an empty journal
    pub fn with_config(config: JournalConfig) -> Self {
        let (notify_tx, _) = watch::channel(0u64);
        Self {
            config,
            inner: RwLock::new(JournalInner::new()),
            notify_tx,
        }
    }

    /// Wake every subscriber
    pub fn notify(&self) {
        self.notify_tx.send_modify(|counter| *counter += 1);
    }

    /// Allocate a new writer epoch
    pub async fn allocate_tag(&self) -> u64 {
        let mut inner = self.inner.write().await;
        inner.current_tag += 1;
        let tag = inner.current_tag;
        inner.next_entry_tid.insert(tag, 0);
        tracing::debug!("Allocated journal tag {}", tag);
        tag
    }

    /// Append an event under `tag`
    pub async fn append(&self, tag: u64, event: &JournalEvent) -> Result<CommitPosition> {
        let position = {
            let mut inner = self.inner.write().await;
            if tag == 0 || tag != inner.current_tag {
                return Err(Error::Busy(format!(
                    "tag {} is not the active writer tag {}",
                    tag, inner.current_tag
                )));
            }

            let entry_tid = {
                let next = inner.next_entry_tid.entry(tag).or_insert(0);
                let tid = *next;
                *next += 1;
                tid
            };
            let segment = inner.appended / self.config.entries_per_segment;
            let position = CommitPosition::new(segment, tag, entry_tid);

            let entry =
                JournalEntry::new(position, Utc::now(), event, self.config.compress_threshold)?;
            inner.entries.push_back(entry);
            inner.appended += 1;

            let active = inner.active_segment(self.config.entries_per_segment);
            inner.enforce_lag_limit(self.config.max_lag_segments, active);
            inner.trim();
            position
        };

        self.notify();
        Ok(position)
    }

    /// Advance the primary writer's commit position
    pub async fn commit_primary(&self, position: CommitPosition) -> Result<()> {
        self.advance_commit(PRIMARY_CLIENT_ID, position).await
    }

    /// Position of the newest entry
    pub async fn tail(&self) -> CommitPosition {
        self.inner.read().await.tail()
    }

    /// Force a client's connection state
    pub async fn set_client_state(&self, client_id: &str, state: ClientState) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            let client = inner.clients.get_mut(client_id).ok_or_else(|| {
                Error::NotFound(format!("journal client '{}' is not registered", client_id))
            })?;
            client.state = state;
            inner.trim();
        }
        tracing::info!("Journal client '{}' set to {}", client_id, state);
        self.notify();
        Ok(())
    }

    /// Discard every entry and replica registration
    pub async fn reset(&self) {
        {
            let mut inner = self.inner.write().await;
            let current_tag = inner.current_tag;
            *inner = JournalInner::new();
            inner.current_tag = current_tag;
        }
        tracing::info!("Journal reset");
        self.notify();
    }

    /// Number of retained entries
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// True when no entries are retained
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Oldest retained segment, if any
    pub async fn first_segment(&self) -> Option<u64> {
        self.inner
            .read()
            .await
            .entries
            .front()
            .map(|e| e.position.segment)
    }

    /// Every registered client
    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.inner.read().await.clients.values().cloned().collect()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteJournal for MemoryJournal {
    async fn read_next(&self, cursor: &CommitPosition) -> Result<ReadResult> {
        let inner = self.inner.read().await;
        if *cursor < inner.trimmed_through {
            return Err(Error::NotConnected(format!(
                "entries after {} were trimmed (horizon {})",
                cursor, inner.trimmed_through
            )));
        }

        let index = inner.entries.partition_point(|e| e.position <= *cursor);
        match inner.entries.get(index) {
            Some(entry) => Ok(ReadResult::Entry(entry.clone())),
            None => Ok(ReadResult::WouldBlock),
        }
    }

    async fn register_client(
        &self,
        client_id: &str,
        sync_state: SyncState,
    ) -> Result<CommitPosition> {
        let position = {
            let mut inner = self.inner.write().await;
            if inner.clients.contains_key(client_id) {
                return Err(Error::AlreadyExists(format!(
                    "journal client '{}' is already registered",
                    client_id
                )));
            }

            let position = inner.tail();
            inner.clients.insert(
                client_id.to_string(),
                ClientInfo {
                    id: client_id.to_string(),
                    state: ClientState::Connected,
                    commit_position: position,
                    sync_state,
                },
            );
            position
        };

        tracing::info!("Registered journal client '{}' at {}", client_id, position);
        self.notify();
        Ok(position)
    }

    async fn unregister_client(&self, client_id: &str) -> Result<()> {
        if client_id == PRIMARY_CLIENT_ID {
            return Err(Error::InvalidArgument(
                "the primary client cannot be unregistered".into(),
            ));
        }

        {
            let mut inner = self.inner.write().await;
            if inner.clients.remove(client_id).is_none() {
                return Err(Error::NotFound(format!(
                    "journal client '{}' is not registered",
                    client_id
                )));
            }
            inner.trim();
        }

        tracing::info!("Unregistered journal client '{}'", client_id);
        self.notify();
        Ok(())
    }

    async fn client(&self, client_id: &str) -> Result<Option<ClientInfo>> {
        Ok(self.inner.read().await.clients.get(client_id).cloned())
    }

    async fn update_sync_state(&self, client_id: &str, sync_state: SyncState) -> Result<()> {
        let mut inner = self.inner.write().await;
        let client = inner.clients.get_mut(client_id).ok_or_else(|| {
            Error::NotFound(format!("journal client '{}' is not registered", client_id))
        })?;
        client.sync_state = sync_state;
        Ok(())
    }

    async fn advance_commit(&self, client_id: &str, position: CommitPosition) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            let client = inner.clients.get_mut(client_id).ok_or_else(|| {
                Error::NotFound(format!("journal client '{}' is not registered", client_id))
            })?;

            if client.state != ClientState::Connected {
                return Err(Error::NotConnected(format!(
                    "journal client '{}' is disconnected",
                    client_id
                )));
            }
            if position < client.commit_position {
                return Err(Error::StaleCommit {
                    current: client.commit_position,
                    requested: position,
                });
            }

            client.commit_position = position;
            inner.trim();
        }

        self.notify();
        Ok(())
    }

    async fn primary_position(&self) -> Result<CommitPosition> {
        let inner = self.inner.read().await;
        Ok(inner
            .clients
            .get(PRIMARY_CLIENT_ID)
            .filter(|c| c.state == ClientState::Connected)
            .map(|c| c.commit_position)
            .unwrap_or_default())
    }

    async fn entries_between(&self, from: &CommitPosition, to: &CommitPosition) -> Result<u64> {
        if to <= from {
            return Ok(0);
        }
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.position > *from && e.position <= *to)
            .count() as u64)
    }

    fn watch(&self) -> JournalWatch {
        WatchStream::new(self.notify_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn small_segments(max_lag_segments: u64) -> JournalConfig {
        JournalConfig {
            entries_per_segment: 4,
            max_lag_segments,
            compress_threshold: 4096,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let journal = MemoryJournal::new();
        let tag = journal.allocate_tag().await;

        let first = journal.append(tag, &JournalEvent::AioFlush).await.unwrap();
        let second = journal.append(tag, &JournalEvent::Noop).await.unwrap();
        assert!(first < second);

        let start = CommitPosition::default();
        match journal.read_next(&start).await.unwrap() {
            ReadResult::Entry(entry) => assert_eq!(entry.position, first),
            ReadResult::WouldBlock => panic!("expected an entry"),
        }
        match journal.read_next(&first).await.unwrap() {
            ReadResult::Entry(entry) => {
                assert_eq!(entry.decode().unwrap(), JournalEvent::Noop);
            }
            ReadResult::WouldBlock => panic!("expected an entry"),
        }
        assert!(matches!(
            journal.read_next(&second).await.unwrap(),
            ReadResult::WouldBlock
        ));
    }

    #[tokio::test]
    async fn test_superseded_tag_is_rejected() {
        let journal = MemoryJournal::new();
        let old_tag = journal.allocate_tag().await;
        let new_tag = journal.allocate_tag().await;

        assert!(journal.append(old_tag, &JournalEvent::Noop).await.is_err());
        let position = journal.append(new_tag, &JournalEvent::Noop).await.unwrap();
        assert_eq!(position.tag_tid, new_tag);
        assert_eq!(position.entry_tid, 0);
    }

    #[tokio::test]
    async fn test_register_at_tail_and_commit_monotonic() {
        let journal = MemoryJournal::new();
        let tag = journal.allocate_tag().await;
        let tail = journal.append(tag, &JournalEvent::Noop).await.unwrap();

        let registered = journal
            .register_client("mirror", SyncState::Replaying)
            .await
            .unwrap();
        assert_eq!(registered, tail);
        assert!(journal
            .register_client("mirror", SyncState::Replaying)
            .await
            .is_err());

        let next = journal.append(tag, &JournalEvent::Noop).await.unwrap();
        journal.advance_commit("mirror", next).await.unwrap();

        match journal.advance_commit("mirror", tail).await {
            Err(Error::StaleCommit { current, requested }) => {
                assert_eq!(current, next);
                assert_eq!(requested, tail);
            }
            other => panic!("expected stale commit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trim_follows_slowest_client() {
        let journal = MemoryJournal::with_config(small_segments(0));
        journal
            .register_client("mirror", SyncState::Replaying)
            .await
            .unwrap();
        let tag = journal.allocate_tag().await;

        let mut positions = Vec::new();
        for _ in 0..12 {
            positions.push(journal.append(tag, &JournalEvent::Noop).await.unwrap());
        }
        journal.commit_primary(positions[11]).await.unwrap();
        assert_eq!(journal.first_segment().await, Some(0));

        journal.advance_commit("mirror", positions[9]).await.unwrap();
        assert_eq!(journal.first_segment().await, Some(2));
        assert!(journal.read_next(&positions[1]).await.is_err());
        assert!(matches!(
            journal.read_next(&positions[9]).await.unwrap(),
            ReadResult::Entry(_)
        ));
    }

    #[tokio::test]
    async fn test_lagging_client_is_disconnected() {
        let journal = MemoryJournal::with_config(small_segments(1));
        journal
            .register_client("mirror", SyncState::Replaying)
            .await
            .unwrap();
        let tag = journal.allocate_tag().await;

        for _ in 0..12 {
            journal.append(tag, &JournalEvent::Noop).await.unwrap();
        }

        assert_eq!(
            journal.client_state("mirror").await.unwrap(),
            ClientState::Disconnected
        );
        assert!(matches!(
            journal
                .advance_commit("mirror", CommitPosition::new(2, tag, 11))
                .await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_wakes_on_append() {
        let journal = MemoryJournal::new();
        let mut watch = journal.watch();
        // first item is the current value
        let initial = watch.next().await.unwrap();

        let tag = journal.allocate_tag().await;
        journal.append(tag, &JournalEvent::Noop).await.unwrap();

        let woke = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert!(woke > initial);
    }

    #[tokio::test]
    async fn test_reset_drops_replicas() {
        let journal = MemoryJournal::new();
        journal
            .register_client("mirror", SyncState::Replaying)
            .await
            .unwrap();
        let tag = journal.allocate_tag().await;
        journal.append(tag, &JournalEvent::Noop).await.unwrap();

        journal.reset().await;
        assert!(journal.is_empty().await);
        assert!(journal.client("mirror").await.unwrap().is_none());
        assert_eq!(journal.primary_position().await.unwrap(), CommitPosition::default());

        let tag2 = journal.allocate_tag().await;
        assert!(tag2 > tag);
    }
}
