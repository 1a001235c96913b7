//! Remote Journal Module
//!
//! Types and the collaborator trait for the ordered, durable event journal
//! written by the primary volume and consumed by replicas.

pub mod entry;
mod memory;

pub use entry::{EventKind, JournalEntry, JournalEvent};
pub use memory::MemoryJournal;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;

use crate::error::Result;

/// Journal client id used by the primary writer
pub const PRIMARY_CLIENT_ID: &str = "";

/// Position of an entry in the journal
///
/// Entries are ordered by tag, then by entry id within the tag. Tags only
/// grow, so this is also append order. The default value sorts before every
/// real entry and is the commit position of a client that has consumed
/// nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitPosition {
    /// Segment that holds the entry
    pub segment: u64,
    /// Writer epoch
    pub tag_tid: u64,
    /// Entry id within the tag
    pub entry_tid: u64,
}

impl CommitPosition {
    pub fn new(segment: u64, tag_tid: u64, entry_tid: u64) -> Self {
        Self {
            segment,
            tag_tid,
            entry_tid,
        }
    }

    /// True when nothing has been consumed
    pub fn is_start(&self) -> bool {
        *self == Self::default()
    }
}

impl Ord for CommitPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag_tid
            .cmp(&other.tag_tid)
            .then(self.entry_tid.cmp(&other.entry_tid))
            .then(self.segment.cmp(&other.segment))
    }
}

impl PartialOrd for CommitPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CommitPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[segment={}, tag={}, entry={}]",
            self.segment, self.tag_tid, self.entry_tid
        )
    }
}

/// Connection state of a registered journal client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Connected,
    Disconnected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Connected => write!(f, "CONNECTED"),
            ClientState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Progress of a replica registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Registered, replica still being populated
    Syncing,
    /// Replica populated, replaying from the commit position
    Replaying,
}

/// Registration of a client on the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
    pub state: ClientState,
    pub commit_position: CommitPosition,
    pub sync_state: SyncState,
}

/// Outcome of a journal read
#[derive(Debug, Clone)]
pub enum ReadResult {
    /// The next entry after the cursor
    Entry(JournalEntry),
    /// Nothing past the cursor yet; wait for a notification
    WouldBlock,
}

/// Subscription to "new data available" signals
///
/// Each item is a monotonically growing notification counter. The stream is
/// lazy and never ends while the journal is alive.
pub type JournalWatch = WatchStream<u64>;

/// Ordered journal consumed by a replica
#[async_trait::async_trait]
pub trait RemoteJournal: Send + Sync {
    /// Read the first entry positioned after `cursor`
    async fn read_next(&self, cursor: &CommitPosition) -> Result<ReadResult>;

    /// Register a client at the current tail and return that position
    async fn register_client(&self, client_id: &str, sync_state: SyncState)
        -> Result<CommitPosition>;

    /// Remove a client registration
    async fn unregister_client(&self, client_id: &str) -> Result<()>;

    /// Look up a client registration
    async fn client(&self, client_id: &str) -> Result<Option<ClientInfo>>;

    /// Record a client's registration progress
    async fn update_sync_state(&self, client_id: &str, sync_state: SyncState) -> Result<()>;

    /// Persist a client's commit position
    async fn advance_commit(&self, client_id: &str, position: CommitPosition) -> Result<()>;

    /// Commit position of the primary writer (disconnected primary reads as start)
    async fn primary_position(&self) -> Result<CommitPosition>;

    /// Number of entries in `(from, to]`
    async fn entries_between(&self, from: &CommitPosition, to: &CommitPosition) -> Result<u64>;

    /// Subscribe to append and client update notifications
    fn watch(&self) -> JournalWatch;

    /// Connection state of a client
    async fn client_state(&self, client_id: &str) -> Result<ClientState> {
        match self.client(client_id).await? {
            Some(info) => Ok(info.state),
            None => Err(crate::Error::NotFound(format!(
                "journal client '{}' is not registered",
                client_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let start = CommitPosition::default();
        let a = CommitPosition::new(0, 1, 0);
        let b = CommitPosition::new(0, 1, 1);
        let c = CommitPosition::new(3, 2, 0);

        assert!(start.is_start());
        assert!(start < a);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.max(a), c);
    }
}
